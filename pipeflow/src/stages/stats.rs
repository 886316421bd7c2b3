//! Per-stage counters.

use crate::queue::{QueueProbe, QueueStats};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Live counters shared by the workers of one stage.
pub struct StageStats {
    name: String,
    concurrency: usize,
    received: AtomicU64,
    produced: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
    live_workers: AtomicUsize,
    output: Arc<dyn QueueProbe>,
}

impl StageStats {
    /// Creates zeroed counters for a stage writing to `output`.
    #[must_use]
    pub fn new(name: impl Into<String>, concurrency: usize, output: Arc<dyn QueueProbe>) -> Self {
        Self {
            name: name.into(),
            concurrency,
            received: AtomicU64::new(0),
            produced: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            live_workers: AtomicUsize::new(0),
            output,
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the configured worker count.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Counts a received item and returns its sequence number.
    pub fn record_received(&self) -> u64 {
        self.received.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn record_produced(&self) {
        self.produced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn workers_started(&self, count: usize) {
        self.live_workers.fetch_add(count, Ordering::AcqRel);
    }

    /// Marks one worker as exited and returns how many are still live.
    pub(crate) fn worker_exited(&self) -> usize {
        self.live_workers.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }

    /// Returns the number of workers currently running.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Acquire)
    }

    /// Returns a serializable snapshot.
    #[must_use]
    pub fn snapshot(&self) -> StageStatsSnapshot {
        StageStatsSnapshot {
            name: self.name.clone(),
            concurrency: self.concurrency,
            received: self.received.load(Ordering::Relaxed),
            produced: self.produced.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            live_workers: self.live_workers(),
            output: self.output.stats(),
        }
    }
}

impl std::fmt::Debug for StageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageStats")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .field("live_workers", &self.live_workers())
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a stage's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatsSnapshot {
    /// Stage name.
    pub name: String,
    /// Configured worker count.
    pub concurrency: usize,
    /// Items taken off the input queue.
    pub received: u64,
    /// Items written to the output queue.
    pub produced: u64,
    /// Items the transform chose to drop.
    pub dropped: u64,
    /// Items whose transform failed or panicked.
    pub failed: u64,
    /// Items drained without processing while the run was aborting.
    pub discarded: u64,
    /// Workers still running.
    pub live_workers: usize,
    /// Output queue counters.
    pub output: QueueStats,
}

impl StageStatsSnapshot {
    /// Returns true if every received item is accounted for.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.received == self.produced + self.dropped + self.failed + self.discarded
    }
}
