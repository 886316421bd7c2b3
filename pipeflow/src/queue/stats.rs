//! Queue occupancy and throughput counters.

use serde::{Deserialize, Serialize};

/// A point-in-time snapshot of a [`BoundedQueue`](super::BoundedQueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Configured capacity (`0` = unbounded).
    pub capacity: usize,
    /// Items currently queued.
    pub current_len: usize,
    /// Items accepted since creation.
    pub total_enqueued: u64,
    /// Items handed out since creation.
    pub total_dequeued: u64,
    /// Enqueues that had to wait for space at least once.
    pub blocked_enqueues: u64,
    /// Largest number of items ever queued at once.
    pub high_water_mark: usize,
    /// Whether the queue has been closed.
    pub closed: bool,
}

impl QueueStats {
    /// Returns the current fill level as a percentage (0 for unbounded queues).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.current_len as f64 / self.capacity as f64) * 100.0
    }

    /// Returns true if producers were ever suspended by backpressure.
    #[must_use]
    pub fn saw_backpressure(&self) -> bool {
        self.blocked_enqueues > 0
    }
}

/// Type-erased read access to a queue's counters.
///
/// Lets stage statistics refer to their output queue without knowing the
/// item type flowing through it.
pub trait QueueProbe: Send + Sync {
    /// Returns a snapshot of the queue counters.
    fn stats(&self) -> QueueStats;
}
