//! Per-item failure handling.
//!
//! A failing transform never unwinds its stage. What happens next depends on
//! the pipeline's [`ErrorPolicy`]: the failure is either recorded and the run
//! continues, or the run switches to aborting and the failure becomes the
//! run's result.

use crate::errors::TransformFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How to handle per-item transform failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Record the failure, drop the item and keep going (default).
    #[default]
    Skip,
    /// Stop accepting new items, drain what is queued without processing it,
    /// and surface the failure as the run's error.
    Abort,
}

/// Record of one item that failed in a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Stage name.
    pub stage: String,
    /// Position of the item in the stage's receive order.
    pub sequence: u64,
    /// Error message.
    pub error: String,
    /// When the failure was observed.
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    /// Creates a new failure record timestamped now.
    #[must_use]
    pub fn new(stage: impl Into<String>, sequence: u64, error: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            sequence,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }
}

impl From<&TransformFailure> for FailureRecord {
    fn from(failure: &TransformFailure) -> Self {
        Self::new(&failure.stage, failure.sequence, &failure.message)
    }
}

/// Collects failure records during a run.
#[derive(Debug, Default)]
pub struct FailureCollector {
    /// Failure policy.
    pub policy: ErrorPolicy,
    failures: Vec<FailureRecord>,
}

impl FailureCollector {
    /// Creates a new failure collector.
    #[must_use]
    pub fn new(policy: ErrorPolicy) -> Self {
        Self {
            policy,
            failures: Vec::new(),
        }
    }

    /// Records a failure.
    pub fn record_failure(&mut self, record: FailureRecord) {
        self.failures.push(record);
    }

    /// Returns true if the run must stop accepting items.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        match self.policy {
            ErrorPolicy::Abort => !self.failures.is_empty(),
            ErrorPolicy::Skip => false,
        }
    }

    /// Returns all failures.
    #[must_use]
    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    /// Takes the recorded failures, leaving the collector empty.
    pub fn take_failures(&mut self) -> Vec<FailureRecord> {
        std::mem::take(&mut self.failures)
    }
}
