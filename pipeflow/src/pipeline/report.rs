//! Outcome of a successful run.

use super::failure_tolerance::FailureRecord;
use crate::queue::QueueStats;
use crate::stages::StageStatsSnapshot;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// What a pipeline run produced, with its counters.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport<O> {
    /// The sink's output.
    pub output: O,
    /// Id of the run.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// Items the source enqueued.
    pub items_sourced: u64,
    /// Items the sink consumed successfully.
    pub items_sunk: u64,
    /// Per-stage counters, in pipeline order.
    pub stages: Vec<StageStatsSnapshot>,
    /// Counters of the queue the source wrote to.
    pub source_queue: QueueStats,
    /// Items skipped because a transform or the sink failed on them.
    pub failures: Vec<FailureRecord>,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

impl<O> RunReport<O> {
    /// Returns true if no item failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Returns the counters of the named stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageStatsSnapshot> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Returns the run duration in whole milliseconds, saturating at `u64::MAX`.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }

    /// Returns the sink output, discarding the counters.
    pub fn into_output(self) -> O {
        self.output
    }

    /// Returns the counters as JSON, without the sink output.
    #[must_use]
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "run_id": self.run_id.to_string(),
            "pipeline": self.pipeline,
            "items_sourced": self.items_sourced,
            "items_sunk": self.items_sunk,
            "failures": self.failures.len(),
            "elapsed_ms": self.elapsed_ms(),
            "stages": self.stages,
            "source_queue": self.source_queue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> RunReport<Vec<u8>> {
        RunReport {
            output: vec![1, 2],
            run_id: Uuid::now_v7(),
            pipeline: "scan".to_string(),
            items_sourced: 3,
            items_sunk: 2,
            stages: vec![StageStatsSnapshot {
                name: "parse".to_string(),
                concurrency: 2,
                received: 3,
                produced: 2,
                dropped: 0,
                failed: 1,
                discarded: 0,
                live_workers: 0,
                output: QueueStats::default(),
            }],
            source_queue: QueueStats::default(),
            failures: vec![FailureRecord::new("parse", 1, "bad input")],
            elapsed: Duration::from_millis(12),
        }
    }

    #[test]
    fn test_summary() {
        let report = report();
        let summary = report.summary();

        assert_eq!(summary["pipeline"], "scan");
        assert_eq!(summary["failures"], 1);
        assert_eq!(summary["elapsed_ms"], 12);
        assert_eq!(summary["stages"][0]["name"], "parse");
        assert!(summary.get("output").is_none());
    }

    #[test]
    fn test_elapsed_ms_saturates() {
        let report = RunReport {
            elapsed: Duration::MAX,
            ..report()
        };
        assert_eq!(report.elapsed_ms(), u64::MAX);
        assert_eq!(report.summary()["elapsed_ms"], u64::MAX);
    }

    #[test]
    fn test_accessors() {
        let report = report();
        assert!(!report.is_clean());
        assert_eq!(report.stage("parse").map(|s| s.failed), Some(1));
        assert_eq!(report.elapsed_ms(), 12);
        assert!(report.stage("missing").is_none());
        assert_eq!(report.into_output(), vec![1, 2]);
    }
}
