//! Test assertions for run reports.

use crate::pipeline::RunReport;
use crate::queue::QueueStats;
use std::fmt::Debug;

/// Asserts that every stage accounted for every item it received.
pub fn assert_all_balanced<O>(report: &RunReport<O>) {
    for stage in &report.stages {
        assert!(
            stage.is_balanced(),
            "Stage '{}' lost items: received {} but produced {}, dropped {}, failed {}, discarded {}",
            stage.name,
            stage.received,
            stage.produced,
            stage.dropped,
            stage.failed,
            stage.discarded
        );
        assert_eq!(
            stage.live_workers, 0,
            "Stage '{}' still has live workers after the run",
            stage.name
        );
    }
}

/// Asserts that a queue never held more than its capacity.
pub fn assert_bounded(stats: &QueueStats) {
    if stats.capacity == 0 {
        return;
    }
    assert!(
        stats.high_water_mark <= stats.capacity,
        "Queue exceeded its capacity: high-water mark {} > capacity {}",
        stats.high_water_mark,
        stats.capacity
    );
}

/// Asserts that two collections hold the same items, ignoring order.
pub fn assert_same_multiset<T: Ord + Debug>(actual: Vec<T>, expected: Vec<T>) {
    let mut actual = actual;
    let mut expected = expected;
    actual.sort();
    expected.sort();
    assert_eq!(actual, expected, "Collections differ as multisets");
}

/// Asserts the produced/dropped/failed counters of a named stage.
pub fn assert_stage_counts<O>(
    report: &RunReport<O>,
    stage: &str,
    produced: u64,
    dropped: u64,
    failed: u64,
) {
    let Some(stats) = report.stage(stage) else {
        panic!(
            "No stage named '{stage}'. Stages: {:?}",
            report.stages.iter().map(|s| &s.name).collect::<Vec<_>>()
        );
    };
    assert_eq!(
        (stats.produced, stats.dropped, stats.failed),
        (produced, dropped, failed),
        "Unexpected (produced, dropped, failed) for stage '{stage}'"
    );
}
