//! Testing utilities for pipeflow pipelines.
//!
//! This module provides:
//! - Instrumented transforms (recording, failing, slow)
//! - A sink whose consumption can be held back to build up backpressure
//! - Assertions over run reports and queue counters

mod assertions;
mod mocks;

pub use assertions::{
    assert_all_balanced, assert_bounded, assert_same_multiset, assert_stage_counts,
};
pub use mocks::{FailingTransform, GatedSink, RecordingTransform, SinkGate, SlowTransform};
