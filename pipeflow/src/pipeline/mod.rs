//! Pipeline building and execution.
//!
//! This module provides:
//! - The typed fluent builder and the positional (uniform) builder
//! - Source drivers (iterators, blocking iterators, streams, external queues)
//! - Sinks and their closure adapters
//! - The run state machine, failure policy and run report
//!
//! Completion flows from the source to the sink: the source closes its queue
//! when exhausted, each stage closes its output after its last worker exits,
//! and the sink finishes once its queue reports end-of-stream.

mod builder;
mod context;
mod failure_tolerance;
mod report;
mod run;
mod sink;
mod source;

pub use builder::{PipelineBuilder, PipelinePlan, PipelineSettings, DEFAULT_SINK_NAME};
pub use context::{FailureCallback, PipelineHandle, PipelineState, RunContext};
pub use failure_tolerance::{ErrorPolicy, FailureCollector, FailureRecord};
pub use report::RunReport;
pub use run::Pipeline;
pub use sink::{AsyncFnSink, CollectSink, FnSink, Sink};
