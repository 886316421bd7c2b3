//! # Pipeflow
//!
//! Bounded, multi-stage concurrent pipelines for tokio.
//!
//! A pipeline moves items from a source through an ordered chain of stages
//! into a sink. Every stage has its own worker count and output capacity:
//!
//! - **Backpressure**: a full queue suspends whoever writes to it, all the way
//!   back to the source.
//! - **Completion propagation**: a stage's output closes only after every one
//!   of its workers has exited, so the sink sees every item that was ever going
//!   to be produced.
//! - **Failure policy**: a failing item is either skipped and recorded, or it
//!   aborts the run while every queue still drains and closes.
//! - **Cancellation**: one cooperative token stops every wait in the run.
//!
//! With more than one worker per stage, output order is not preserved.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipeflow::prelude::*;
//!
//! let report = Pipeline::from_iter(1..=5)
//!     .map("double", StageOptions::concurrent(2), |x| x * 2)
//!     .filter("small", StageOptions::default(), |x| *x <= 6)
//!     .collect()
//!     .run()
//!     .await?;
//!
//! assert_eq!(report.items_sunk, 3);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{PipelineConfig, StageConfig, StageOptions};
    pub use crate::errors::{
        ConfigurationError, PipelineError, QueueError, Result, TransformFailure,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::pipeline::{
        CollectSink, ErrorPolicy, FailureRecord, Pipeline, PipelineHandle, PipelineState,
        RunReport, Sink,
    };
    pub use crate::queue::{BoundedQueue, QueueStats};
    pub use crate::stages::{
        AsyncFnTransform, FilterMapTransform, FilterTransform, FnTransform, Stage, Transform,
        TransformKind,
    };
}
