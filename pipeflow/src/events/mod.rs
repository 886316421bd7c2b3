//! Lifecycle events emitted by pipeline runs.
//!
//! Every run reports to one [`EventSink`]; the default discards everything.
//! Event payloads are JSON objects that always carry the run id.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Emitted once when `run()` starts.
pub const PIPELINE_STARTED: &str = "pipeline.started";
/// Emitted on every pipeline state transition.
pub const PIPELINE_STATE_CHANGED: &str = "pipeline.state_changed";
/// Emitted when the last worker of a stage exits.
pub const STAGE_COMPLETED: &str = "stage.completed";
/// Emitted for every per-item failure.
pub const ITEM_FAILED: &str = "item.failed";
/// Emitted once when the run finishes, successfully or not.
pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
