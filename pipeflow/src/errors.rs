//! Error types for the pipeflow engine.
//!
//! Library errors are typed with `thiserror`. User collaborators (transforms
//! and sinks) report failures as [`anyhow::Error`], which the engine wraps in
//! a [`TransformFailure`] at the stage boundary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type for pipeflow operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// The main error type returned by a pipeline run.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// An enqueue was attempted on a queue that had already been closed.
    #[error("Queue closed: enqueue attempted after close")]
    QueueClosed,

    /// A transform (or the sink) failed on a specific item.
    #[error("{0}")]
    TransformFailure(#[from] TransformFailure),

    /// The pipeline was configured with invalid capacities or concurrency.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// Cooperative cancellation was observed.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// A task panicked outside of a transform or could not be joined.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Returns true if this error is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns the transform failure carried by this error, if any.
    #[must_use]
    pub fn as_transform_failure(&self) -> Option<&TransformFailure> {
        match self {
            Self::TransformFailure(failure) => Some(failure),
            _ => None,
        }
    }

    /// A short, stable name for the error kind, used in events and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueClosed => "queue_closed",
            Self::TransformFailure(_) => "transform_failure",
            Self::Configuration(_) => "configuration",
            Self::Cancelled(_) => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

/// Errors surfaced by [`BoundedQueue`](crate::queue::BoundedQueue) waits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue was closed before the item could be enqueued.
    #[error("Queue closed")]
    Closed,

    /// The queue's cancellation token was raised.
    #[error("Queue wait cancelled: {0}")]
    Cancelled(String),
}

impl From<QueueError> for PipelineError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Closed => Self::QueueClosed,
            QueueError::Cancelled(reason) => Self::Cancelled(reason),
        }
    }
}

/// Error returned by [`BoundedQueue::try_enqueue`](crate::queue::BoundedQueue::try_enqueue).
///
/// The rejected item is handed back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum TryEnqueueError<T> {
    /// The queue is at capacity.
    Full(T),

    /// The queue has been closed.
    Closed(T),
}

impl<T> std::fmt::Display for TryEnqueueError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Queue is full"),
            Self::Closed(_) => f.write_str("Queue closed"),
        }
    }
}

impl<T: std::fmt::Debug> std::error::Error for TryEnqueueError<T> {}

impl<T> TryEnqueueError<T> {
    /// Recovers the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }
}

/// A transform or sink failed while handling one item.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Transform failed in stage '{stage}' on item #{sequence}: {message}")]
pub struct TransformFailure {
    /// Name of the stage (or sink) that failed.
    pub stage: String,
    /// Zero-based position of the item in the order the stage received it.
    pub sequence: u64,
    /// The collaborator's error message, including its cause chain.
    pub message: String,
}

impl TransformFailure {
    /// Creates a new transform failure.
    #[must_use]
    pub fn new(stage: impl Into<String>, sequence: u64, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            sequence,
            message: message.into(),
        }
    }

    /// Builds a failure from a collaborator error, keeping its cause chain.
    #[must_use]
    pub fn from_error(stage: impl Into<String>, sequence: u64, error: &anyhow::Error) -> Self {
        Self::new(stage, sequence, format!("{error:#}"))
    }
}

/// Error raised when a pipeline is built with invalid settings.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The stage the error refers to, if any.
    pub stage: Option<String>,
    /// Additional context key-value pairs.
    pub context: HashMap<String, String>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stage: None,
            context: HashMap::new(),
        }
    }

    /// Sets the stage involved.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}
