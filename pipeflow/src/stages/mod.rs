//! Stages and the transforms they run.
//!
//! A [`Stage`] reads items from an upstream queue, runs its [`Transform`]
//! on them with a fixed number of concurrent workers, and writes the results
//! to an output queue it owns. The output queue is closed exactly once, by
//! whichever worker exits last.
//!
//! With more than one worker, output order is **not** guaranteed to match
//! input order. Consumers must tolerate reordering.

mod runner;
mod stats;
mod transforms;

pub use runner::{Stage, WiredStage};
pub(crate) use runner::{abandon, panic_message};
pub use stats::{StageStats, StageStatsSnapshot};
pub use transforms::{AsyncFnTransform, FilterMapTransform, FilterTransform, FnTransform};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a transform may suspend while handling an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// Always completes without suspending (CPU-bound or trivial work).
    ///
    /// Workers yield to the scheduler after each synchronous transform.
    Sync,
    /// May suspend, e.g. while waiting on I/O.
    #[default]
    Async,
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Async => write!(f, "async"),
        }
    }
}

/// A per-item transformation run by stage workers.
///
/// Returning `Ok(None)` drops the item without producing output; returning
/// an error reports a per-item failure that is handled according to the
/// pipeline's [`ErrorPolicy`](crate::pipeline::ErrorPolicy). A transform has
/// no access to engine state and may be called concurrently.
#[async_trait]
pub trait Transform<In, Out>: Send + Sync
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Transforms one item.
    async fn apply(&self, item: In) -> anyhow::Result<Option<Out>>;

    /// Returns whether `apply` may suspend.
    fn kind(&self) -> TransformKind {
        TransformKind::Async
    }
}
