//! Stage wiring and the worker loop.

use super::{StageStats, Transform, TransformKind};
use crate::cancellation::{CancellationToken, TaskGroup};
use crate::config::StageOptions;
use crate::errors::{ConfigurationError, PipelineError, QueueError, Result, TransformFailure};
use crate::events::STAGE_COMPLETED;
use crate::pipeline::RunContext;
use crate::queue::BoundedQueue;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info_span, Instrument};

/// A named transform with its concurrency and output capacity.
///
/// A stage is inert until it is [wired](Stage::wire) to an input queue.
pub struct Stage<In, Out> {
    name: String,
    options: StageOptions,
    transform: Arc<dyn Transform<In, Out>>,
}

impl<In, Out> Stage<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Creates a new stage.
    pub fn new<X>(name: impl Into<String>, options: StageOptions, transform: X) -> Self
    where
        X: Transform<In, Out> + 'static,
    {
        Self::from_arc(name, options, Arc::new(transform))
    }

    /// Creates a stage from a shared transform.
    pub fn from_arc(
        name: impl Into<String>,
        options: StageOptions,
        transform: Arc<dyn Transform<In, Out>>,
    ) -> Self {
        Self {
            name: name.into(),
            options,
            transform,
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stage options.
    #[must_use]
    pub fn options(&self) -> StageOptions {
        self.options
    }

    /// Validates the stage options.
    pub fn validate(&self) -> std::result::Result<(), ConfigurationError> {
        self.options.validate(&self.name)
    }

    /// Connects the stage to its input queue and creates its output queue.
    ///
    /// The output queue is bound to `token`, so its waits fail once the run
    /// is cancelled.
    pub fn wire(
        self,
        input: Arc<BoundedQueue<In>>,
        token: &Arc<CancellationToken>,
    ) -> WiredStage<In, Out> {
        let output = Arc::new(
            BoundedQueue::new(self.options.capacity).with_cancellation(Arc::clone(token)),
        );
        let stats = Arc::new(StageStats::new(
            &self.name,
            self.options.concurrency,
            output.clone(),
        ));
        let kind = self.transform.kind();

        WiredStage {
            shared: Arc::new(Shared {
                name: self.name,
                transform: self.transform,
                kind,
                input,
                output,
                stats,
            }),
        }
    }
}

impl<In, Out> std::fmt::Debug for Stage<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// A stage connected to its input and output queues, ready to spawn.
pub struct WiredStage<In, Out> {
    shared: Arc<Shared<In, Out>>,
}

struct Shared<In, Out> {
    name: String,
    transform: Arc<dyn Transform<In, Out>>,
    kind: TransformKind,
    input: Arc<BoundedQueue<In>>,
    output: Arc<BoundedQueue<Out>>,
    stats: Arc<StageStats>,
}

impl<In, Out> WiredStage<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Returns the queue this stage writes to.
    #[must_use]
    pub fn output(&self) -> Arc<BoundedQueue<Out>> {
        self.shared.output.clone()
    }

    /// Returns the stage counters.
    #[must_use]
    pub fn stats(&self) -> Arc<StageStats> {
        self.shared.stats.clone()
    }

    /// Spawns the stage's workers into `group`.
    ///
    /// The worker that exits last closes the output queue. It also closes the
    /// input queue, so upstream producers fail fast instead of blocking on a
    /// queue nobody reads any more.
    pub fn spawn(self, group: &TaskGroup, ctx: &Arc<RunContext>) {
        let concurrency = self.shared.stats.concurrency();
        self.shared.stats.workers_started(concurrency);

        for worker in 0..concurrency {
            let shared = self.shared.clone();
            let ctx = ctx.clone();
            let span = info_span!("stage_worker", stage = %shared.name, worker);
            group.spawn(
                format!("{}#{worker}", shared.name),
                run_worker(shared, ctx).instrument(span),
            );
        }
    }
}

/// Decrements the live-worker count when a worker exits, however it exits.
struct WorkerExit<In, Out> {
    shared: Arc<Shared<In, Out>>,
    ctx: Arc<RunContext>,
}

impl<In, Out> Drop for WorkerExit<In, Out> {
    fn drop(&mut self) {
        if self.shared.stats.worker_exited() > 0 {
            return;
        }

        self.shared.output.close();
        self.shared.input.close();

        let snapshot = self.shared.stats.snapshot();
        debug!(
            stage = %self.shared.name,
            received = snapshot.received,
            produced = snapshot.produced,
            dropped = snapshot.dropped,
            failed = snapshot.failed,
            discarded = snapshot.discarded,
            "Stage completed"
        );
        self.ctx.try_emit(
            STAGE_COMPLETED,
            serde_json::to_value(&snapshot).unwrap_or_default(),
        );
    }
}

async fn run_worker<In, Out>(shared: Arc<Shared<In, Out>>, ctx: Arc<RunContext>) -> Result<()>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    let _exit = WorkerExit {
        shared: shared.clone(),
        ctx: ctx.clone(),
    };

    loop {
        // The input may be an external queue bound to another token, so the
        // run's own token is raced here too.
        let ready = tokio::select! {
            biased;
            () = ctx.cancelled() => Err(QueueError::Cancelled(ctx.cancellation_reason())),
            ready = shared.input.wait_for_items_or_close() => ready,
        };
        match ready {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => return Err(abandon(&ctx, err)),
        }

        while let Some(item) = shared.input.try_dequeue() {
            let sequence = shared.stats.record_received();
            if ctx.is_aborting() {
                shared.stats.record_discarded();
                continue;
            }

            let outcome = tokio::select! {
                biased;
                () = ctx.cancelled() => {
                    shared.stats.record_discarded();
                    return Err(abandon(&ctx, QueueError::Cancelled(ctx.cancellation_reason())));
                }
                outcome = AssertUnwindSafe(shared.transform.apply(item)).catch_unwind() => outcome,
            };

            if shared.kind == TransformKind::Sync {
                tokio::task::yield_now().await;
            }

            match outcome {
                Ok(Ok(Some(out))) => match shared.output.enqueue(out).await {
                    Ok(()) => shared.stats.record_produced(),
                    Err(QueueError::Closed) if ctx.is_aborting() => {
                        shared.stats.record_discarded();
                    }
                    Err(err) => return Err(abandon(&ctx, err)),
                },
                Ok(Ok(None)) => shared.stats.record_dropped(),
                Ok(Err(error)) => {
                    shared.stats.record_failed();
                    ctx.report_failure(TransformFailure::from_error(&shared.name, sequence, &error));
                }
                Err(panic) => {
                    shared.stats.record_failed();
                    ctx.report_failure(TransformFailure::new(
                        &shared.name,
                        sequence,
                        format!("transform panicked: {}", panic_message(panic.as_ref())),
                    ));
                }
            }
        }
    }

    Ok(())
}

/// Turns a queue error into the run's fatal error.
pub(crate) fn abandon(ctx: &RunContext, err: QueueError) -> PipelineError {
    let err = PipelineError::from(err);
    ctx.fail(err.clone());
    err
}

/// Extracts the message of a caught panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
