//! Terminal consumers of a pipeline.

use super::context::RunContext;
use crate::errors::{PipelineError, QueueError, Result, TransformFailure};
use crate::queue::BoundedQueue;
use crate::stages::{abandon, panic_message};
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt::Debug;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::debug;

/// The terminal consumer of the last stage's output.
///
/// `consume` is called from a single task, one item at a time; a failure is
/// handled like a transform failure under the sink's name. `finish` runs once
/// after the last item and its output is returned in the run report.
#[async_trait]
pub trait Sink<T: Send + 'static>: Send {
    /// Value produced when the sink finishes.
    type Output: Send + 'static;

    /// Consumes one item.
    async fn consume(&mut self, item: T) -> anyhow::Result<()>;

    /// Completes the sink after end-of-stream.
    async fn finish(&mut self) -> anyhow::Result<Self::Output>;
}

/// A sink calling a synchronous closure for each item.
pub struct FnSink<F> {
    func: F,
}

impl<F> FnSink<F> {
    /// Creates a new function-based sink.
    pub fn new<T>(func: F) -> Self
    where
        F: FnMut(T) -> anyhow::Result<()>,
    {
        Self { func }
    }
}

impl<F> Debug for FnSink<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, F> Sink<T> for FnSink<F>
where
    T: Send + 'static,
    F: FnMut(T) -> anyhow::Result<()> + Send,
{
    type Output = ();

    async fn consume(&mut self, item: T) -> anyhow::Result<()> {
        (self.func)(item)
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A sink awaiting an async closure for each item.
pub struct AsyncFnSink<F> {
    func: F,
}

impl<F> AsyncFnSink<F> {
    /// Creates a new async function-based sink.
    pub fn new<T, Fut>(func: F) -> Self
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        Self { func }
    }
}

impl<F> Debug for AsyncFnSink<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFnSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, F, Fut> Sink<T> for AsyncFnSink<F>
where
    T: Send + 'static,
    F: FnMut(T) -> Fut + Send,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    type Output = ();

    async fn consume(&mut self, item: T) -> anyhow::Result<()> {
        (self.func)(item).await
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A sink gathering every item into a `Vec`.
#[derive(Debug)]
pub struct CollectSink<T> {
    items: Vec<T>,
}

impl<T> CollectSink<T> {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> Default for CollectSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> Sink<T> for CollectSink<T> {
    type Output = Vec<T>;

    async fn consume(&mut self, item: T) -> anyhow::Result<()> {
        self.items.push(item);
        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<Vec<T>> {
        Ok(std::mem::take(&mut self.items))
    }
}

/// Drives `sink` until `queue` reports end-of-stream, then finishes it.
///
/// The queue is closed when the loop ends, however it ends.
pub(crate) async fn drive_sink<T, S>(
    mut sink: S,
    name: String,
    queue: Arc<BoundedQueue<T>>,
    ctx: Arc<RunContext>,
) -> Result<S::Output>
where
    T: Send + 'static,
    S: Sink<T>,
{
    let consumed = consume_all(&mut sink, &name, &queue, &ctx).await;
    queue.close();
    consumed?;

    debug!(sink = %name, items = ctx.items_sunk(), "Sink reached end of stream");
    match AssertUnwindSafe(sink.finish()).catch_unwind().await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(error)) => Err(fail_finish(
            &ctx,
            TransformFailure::from_error(&name, ctx.items_sunk(), &error),
        )),
        Err(panic) => Err(fail_finish(
            &ctx,
            TransformFailure::new(
                &name,
                ctx.items_sunk(),
                format!("sink panicked in finish: {}", panic_message(panic.as_ref())),
            ),
        )),
    }
}

async fn consume_all<T, S>(
    sink: &mut S,
    name: &str,
    queue: &BoundedQueue<T>,
    ctx: &RunContext,
) -> Result<()>
where
    T: Send + 'static,
    S: Sink<T>,
{
    let mut sequence = 0_u64;

    loop {
        let ready = tokio::select! {
            biased;
            () = ctx.cancelled() => Err(QueueError::Cancelled(ctx.cancellation_reason())),
            ready = queue.wait_for_items_or_close() => ready,
        };
        match ready {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(err) => return Err(abandon(ctx, err)),
        }

        while let Some(item) = queue.try_dequeue() {
            let current = sequence;
            sequence += 1;
            if ctx.is_aborting() {
                continue;
            }

            let outcome = tokio::select! {
                biased;
                () = ctx.cancelled() => {
                    return Err(abandon(ctx, QueueError::Cancelled(ctx.cancellation_reason())));
                }
                outcome = AssertUnwindSafe(sink.consume(item)).catch_unwind() => outcome,
            };

            match outcome {
                Ok(Ok(())) => ctx.record_sunk(),
                Ok(Err(error)) => {
                    ctx.report_failure(TransformFailure::from_error(name, current, &error));
                }
                Err(panic) => {
                    ctx.report_failure(TransformFailure::new(
                        name,
                        current,
                        format!("sink panicked: {}", panic_message(panic.as_ref())),
                    ));
                }
            }
        }
    }
}

/// A failing `finish` is fatal regardless of the error policy.
fn fail_finish(ctx: &RunContext, failure: TransformFailure) -> PipelineError {
    let err = PipelineError::TransformFailure(failure);
    ctx.fail(err.clone());
    err
}
