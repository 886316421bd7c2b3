//! Source drivers feeding the first queue of a pipeline.

use super::context::{PipelineState, RunContext};
use crate::errors::{PipelineError, QueueError, Result};
use crate::queue::BoundedQueue;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tracing::debug;

/// Enqueues every item of a non-blocking iterator.
pub(crate) async fn feed_iter<T, I>(
    iter: I,
    queue: Arc<BoundedQueue<T>>,
    ctx: Arc<RunContext>,
) -> Result<()>
where
    T: Send + 'static,
    I: Iterator<Item = T> + Send + 'static,
{
    let result = async {
        for item in iter {
            if ctx.is_aborting() {
                break;
            }
            queue.enqueue(item).await?;
            ctx.record_sourced();
        }
        Ok::<(), QueueError>(())
    }
    .await;

    finish_source(&queue, &ctx, result)
}

/// Enqueues every item of an iterator that may block, such as a reader over
/// file lines. The iterator runs on tokio's blocking thread pool.
pub(crate) async fn feed_blocking_iter<T, I>(
    iter: I,
    queue: Arc<BoundedQueue<T>>,
    ctx: Arc<RunContext>,
) -> Result<()>
where
    T: Send + 'static,
    I: Iterator<Item = T> + Send + 'static,
{
    let runtime = tokio::runtime::Handle::current();
    let feeder_queue = queue.clone();
    let feeder_ctx = ctx.clone();

    let joined = tokio::task::spawn_blocking(move || {
        for item in iter {
            if feeder_ctx.is_aborting() {
                break;
            }
            runtime.block_on(feeder_queue.enqueue(item))?;
            feeder_ctx.record_sourced();
        }
        Ok::<(), QueueError>(())
    })
    .await;

    match joined {
        Ok(result) => finish_source(&queue, &ctx, result),
        Err(join_error) => {
            queue.close();
            let err = PipelineError::Internal(format!("blocking source failed: {join_error}"));
            ctx.fail(err.clone());
            Err(err)
        }
    }
}

/// Enqueues every item of an async stream.
pub(crate) async fn feed_stream<T, S>(
    stream: S,
    queue: Arc<BoundedQueue<T>>,
    ctx: Arc<RunContext>,
) -> Result<()>
where
    T: Send + 'static,
    S: Stream<Item = T> + Send + 'static,
{
    let result = async {
        let mut stream = Box::pin(stream);
        loop {
            let next = tokio::select! {
                biased;
                () = ctx.cancelled() => {
                    return Err(QueueError::Cancelled(ctx.cancellation_reason()));
                }
                next = stream.next() => next,
            };
            let Some(item) = next else {
                return Ok::<(), QueueError>(());
            };
            if ctx.is_aborting() {
                return Ok(());
            }
            queue.enqueue(item).await?;
            ctx.record_sourced();
        }
    }
    .await;

    finish_source(&queue, &ctx, result)
}

/// Closes the source queue and records how the source ended.
fn finish_source<T>(
    queue: &BoundedQueue<T>,
    ctx: &RunContext,
    result: std::result::Result<(), QueueError>,
) -> Result<()> {
    queue.close();

    match result {
        Ok(()) if ctx.is_aborting() => {
            debug!(items = ctx.items_sourced(), "Source stopped by abort");
            Ok(())
        }
        Ok(()) => {
            debug!(items = ctx.items_sourced(), "Source exhausted");
            ctx.transition(PipelineState::Draining);
            Ok(())
        }
        // Downstream stopped reading because the run is already aborting.
        Err(QueueError::Closed) if ctx.is_aborting() => Ok(()),
        Err(err) => {
            let err = PipelineError::from(err);
            ctx.fail(err.clone());
            Err(err)
        }
    }
}
