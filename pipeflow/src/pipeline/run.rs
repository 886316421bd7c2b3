//! Pipeline execution.

use super::builder::{build_uniform, positional_stages, PipelineBuilder, PipelineSettings};
use super::context::{PipelineHandle, PipelineState, RunContext};
use super::report::RunReport;
use super::sink::Sink;
use crate::cancellation::TaskGroup;
use crate::config::PipelineConfig;
use crate::errors::{PipelineError, Result};
use crate::events::{PIPELINE_COMPLETED, PIPELINE_STARTED};
use crate::queue::{BoundedQueue, QueueProbe};
use crate::stages::Transform;
use futures::future::BoxFuture;
use futures::Stream;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Spawns one part of the pipeline (the source or a stage's workers).
pub(crate) type Launcher = Box<dyn FnOnce(&TaskGroup, &Arc<RunContext>) + Send>;

/// Starts the sink driver, which runs on the caller's task.
pub(crate) type SinkLauncher<O> =
    Box<dyn FnOnce(Arc<RunContext>) -> BoxFuture<'static, Result<O>> + Send>;

/// A validated pipeline ready to run once.
///
/// `O` is the sink's output, returned in the [`RunReport`].
pub struct Pipeline<O> {
    ctx: Arc<RunContext>,
    source_queue: Arc<dyn QueueProbe>,
    launchers: Vec<Launcher>,
    sink_name: String,
    sink: SinkLauncher<O>,
}

impl Pipeline<()> {
    /// Starts configuring a named pipeline.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> PipelineSettings {
        PipelineSettings::new(name)
    }

    /// Starts an unnamed pipeline sourced from a non-blocking iterator.
    pub fn from_iter<T, I>(iter: I) -> PipelineBuilder<T>
    where
        T: Send + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::builder("pipeline").from_iter(iter)
    }

    /// Starts an unnamed pipeline sourced from a blocking iterator.
    pub fn from_blocking_iter<T, I>(iter: I) -> PipelineBuilder<T>
    where
        T: Send + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::builder("pipeline").from_blocking_iter(iter)
    }

    /// Starts an unnamed pipeline sourced from an async stream.
    pub fn from_stream<T, S>(stream: S) -> PipelineBuilder<T>
    where
        T: Send + 'static,
        S: Stream<Item = T> + Send + 'static,
    {
        Self::builder("pipeline").from_stream(stream)
    }

    /// Starts an unnamed pipeline reading a queue fed by external producers.
    pub fn from_queue<T>(queue: Arc<BoundedQueue<T>>) -> PipelineBuilder<T>
    where
        T: Send + 'static,
    {
        Self::builder("pipeline").from_queue(queue)
    }

    /// Wires a chain of same-typed stages from positional settings.
    ///
    /// Stage `i` gets `capacities[i]` as its output capacity and
    /// `concurrencies[i]` workers; stages are named `stage-0`, `stage-1`, ...
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`](crate::errors::ConfigurationError)
    /// when the three lists differ in length or a concurrency degree is 0.
    pub fn build<T, I, S>(
        source: I,
        capacities: &[usize],
        concurrencies: &[usize],
        transforms: Vec<Arc<dyn Transform<T, T>>>,
        sink: S,
    ) -> Result<Pipeline<S::Output>>
    where
        T: Send + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        S: Sink<T> + 'static,
    {
        let stages = positional_stages(capacities, concurrencies)?;
        build_uniform(PipelineSettings::new("pipeline"), source, stages, transforms, sink)
    }

    /// Wires a chain of same-typed stages described by `config`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`](crate::errors::ConfigurationError)
    /// when the config is invalid or lists a different number of stages than
    /// `transforms`.
    pub fn from_config<T, I, S>(
        config: &PipelineConfig,
        source: I,
        transforms: Vec<Arc<dyn Transform<T, T>>>,
        sink: S,
    ) -> Result<Pipeline<S::Output>>
    where
        T: Send + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        S: Sink<T> + 'static,
    {
        config.validate()?;
        let stages = config
            .stages
            .iter()
            .map(|stage| (stage.name.clone(), stage.options))
            .collect();
        build_uniform(PipelineSettings::from_config(config), source, stages, transforms, sink)
    }
}

impl<O: Send + 'static> Pipeline<O> {
    pub(crate) fn new(
        ctx: Arc<RunContext>,
        source_queue: Arc<dyn QueueProbe>,
        launchers: Vec<Launcher>,
        sink_name: String,
        sink: SinkLauncher<O>,
    ) -> Self {
        Self {
            ctx,
            source_queue,
            launchers,
            sink_name,
            sink,
        }
    }

    /// Returns a handle for observing and cancelling the run.
    #[must_use]
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle::new(self.ctx.clone())
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.ctx.pipeline()
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.ctx.stages().len()
    }

    /// Runs the pipeline to completion.
    ///
    /// Spawns the source and every stage worker onto the current tokio
    /// runtime, drives the sink on the calling task and waits for all of
    /// them. Consumes the pipeline, so a run cannot be restarted.
    ///
    /// # Errors
    ///
    /// Returns the run's first fatal error: a transform or sink failure under
    /// [`ErrorPolicy::Abort`](super::ErrorPolicy::Abort), a failing sink
    /// `finish`, [`PipelineError::Cancelled`](crate::errors::PipelineError::Cancelled)
    /// after cancellation, or an internal error if a task could not be joined.
    pub async fn run(self) -> Result<RunReport<O>> {
        let Self {
            ctx,
            source_queue,
            launchers,
            sink_name,
            sink,
        } = self;
        let started = Instant::now();

        ctx.transition(PipelineState::Running);
        // Cancelled while idle: the fatal error is already recorded but the
        // state machine could not leave Idle for Aborting.
        if ctx.token().is_cancelled() {
            ctx.fail(PipelineError::Cancelled(ctx.cancellation_reason()));
        }
        if ctx.has_fatal() {
            ctx.transition(PipelineState::Aborting);
        }
        let stage_names: Vec<&str> = ctx.stages().iter().map(|s| s.name()).collect();
        info!(
            pipeline = %ctx.pipeline(),
            run_id = %ctx.run_id(),
            stages = ?stage_names,
            sink = %sink_name,
            policy = ?ctx.policy(),
            "Pipeline run started"
        );
        ctx.emit(
            PIPELINE_STARTED,
            serde_json::json!({
                "stages": stage_names,
                "sink": sink_name,
                "policy": ctx.policy(),
            }),
        )
        .await;

        let group = TaskGroup::new();
        for launch in launchers {
            launch(&group, &ctx);
        }

        let (sink_result, group_result) = tokio::join!(sink(ctx.clone()), group.wait());
        let outcome = match ctx.take_fatal() {
            Some(fatal) => Err(fatal),
            None => group_result.and(sink_result),
        };

        ctx.transition(PipelineState::Completed);
        let elapsed = started.elapsed();
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        match &outcome {
            Ok(_) => info!(
                pipeline = %ctx.pipeline(),
                items_sourced = ctx.items_sourced(),
                items_sunk = ctx.items_sunk(),
                failures = ctx.failure_count(),
                elapsed_ms,
                "Pipeline run completed"
            ),
            Err(err) => warn!(
                pipeline = %ctx.pipeline(),
                error = %err,
                elapsed_ms,
                "Pipeline run failed"
            ),
        }
        ctx.emit(
            PIPELINE_COMPLETED,
            serde_json::json!({
                "success": outcome.is_ok(),
                "error": outcome.as_ref().err().map(ToString::to_string),
                "error_kind": outcome.as_ref().err().map(|e| e.kind()),
                "items_sourced": ctx.items_sourced(),
                "items_sunk": ctx.items_sunk(),
                "elapsed_ms": elapsed_ms,
            }),
        )
        .await;

        let output = outcome?;
        Ok(RunReport {
            output,
            run_id: ctx.run_id(),
            pipeline: ctx.pipeline().to_string(),
            items_sourced: ctx.items_sourced(),
            items_sunk: ctx.items_sunk(),
            stages: ctx.stage_snapshots(),
            source_queue: source_queue.stats(),
            failures: ctx.take_failures(),
            elapsed,
        })
    }
}

impl<O> std::fmt::Debug for Pipeline<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.ctx.pipeline())
            .field("run_id", &self.ctx.run_id())
            .field("stages", &self.ctx.stages().len())
            .field("sink", &self.sink_name)
            .finish_non_exhaustive()
    }
}
