//! Typed fluent pipeline builder.
//!
//! ```ignore
//! let report = Pipeline::from_iter(1..=5)
//!     .map("double", StageOptions::concurrent(2), |x| x * 2)
//!     .filter("small", StageOptions::default(), |x| *x <= 6)
//!     .collect()
//!     .run()
//!     .await?;
//! ```
//!
//! Configuration errors (zero concurrency, duplicate stage names) are
//! recorded while chaining and returned by [`PipelinePlan::build`], before
//! anything runs.

use super::context::{FailureCallback, RunContext};
use super::failure_tolerance::{ErrorPolicy, FailureRecord};
use super::report::RunReport;
use super::run::{Launcher, Pipeline, SinkLauncher};
use super::sink::{drive_sink, AsyncFnSink, CollectSink, FnSink, Sink};
use super::source::{feed_blocking_iter, feed_iter, feed_stream};
use crate::cancellation::{CancellationToken, TaskGroup};
use crate::config::{PipelineConfig, StageOptions, DEFAULT_CAPACITY};
use crate::errors::{ConfigurationError, Result};
use crate::events::{EventSink, NoOpEventSink};
use crate::queue::{BoundedQueue, QueueProbe};
use crate::stages::{
    AsyncFnTransform, FilterMapTransform, FilterTransform, FnTransform, Stage, StageStats,
    Transform,
};
use futures::{FutureExt, Stream, TryFutureExt};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Default name of the terminal sink.
pub const DEFAULT_SINK_NAME: &str = "sink";

/// Run-wide settings chosen before the source.
#[derive(Clone)]
pub struct PipelineSettings {
    name: String,
    source_capacity: usize,
    policy: ErrorPolicy,
    events: Arc<dyn EventSink>,
    on_failure: Option<FailureCallback>,
    token: Arc<CancellationToken>,
}

impl PipelineSettings {
    /// Creates default settings for the named pipeline.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_capacity: DEFAULT_CAPACITY,
            policy: ErrorPolicy::default(),
            events: Arc::new(NoOpEventSink),
            on_failure: None,
            token: Arc::new(CancellationToken::new()),
        }
    }

    /// Takes the name, source capacity and error policy from `config`.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(&config.name)
            .source_capacity(config.source_capacity)
            .error_policy(config.error_policy)
    }

    /// Sets the capacity of the queue the source writes to (`0` = unbounded).
    #[must_use]
    pub fn source_capacity(mut self, capacity: usize) -> Self {
        self.source_capacity = capacity;
        self
    }

    /// Sets the error policy.
    #[must_use]
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Registers a callback invoked for every per-item failure.
    #[must_use]
    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FailureRecord) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(callback));
        self
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.token = token;
        self
    }

    /// Sources the pipeline from a non-blocking iterator.
    pub fn from_iter<T, I>(self, iter: I) -> PipelineBuilder<T>
    where
        T: Send + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let iter = iter.into_iter();
        self.with_source(move |queue, group, ctx| {
            group.spawn("source", feed_iter(iter, queue, ctx.clone()));
        })
    }

    /// Sources the pipeline from an iterator that may block, such as the
    /// lines of a file. The iterator is driven on the blocking thread pool.
    pub fn from_blocking_iter<T, I>(self, iter: I) -> PipelineBuilder<T>
    where
        T: Send + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let iter = iter.into_iter();
        self.with_source(move |queue, group, ctx| {
            group.spawn("source", feed_blocking_iter(iter, queue, ctx.clone()));
        })
    }

    /// Sources the pipeline from an async stream.
    pub fn from_stream<T, S>(self, stream: S) -> PipelineBuilder<T>
    where
        T: Send + 'static,
        S: Stream<Item = T> + Send + 'static,
    {
        self.with_source(move |queue, group, ctx| {
            group.spawn("source", feed_stream(stream, queue, ctx.clone()));
        })
    }

    /// Uses a queue written by external producers as the source.
    ///
    /// The producers own the queue's lifecycle: the run ends only after they
    /// close it. The queue is bound to the run's cancellation token unless it
    /// already has one.
    pub fn from_queue<T>(self, queue: Arc<BoundedQueue<T>>) -> PipelineBuilder<T>
    where
        T: Send + 'static,
    {
        if !queue.bind_cancellation(self.token.clone()) {
            debug!(pipeline = %self.name, "Source queue already bound to a cancellation token");
        }
        PipelineBuilder::start(self, queue, None)
    }

    fn with_source<T, F>(self, launch: F) -> PipelineBuilder<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<BoundedQueue<T>>, &TaskGroup, &Arc<RunContext>) + Send + 'static,
    {
        let queue = Arc::new(
            BoundedQueue::new(self.source_capacity).with_cancellation(self.token.clone()),
        );
        let source_queue = queue.clone();
        let launcher: Launcher = Box::new(move |group: &TaskGroup, ctx: &Arc<RunContext>| {
            launch(source_queue, group, ctx);
        });
        PipelineBuilder::start(self, queue, Some(launcher))
    }
}

impl std::fmt::Debug for PipelineSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineSettings")
            .field("name", &self.name)
            .field("source_capacity", &self.source_capacity)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// A pipeline under construction whose last queue carries items of type `T`.
pub struct PipelineBuilder<T> {
    settings: PipelineSettings,
    tail: Arc<BoundedQueue<T>>,
    source_queue: Arc<dyn QueueProbe>,
    launchers: Vec<Launcher>,
    stages: Vec<Arc<StageStats>>,
    names: HashSet<String>,
    error: Option<ConfigurationError>,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    fn start(
        settings: PipelineSettings,
        queue: Arc<BoundedQueue<T>>,
        source: Option<Launcher>,
    ) -> Self {
        Self {
            settings,
            source_queue: queue.clone(),
            tail: queue,
            launchers: source.into_iter().collect(),
            stages: Vec::new(),
            names: HashSet::new(),
            error: None,
        }
    }

    /// Appends a stage running `transform`.
    pub fn pipe<U, X>(
        self,
        name: impl Into<String>,
        options: StageOptions,
        transform: X,
    ) -> PipelineBuilder<U>
    where
        U: Send + 'static,
        X: Transform<T, U> + 'static,
    {
        self.stage(Stage::new(name, options, transform))
    }

    /// Appends a stage running a shared transform.
    pub fn pipe_arc<U>(
        self,
        name: impl Into<String>,
        options: StageOptions,
        transform: Arc<dyn Transform<T, U>>,
    ) -> PipelineBuilder<U>
    where
        U: Send + 'static,
    {
        self.stage(Stage::from_arc(name, options, transform))
    }

    /// Appends an infallible synchronous mapping stage.
    pub fn map<U, F>(
        self,
        name: impl Into<String>,
        options: StageOptions,
        func: F,
    ) -> PipelineBuilder<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.pipe(name, options, FnTransform::new(move |item| Ok(Some(func(item)))))
    }

    /// Appends a fallible synchronous mapping stage.
    pub fn try_map<U, F>(
        self,
        name: impl Into<String>,
        options: StageOptions,
        func: F,
    ) -> PipelineBuilder<U>
    where
        U: Send + 'static,
        F: Fn(T) -> anyhow::Result<U> + Send + Sync + 'static,
    {
        self.pipe(name, options, FnTransform::new(move |item| func(item).map(Some)))
    }

    /// Appends a fallible asynchronous mapping stage.
    pub fn map_async<U, F, Fut>(
        self,
        name: impl Into<String>,
        options: StageOptions,
        func: F,
    ) -> PipelineBuilder<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        self.pipe(
            name,
            options,
            AsyncFnTransform::new(move |item| func(item).map_ok(Some)),
        )
    }

    /// Appends a stage dropping items that fail `predicate`.
    pub fn filter<P>(self, name: impl Into<String>, options: StageOptions, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.pipe(name, options, FilterTransform::new(predicate))
    }

    /// Appends a stage mapping items and dropping those mapped to `None`.
    pub fn filter_map<U, F>(
        self,
        name: impl Into<String>,
        options: StageOptions,
        func: F,
    ) -> PipelineBuilder<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Option<U> + Send + Sync + 'static,
    {
        self.pipe(name, options, FilterMapTransform::new(func))
    }

    /// Appends a stage.
    pub fn stage<U>(mut self, stage: Stage<T, U>) -> PipelineBuilder<U>
    where
        U: Send + 'static,
    {
        self.check_stage(stage.name(), stage.validate());

        let wired = stage.wire(self.tail, &self.settings.token);
        let tail = wired.output();
        self.stages.push(wired.stats());
        self.launchers
            .push(Box::new(move |group: &TaskGroup, ctx: &Arc<RunContext>| {
                wired.spawn(group, ctx);
            }));

        PipelineBuilder {
            settings: self.settings,
            tail,
            source_queue: self.source_queue,
            launchers: self.launchers,
            stages: self.stages,
            names: self.names,
            error: self.error,
        }
    }

    /// Terminates the pipeline with a named sink.
    pub fn sink_with<S>(mut self, name: impl Into<String>, sink: S) -> PipelinePlan<S::Output>
    where
        S: Sink<T> + 'static,
    {
        let name = name.into();
        self.check_stage(&name, Ok(()));

        let queue = self.tail;
        let sink_name = name.clone();
        let launch: SinkLauncher<S::Output> = Box::new(move |ctx: Arc<RunContext>| {
            drive_sink(sink, sink_name, queue, ctx).boxed()
        });

        PipelinePlan {
            settings: self.settings,
            source_queue: self.source_queue,
            launchers: self.launchers,
            stages: self.stages,
            sink_name: name,
            sink: launch,
            error: self.error,
        }
    }

    /// Terminates the pipeline with a synchronous closure.
    pub fn sink<F>(self, func: F) -> PipelinePlan<()>
    where
        F: FnMut(T) -> anyhow::Result<()> + Send + 'static,
    {
        self.sink_with(DEFAULT_SINK_NAME, FnSink::new(func))
    }

    /// Terminates the pipeline with an asynchronous closure.
    pub fn sink_async<F, Fut>(self, func: F) -> PipelinePlan<()>
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.sink_with(DEFAULT_SINK_NAME, AsyncFnSink::new(func))
    }

    /// Terminates the pipeline by collecting every item into a `Vec`.
    pub fn collect(self) -> PipelinePlan<Vec<T>> {
        self.sink_with(DEFAULT_SINK_NAME, CollectSink::new())
    }

    /// Returns the number of stages added so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    fn check_stage(&mut self, name: &str, valid: std::result::Result<(), ConfigurationError>) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = valid {
            self.error = Some(err);
        } else if !self.names.insert(name.to_string()) {
            self.error = Some(
                ConfigurationError::new(format!("Duplicate stage name '{name}'"))
                    .with_stage(name),
            );
        }
    }
}

impl<T> std::fmt::Debug for PipelineBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("settings", &self.settings)
            .field("stages", &self.stages.len())
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// A fully chained pipeline waiting to be validated.
pub struct PipelinePlan<O> {
    settings: PipelineSettings,
    source_queue: Arc<dyn QueueProbe>,
    launchers: Vec<Launcher>,
    stages: Vec<Arc<StageStats>>,
    sink_name: String,
    sink: SinkLauncher<O>,
    error: Option<ConfigurationError>,
}

impl<O: Send + 'static> PipelinePlan<O> {
    /// Validates the chain and produces a runnable pipeline.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error recorded while chaining.
    pub fn build(self) -> Result<Pipeline<O>> {
        if let Some(err) = self.error {
            return Err(err.into());
        }

        let settings = self.settings;
        let ctx = RunContext::new(settings.name)
            .with_policy(settings.policy)
            .with_cancellation(settings.token)
            .with_event_sink(settings.events)
            .with_failure_callback(settings.on_failure)
            .with_stages(self.stages);

        Ok(Pipeline::new(
            Arc::new(ctx),
            self.source_queue,
            self.launchers,
            self.sink_name,
            self.sink,
        ))
    }

    /// Builds and runs the pipeline.
    ///
    /// # Errors
    ///
    /// Returns configuration errors from [`build`](Self::build) or the run's
    /// fatal error.
    pub async fn run(self) -> Result<RunReport<O>> {
        self.build()?.run().await
    }
}

impl<O> std::fmt::Debug for PipelinePlan<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelinePlan")
            .field("settings", &self.settings)
            .field("stages", &self.stages.len())
            .field("sink", &self.sink_name)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Builds a chain of same-typed stages from parallel per-stage settings.
pub(crate) fn build_uniform<T, I, S>(
    settings: PipelineSettings,
    source: I,
    stages: Vec<(String, StageOptions)>,
    transforms: Vec<Arc<dyn Transform<T, T>>>,
    sink: S,
) -> Result<Pipeline<S::Output>>
where
    T: Send + 'static,
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
    S: Sink<T> + 'static,
{
    if stages.len() != transforms.len() {
        return Err(ConfigurationError::new(format!(
            "Expected {} transforms, got {}",
            stages.len(),
            transforms.len()
        ))
        .with_context_entry("stages", stages.len().to_string())
        .with_context_entry("transforms", transforms.len().to_string())
        .into());
    }

    let mut builder = settings.from_iter(source);
    for ((name, options), transform) in stages.into_iter().zip(transforms) {
        builder = builder.pipe_arc(name, options, transform);
    }
    builder.sink_with(DEFAULT_SINK_NAME, sink).build()
}

/// Pairs positional capacities and concurrency degrees into stage options.
pub(crate) fn positional_stages(
    capacities: &[usize],
    concurrencies: &[usize],
) -> std::result::Result<Vec<(String, StageOptions)>, ConfigurationError> {
    if capacities.len() != concurrencies.len() {
        return Err(ConfigurationError::new(format!(
            "Got {} capacities but {} concurrency degrees",
            capacities.len(),
            concurrencies.len()
        )));
    }

    Ok(capacities
        .iter()
        .zip(concurrencies)
        .enumerate()
        .map(|(i, (&capacity, &concurrency))| {
            (format!("stage-{i}"), StageOptions::new(concurrency, capacity))
        })
        .collect())
}
