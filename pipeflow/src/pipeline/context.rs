//! Shared state of one pipeline run.

use super::failure_tolerance::{ErrorPolicy, FailureCollector, FailureRecord};
use crate::cancellation::CancellationToken;
use crate::errors::{PipelineError, TransformFailure};
use crate::events::{EventSink, NoOpEventSink, ITEM_FAILED, PIPELINE_STATE_CHANGED};
use crate::stages::{StageStats, StageStatsSnapshot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Lifecycle state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Built but not yet running.
    #[default]
    Idle,
    /// The source is still producing.
    Running,
    /// The source is exhausted; stages and sink are finishing.
    Draining,
    /// A fatal error or cancellation was observed; queues are being drained
    /// without processing.
    Aborting,
    /// Every task has exited.
    Completed,
}

impl PipelineState {
    /// Returns true if the run may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Running)
                | (Self::Running | Self::Draining, Self::Aborting)
                | (Self::Running, Self::Draining)
                | (Self::Running | Self::Draining | Self::Aborting, Self::Completed)
        )
    }

    /// Returns true for the terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Completed
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Aborting => write!(f, "aborting"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Callback invoked for every per-item failure.
pub type FailureCallback = Arc<dyn Fn(&FailureRecord) + Send + Sync>;

/// State shared by the source, every stage worker and the sink of one run.
///
/// Items never pass through the context; it only carries the run's policy,
/// its fatal error, failure records and counters.
pub struct RunContext {
    run_id: Uuid,
    pipeline: String,
    policy: ErrorPolicy,
    token: Arc<CancellationToken>,
    state: Mutex<PipelineState>,
    fatal: Mutex<Option<PipelineError>>,
    failures: Mutex<FailureCollector>,
    on_failure: Option<FailureCallback>,
    events: Arc<dyn EventSink>,
    stages: Vec<Arc<StageStats>>,
    sourced: AtomicU64,
    sunk: AtomicU64,
}

impl RunContext {
    /// Creates a context for a run of the named pipeline.
    #[must_use]
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            pipeline: pipeline.into(),
            policy: ErrorPolicy::default(),
            token: Arc::new(CancellationToken::new()),
            state: Mutex::new(PipelineState::Idle),
            fatal: Mutex::new(None),
            failures: Mutex::new(FailureCollector::new(ErrorPolicy::default())),
            on_failure: None,
            events: Arc::new(NoOpEventSink),
            stages: Vec::new(),
            sourced: AtomicU64::new(0),
            sunk: AtomicU64::new(0),
        }
    }

    /// Sets the error policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self.failures = Mutex::new(FailureCollector::new(policy));
        self
    }

    /// Uses `token` as the run's cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.token = token;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the per-item failure callback.
    #[must_use]
    pub fn with_failure_callback(mut self, callback: Option<FailureCallback>) -> Self {
        self.on_failure = callback;
        self
    }

    #[must_use]
    pub(crate) fn with_stages(mut self, stages: Vec<Arc<StageStats>>) -> Self {
        self.stages = stages;
        self
    }

    /// Returns the run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Returns the error policy.
    #[must_use]
    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// Returns true once a fatal error or cancellation has been observed.
    #[must_use]
    pub fn is_aborting(&self) -> bool {
        self.fatal.lock().is_some() || self.token.is_cancelled()
    }

    /// Completes once the run is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Returns the cancellation reason, or an empty string.
    #[must_use]
    pub fn cancellation_reason(&self) -> String {
        self.token.reason().unwrap_or_default()
    }

    /// Moves to `next` if the state machine allows it.
    ///
    /// Returns false (and changes nothing) for a disallowed transition.
    pub fn transition(&self, next: PipelineState) -> bool {
        let previous = {
            let mut state = self.state.lock();
            if !state.can_transition_to(next) {
                return false;
            }
            std::mem::replace(&mut *state, next)
        };

        debug!(pipeline = %self.pipeline, from = %previous, to = %next, "Pipeline state changed");
        self.try_emit(
            PIPELINE_STATE_CHANGED,
            serde_json::json!({ "from": previous, "to": next }),
        );
        true
    }

    /// Handles a per-item failure according to the error policy.
    ///
    /// Returns true if the failure aborted the run.
    pub fn report_failure(&self, failure: TransformFailure) -> bool {
        let record = FailureRecord::from(&failure);
        match self.policy {
            ErrorPolicy::Skip => warn!(
                stage = %record.stage,
                sequence = record.sequence,
                error = %record.error,
                "Item failed, skipping"
            ),
            ErrorPolicy::Abort => error!(
                stage = %record.stage,
                sequence = record.sequence,
                error = %record.error,
                "Item failed, aborting run"
            ),
        }

        self.try_emit(
            ITEM_FAILED,
            serde_json::json!({
                "stage": record.stage,
                "sequence": record.sequence,
                "error": record.error,
                "policy": self.policy,
            }),
        );
        if let Some(callback) = &self.on_failure {
            callback.as_ref()(&record);
        }

        let stop = {
            let mut failures = self.failures.lock();
            failures.record_failure(record);
            failures.should_stop()
        };
        stop && self.fail(PipelineError::TransformFailure(failure))
    }

    /// Records the run's fatal error and switches to [`PipelineState::Aborting`].
    ///
    /// Only the first fatal error is kept; returns true if `err` was it.
    pub fn fail(&self, err: PipelineError) -> bool {
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_some() {
                return false;
            }
            debug!(pipeline = %self.pipeline, error = %err, "Fatal error recorded");
            *fatal = Some(err);
        }
        self.transition(PipelineState::Aborting);
        true
    }

    /// Returns true if a fatal error has been recorded.
    #[must_use]
    pub fn has_fatal(&self) -> bool {
        self.fatal.lock().is_some()
    }

    /// Takes the fatal error, if any.
    pub fn take_fatal(&self) -> Option<PipelineError> {
        self.fatal.lock().take()
    }

    /// Takes the failure records collected so far.
    pub fn take_failures(&self) -> Vec<FailureRecord> {
        self.failures.lock().take_failures()
    }

    /// Returns the number of failures recorded so far.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failures.lock().failures().len()
    }

    /// Returns the stage counters in pipeline order.
    #[must_use]
    pub fn stages(&self) -> &[Arc<StageStats>] {
        &self.stages
    }

    /// Returns snapshots of every stage's counters.
    #[must_use]
    pub fn stage_snapshots(&self) -> Vec<StageStatsSnapshot> {
        self.stages.iter().map(|s| s.snapshot()).collect()
    }

    pub(crate) fn record_sourced(&self) {
        self.sourced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sunk(&self) {
        self.sunk.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of items the source has enqueued.
    #[must_use]
    pub fn items_sourced(&self) -> u64 {
        self.sourced.load(Ordering::Relaxed)
    }

    /// Returns the number of items the sink has consumed.
    #[must_use]
    pub fn items_sunk(&self) -> u64 {
        self.sunk.load(Ordering::Relaxed)
    }

    /// Emits an event tagged with the run id.
    pub async fn emit(&self, event_type: &str, data: serde_json::Value) {
        self.events.emit(event_type, Some(self.tag(data))).await;
    }

    /// Emits an event tagged with the run id without blocking.
    pub fn try_emit(&self, event_type: &str, data: serde_json::Value) {
        self.events.try_emit(event_type, Some(self.tag(data)));
    }

    fn tag(&self, data: serde_json::Value) -> serde_json::Value {
        let mut data = match data {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        data.insert("run_id".to_string(), self.run_id.to_string().into());
        data.insert("pipeline".to_string(), self.pipeline.clone().into());
        serde_json::Value::Object(data)
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("pipeline", &self.pipeline)
            .field("policy", &self.policy)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Observes and controls a pipeline run from outside.
///
/// Obtained from [`Pipeline::handle`](super::Pipeline::handle) before
/// calling `run()`; it stays valid after the run has finished.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    ctx: Arc<RunContext>,
}

impl PipelineHandle {
    pub(crate) fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    /// Requests cooperative cancellation. Only the first reason is kept.
    pub fn cancel(&self, reason: impl Into<String>) {
        let token = self.ctx.token();
        token.cancel(reason);
        let reason = token.reason().unwrap_or_default();
        self.ctx.fail(PipelineError::Cancelled(reason));
    }

    /// Returns true once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.ctx.token().is_cancelled()
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.ctx.state()
    }

    /// Returns the run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.ctx.run_id()
    }

    /// Returns live snapshots of every stage's counters.
    #[must_use]
    pub fn stage_stats(&self) -> Vec<StageStatsSnapshot> {
        self.ctx.stage_snapshots()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_state_transitions() {
        use PipelineState::*;

        assert!(Idle.can_transition_to(Running));
        assert!(Running.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Completed));
        assert!(Running.can_transition_to(Aborting));
        assert!(Draining.can_transition_to(Aborting));
        assert!(Aborting.can_transition_to(Completed));

        assert!(!Idle.can_transition_to(Completed));
        assert!(!Aborting.can_transition_to(Draining));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Draining.can_transition_to(Running));
        assert!(Completed.is_terminal());
    }

    #[test]
    fn test_transition_emits_event() {
        let events = Arc::new(CollectingEventSink::new());
        let ctx = RunContext::new("p").with_event_sink(events.clone());

        assert!(ctx.transition(PipelineState::Running));
        assert!(!ctx.transition(PipelineState::Idle));
        assert_eq!(ctx.state(), PipelineState::Running);

        let changed = events.events_of_type(PIPELINE_STATE_CHANGED);
        assert_eq!(changed.len(), 1);
        let data = changed[0].1.clone().unwrap();
        assert_eq!(data["from"], "idle");
        assert_eq!(data["to"], "running");
        assert_eq!(data["pipeline"], "p");
        assert_eq!(data["run_id"], ctx.run_id().to_string());
    }

    #[test]
    fn test_first_fatal_error_wins() {
        let ctx = RunContext::new("p");
        ctx.transition(PipelineState::Running);

        assert!(ctx.fail(PipelineError::Internal("first".into())));
        assert!(!ctx.fail(PipelineError::Internal("second".into())));
        assert!(ctx.is_aborting());
        assert_eq!(ctx.state(), PipelineState::Aborting);
        assert_eq!(ctx.take_fatal().unwrap().to_string(), "Internal error: first");
    }

    #[test]
    fn test_skip_policy_records_and_continues() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let ctx = RunContext::new("p").with_failure_callback(Some(Arc::new(move |record: &FailureRecord| {
            assert_eq!(record.stage, "parse");
            seen.fetch_add(1, Ordering::SeqCst);
        })));

        assert!(!ctx.report_failure(TransformFailure::new("parse", 0, "bad")));
        assert!(!ctx.report_failure(TransformFailure::new("parse", 5, "bad")));

        assert!(!ctx.is_aborting());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.failure_count(), 2);
    }

    #[test]
    fn test_abort_policy_fails_run() {
        let ctx = RunContext::new("p").with_policy(ErrorPolicy::Abort);
        ctx.transition(PipelineState::Running);

        assert!(ctx.report_failure(TransformFailure::new("parse", 2, "bad")));
        assert!(!ctx.report_failure(TransformFailure::new("parse", 3, "worse")));

        let fatal = ctx.take_fatal().unwrap();
        assert_eq!(fatal.as_transform_failure().unwrap().sequence, 2);
    }

    #[test]
    fn test_handle_cancel() {
        let ctx = Arc::new(RunContext::new("p"));
        let handle = PipelineHandle::new(ctx.clone());
        ctx.transition(PipelineState::Running);

        handle.cancel("user request");
        handle.cancel("ignored");

        assert!(handle.is_cancelled());
        assert_eq!(handle.state(), PipelineState::Aborting);
        assert_eq!(ctx.cancellation_reason(), "user request");
        assert!(ctx.take_fatal().unwrap().is_cancelled());
    }
}
