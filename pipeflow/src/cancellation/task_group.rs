//! Task group for the tasks of one pipeline run.

use crate::errors::{PipelineError, Result};
use parking_lot::Mutex;
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{debug, Instrument};

/// A group of related tasks that are joined together.
///
/// Every task is spawned onto the current tokio runtime inside its own
/// tracing span. [`TaskGroup::wait`] joins all of them and reports the first
/// error in spawn order; a panicked task is reported as
/// [`PipelineError::Internal`].
#[derive(Default)]
pub struct TaskGroup {
    /// Handles to spawned tasks with their names.
    handles: Mutex<Vec<(String, JoinHandle<Result<()>>)>>,
}

impl TaskGroup {
    /// Creates a new task group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a task in the group.
    pub fn spawn<Fut>(&self, name: impl Into<String>, task: Fut)
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let span = tracing::debug_span!("task", task = %name);
        let handle = tokio::spawn(task.instrument(span));
        self.handles.lock().push((name, handle));
    }

    /// Waits for all tasks to complete.
    ///
    /// All tasks are joined even after a failure, so no task outlives the
    /// group. Returns the first error if any occurred.
    pub async fn wait(&self) -> Result<()> {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        let mut first_error = None;

        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(PipelineError::Internal(format!(
                    "task '{name}' failed to join: {join_error}"
                ))),
            };

            if let Err(err) = outcome {
                debug!(task = %name, error = %err, "Task finished with error");
                first_error.get_or_insert(err);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Returns the number of tasks not yet joined.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.handles.lock().len()
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("task_count", &self.task_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_task_group_success() {
        let group = TaskGroup::new();
        group.spawn("task1", async { Ok(()) });
        group.spawn("task2", async { Ok(()) });
        assert_eq!(group.task_count(), 2);

        assert!(group.wait().await.is_ok());
        assert_eq!(group.task_count(), 0);
    }

    #[tokio::test]
    async fn test_task_group_joins_all_after_error() {
        let group = TaskGroup::new();
        let finished = Arc::new(AtomicUsize::new(0));

        group.spawn("fails", async { Err(PipelineError::QueueClosed) });
        let counter = finished.clone();
        group.spawn("slow", async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let result = group.wait().await;
        assert!(matches!(result, Err(PipelineError::QueueClosed)));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_task_group_reports_panics_as_internal() {
        let group = TaskGroup::new();
        group.spawn("boom", async {
            if true {
                panic!("worker exploded");
            }
            Ok(())
        });

        match group.wait().await {
            Err(PipelineError::Internal(message)) => assert!(message.contains("boom")),
            other => panic!("expected internal error, got {other:?}"),
        }
    }
}
