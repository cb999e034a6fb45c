use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::{
    action::{TaskAction, TaskContext},
    error::ExecutionError,
    periodic::{DuePeriodic, PeriodicTaskRegistry},
    sink::{ErrorSink, TaskLogSink},
    store::{DueTask, TaskStore},
    types::{ExecutionStatus, TaskLogRecord, TaskStatus},
};

/// What one execution ended with. Already reported to both sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub error: Option<String>,
}

impl ExecutionReport {
    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Runs task actions inside a failure boundary.
///
/// Each action is spawned on its own Tokio task and bounded by `timeout`, so
/// an error, a panic or a hang in one action is turned into a `Failed`
/// status and never reaches the caller.
pub struct TaskExecutor {
    error_sink: Arc<dyn ErrorSink>,
    task_log: Arc<dyn TaskLogSink>,
    timeout: Duration,
    max_consecutive_failures: Option<u32>,
}

impl TaskExecutor {
    pub fn new(error_sink: Arc<dyn ErrorSink>, task_log: Arc<dyn TaskLogSink>, timeout: Duration) -> Self {
        Self {
            error_sink,
            task_log,
            timeout,
            max_consecutive_failures: None,
        }
    }

    /// Disable periodic tasks after this many failures in a row.
    pub fn with_max_consecutive_failures(mut self, max: Option<u32>) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    pub fn error_sink(&self) -> &Arc<dyn ErrorSink> {
        &self.error_sink
    }

    /// Run a task returned by [`TaskStore::take_due`].
    ///
    /// Returns `None` without running anything when the task was canceled or
    /// replaced after the scan picked it up.
    pub async fn run_due_task(&self, store: &TaskStore, due: DueTask) -> Option<ExecutionReport> {
        match store.mark(&due.name, &due.id, TaskStatus::Running, Utc::now()) {
            Ok(true) => Some(self.execute_one_shot(store, due).await),
            Ok(false) => {
                debug!(task = %due.name, "task changed before execution, skipped");
                None
            }
            Err(e) => {
                self.error_sink.log_error(&format!("task store: {}", due.name), &e);
                None
            }
        }
    }

    /// Execute a one-shot task that is already `Running` and record the result.
    pub async fn execute_one_shot(&self, store: &TaskStore, due: DueTask) -> ExecutionReport {
        let ctx = TaskContext {
            name: due.name.clone(),
            details: due.details,
            periodic: false,
            fired_at: Utc::now(),
        };
        let result = self.invoke(due.action, ctx).await;

        let now = Utc::now();
        let stored = match &result {
            Ok(()) => store.mark(&due.name, &due.id, TaskStatus::Completed, now),
            Err(e) => store.mark_failed(&due.name, &due.id, e.to_string(), now),
        };
        match stored {
            Ok(true) => {}
            Ok(false) => debug!(task = %due.name, "task replaced while running, status not stored"),
            Err(e) => self.error_sink.log_error(&format!("task store: {}", due.name), &e),
        }

        self.report(&due.name, false, result)
    }

    /// Execute a periodic invocation. The entry stays registered whatever happens.
    pub async fn execute_periodic(&self, registry: &PeriodicTaskRegistry, due: DuePeriodic) -> ExecutionReport {
        let ctx = TaskContext {
            name: due.name.clone(),
            details: due.details,
            periodic: true,
            fired_at: Utc::now(),
        };
        let result = self.invoke(due.action, ctx).await;

        if let Err(e) = registry.record_outcome(
            &due.name,
            &due.id,
            result.is_ok(),
            self.max_consecutive_failures,
        ) {
            self.error_sink.log_error(&format!("periodic registry: {}", due.name), &e);
        }

        self.report(&due.name, true, result)
    }

    // --- private helpers ---------------------------------------------------

    async fn invoke(&self, action: Arc<dyn TaskAction>, ctx: TaskContext) -> Result<(), ExecutionError> {
        let name = ctx.name.clone();
        let started = Instant::now();
        let mut handle = tokio::spawn(async move { action.run(ctx).await });

        let result = match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(ExecutionError::Action(format!("{e:#}"))),
            Ok(Err(join_err)) => Err(ExecutionError::Panicked(panic_message(join_err))),
            Err(_elapsed) => {
                // Best-effort preemption: the action is dropped at its next await point.
                handle.abort();
                Err(ExecutionError::TimedOut {
                    ms: saturating_millis(self.timeout),
                })
            }
        };

        let elapsed_ms = saturating_millis(started.elapsed());
        debug!(task = %name, elapsed_ms, "action returned");
        result
    }

    fn report(&self, name: &str, periodic: bool, result: Result<(), ExecutionError>) -> ExecutionReport {
        let (status, error) = match result {
            Ok(()) => {
                info!(task = %name, periodic, "task completed");
                (ExecutionStatus::Completed, None)
            }
            Err(e) => {
                warn!(task = %name, periodic, error = %e, "task failed");
                self.error_sink
                    .log_error(&format!("execution error: {name}"), &e);
                (ExecutionStatus::Failed, Some(e.to_string()))
            }
        };

        self.task_log.store_task_log(TaskLogRecord {
            task_name: name.to_string(),
            executed_at: Utc::now(),
            periodic,
            status,
        });

        ExecutionReport { status, error }
    }
}

/// Whole milliseconds of `d`, clamped to `u64::MAX`.
pub(crate) fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
