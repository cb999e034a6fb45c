use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque key-value configuration attached to a task and handed to its action.
pub type Details = serde_json::Map<String, serde_json::Value>;

/// Lifecycle state of a one-shot task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Registered, waiting for its run time.
    Scheduled,
    /// A tick saw the run time in the past; execution is imminent.
    Overdue,
    /// The action is executing.
    Running,
    /// The action finished successfully.
    Completed,
    /// Removed before it started running.
    Canceled,
    /// The action returned an error, panicked or timed out.
    Failed,
}

impl TaskStatus {
    /// Terminal states are never left again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Canceled | TaskStatus::Failed
        )
    }

    /// Whether a task may be canceled while in this state.
    pub fn is_cancelable(self) -> bool {
        matches!(self, TaskStatus::Scheduled | TaskStatus::Overdue)
    }

    /// The one-shot lifecycle graph.
    ///
    /// `Scheduled -> Running` is only taken by a manual run; ticks always go
    /// through `Overdue` first.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Scheduled, Overdue)
                | (Scheduled, Running)
                | (Scheduled, Canceled)
                | (Overdue, Running)
                | (Overdue, Canceled)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Overdue => "overdue",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TaskStatus::Scheduled),
            "overdue" => Ok(TaskStatus::Overdue),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "canceled" => Ok(TaskStatus::Canceled),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Snapshot of a one-shot task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// UUID v4 of this registration. A replacement under the same name gets a new id.
    pub id: String,
    /// Unique key within the store.
    pub name: String,
    /// Absolute instant at which the task becomes due.
    pub run_time: DateTime<Utc>,
    pub details: Details,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Fault text of the failed run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Snapshot of a periodic task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicTask {
    pub id: String,
    pub name: String,
    /// Minimum spacing between two scheduled fires, in milliseconds.
    pub interval_ms: u64,
    /// Instant of the last scheduled fire, or of registration before the first one.
    pub last_run: DateTime<Utc>,
    pub details: Details,
    /// Number of scheduled fires so far (manual runs excluded).
    pub run_count: u64,
    pub consecutive_failures: u32,
    /// Set once `max_consecutive_failures` is reached; cleared by re-adding.
    pub disabled: bool,
}

impl PeriodicTask {
    /// Earliest instant at which the task becomes due again, or `None` when
    /// that instant is past the representable range.
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        let interval = i64::try_from(self.interval_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)?;
        self.last_run.checked_add_signed(interval)
    }
}

/// Read snapshot of both registries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskListing {
    pub scheduled: Vec<Task>,
    pub periodic: Vec<PeriodicTask>,
}

/// Final status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One entry handed to the task-log sink per execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogRecord {
    pub task_name: String,
    pub executed_at: DateTime<Utc>,
    pub periodic: bool,
    pub status: ExecutionStatus,
}

/// Acknowledgement of `schedule_task`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleAck {
    pub task: Task,
    /// An entry with the same name existed and was replaced.
    pub replaced: bool,
}

impl fmt::Display for ScheduleAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task '{}' scheduled for {}.",
            self.task.name,
            self.task.run_time.format("%Y-%m-%d %H:%M:%S")
        )?;
        if self.replaced {
            write!(f, " (replaced existing entry)")?;
        }
        Ok(())
    }
}

/// Result of `cancel_task`.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// A one-shot task was removed; the snapshot carries status `Canceled`.
    Canceled(Task),
    /// A periodic task was removed.
    PeriodicCanceled(String),
    /// The task is executing and cannot be canceled any more.
    AlreadyRunning(String),
    /// The task already reached a terminal state; the entry is left in place.
    AlreadyFinished { name: String, status: TaskStatus },
    NotFound(String),
}

impl CancelOutcome {
    /// True when an entry was actually removed.
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            CancelOutcome::Canceled(_) | CancelOutcome::PeriodicCanceled(_)
        )
    }
}

impl fmt::Display for CancelOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelOutcome::Canceled(task) => write!(f, "Task '{}' has been canceled.", task.name),
            CancelOutcome::PeriodicCanceled(name) => {
                write!(f, "Periodic task '{name}' has been canceled.")
            }
            CancelOutcome::AlreadyRunning(name) => {
                write!(f, "Task '{name}' is running and cannot be canceled.")
            }
            CancelOutcome::AlreadyFinished { name, status } => {
                write!(f, "Task '{name}' already {status}.")
            }
            CancelOutcome::NotFound(name) => write!(f, "Task '{name}' not found."),
        }
    }
}

/// Result of a manual `run_task`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Executed { name: String, periodic: bool },
    Failed { name: String, periodic: bool, error: String },
    AlreadyRunning(String),
    AlreadyFinished { name: String, status: TaskStatus },
    NotFound(String),
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Executed { name, .. } => write!(f, "Task '{name}' executed successfully."),
            RunOutcome::Failed { name, error, .. } => write!(f, "Task '{name}' failed: {error}"),
            RunOutcome::AlreadyRunning(name) => write!(f, "Task '{name}' is already running."),
            RunOutcome::AlreadyFinished { name, status } => {
                write!(f, "Task '{name}' already {status}.")
            }
            RunOutcome::NotFound(name) => write!(f, "Task '{name}' not found."),
        }
    }
}
