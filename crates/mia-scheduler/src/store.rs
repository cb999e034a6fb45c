use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::{
    action::TaskAction,
    error::{Result, SchedulerError},
    types::{CancelOutcome, Details, Task, TaskStatus},
};

struct TaskEntry {
    task: Task,
    action: Arc<dyn TaskAction>,
}

/// A one-shot task handed from the store to the executor.
#[derive(Clone)]
pub struct DueTask {
    pub id: String,
    pub name: String,
    pub details: Details,
    pub action: Arc<dyn TaskAction>,
}

/// Result of moving a task to `Running` outside a tick.
pub enum ClaimOutcome {
    Claimed(DueTask),
    AlreadyRunning,
    AlreadyFinished(TaskStatus),
    NotFound,
}

/// Concurrency-safe registry of one-shot tasks keyed by name.
///
/// Mutations and the due scan take the write lock; `list`/`get` hold the read
/// lock only while cloning. No lock is held while an action runs.
pub struct TaskStore {
    tasks: RwLock<HashMap<String, TaskEntry>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Register `name` as `Scheduled`, replacing any entry with the same name.
    ///
    /// Returns the new snapshot and whether an entry was replaced. The
    /// replacement gets a fresh id, so late status updates from a replaced
    /// run are dropped by [`mark`](Self::mark).
    pub fn schedule(
        &self,
        name: &str,
        run_time: DateTime<Utc>,
        details: Details,
        action: Arc<dyn TaskAction>,
        now: DateTime<Utc>,
    ) -> Result<(Task, bool)> {
        validate_name(name)?;
        let task = Task {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            run_time,
            details,
            status: TaskStatus::Scheduled,
            created_at: now,
            updated_at: now,
            last_error: None,
        };

        let mut tasks = self.write()?;
        let replaced = tasks
            .insert(
                name.to_string(),
                TaskEntry {
                    task: task.clone(),
                    action,
                },
            )
            .is_some();
        debug!(task = %name, id = %task.id, replaced, "one-shot task stored");
        Ok((task, replaced))
    }

    pub fn get(&self, name: &str) -> Result<Option<Task>> {
        Ok(self.read()?.get(name).map(|e| e.task.clone()))
    }

    /// Remove a task that has not started running.
    ///
    /// Running and terminal entries are left untouched. Canceling the same
    /// name twice yields `NotFound` the second time.
    pub fn cancel(&self, name: &str, now: DateTime<Utc>) -> Result<CancelOutcome> {
        let mut tasks = self.write()?;
        let status = match tasks.get(name) {
            Some(entry) => entry.task.status,
            None => return Ok(CancelOutcome::NotFound(name.to_string())),
        };

        if status == TaskStatus::Running {
            return Ok(CancelOutcome::AlreadyRunning(name.to_string()));
        }
        if !status.is_cancelable() {
            return Ok(CancelOutcome::AlreadyFinished {
                name: name.to_string(),
                status,
            });
        }

        let mut task = match tasks.remove(name) {
            Some(entry) => entry.task,
            None => return Ok(CancelOutcome::NotFound(name.to_string())),
        };
        task.status = TaskStatus::Canceled;
        task.updated_at = now;
        debug!(task = %name, "one-shot task canceled");
        Ok(CancelOutcome::Canceled(task))
    }

    /// Snapshot of every task, ordered by run time then name.
    pub fn list(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.read()?.values().map(|e| e.task.clone()).collect();
        tasks.sort_by(|a, b| a.run_time.cmp(&b.run_time).then_with(|| a.name.cmp(&b.name)));
        Ok(tasks)
    }

    /// Apply a validated status transition to generation `id` of `name`.
    ///
    /// Returns false when the entry is gone, was replaced, or the transition
    /// is not part of the lifecycle.
    pub fn mark(&self, name: &str, id: &str, status: TaskStatus, now: DateTime<Utc>) -> Result<bool> {
        self.transition(name, id, status, None, now)
    }

    /// Mark generation `id` of `name` as `Failed` and keep the fault text.
    pub fn mark_failed(&self, name: &str, id: &str, error: String, now: DateTime<Utc>) -> Result<bool> {
        self.transition(name, id, TaskStatus::Failed, Some(error), now)
    }

    /// Move every `Scheduled` task with `run_time <= now` to `Overdue` and
    /// return them in list order. Each task is returned by at most one call.
    pub fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<DueTask>> {
        let mut tasks = self.write()?;
        let mut due: Vec<&mut TaskEntry> = tasks
            .values_mut()
            .filter(|e| e.task.status == TaskStatus::Scheduled && e.task.run_time <= now)
            .collect();
        due.sort_by(|a, b| {
            a.task
                .run_time
                .cmp(&b.task.run_time)
                .then_with(|| a.task.name.cmp(&b.task.name))
        });

        Ok(due
            .into_iter()
            .map(|entry| {
                entry.task.status = TaskStatus::Overdue;
                entry.task.updated_at = now;
                due_task(entry)
            })
            .collect())
    }

    /// Move a `Scheduled` or `Overdue` task straight to `Running`.
    pub fn claim(&self, name: &str, now: DateTime<Utc>) -> Result<ClaimOutcome> {
        let mut tasks = self.write()?;
        let Some(entry) = tasks.get_mut(name) else {
            return Ok(ClaimOutcome::NotFound);
        };
        match entry.task.status {
            TaskStatus::Running => Ok(ClaimOutcome::AlreadyRunning),
            status if status.is_terminal() => Ok(ClaimOutcome::AlreadyFinished(status)),
            _ => {
                entry.task.status = TaskStatus::Running;
                entry.task.updated_at = now;
                Ok(ClaimOutcome::Claimed(due_task(entry)))
            }
        }
    }

    /// Remove a finished entry. Returns false for absent or unfinished tasks.
    pub fn purge(&self, name: &str) -> Result<bool> {
        let mut tasks = self.write()?;
        match tasks.get(name) {
            Some(entry) if entry.task.status.is_terminal() => {
                tasks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remove every finished entry and return how many were dropped.
    pub fn purge_finished(&self) -> Result<usize> {
        let mut tasks = self.write()?;
        let before = tasks.len();
        tasks.retain(|_, e| !e.task.status.is_terminal());
        Ok(before - tasks.len())
    }

    // --- private helpers ---------------------------------------------------

    fn transition(
        &self,
        name: &str,
        id: &str,
        status: TaskStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tasks = self.write()?;
        let Some(entry) = tasks.get_mut(name) else {
            return Ok(false);
        };
        if entry.task.id != id || !entry.task.status.can_transition_to(status) {
            debug!(
                task = %name,
                from = %entry.task.status,
                to = %status,
                "status update ignored"
            );
            return Ok(false);
        }
        entry.task.status = status;
        entry.task.updated_at = now;
        if error.is_some() {
            entry.task.last_error = error;
        }
        Ok(true)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, TaskEntry>>> {
        self.tasks
            .read()
            .map_err(|_| SchedulerError::RegistryPoisoned("task store"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, TaskEntry>>> {
        self.tasks
            .write()
            .map_err(|_| SchedulerError::RegistryPoisoned("task store"))
    }
}

#[cfg(test)]
impl TaskStore {
    /// Poison the registry lock, as a panic while holding it would.
    pub(crate) fn poison(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.tasks.write().unwrap_or_else(|p| p.into_inner());
            panic!("poisoning task store");
        }));
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

fn due_task(entry: &TaskEntry) -> DueTask {
    DueTask {
        id: entry.task.id.clone(),
        name: entry.task.name.clone(),
        details: entry.task.details.clone(),
        action: Arc::clone(&entry.action),
    }
}

/// Names are registry keys: non-empty, no surrounding whitespace.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.trim() != name {
        return Err(SchedulerError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::NoopAction;
    use chrono::Duration;

    fn noop() -> Arc<dyn TaskAction> {
        Arc::new(NoopAction)
    }

    fn schedule(store: &TaskStore, name: &str, run_time: DateTime<Utc>) -> Task {
        store
            .schedule(name, run_time, Details::new(), noop(), Utc::now())
            .expect("schedule")
            .0
    }

    #[test]
    fn schedule_then_get() {
        let store = TaskStore::new();
        let at = Utc::now() + Duration::hours(1);
        let task = schedule(&store, "Backup", at);

        let fetched = store.get("Backup").unwrap().expect("present");
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.status, TaskStatus::Scheduled);
        assert_eq!(fetched.run_time, at);
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn blank_names_are_rejected() {
        let store = TaskStore::new();
        for name in ["", " padded", "padded "] {
            let err = store
                .schedule(name, Utc::now(), Details::new(), noop(), Utc::now())
                .unwrap_err();
            assert!(matches!(err, SchedulerError::InvalidName(_)));
        }
    }

    #[test]
    fn rescheduling_replaces_and_drops_stale_updates() {
        let store = TaskStore::new();
        let now = Utc::now();
        let first = schedule(&store, "report", now);
        assert!(matches!(store.claim("report", now).unwrap(), ClaimOutcome::Claimed(_)));

        let (second, replaced) = store
            .schedule("report", now + Duration::minutes(5), Details::new(), noop(), now)
            .unwrap();
        assert!(replaced);
        assert_ne!(first.id, second.id);

        // The replaced run finishing must not touch the new entry.
        assert!(!store.mark("report", &first.id, TaskStatus::Completed, now).unwrap());
        let current = store.get("report").unwrap().unwrap();
        assert_eq!(current.id, second.id);
        assert_eq!(current.status, TaskStatus::Scheduled);
    }

    #[test]
    fn take_due_returns_each_past_task_once() {
        let store = TaskStore::new();
        let now = Utc::now();
        schedule(&store, "late", now - Duration::seconds(10));
        schedule(&store, "exact", now);
        schedule(&store, "future", now + Duration::seconds(10));

        let due: Vec<String> = store.take_due(now).unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(due, vec!["late".to_string(), "exact".to_string()]);
        assert_eq!(store.get("late").unwrap().unwrap().status, TaskStatus::Overdue);
        assert_eq!(store.get("future").unwrap().unwrap().status, TaskStatus::Scheduled);

        assert!(store.take_due(now).unwrap().is_empty());
    }

    #[test]
    fn lifecycle_transitions_are_validated() {
        let store = TaskStore::new();
        let now = Utc::now();
        let task = schedule(&store, "job", now);

        assert!(!store.mark("job", &task.id, TaskStatus::Completed, now).unwrap());
        assert!(store.mark("job", &task.id, TaskStatus::Overdue, now).unwrap());
        assert!(store.mark("job", &task.id, TaskStatus::Running, now).unwrap());
        assert!(store.mark_failed("job", &task.id, "boom".into(), now).unwrap());
        assert!(!store.mark("job", &task.id, TaskStatus::Completed, now).unwrap());

        let failed = store.get("job").unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn cancel_is_idempotent() {
        let store = TaskStore::new();
        schedule(&store, "Backup", Utc::now() + Duration::hours(1));

        match store.cancel("Backup", Utc::now()).unwrap() {
            CancelOutcome::Canceled(task) => assert_eq!(task.status, TaskStatus::Canceled),
            other => panic!("expected Canceled, got {other:?}"),
        }
        assert!(matches!(
            store.cancel("Backup", Utc::now()).unwrap(),
            CancelOutcome::NotFound(_)
        ));
    }

    #[test]
    fn running_and_finished_tasks_cannot_be_canceled() {
        let store = TaskStore::new();
        let now = Utc::now();
        let task = schedule(&store, "job", now);
        store.claim("job", now).unwrap();
        assert!(matches!(
            store.cancel("job", now).unwrap(),
            CancelOutcome::AlreadyRunning(_)
        ));

        store.mark("job", &task.id, TaskStatus::Completed, now).unwrap();
        assert!(matches!(
            store.cancel("job", now).unwrap(),
            CancelOutcome::AlreadyFinished {
                status: TaskStatus::Completed,
                ..
            }
        ));
        assert!(store.get("job").unwrap().is_some());
    }

    #[test]
    fn list_is_ordered_by_run_time() {
        let store = TaskStore::new();
        let now = Utc::now();
        schedule(&store, "c", now + Duration::seconds(3));
        schedule(&store, "a", now + Duration::seconds(1));
        schedule(&store, "b", now + Duration::seconds(1));

        let names: Vec<String> = store.list().unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn purge_only_removes_finished_tasks() {
        let store = TaskStore::new();
        let now = Utc::now();
        let done = schedule(&store, "done", now);
        schedule(&store, "pending", now + Duration::hours(1));
        store.claim("done", now).unwrap();
        store.mark("done", &done.id, TaskStatus::Completed, now).unwrap();

        assert!(!store.purge("pending").unwrap());
        assert_eq!(store.purge_finished().unwrap(), 1);
        assert!(store.get("done").unwrap().is_none());
        assert!(store.get("pending").unwrap().is_some());
    }

    #[test]
    fn concurrent_list_never_sees_duplicates() {
        let store = Arc::new(TaskStore::new());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let name = format!("task-{}", i % 10);
                        let at = Utc::now() + Duration::seconds(w);
                        store.schedule(&name, at, Details::new(), noop(), Utc::now()).unwrap();
                        if i % 3 == 0 {
                            store.cancel(&name, Utc::now()).unwrap();
                        }
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            let listed = store.list().unwrap();
            let mut names: Vec<&str> = listed.iter().map(|t| t.name.as_str()).collect();
            let total = names.len();
            names.sort_unstable();
            names.dedup();
            assert_eq!(names.len(), total, "duplicate entry in snapshot");
            assert!(listed.iter().all(|t| t.status == TaskStatus::Scheduled));
        }

        for w in writers {
            w.join().unwrap();
        }
    }
}
