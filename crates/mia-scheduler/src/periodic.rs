use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    action::TaskAction,
    error::{Result, SchedulerError},
    store::validate_name,
    types::{Details, PeriodicTask},
};

struct PeriodicEntry {
    task: PeriodicTask,
    interval: chrono::Duration,
    action: Arc<dyn TaskAction>,
}

/// A periodic invocation handed from the registry to the executor.
#[derive(Clone)]
pub struct DuePeriodic {
    pub id: String,
    pub name: String,
    pub details: Details,
    pub action: Arc<dyn TaskAction>,
}

/// Concurrency-safe registry of recurring tasks keyed by name.
pub struct PeriodicTaskRegistry {
    tasks: RwLock<HashMap<String, PeriodicEntry>>,
}

impl PeriodicTaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Register `name` with `last_run = now`.
    ///
    /// Re-adding an existing name replaces the entry: interval, action and
    /// details change, `last_run` restarts at `now`, counters reset and a
    /// disabled task is re-armed. Returns the snapshot and whether an entry
    /// was replaced.
    pub fn add(
        &self,
        name: &str,
        interval: Duration,
        action: Arc<dyn TaskAction>,
        details: Details,
        now: DateTime<Utc>,
    ) -> Result<(PeriodicTask, bool)> {
        validate_name(name)?;
        let chrono_interval = chrono::Duration::from_std(interval)
            .map_err(|e| SchedulerError::InvalidInterval(format!("{interval:?}: {e}")))?;
        let interval_ms = u64::try_from(interval.as_millis())
            .map_err(|_| SchedulerError::InvalidInterval(format!("{interval:?}")))?;
        if now.checked_add_signed(chrono_interval).is_none() {
            return Err(SchedulerError::InvalidInterval(format!(
                "{interval:?}: next run is out of range"
            )));
        }

        let task = PeriodicTask {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            interval_ms,
            last_run: now,
            details,
            run_count: 0,
            consecutive_failures: 0,
            disabled: false,
        };

        let mut tasks = self.write()?;
        let replaced = tasks
            .insert(
                name.to_string(),
                PeriodicEntry {
                    task: task.clone(),
                    interval: chrono_interval,
                    action,
                },
            )
            .is_some();
        debug!(task = %name, interval_ms, replaced, "periodic task stored");
        Ok((task, replaced))
    }

    /// Remove `name`. Returns false if it was not registered.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let removed = self.write()?.remove(name).is_some();
        if removed {
            debug!(task = %name, "periodic task removed");
        }
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Result<Option<PeriodicTask>> {
        Ok(self.read()?.get(name).map(|e| e.task.clone()))
    }

    /// Snapshot of every periodic task, ordered by name.
    pub fn list(&self) -> Result<Vec<PeriodicTask>> {
        let mut tasks: Vec<PeriodicTask> = self.read()?.values().map(|e| e.task.clone()).collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tasks)
    }

    /// Entries with `now >= last_run + interval`, ordered by name.
    ///
    /// Their `last_run` moves to `now` before the lock is released, so two
    /// concurrent calls can never both return the same firing.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<DuePeriodic>> {
        let mut tasks = self.write()?;
        let mut due: Vec<DuePeriodic> = tasks
            .values_mut()
            .filter(|e| !e.task.disabled && is_due(e, now))
            .map(|entry| {
                entry.task.last_run = now;
                entry.task.run_count += 1;
                invocation(entry)
            })
            .collect();
        due.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(due)
    }

    /// The stored action for an out-of-band run. Does not touch `last_run`.
    pub fn invocation(&self, name: &str) -> Result<Option<DuePeriodic>> {
        Ok(self.read()?.get(name).map(invocation))
    }

    /// Track the outcome of a run of generation `id`.
    ///
    /// Returns true when this failure just disabled the task.
    pub fn record_outcome(
        &self,
        name: &str,
        id: &str,
        success: bool,
        max_consecutive_failures: Option<u32>,
    ) -> Result<bool> {
        let mut tasks = self.write()?;
        let Some(entry) = tasks.get_mut(name).filter(|e| e.task.id == id) else {
            return Ok(false);
        };

        if success {
            entry.task.consecutive_failures = 0;
            return Ok(false);
        }

        entry.task.consecutive_failures += 1;
        match max_consecutive_failures {
            Some(max) if !entry.task.disabled && entry.task.consecutive_failures >= max => {
                entry.task.disabled = true;
                warn!(
                    task = %name,
                    failures = entry.task.consecutive_failures,
                    "periodic task disabled after consecutive failures"
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, PeriodicEntry>>> {
        self.tasks
            .read()
            .map_err(|_| SchedulerError::RegistryPoisoned("periodic registry"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, PeriodicEntry>>> {
        self.tasks
            .write()
            .map_err(|_| SchedulerError::RegistryPoisoned("periodic registry"))
    }
}

impl Default for PeriodicTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// An entry whose next run cannot be represented never becomes due.
fn is_due(entry: &PeriodicEntry, now: DateTime<Utc>) -> bool {
    entry
        .task
        .last_run
        .checked_add_signed(entry.interval)
        .is_some_and(|next| now >= next)
}

fn invocation(entry: &PeriodicEntry) -> DuePeriodic {
    DuePeriodic {
        id: entry.task.id.clone(),
        name: entry.task.name.clone(),
        details: entry.task.details.clone(),
        action: Arc::clone(&entry.action),
    }
}
