use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinError;
use tracing::{info, instrument};

use crate::{
    action::TaskAction,
    engine::{RunningScheduler, SchedulerEngine},
    error::{Result, SchedulerError},
    executor::{saturating_millis, ExecutionReport, TaskExecutor},
    optimization::{SelfOptimizationCycle, SELF_OPTIMIZATION_TASK},
    periodic::PeriodicTaskRegistry,
    sink::{ErrorSink, TaskLogSink},
    store::{ClaimOutcome, TaskStore},
    types::{
        CancelOutcome, Details, PeriodicTask, RunOutcome, ScheduleAck, Task, TaskListing,
    },
};

/// Runtime knobs for one scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Period of the background loop.
    pub tick: Duration,
    /// Upper bound for a single action invocation.
    pub action_timeout: Duration,
    /// Disable a periodic task after this many failures in a row (`None` = never).
    pub max_consecutive_failures: Option<u32>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&mia_core::config::SchedulerConfig::default())
    }
}

impl From<&mia_core::config::SchedulerConfig> for SchedulerSettings {
    fn from(config: &mia_core::config::SchedulerConfig) -> Self {
        Self {
            tick: Duration::from_secs(config.tick_secs.max(1)),
            action_timeout: Duration::from_secs(config.action_timeout_secs),
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }
}

pub(crate) struct SchedulerInner {
    pub(crate) store: TaskStore,
    pub(crate) periodic: PeriodicTaskRegistry,
    pub(crate) executor: TaskExecutor,
    pub(crate) settings: SchedulerSettings,
}

/// Shared handle for task management while the engine loop runs.
///
/// Cheap to clone; every clone sees the same registries. Independent
/// handles share nothing, so several schedulers can coexist in one process.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) inner: Arc<SchedulerInner>,
}

impl SchedulerHandle {
    pub fn new(
        settings: SchedulerSettings,
        error_sink: Arc<dyn ErrorSink>,
        task_log: Arc<dyn TaskLogSink>,
    ) -> Self {
        let executor = TaskExecutor::new(error_sink, task_log, settings.action_timeout)
            .with_max_consecutive_failures(settings.max_consecutive_failures);
        Self {
            inner: Arc::new(SchedulerInner {
                store: TaskStore::new(),
                periodic: PeriodicTaskRegistry::new(),
                executor,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// Register a one-shot task. An existing task with the same name is replaced.
    #[instrument(skip(self, run_time, details, action), fields(run_time = %run_time))]
    pub fn schedule_task(
        &self,
        name: &str,
        run_time: DateTime<Utc>,
        details: Details,
        action: Arc<dyn TaskAction>,
    ) -> Result<ScheduleAck> {
        let (task, replaced) = self
            .inner
            .store
            .schedule(name, run_time, details, action, Utc::now())?;
        info!(task = %name, replaced, "task scheduled");
        Ok(ScheduleAck { task, replaced })
    }

    /// Like [`schedule_task`](Self::schedule_task) with an RFC 3339 run time.
    pub fn schedule_task_rfc3339(
        &self,
        name: &str,
        run_time: &str,
        details: Details,
        action: Arc<dyn TaskAction>,
    ) -> Result<ScheduleAck> {
        let run_time = DateTime::parse_from_rfc3339(run_time)
            .map_err(|e| SchedulerError::InvalidRunTime(format!("{run_time:?}: {e}")))?
            .with_timezone(&Utc);
        self.schedule_task(name, run_time, details, action)
    }

    /// Register a periodic task, replacing any periodic task with the same name.
    #[instrument(skip(self, interval, action, details), fields(interval_ms = saturating_millis(interval)))]
    pub fn add_periodic_task(
        &self,
        name: &str,
        interval: Duration,
        action: Arc<dyn TaskAction>,
        details: Details,
    ) -> Result<PeriodicTask> {
        let (task, replaced) = self
            .inner
            .periodic
            .add(name, interval, action, details, Utc::now())?;
        info!(task = %name, replaced, "periodic task added");
        Ok(task)
    }

    /// Cancel by name: the periodic registry is checked first, then the one-shot store.
    #[instrument(skip(self))]
    pub fn cancel_task(&self, name: &str) -> Result<CancelOutcome> {
        if self.inner.periodic.remove(name)? {
            info!(task = %name, "periodic task canceled");
            return Ok(CancelOutcome::PeriodicCanceled(name.to_string()));
        }
        let outcome = self.inner.store.cancel(name, Utc::now())?;
        info!(task = %name, outcome = %outcome, "cancel requested");
        Ok(outcome)
    }

    /// Read snapshot of both registries.
    pub fn list_tasks(&self) -> Result<TaskListing> {
        Ok(TaskListing {
            scheduled: self.inner.store.list()?,
            periodic: self.inner.periodic.list()?,
        })
    }

    pub fn get_task(&self, name: &str) -> Result<Option<Task>> {
        self.inner.store.get(name)
    }

    pub fn get_periodic_task(&self, name: &str) -> Result<Option<PeriodicTask>> {
        self.inner.periodic.get(name)
    }

    /// Execute a task now, outside the tick, through the executor.
    ///
    /// One-shot tasks are looked up first. A manual run of a periodic task
    /// does not move its `last_run`, so its regular cadence is unchanged.
    /// The execution runs on its own task: dropping the returned future does
    /// not stop it, and a claimed task still ends `Completed` or `Failed`.
    #[instrument(skip(self))]
    pub async fn run_task(&self, name: &str) -> Result<RunOutcome> {
        let inner = Arc::clone(&self.inner);
        match inner.store.claim(name, Utc::now())? {
            ClaimOutcome::Claimed(due) => {
                let job = tokio::spawn(async move { inner.executor.execute_one_shot(&inner.store, due).await });
                return Ok(run_outcome(name, false, joined_error(job.await)));
            }
            ClaimOutcome::AlreadyRunning => return Ok(RunOutcome::AlreadyRunning(name.to_string())),
            ClaimOutcome::AlreadyFinished(status) => {
                return Ok(RunOutcome::AlreadyFinished {
                    name: name.to_string(),
                    status,
                })
            }
            ClaimOutcome::NotFound => {}
        }

        match inner.periodic.invocation(name)? {
            Some(due) => {
                let job = tokio::spawn(async move { inner.executor.execute_periodic(&inner.periodic, due).await });
                Ok(run_outcome(name, true, joined_error(job.await)))
            }
            None => Ok(RunOutcome::NotFound(name.to_string())),
        }
    }

    /// Register the self-optimization cycle as the `self_optimization`
    /// periodic task, using the cycle's own interval.
    pub fn start_self_optimization_cycle(&self, cycle: SelfOptimizationCycle) -> Result<PeriodicTask> {
        let interval = cycle.settings().interval;
        self.add_periodic_task(SELF_OPTIMIZATION_TASK, interval, Arc::new(cycle), Details::new())
    }

    /// Drop finished one-shot entries. Returns how many were removed.
    pub fn purge_finished(&self) -> Result<usize> {
        self.inner.store.purge_finished()
    }

    /// Spawn the background loop on the current Tokio runtime.
    pub fn start(&self) -> RunningScheduler {
        SchedulerEngine::new(self.clone()).spawn()
    }
}

fn joined_error(joined: std::result::Result<ExecutionReport, JoinError>) -> Option<String> {
    match joined {
        Ok(report) => report.error,
        Err(e) => Some(e.to_string()),
    }
}

fn run_outcome(name: &str, periodic: bool, error: Option<String>) -> RunOutcome {
    match error {
        None => RunOutcome::Executed {
            name: name.to_string(),
            periodic,
        },
        Some(error) => RunOutcome::Failed {
            name: name.to_string(),
            periodic,
            error,
        },
    }
}
