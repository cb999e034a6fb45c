use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::{
    executor::{saturating_millis, ExecutionReport},
    handle::{SchedulerHandle, SchedulerInner},
    types::ExecutionStatus,
};

/// Observable state of the background loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Sleeping until the next tick.
    Idle,
    /// Scanning registries and running due work.
    Ticking,
    /// Shutdown observed; no further ticks will start.
    ShuttingDown,
}

/// Counts for one tick, mostly useful for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub one_shot: usize,
    pub periodic: usize,
    pub failed: usize,
}

/// Single background worker that wakes on a fixed tick and dispatches due work.
pub struct SchedulerEngine {
    inner: Arc<SchedulerInner>,
    tick: Duration,
    state_tx: watch::Sender<LoopState>,
}

impl SchedulerEngine {
    pub fn new(handle: SchedulerHandle) -> Self {
        let tick = handle.settings().tick;
        let (state_tx, _) = watch::channel(LoopState::Idle);
        Self {
            inner: handle.inner,
            tick,
            state_tx,
        }
    }

    /// Subscribe to loop state changes.
    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    /// Main event loop. Ticks every `tick` until `shutdown` broadcasts `true`
    /// or its sender is dropped.
    ///
    /// The inter-tick sleep is interrupted immediately by shutdown; a tick
    /// that already started always runs to completion first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let tick_ms = saturating_millis(self.tick);
        info!(tick_ms, "scheduler engine started");

        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    self.state_tx.send_replace(LoopState::Ticking);
                    let summary = self.tick_at(Utc::now()).await;
                    if summary != TickSummary::default() {
                        debug!(?summary, "tick finished");
                    }
                    self.state_tx.send_replace(LoopState::Idle);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.state_tx.send_replace(LoopState::ShuttingDown);
        info!("scheduler engine shutting down");
    }

    /// Spawn [`run`](Self::run) on the current runtime with its own shutdown channel.
    pub fn spawn(self) -> RunningScheduler {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = self.state();
        let join = tokio::spawn(self.run(shutdown_rx));
        RunningScheduler {
            shutdown_tx,
            state,
            join,
        }
    }

    /// Run one tick body as if the clock read `now`.
    ///
    /// Due one-shot tasks are dispatched and awaited before due periodic
    /// tasks. The body runs on its own task, so faults of the scan itself,
    /// panics included, go to the error sink and never escape.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickSummary {
        match tokio::spawn(dispatch_due(Arc::clone(&self.inner), now)).await {
            Ok(summary) => summary,
            Err(e) => {
                loop_fault(&self.inner, &e);
                TickSummary::default()
            }
        }
    }
}

async fn dispatch_due(inner: Arc<SchedulerInner>, now: DateTime<Utc>) -> TickSummary {
    let mut summary = TickSummary::default();

    match inner.store.take_due(now) {
        Ok(due) => {
            let mut batch = JoinSet::new();
            for task in due {
                let inner = Arc::clone(&inner);
                batch.spawn(async move { inner.executor.run_due_task(&inner.store, task).await });
            }
            while let Some(joined) = batch.join_next().await {
                match joined {
                    Ok(Some(report)) => summary.count(&report, false),
                    Ok(None) => {}
                    Err(e) => loop_fault(&inner, &e),
                }
            }
        }
        Err(e) => loop_fault(&inner, &e),
    }

    match inner.periodic.due(now) {
        Ok(due) => {
            let mut batch = JoinSet::new();
            for entry in due {
                let inner = Arc::clone(&inner);
                batch.spawn(async move { inner.executor.execute_periodic(&inner.periodic, entry).await });
            }
            while let Some(joined) = batch.join_next().await {
                match joined {
                    Ok(report) => summary.count(&report, true),
                    Err(e) => loop_fault(&inner, &e),
                }
            }
        }
        Err(e) => loop_fault(&inner, &e),
    }

    summary
}

fn loop_fault(inner: &SchedulerInner, fault: &(dyn std::error::Error + 'static)) {
    error!(error = %fault, "scheduler tick error");
    inner.executor.error_sink().log_error("scheduler tick", fault);
}

impl TickSummary {
    fn count(&mut self, report: &ExecutionReport, periodic: bool) {
        if periodic {
            self.periodic += 1;
        } else {
            self.one_shot += 1;
        }
        if report.status == ExecutionStatus::Failed {
            self.failed += 1;
        }
    }
}

/// A spawned engine loop and the means to stop it.
pub struct RunningScheduler {
    shutdown_tx: watch::Sender<bool>,
    state: watch::Receiver<LoopState>,
    join: JoinHandle<()>,
}

impl RunningScheduler {
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Signal shutdown and wait for the loop to exit. A tick in progress,
    /// including its in-flight actions, finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            error!("scheduler engine task ended abnormally: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{action_fn, NoopAction, TaskAction};
    use crate::executor::tests::RecordingSink;
    use crate::handle::SchedulerSettings;
    use crate::sink::MemoryTaskLog;
    use crate::types::{Details, TaskStatus};
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn handle_with(settings: SchedulerSettings) -> (SchedulerHandle, Arc<RecordingSink>, Arc<MemoryTaskLog>) {
        let sink = Arc::new(RecordingSink::default());
        let log = Arc::new(MemoryTaskLog::new());
        (SchedulerHandle::new(settings, sink.clone(), log.clone()), sink, log)
    }

    fn failing(msg: &'static str) -> Arc<dyn TaskAction> {
        action_fn(move |_| async move { Err(anyhow::anyhow!(msg)) })
    }

    #[tokio::test]
    async fn past_tasks_run_exactly_once() {
        let (handle, _, log) = handle_with(SchedulerSettings::default());
        let engine = SchedulerEngine::new(handle.clone());
        let now = Utc::now();
        for name in ["a", "b", "c"] {
            handle
                .schedule_task(name, now - ChronoDuration::minutes(5), Details::new(), Arc::new(NoopAction))
                .unwrap();
        }

        let first = engine.tick_at(now).await;
        assert_eq!(first.one_shot, 3);
        let second = engine.tick_at(now + ChronoDuration::seconds(60)).await;
        assert_eq!(second.one_shot, 0);

        for name in ["a", "b", "c"] {
            assert_eq!(handle.get_task(name).unwrap().unwrap().status, TaskStatus::Completed);
            assert_eq!(log.records_for(name).len(), 1);
        }
    }

    #[tokio::test]
    async fn one_shot_batch_runs_before_periodic_batch() {
        let (handle, _, _) = handle_with(SchedulerSettings::default());
        let engine = SchedulerEngine::new(handle.clone());
        let order = Arc::new(Mutex::new(Vec::new()));

        let recorder = |label: &'static str| {
            let order = Arc::clone(&order);
            action_fn(move |_| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(label);
                    Ok(())
                }
            })
        };
        handle
            .add_periodic_task("periodic", std::time::Duration::ZERO, recorder("periodic"), Details::new())
            .unwrap();
        handle
            .schedule_task("one-shot", Utc::now(), Details::new(), recorder("one-shot"))
            .unwrap();

        engine.tick_at(Utc::now() + ChronoDuration::seconds(1)).await;
        assert_eq!(*order.lock().unwrap(), vec!["one-shot", "periodic"]);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_rest() {
        let (handle, sink, log) = handle_with(SchedulerSettings::default());
        let engine = SchedulerEngine::new(handle.clone());
        let now = Utc::now();
        handle.schedule_task("bad", now, Details::new(), failing("boom")).unwrap();
        handle.schedule_task("good-1", now, Details::new(), Arc::new(NoopAction)).unwrap();
        handle.schedule_task("good-2", now, Details::new(), Arc::new(NoopAction)).unwrap();
        handle
            .add_periodic_task("bad-periodic", std::time::Duration::ZERO, failing("down"), Details::new())
            .unwrap();
        handle
            .add_periodic_task("good-periodic", std::time::Duration::ZERO, Arc::new(NoopAction), Details::new())
            .unwrap();

        let summary = engine.tick_at(now + ChronoDuration::seconds(1)).await;
        assert_eq!(summary, TickSummary { one_shot: 3, periodic: 2, failed: 2 });

        assert_eq!(handle.get_task("bad").unwrap().unwrap().status, TaskStatus::Failed);
        assert_eq!(handle.get_task("good-1").unwrap().unwrap().status, TaskStatus::Completed);
        assert_eq!(handle.get_task("good-2").unwrap().unwrap().status, TaskStatus::Completed);

        let contexts: Vec<String> = sink.entries().into_iter().map(|(ctx, _)| ctx).collect();
        assert_eq!(contexts.len(), 2);
        assert!(contexts.contains(&"execution error: bad".to_string()));
        assert!(contexts.contains(&"execution error: bad-periodic".to_string()));
        assert_eq!(log.records().len(), 5);
    }

    #[tokio::test]
    async fn stuck_action_does_not_starve_siblings() {
        let settings = SchedulerSettings {
            action_timeout: std::time::Duration::from_millis(100),
            ..SchedulerSettings::default()
        };
        let (handle, sink, _) = handle_with(settings);
        let engine = SchedulerEngine::new(handle.clone());
        let now = Utc::now();
        let stuck = action_fn(|_| async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(())
        });
        handle.schedule_task("stuck", now, Details::new(), stuck).unwrap();
        handle.schedule_task("quick", now, Details::new(), Arc::new(NoopAction)).unwrap();

        let started = std::time::Instant::now();
        let summary = engine.tick_at(now).await;
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(summary.failed, 1);
        assert_eq!(handle.get_task("quick").unwrap().unwrap().status, TaskStatus::Completed);
        assert_eq!(handle.get_task("stuck").unwrap().unwrap().status, TaskStatus::Failed);
        assert_eq!(sink.entries().len(), 1);
    }

    #[tokio::test]
    async fn failing_periodic_keeps_firing_without_limit() {
        let (handle, _, _) = handle_with(SchedulerSettings::default());
        let engine = SchedulerEngine::new(handle.clone());
        handle
            .add_periodic_task("flaky", std::time::Duration::from_secs(10), failing("nope"), Details::new())
            .unwrap();
        let t0 = handle.get_periodic_task("flaky").unwrap().unwrap().last_run;

        let mut fired = 0;
        for step in 1..=5 {
            fired += engine.tick_at(t0 + ChronoDuration::seconds(step * 10)).await.periodic;
        }
        assert_eq!(fired, 5);
    }

    #[tokio::test]
    async fn failing_periodic_is_disabled_when_limit_configured() {
        let settings = SchedulerSettings {
            max_consecutive_failures: Some(2),
            ..SchedulerSettings::default()
        };
        let (handle, _, _) = handle_with(settings);
        let engine = SchedulerEngine::new(handle.clone());
        handle
            .add_periodic_task("flaky", std::time::Duration::from_secs(10), failing("nope"), Details::new())
            .unwrap();
        let t0 = handle.get_periodic_task("flaky").unwrap().unwrap().last_run;

        let mut fired = 0;
        for step in 1..=5 {
            fired += engine.tick_at(t0 + ChronoDuration::seconds(step * 10)).await.periodic;
        }
        assert_eq!(fired, 2);
        assert!(handle.get_periodic_task("flaky").unwrap().unwrap().disabled);
    }

    #[tokio::test]
    async fn scan_fault_is_reported_and_ticking_continues() {
        let (handle, sink, _) = handle_with(SchedulerSettings::default());
        let engine = SchedulerEngine::new(handle.clone());
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        handle
            .add_periodic_task(
                "heartbeat",
                std::time::Duration::ZERO,
                action_fn(move |_| {
                    let c = Arc::clone(&c);
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                Details::new(),
            )
            .unwrap();
        handle.inner.store.poison();

        let first = engine.tick_at(Utc::now() + ChronoDuration::seconds(1)).await;
        assert_eq!(first, TickSummary { one_shot: 0, periodic: 1, failed: 0 });
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "scheduler tick");
        assert!(entries[0].1.contains("task store"));

        let second = engine.tick_at(Utc::now() + ChronoDuration::seconds(2)).await;
        assert_eq!(second.periodic, 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(sink.entries().len(), 2);
    }

    #[tokio::test]
    async fn loop_ticks_until_shutdown() {
        let settings = SchedulerSettings {
            tick: std::time::Duration::from_millis(20),
            ..SchedulerSettings::default()
        };
        let (handle, _, _) = handle_with(settings);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        handle
            .add_periodic_task(
                "heartbeat",
                std::time::Duration::ZERO,
                action_fn(move |_| {
                    let c = Arc::clone(&c);
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                Details::new(),
            )
            .unwrap();

        let running = handle.start();
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        running.shutdown().await;

        let after_shutdown = count.load(Ordering::SeqCst);
        assert!(after_shutdown >= 2, "only {after_shutdown} ticks");
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_shutdown);
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_long_sleep() {
        let settings = SchedulerSettings {
            tick: std::time::Duration::from_secs(3600),
            ..SchedulerSettings::default()
        };
        let (handle, _, _) = handle_with(settings);
        let engine = SchedulerEngine::new(handle);
        let mut state = engine.state();
        let running = engine.spawn();

        // Let the immediate first tick pass, then stop during the hour-long sleep.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(running.state(), LoopState::Idle);

        let started = std::time::Instant::now();
        running.shutdown().await;
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        state.changed().await.ok();
        assert_eq!(*state.borrow(), LoopState::ShuttingDown);
    }
}
