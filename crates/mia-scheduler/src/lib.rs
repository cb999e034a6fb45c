//! `mia-scheduler` — in-memory task scheduling engine for the Mia assistant.
//!
//! # Overview
//!
//! One-shot tasks live in a [`store::TaskStore`], recurring tasks in a
//! [`periodic::PeriodicTaskRegistry`]. The [`engine::SchedulerEngine`] ticks on
//! a fixed period, collects whatever is due and hands it to the
//! [`executor::TaskExecutor`], which runs each action inside a failure
//! boundary (error, panic and timeout are all contained) and reports to the
//! error and task-log sinks.
//!
//! Callers manage tasks through a cloneable [`handle::SchedulerHandle`] while
//! the loop runs.
//!
//! # One-shot lifecycle
//!
//! | From        | To                               |
//! |-------------|----------------------------------|
//! | `Scheduled` | `Overdue`, `Running`, `Canceled` |
//! | `Overdue`   | `Running`, `Canceled`            |
//! | `Running`   | `Completed`, `Failed`            |
//!
//! `Completed`, `Failed` and `Canceled` are terminal.

pub mod action;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handle;
pub mod optimization;
pub mod periodic;
pub mod sink;
pub mod store;
pub mod types;

pub use action::{action_fn, NoopAction, TaskAction, TaskContext};
pub use engine::{LoopState, RunningScheduler, SchedulerEngine, TickSummary};
pub use error::{ExecutionError, Result, SchedulerError};
pub use executor::{ExecutionReport, TaskExecutor};
pub use handle::{SchedulerHandle, SchedulerSettings};
pub use optimization::{
    Feedback, FeedbackInsights, FeedbackSource, InteractionSource, OptimizationSettings, Optimizer,
    SelfOptimizationCycle, SELF_OPTIMIZATION_TASK,
};
pub use sink::{ErrorEntry, ErrorSink, MemoryTaskLog, TaskLogSink, TracingErrorSink};
pub use types::{
    CancelOutcome, Details, ExecutionStatus, PeriodicTask, RunOutcome, ScheduleAck, Task, TaskListing,
    TaskLogRecord, TaskStatus,
};
