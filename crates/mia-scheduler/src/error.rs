use thiserror::Error;

/// Errors surfaced synchronously by scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Task names must be non-empty and free of surrounding whitespace.
    #[error("Invalid task name: {0:?}")]
    InvalidName(String),

    /// The run time could not be parsed or is out of range.
    #[error("Invalid run time: {0}")]
    InvalidRunTime(String),

    /// The interval cannot be represented as a calendar duration.
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    /// A registry lock was poisoned by a panic while held.
    #[error("Registry poisoned: {0}")]
    RegistryPoisoned(&'static str),
}

/// Why a single action invocation failed.
///
/// Never propagated past the executor: it is logged, reported to the error
/// sink and turned into a `Failed` status.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The action returned an error.
    #[error("action failed: {0}")]
    Action(String),

    /// The action panicked.
    #[error("action panicked: {0}")]
    Panicked(String),

    /// The action did not finish within the configured timeout and was aborted.
    #[error("action timed out after {ms}ms")]
    TimedOut { ms: u64 },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
