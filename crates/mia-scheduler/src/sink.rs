//! Collaborator interfaces the scheduler reports to, plus in-process defaults.
//!
//! The scheduler never owns where errors and execution records end up; it
//! only calls these traits. `TracingErrorSink` and `MemoryTaskLog` are enough
//! for the daemon and for tests.

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use crate::types::TaskLogRecord;

const DEFAULT_ERROR_HISTORY: usize = 200;
const DEFAULT_TASK_LOG_HISTORY: usize = 1000;

/// Receives every failed execution and every fault of the tick body.
pub trait ErrorSink: Send + Sync {
    fn log_error(&self, context: &str, fault: &(dyn StdError + 'static));
}

/// Receives one record per execution, successful or not.
pub trait TaskLogSink: Send + Sync {
    fn store_task_log(&self, record: TaskLogRecord);
}

/// A captured error-sink entry.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub context: String,
    pub message: String,
}

/// Error sink that emits `tracing::error!` and keeps the latest entries in memory.
pub struct TracingErrorSink {
    recent: Mutex<VecDeque<ErrorEntry>>,
    capacity: usize,
}

impl TracingErrorSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ERROR_HISTORY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_ERROR_HISTORY))),
            capacity: capacity.max(1),
        }
    }

    /// The `count` most recent entries, oldest first.
    pub fn recent(&self, count: usize) -> Vec<ErrorEntry> {
        let recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        let skip = recent.len().saturating_sub(count);
        recent.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.recent.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TracingErrorSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorSink for TracingErrorSink {
    fn log_error(&self, context: &str, fault: &(dyn StdError + 'static)) {
        let message = error_chain(fault);
        error!(context, error = %message, "scheduler error");

        // A poisoned buffer only ever holds complete entries, so keep using it.
        let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(ErrorEntry {
            at: Utc::now(),
            context: context.to_string(),
            message,
        });
    }
}

/// Task-log sink that keeps the latest records in memory.
pub struct MemoryTaskLog {
    records: Mutex<VecDeque<TaskLogRecord>>,
    capacity: usize,
}

impl MemoryTaskLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TASK_LOG_HISTORY)
    }

    /// Keep at most `capacity` records; the oldest is evicted first.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_TASK_LOG_HISTORY))),
            capacity: capacity.max(1),
        }
    }

    /// Retained records, oldest first.
    pub fn records(&self) -> Vec<TaskLogRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn records_for(&self, task_name: &str) -> Vec<TaskLogRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|r| r.task_name == task_name)
            .cloned()
            .collect()
    }
}

impl Default for MemoryTaskLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskLogSink for MemoryTaskLog {
    fn store_task_log(&self, record: TaskLogRecord) {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }
}

/// Render an error with its `source()` chain, `outer: inner: innermost`.
fn error_chain(fault: &(dyn StdError + 'static)) -> String {
    let mut message = fault.to_string();
    let mut source = fault.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
