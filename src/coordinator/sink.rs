//! Pluggable reporting of failed task bodies.

use std::fmt;
use std::time::Duration;
use tracing::error;
use uuid::Uuid;

/// Why a task body counted as failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailureReason {
    /// The body returned `Ok(false)`
    ReturnedFalse,
    /// The body returned an error
    Error(String),
    /// The body panicked
    Panicked(String),
}

impl fmt::Display for TaskFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailureReason::ReturnedFalse => write!(f, "body reported failure"),
            TaskFailureReason::Error(msg) => write!(f, "body returned error: {msg}"),
            TaskFailureReason::Panicked(msg) => write!(f, "body panicked: {msg}"),
        }
    }
}

/// A failed execution, handed to the [`TaskFailureSink`]
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub coordinator_id: Uuid,
    /// `Debug` rendering of the task key
    pub key: String,
    pub reason: TaskFailureReason,
    /// Time between first submission and the start of execution
    pub queued_for: Duration,
    pub run_time: Duration,
}

/// Receives failed task executions. Failed items are never retried, so this
/// is the only trace they leave.
pub trait TaskFailureSink: Send + Sync + fmt::Debug {
    fn record(&self, failure: &TaskFailure);
}

/// Default sink: one `tracing` error event per failure
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFailureSink;

impl TaskFailureSink for TracingFailureSink {
    fn record(&self, failure: &TaskFailure) {
        error!(
            coordinator_id = %failure.coordinator_id,
            key = %failure.key,
            reason = %failure.reason,
            queued_ms = failure.queued_for.as_millis() as u64,
            run_ms = failure.run_time.as_millis() as u64,
            "Task execution failed"
        );
    }
}
