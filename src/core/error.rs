//! Error types for scheduler operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::task::{TaskId, TaskState};

/// Errors produced by scheduler control operations.
///
/// Submitters only ever see `QueueFull`; everything else surfaces through the
/// task's terminal state or through control calls (`cancel`, `retry`,
/// `is_completed`) that reference a task.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Submission rejected: the agent's queue is at `max_queue` depth.
    #[error("task queue is full")]
    QueueFull,
    /// Operation references a task the scheduler does not know.
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),
    /// Operation is not legal in the task's current state.
    #[error("cannot {operation} task {task} in state {state:?}")]
    InvalidTransition {
        /// Task the operation referenced.
        task: TaskId,
        /// State the task was in when the operation arrived.
        state: TaskState,
        /// Name of the rejected operation.
        operation: &'static str,
    },
    /// No device has enough free memory to place the task.
    #[error("no device with sufficient capacity")]
    NoCapacity,
    /// Configuration validation failed at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Reason a task reached the `Failed` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// A non-optional upstream dependency failed or was cancelled.
    UpstreamFailed(TaskId),
    /// The worker exceeded the agent's task timeout.
    TimedOut,
    /// Opaque failure payload returned by the worker callback.
    WorkerError(String),
}

impl FailureReason {
    /// Stable label used to bucket errors in metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::UpstreamFailed(_) => "upstream_failed",
            Self::TimedOut => "timed_out",
            Self::WorkerError(_) => "worker_error",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpstreamFailed(id) => write!(f, "upstream failed: {id}"),
            Self::TimedOut => write!(f, "timed out"),
            Self::WorkerError(msg) => write!(f, "worker error: {msg}"),
        }
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
