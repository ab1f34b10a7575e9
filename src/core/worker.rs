//! Worker callback abstraction and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::AgentKind;
use crate::core::task::TaskId;

/// Cooperative cancellation flag shared between the dispatcher and a running
/// worker. Workers are expected to poll it at natural yield points.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Has cancellation been requested?
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Per-invocation context handed to the worker alongside the payload.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// The task being executed.
    pub task_id: TaskId,
    /// Cancellation flag for this attempt.
    pub cancel: CancelToken,
}

/// The opaque execution callback an agent variant supplies.
///
/// The scheduler is unaware of what the worker does; it may generate an LLM
/// response, look up knowledge, coordinate reasoning, or drive an actuator.
/// The returned `Err` payload becomes the task's failure reason.
#[async_trait]
pub trait AgentWorker: Send + Sync + 'static {
    /// Variant tag; construction rejects a mismatch with the configuration.
    fn kind(&self) -> AgentKind;

    /// Execute a task payload. Implementations must honor
    /// `ctx.cancel` at their yield points.
    async fn execute(&self, payload: Vec<u8>, ctx: TaskContext) -> Result<Vec<u8>, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_round_trip() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let observer = token.clone();
        token.cancel();
        assert!(observer.is_cancelled());
    }
}
