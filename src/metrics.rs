//! Metrics snapshots and sinks.
//!
//! The scheduler assembles an [`AgentMetrics`] snapshot on demand; sinks
//! receive snapshots and have no influence on scheduling.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AgentKind;
use crate::core::accountant::MeterSnapshot;

/// Full metrics snapshot for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Scheduler instance identity.
    pub agent_id: Uuid,
    /// Worker variant.
    pub kind: AgentKind,
    /// Model label from the configuration.
    pub model_name: String,

    /// Tasks currently executing.
    pub active_tasks: u64,
    /// Tasks completed successfully since start.
    pub completed_tasks: u64,
    /// Tasks in a failed terminal state since start.
    pub failed_tasks: u64,
    /// Tasks cancelled since start.
    pub cancelled_tasks: u64,
    /// Tasks waiting in the ready queue or admission-blocked.
    pub queued_tasks: u64,
    /// Tasks waiting on unresolved dependencies.
    pub waiting_tasks: u64,
    /// Tasks currently excluded from dispatch by admission refusal.
    pub blocked_tasks: u64,
    /// Explicit retries performed.
    pub retries: u64,
    /// Tasks that exceeded the agent timeout.
    pub timeouts: u64,
    /// Cycle-break events observed.
    pub cycle_breaks: u64,
    /// Failure counts bucketed by reason label.
    pub errors_by_reason: HashMap<String, u64>,

    /// `completed / (completed + failed)`, or 1.0 with no data.
    pub task_success_rate: f64,
    /// Mean worker execution time in milliseconds.
    pub mean_processing_ms: f64,
    /// 95th percentile execution time in milliseconds.
    pub p95_processing_ms: f64,
    /// 99th percentile execution time in milliseconds.
    pub p99_processing_ms: f64,
    /// Mean queue wait in milliseconds.
    pub mean_wait_ms: f64,
    /// Completions per second since the scheduler started.
    pub throughput_per_sec: f64,

    /// Mean utilization across every resource kind.
    pub load_factor: f64,
    /// Combined peak of the memory kinds, in bytes.
    pub peak_memory_bytes: u64,
    /// Per-kind meter snapshots.
    pub resources: Vec<MeterSnapshot>,

    /// Tasks the dependency engine is still holding edges for.
    pub pending_dependencies: usize,
    /// Most recent error messages, oldest first.
    pub recent_errors: Vec<String>,
    /// Wall-clock milliseconds the snapshot was taken at.
    pub snapshot_at_ms: u128,
}

/// Receiver of metrics snapshots.
pub trait MetricsSink: Send {
    /// Record one snapshot.
    fn record(&mut self, snapshot: AgentMetrics);
}

/// Bounded in-memory sink for testing and development.
pub struct InMemoryMetricsSink {
    snapshots: VecDeque<AgentMetrics>,
    max_snapshots: usize,
}

impl InMemoryMetricsSink {
    /// Sink retaining at most `max_snapshots` entries.
    #[must_use]
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            snapshots: VecDeque::with_capacity(max_snapshots.min(64)),
            max_snapshots,
        }
    }

    /// Stored snapshots, oldest first.
    #[must_use]
    pub fn snapshots(&self) -> Vec<AgentMetrics> {
        self.snapshots.iter().cloned().collect()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record(&mut self, snapshot: AgentMetrics) {
        if self.snapshots.len() >= self.max_snapshots {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snapshot);
    }
}

/// Percentile over a sorted slice; 0.0 when empty.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
    sorted[idx]
}
