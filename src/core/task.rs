//! Task model: identifiers, priorities, resource requirements, dependencies,
//! and the task record itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::FailureReason;

/// Process-global task id allocator. Ids are monotonic, so later submissions
/// always compare greater than earlier ones.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, totally ordered task identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocate the next id from the global counter.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Reconstruct an id captured earlier (logs, metrics). An id that was
    /// never returned by a submit refers to no task and surfaces as
    /// `UnknownTask` from control operations.
    #[must_use]
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Task priority. The derived ordering puts `Critical` first, so the queue
/// key is simply `(priority, created_at)` with smaller values dispatching
/// earlier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Dispatch ahead of everything else.
    Critical,
    /// Latency-sensitive work.
    High,
    /// Default tier.
    Medium,
    /// Deferred work.
    Low,
    /// Runs only when nothing else is ready.
    Background,
}

/// Closed enumeration of finite resource categories the accountant tracks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Device (GPU) memory in bytes.
    GpuMemory,
    /// Host memory in bytes.
    CpuMemory,
    /// Device compute, in abstract units.
    GpuCompute,
    /// Host compute, in abstract units.
    CpuCompute,
    /// Network bandwidth, in abstract units.
    NetworkBandwidth,
    /// Storage I/O, in abstract units.
    StorageIo,
}

impl ResourceKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::GpuMemory,
        Self::CpuMemory,
        Self::GpuCompute,
        Self::CpuCompute,
        Self::NetworkBandwidth,
        Self::StorageIo,
    ];

    /// Stable snake_case label for logs and metrics keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GpuMemory => "gpu_memory",
            Self::CpuMemory => "cpu_memory",
            Self::GpuCompute => "gpu_compute",
            Self::CpuCompute => "cpu_compute",
            Self::NetworkBandwidth => "network_bandwidth",
            Self::StorageIo => "storage_io",
        }
    }
}

/// A single resource demand carried by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// Which resource the task consumes.
    pub kind: ResourceKind,
    /// How much of it, in the kind's units.
    pub amount: u64,
    /// Admission refuses the task when current utilization plus this demand's
    /// fraction would exceed the ceiling. The load balancer may tighten this
    /// value, never loosen it.
    pub utilization_ceiling: f64,
}

impl ResourceRequirement {
    /// Requirement with the default ceiling of 1.0 (admit up to capacity).
    #[must_use]
    pub const fn new(kind: ResourceKind, amount: u64) -> Self {
        Self {
            kind,
            amount,
            utilization_ceiling: 1.0,
        }
    }
}

/// A directed dependency edge: the owning task waits on `upstream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDependency {
    /// Task that must finish first.
    pub upstream: TaskId,
    /// Free-form label describing what flows across the edge ("data",
    /// "compute", "resource", ...).
    pub kind_tag: String,
    /// Optional edges let the dependent proceed even if the upstream fails.
    pub optional: bool,
    /// Bound on the wait, measured from the upstream task's creation time.
    pub timeout: Duration,
    /// Resource kinds a task must request for a pattern carrying this edge
    /// to match it.
    pub required_resource_tags: Vec<ResourceKind>,
}

impl TaskDependency {
    /// Required (non-optional) dependency with the given timeout.
    #[must_use]
    pub fn required(upstream: TaskId, timeout: Duration) -> Self {
        Self {
            upstream,
            kind_tag: "data".into(),
            optional: false,
            timeout,
            required_resource_tags: Vec::new(),
        }
    }
}

/// Task lifecycle states.
///
/// Terminal states are absorbing; only `Failed` is re-enterable, via an
/// explicit `retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted but not yet schedulable (admission refused or just created).
    Queued,
    /// Waiting on unresolved non-optional dependencies.
    WaitingOnDeps,
    /// All dependencies resolved; sitting in the ready queue.
    Ready,
    /// A dispatcher is executing the worker callback.
    Running,
    /// Worker returned successfully.
    Completed,
    /// Worker failed, timed out, or an upstream dependency failed.
    Failed,
    /// Cancelled before completion. Retained so lookups stay well defined.
    Cancelled,
}

impl TaskState {
    /// True for `Completed`, `Failed`, and `Cancelled`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Cap on per-task error messages retained for reporting.
pub(crate) const MAX_TASK_ERRORS: usize = 16;

/// A unit of deferred work owned by the scheduler's task map.
///
/// The dependency graph refers to tasks by [`TaskId`] only; no task holds a
/// reference to another, so ownership stays acyclic.
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique id.
    pub id: TaskId,
    /// Human-readable description.
    pub description: String,
    /// Opaque payload handed to the worker callback.
    pub payload: Vec<u8>,
    /// Dependency edges as declared at submit (or applied from a pattern).
    pub dependencies: Vec<TaskDependency>,
    /// Queue ordering tier.
    pub priority: Priority,
    /// Resource demands checked at admission and re-checked at dispatch.
    pub requirements: Vec<ResourceRequirement>,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Set while admission or placement refuses the task; cleared when a
    /// rebalance tick re-admits it.
    pub blocked: bool,
    /// Monotonic creation time; dependency timeouts anchor here.
    pub created_at: Instant,
    /// When a dispatcher picked the task up.
    pub started_at: Option<Instant>,
    /// When the task reached a terminal state.
    pub completed_at: Option<Instant>,
    /// Number of explicit retries performed so far.
    pub retry_count: u32,
    /// Success payload returned by the worker, once completed.
    pub output: Option<Vec<u8>>,
    /// Why the task failed, if it did.
    pub failure: Option<FailureReason>,
    /// Bounded log of error messages accumulated across attempts.
    pub error_messages: Vec<String>,
    /// Free-form metadata recorded by the agent variant.
    pub metadata: HashMap<String, String>,
}

impl Task {
    /// Append an error message, dropping the oldest past the cap.
    pub fn push_error(&mut self, message: String) {
        if self.error_messages.len() >= MAX_TASK_ERRORS {
            self.error_messages.remove(0);
        }
        self.error_messages.push(message);
    }
}

/// A reusable dependency template.
///
/// When a freshly submitted task has no explicit dependencies and its
/// resource kinds cover the pattern's `required_resource_tags`, a pattern
/// with `success_rate > 0.8` copies its template edges onto the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyPattern {
    /// Pattern identity.
    pub id: Uuid,
    /// Edges to copy onto matching tasks.
    pub template_deps: Vec<TaskDependency>,
    /// Observed fraction of successful completions under this pattern.
    pub success_rate: f64,
    /// Observed mean completion time under this pattern.
    pub mean_completion_time: Duration,
    /// Resource kinds a task must request for the pattern to apply.
    pub required_resource_tags: Vec<ResourceKind>,
}
