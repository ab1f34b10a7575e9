//! Resource accountant: the single source of truth for per-kind utilization.
//!
//! The accountant is a plain struct owned by the scheduler state and mutated
//! under the agent lock. Admission is read-only; allocation and release keep
//! a per-task ledger so release stays idempotent (cancellation and completion
//! may both trigger it).

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::core::task::{ResourceKind, ResourceRequirement, TaskId};
use crate::util::clock::now_ms;

/// Comparison slack for admission math on accumulated floats.
const ADMIT_EPSILON: f64 = 1e-9;

/// Capacity assigned to kinds the caller did not configure explicitly.
const DEFAULT_CAPACITY: u64 = 1_000_000;

/// Point-in-time view of one resource meter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterSnapshot {
    /// Resource kind this meter tracks.
    pub kind: ResourceKind,
    /// Live usage divided by capacity, in `[0, 1]` (may exceed 1 briefly if
    /// limits were tightened below current usage).
    pub utilization: f64,
    /// Provisioned watermark maintained by `adjust_limits`.
    pub allocated: u64,
    /// Configured capacity.
    pub available: u64,
    /// Sum of live allocations.
    pub in_use: u64,
    /// Highest live usage ever observed. Monotonic.
    pub peak: u64,
    /// Wall-clock milliseconds of the last mutation.
    pub updated_at_ms: u128,
}

#[derive(Debug)]
struct Meter {
    available: u64,
    allocated: u64,
    in_use: u64,
    peak: u64,
    utilization: f64,
    updated_at_ms: u128,
    history: VecDeque<f64>,
}

impl Meter {
    fn new(available: u64) -> Self {
        Self {
            available,
            allocated: 0,
            in_use: 0,
            peak: 0,
            utilization: 0.0,
            updated_at_ms: now_ms(),
            history: VecDeque::new(),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn recompute(&mut self) {
        self.utilization = if self.available == 0 {
            0.0
        } else {
            self.in_use as f64 / self.available as f64
        };
        self.updated_at_ms = now_ms();
    }
}

/// Per-agent utilization tracking and admission control.
#[derive(Debug)]
pub struct ResourceAccountant {
    meters: HashMap<ResourceKind, Meter>,
    ledger: HashMap<TaskId, Vec<(ResourceKind, u64)>>,
    history_cap: usize,
}

impl ResourceAccountant {
    /// Create an accountant with the given per-kind capacities. Kinds absent
    /// from the map fall back to a generous default so they never refuse
    /// admission unless explicitly constrained.
    #[must_use]
    pub fn new(capacities: &HashMap<ResourceKind, u64>, history_cap: usize) -> Self {
        let meters = ResourceKind::ALL
            .iter()
            .map(|&kind| {
                let cap = capacities.get(&kind).copied().unwrap_or(DEFAULT_CAPACITY);
                (kind, Meter::new(cap))
            })
            .collect();
        Self {
            meters,
            ledger: HashMap::new(),
            history_cap,
        }
    }

    /// Would the given requirements fit under their ceilings right now?
    ///
    /// Read-only: nothing is reserved on success and nothing changes on
    /// refusal.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn admit(&self, requirements: &[ResourceRequirement]) -> bool {
        requirements.iter().all(|req| {
            let Some(meter) = self.meters.get(&req.kind) else {
                return true;
            };
            if req.amount == 0 {
                return true;
            }
            if meter.available == 0 {
                return false;
            }
            let demand = req.amount as f64 / meter.available as f64;
            meter.utilization + demand <= req.utilization_ceiling + ADMIT_EPSILON
        })
    }

    /// Record a task's allocations and recompute utilization and peak.
    pub fn record_allocation(&mut self, task: TaskId, requirements: &[ResourceRequirement]) {
        // Re-recording (e.g. a retry) releases the previous entry first.
        self.record_release(task);
        let mut held = Vec::with_capacity(requirements.len());
        for req in requirements {
            if let Some(meter) = self.meters.get_mut(&req.kind) {
                meter.in_use = meter.in_use.saturating_add(req.amount);
                meter.peak = meter.peak.max(meter.in_use);
                meter.allocated = meter.allocated.max(meter.in_use);
                meter.recompute();
                held.push((req.kind, req.amount));
            }
        }
        self.ledger.insert(task, held);
    }

    /// Release everything the task holds. Unknown tasks are a no-op.
    pub fn record_release(&mut self, task: TaskId) {
        let Some(held) = self.ledger.remove(&task) else {
            return;
        };
        for (kind, amount) in held {
            if let Some(meter) = self.meters.get_mut(&kind) {
                meter.in_use = meter.in_use.saturating_sub(amount);
                meter.recompute();
            }
        }
    }

    /// Push the current utilization of every kind into its history ring.
    pub fn sample(&mut self) {
        for meter in self.meters.values_mut() {
            if meter.history.len() >= self.history_cap {
                meter.history.pop_front();
            }
            meter.history.push_back(meter.utilization);
        }
    }

    /// Move the provisioned watermark toward observed peaks: grow 20 % when
    /// peaks press against it, shrink a third when they sit well below.
    /// Never exceeds capacity, never drops below live usage.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn adjust_limits(&mut self) {
        for (kind, meter) in &mut self.meters {
            if meter.allocated == 0 {
                continue;
            }
            let allocated = meter.allocated as f64;
            let peak = meter.peak as f64;
            if peak > 0.9 * allocated {
                let grown = (allocated * 1.2) as u64;
                meter.allocated = grown.min(meter.available);
                tracing::debug!(kind = kind.as_str(), allocated = meter.allocated, "grew resource limit");
            } else if peak < 0.5 * allocated {
                let shrunk = (allocated * 2.0 / 3.0) as u64;
                meter.allocated = shrunk.max(meter.in_use);
                tracing::debug!(kind = kind.as_str(), allocated = meter.allocated, "shrank resource limit");
            }
        }
    }

    /// Current utilization of one kind.
    #[must_use]
    pub fn utilization(&self, kind: ResourceKind) -> f64 {
        self.meters.get(&kind).map_or(0.0, |m| m.utilization)
    }

    /// Mean utilization across every kind.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn load_factor(&self) -> f64 {
        let sum: f64 = self.meters.values().map(|m| m.utilization).sum();
        sum / ResourceKind::ALL.len() as f64
    }

    /// Kinds currently above the given utilization threshold.
    #[must_use]
    pub fn overloaded_kinds(&self, threshold: f64) -> Vec<ResourceKind> {
        let mut kinds: Vec<ResourceKind> = self
            .meters
            .iter()
            .filter(|(_, m)| m.utilization > threshold)
            .map(|(&kind, _)| kind)
            .collect();
        kinds.sort();
        kinds
    }

    /// Snapshot every meter for reporting.
    #[must_use]
    pub fn snapshots(&self) -> Vec<MeterSnapshot> {
        let mut out: Vec<MeterSnapshot> = self
            .meters
            .iter()
            .map(|(&kind, m)| MeterSnapshot {
                kind,
                utilization: m.utilization,
                allocated: m.allocated,
                available: m.available,
                in_use: m.in_use,
                peak: m.peak,
                updated_at_ms: m.updated_at_ms,
            })
            .collect();
        out.sort_by_key(|s| s.kind);
        out
    }

    /// Recent utilization samples for one kind, oldest first.
    #[must_use]
    pub fn history(&self, kind: ResourceKind) -> Vec<f64> {
        self.meters
            .get(&kind)
            .map_or_else(Vec::new, |m| m.history.iter().copied().collect())
    }

    /// Combined peak of the memory kinds, for the metrics snapshot.
    #[must_use]
    pub fn peak_memory_bytes(&self) -> u64 {
        let gpu = self.meters.get(&ResourceKind::GpuMemory).map_or(0, |m| m.peak);
        let cpu = self.meters.get(&ResourceKind::CpuMemory).map_or(0, |m| m.peak);
        gpu.saturating_add(cpu)
    }
}
