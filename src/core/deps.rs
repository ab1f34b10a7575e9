//! Dependency engine: DAG maintenance and readiness transitions.
//!
//! The engine holds [`TaskId`] indices only; the scheduler's task map owns
//! the records. All methods run under the agent lock and report transitions
//! as return values, never through callbacks, so the caller decides what to
//! do while still holding the lock.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::core::error::FailureReason;
use crate::core::task::{DependencyPattern, Priority, ResourceKind, TaskDependency, TaskId};

/// One dependency edge removed to break a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokenEdge {
    /// The task that was waiting.
    pub dependent: TaskId,
    /// The upstream it no longer waits on.
    pub upstream: TaskId,
}

/// Readiness and failure transitions produced by one engine call.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Tasks whose last blocking edge was resolved, ascending id order.
    pub readied: Vec<TaskId>,
    /// Tasks that must transition to `Failed`, with the reason.
    pub failed: Vec<(TaskId, FailureReason)>,
}

/// Outcome of registering a task's edges.
#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// No open non-optional dependencies: dispatchable now.
    Ready,
    /// At least one open non-optional dependency remains.
    Waiting,
    /// A non-optional upstream already failed; the task fails immediately.
    Failed(FailureReason),
}

#[derive(Debug)]
struct Edge {
    dep: TaskDependency,
    /// Timeout anchor: the upstream's creation time when known at insert,
    /// otherwise the moment the edge was added.
    anchor: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    priority: Priority,
    created_at: Instant,
}

/// Task-dependency DAG with cycle breakage and pattern application.
#[derive(Debug, Default)]
pub struct DependencyEngine {
    /// Open edges per dependent task.
    edges: HashMap<TaskId, Vec<Edge>>,
    /// Upstream id to dependents holding an open edge on it.
    dependents: HashMap<TaskId, Vec<TaskId>>,
    /// Tasks the engine has seen, with the data cycle breakage needs.
    nodes: HashMap<TaskId, Node>,
    completed: HashSet<TaskId>,
    failed: HashSet<TaskId>,
}

impl DependencyEngine {
    /// Empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task and its edges. Edges to already-completed upstreams are
    /// satisfied on the spot; a non-optional edge to an already-failed
    /// upstream fails the task immediately.
    pub fn register(
        &mut self,
        id: TaskId,
        priority: Priority,
        created_at: Instant,
        deps: &[TaskDependency],
        now: Instant,
    ) -> RegisterOutcome {
        self.nodes.insert(id, Node { priority, created_at });

        let mut open = Vec::new();
        for dep in deps {
            if self.completed.contains(&dep.upstream) {
                continue;
            }
            if self.failed.contains(&dep.upstream) {
                if dep.optional {
                    continue;
                }
                return RegisterOutcome::Failed(FailureReason::UpstreamFailed(dep.upstream));
            }
            let anchor = self
                .nodes
                .get(&dep.upstream)
                .map_or(now, |n| n.created_at);
            open.push(Edge {
                dep: dep.clone(),
                anchor,
            });
        }

        if open.iter().all(|e| e.dep.optional) {
            // Optional leftovers never block; drop them entirely.
            return RegisterOutcome::Ready;
        }

        for edge in &open {
            self.dependents
                .entry(edge.dep.upstream)
                .or_default()
                .push(id);
        }
        self.edges.insert(id, open);
        RegisterOutcome::Waiting
    }

    /// Resolve a completion. Idempotent: a second call for the same task
    /// returns no transitions.
    pub fn on_complete(&mut self, id: TaskId) -> Vec<TaskId> {
        if !self.completed.insert(id) {
            return Vec::new();
        }
        let mut readied = Vec::new();
        for dependent in self.dependents.remove(&id).unwrap_or_default() {
            if self.satisfy_edge(dependent, id) {
                readied.push(dependent);
            }
        }
        readied.sort_unstable();
        readied
    }

    /// Propagate an upstream failure. Non-optional dependents fail (and the
    /// failure cascades through them); optional edges count as satisfied.
    pub fn on_failure(&mut self, id: TaskId) -> Resolution {
        let mut resolution = Resolution::default();
        if !self.failed.insert(id) {
            return resolution;
        }
        let mut queue = vec![id];
        while let Some(failed_id) = queue.pop() {
            for dependent in self.dependents.remove(&failed_id).unwrap_or_default() {
                let Some(edges) = self.edges.get(&dependent) else {
                    continue;
                };
                let optional = edges
                    .iter()
                    .find(|e| e.dep.upstream == failed_id)
                    .is_none_or(|e| e.dep.optional);
                if optional {
                    if self.satisfy_edge(dependent, failed_id) {
                        resolution.readied.push(dependent);
                    }
                } else {
                    self.drop_edges_of(dependent);
                    self.failed.insert(dependent);
                    resolution
                        .failed
                        .push((dependent, FailureReason::UpstreamFailed(failed_id)));
                    queue.push(dependent);
                }
            }
        }
        resolution.readied.sort_unstable();
        resolution.failed.sort_unstable_by_key(|(id, _)| *id);
        resolution
    }

    /// Fail every dependent whose edge outlived its timeout, measured from
    /// the upstream's creation time.
    pub fn check_timeouts(&mut self, now: Instant) -> Resolution {
        let mut expired: Vec<(TaskId, TaskId, bool)> = Vec::new();
        for (&dependent, edges) in &self.edges {
            for edge in edges {
                if now.duration_since(edge.anchor) > edge.dep.timeout {
                    expired.push((dependent, edge.dep.upstream, edge.dep.optional));
                }
            }
        }

        let mut resolution = Resolution::default();
        for (dependent, upstream, optional) in expired {
            if self.failed.contains(&dependent) {
                continue;
            }
            if optional {
                if self.satisfy_edge(dependent, upstream) {
                    resolution.readied.push(dependent);
                }
            } else {
                tracing::warn!(%dependent, %upstream, "dependency timed out");
                self.drop_edges_of(dependent);
                let cascade = self.on_failure(dependent);
                resolution
                    .failed
                    .push((dependent, FailureReason::UpstreamFailed(upstream)));
                resolution.failed.extend(cascade.failed);
                resolution.readied.extend(cascade.readied);
            }
        }
        resolution.readied.sort_unstable();
        resolution.readied.dedup();
        resolution
    }

    /// Detect cycles with a depth-first traversal and break each by removing
    /// the outbound edge of the least-urgent task in the cycle (ties go to
    /// the earliest-created). Never an error: returns the broken edges and
    /// any tasks that became ready.
    pub fn detect_and_break_cycles(&mut self) -> (Vec<BrokenEdge>, Vec<TaskId>) {
        let mut broken = Vec::new();
        let mut readied = Vec::new();

        // Each break removes one edge, so this terminates.
        while let Some(cycle) = self.find_cycle() {
            let Some(&victim) = cycle.iter().min_by_key(|id| {
                let node = self.nodes.get(*id);
                (
                    std::cmp::Reverse(node.map_or(Priority::Background, |n| n.priority)),
                    node.map(|n| n.created_at),
                )
            }) else {
                break;
            };
            let in_cycle: HashSet<TaskId> = cycle.iter().copied().collect();
            let Some(upstream) = self.edges.get(&victim).and_then(|edges| {
                edges
                    .iter()
                    .map(|e| e.dep.upstream)
                    .find(|u| in_cycle.contains(u))
            }) else {
                break;
            };
            tracing::warn!(dependent = %victim, %upstream, "breaking circular dependency");
            if self.satisfy_edge(victim, upstream) {
                readied.push(victim);
            }
            broken.push(BrokenEdge {
                dependent: victim,
                upstream,
            });
        }
        readied.sort_unstable();
        (broken, readied)
    }

    /// First pattern whose resource tags are covered by the task's requested
    /// kinds and whose success rate clears the bar.
    #[must_use]
    pub fn matching_pattern<'a>(
        requested_kinds: &[ResourceKind],
        patterns: &'a [DependencyPattern],
    ) -> Option<&'a DependencyPattern> {
        patterns.iter().find(|p| {
            p.success_rate > 0.8
                && !p.template_deps.is_empty()
                && p.required_resource_tags
                    .iter()
                    .all(|tag| requested_kinds.contains(tag))
        })
    }

    /// Remove a cancelled task. Its own edges disappear, and dependents
    /// treat it like a failed upstream (optional edges are satisfied).
    pub fn remove_task(&mut self, id: TaskId) -> Resolution {
        self.drop_edges_of(id);
        let resolution = self.on_failure(id);
        self.nodes.remove(&id);
        resolution
    }

    /// Forget a terminal task entirely once the scheduler no longer needs
    /// its edges (completion keeps the node for late registrations).
    pub fn forget(&mut self, id: TaskId) {
        self.drop_edges_of(id);
        self.nodes.remove(&id);
        self.dependents.remove(&id);
    }

    /// Allow a failed task to run again. Returns true when no open
    /// non-optional edges remain (they were purged at failure time).
    pub fn reopen(&mut self, id: TaskId) -> bool {
        self.failed.remove(&id);
        self.edges
            .get(&id)
            .is_none_or(|edges| edges.iter().all(|e| e.dep.optional))
    }

    /// Number of tasks still waiting on at least one edge.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.edges.len()
    }

    /// True when the task has an open non-optional edge.
    #[must_use]
    pub fn has_open_deps(&self, id: TaskId) -> bool {
        self.edges
            .get(&id)
            .is_some_and(|edges| edges.iter().any(|e| !e.dep.optional))
    }

    /// Remove the edge `dependent -> upstream`; returns true when the
    /// dependent has no blocking edges left (remaining optional edges are
    /// purged alongside).
    fn satisfy_edge(&mut self, dependent: TaskId, upstream: TaskId) -> bool {
        let Some(edges) = self.edges.get_mut(&dependent) else {
            return false;
        };
        edges.retain(|e| e.dep.upstream != upstream);
        if edges.iter().any(|e| !e.dep.optional) {
            return false;
        }
        self.drop_edges_of(dependent);
        true
    }

    /// Purge every edge owned by `id` and its reverse index entries.
    fn drop_edges_of(&mut self, id: TaskId) {
        if let Some(edges) = self.edges.remove(&id) {
            for edge in edges {
                if let Some(deps) = self.dependents.get_mut(&edge.dep.upstream) {
                    deps.retain(|&d| d != id);
                    if deps.is_empty() {
                        self.dependents.remove(&edge.dep.upstream);
                    }
                }
            }
        }
    }

    /// Iterative DFS over open edges; returns the nodes of one cycle.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut visited: HashSet<TaskId> = HashSet::new();
        let mut starts: Vec<TaskId> = self.edges.keys().copied().collect();
        starts.sort_unstable();

        for start in starts {
            if visited.contains(&start) {
                continue;
            }
            // Stack of (node, next child index); `on_stack` is the recursion
            // stack of the classic recursive formulation.
            let mut stack: Vec<(TaskId, usize)> = vec![(start, 0)];
            let mut on_stack: Vec<TaskId> = vec![start];
            visited.insert(start);

            loop {
                let Some(&(node, next)) = stack.last() else {
                    break;
                };
                let upstreams: Vec<TaskId> = self
                    .edges
                    .get(&node)
                    .map(|edges| edges.iter().map(|e| e.dep.upstream).collect())
                    .unwrap_or_default();
                if next < upstreams.len() {
                    if let Some(frame) = stack.last_mut() {
                        frame.1 += 1;
                    }
                    let child = upstreams[next];
                    if let Some(pos) = on_stack.iter().position(|&n| n == child) {
                        return Some(on_stack[pos..].to_vec());
                    }
                    if !visited.contains(&child) {
                        visited.insert(child);
                        stack.push((child, 0));
                        on_stack.push(child);
                    }
                } else {
                    stack.pop();
                    on_stack.pop();
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dep(upstream: u64, optional: bool) -> TaskDependency {
        TaskDependency {
            upstream: TaskId::from_u64(upstream),
            kind_tag: "data".into(),
            optional,
            timeout: Duration::from_secs(3600),
            required_resource_tags: Vec::new(),
        }
    }

    fn register(
        engine: &mut DependencyEngine,
        id: u64,
        priority: Priority,
        deps: &[TaskDependency],
    ) -> RegisterOutcome {
        let now = Instant::now();
        engine.register(TaskId::from_u64(id), priority, now, deps, now)
    }

    #[test]
    fn test_no_deps_is_ready() {
        let mut engine = DependencyEngine::new();
        assert_eq!(
            register(&mut engine, 1, Priority::Medium, &[]),
            RegisterOutcome::Ready
        );
    }

    #[test]
    fn test_chain_resolves_in_order() {
        let mut engine = DependencyEngine::new();
        register(&mut engine, 1, Priority::Medium, &[]);
        assert_eq!(
            register(&mut engine, 2, Priority::Medium, &[dep(1, false)]),
            RegisterOutcome::Waiting
        );
        assert_eq!(
            register(&mut engine, 3, Priority::Medium, &[dep(2, false)]),
            RegisterOutcome::Waiting
        );

        assert_eq!(engine.on_complete(TaskId::from_u64(1)), vec![TaskId::from_u64(2)]);
        assert_eq!(engine.on_complete(TaskId::from_u64(2)), vec![TaskId::from_u64(3)]);
        assert!(engine.on_complete(TaskId::from_u64(3)).is_empty());
    }

    #[test]
    fn test_on_complete_is_idempotent() {
        let mut engine = DependencyEngine::new();
        register(&mut engine, 1, Priority::Medium, &[]);
        register(&mut engine, 2, Priority::Medium, &[dep(1, false)]);

        assert_eq!(engine.on_complete(TaskId::from_u64(1)).len(), 1);
        assert!(engine.on_complete(TaskId::from_u64(1)).is_empty());
    }

    #[test]
    fn test_multiple_dependents_ready_ascending() {
        let mut engine = DependencyEngine::new();
        register(&mut engine, 1, Priority::Medium, &[]);
        register(&mut engine, 9, Priority::Medium, &[dep(1, false)]);
        register(&mut engine, 4, Priority::Medium, &[dep(1, false)]);
        register(&mut engine, 6, Priority::Medium, &[dep(1, false)]);

        let readied = engine.on_complete(TaskId::from_u64(1));
        assert_eq!(
            readied,
            vec![TaskId::from_u64(4), TaskId::from_u64(6), TaskId::from_u64(9)]
        );
    }

    #[test]
    fn test_failure_cascades_non_optional() {
        let mut engine = DependencyEngine::new();
        register(&mut engine, 1, Priority::Medium, &[]);
        register(&mut engine, 2, Priority::Medium, &[dep(1, false)]);
        register(&mut engine, 3, Priority::Medium, &[dep(2, false)]);

        let resolution = engine.on_failure(TaskId::from_u64(1));
        assert!(resolution.readied.is_empty());
        assert_eq!(resolution.failed.len(), 2);
        assert_eq!(resolution.failed[0].0, TaskId::from_u64(2));
        assert_eq!(resolution.failed[1].0, TaskId::from_u64(3));
    }

    #[test]
    fn test_optional_edge_survives_failure() {
        let mut engine = DependencyEngine::new();
        register(&mut engine, 1, Priority::Medium, &[]);
        register(
            &mut engine,
            2,
            Priority::Medium,
            &[dep(1, true), dep(3, false)],
        );
        register(&mut engine, 3, Priority::Medium, &[]);

        // Optional upstream fails: edge counts as satisfied, task still
        // waits on the required one.
        let resolution = engine.on_failure(TaskId::from_u64(1));
        assert!(resolution.failed.is_empty());
        assert!(resolution.readied.is_empty());

        assert_eq!(engine.on_complete(TaskId::from_u64(3)), vec![TaskId::from_u64(2)]);
    }

    #[test]
    fn test_register_against_failed_upstream() {
        let mut engine = DependencyEngine::new();
        register(&mut engine, 1, Priority::Medium, &[]);
        engine.on_failure(TaskId::from_u64(1));

        match register(&mut engine, 2, Priority::Medium, &[dep(1, false)]) {
            RegisterOutcome::Failed(FailureReason::UpstreamFailed(id)) => {
                assert_eq!(id, TaskId::from_u64(1));
            }
            other => panic!("expected immediate failure, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_fails_dependent() {
        let mut engine = DependencyEngine::new();
        let t0 = Instant::now();
        engine.register(TaskId::from_u64(1), Priority::Medium, t0, &[], t0);

        let mut d = dep(1, false);
        d.timeout = Duration::from_millis(10);
        engine.register(TaskId::from_u64(2), Priority::Medium, t0, &[d], t0);

        let resolution = engine.check_timeouts(t0 + Duration::from_millis(50));
        assert_eq!(resolution.failed.len(), 1);
        assert_eq!(resolution.failed[0].0, TaskId::from_u64(2));
    }

    #[test]
    fn test_cycle_breaks_least_urgent_outbound_edge() {
        let mut engine = DependencyEngine::new();
        // A(Low) -> B(Medium) -> C(High) -> A
        register(&mut engine, 1, Priority::Low, &[dep(2, false)]);
        register(&mut engine, 2, Priority::Medium, &[dep(3, false)]);
        register(&mut engine, 3, Priority::High, &[dep(1, false)]);

        let (broken, readied) = engine.detect_and_break_cycles();
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].dependent, TaskId::from_u64(1));
        assert_eq!(broken[0].upstream, TaskId::from_u64(2));
        // A lost its only edge: ready. B -> C -> A stays a linear chain.
        assert_eq!(readied, vec![TaskId::from_u64(1)]);
        assert!(engine.has_open_deps(TaskId::from_u64(2)));
        assert!(engine.has_open_deps(TaskId::from_u64(3)));

        // Idempotent once acyclic.
        let (broken, _) = engine.detect_and_break_cycles();
        assert!(broken.is_empty());
    }

    #[test]
    fn test_cancel_leaves_no_dangling_edges() {
        let mut engine = DependencyEngine::new();
        register(&mut engine, 1, Priority::Medium, &[]);
        register(&mut engine, 2, Priority::Medium, &[dep(1, false)]);
        engine.remove_task(TaskId::from_u64(2));

        // Completing the upstream must not resurrect the cancelled task.
        assert!(engine.on_complete(TaskId::from_u64(1)).is_empty());
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_cancelled_upstream_fails_required_dependent() {
        let mut engine = DependencyEngine::new();
        register(&mut engine, 1, Priority::Medium, &[]);
        register(&mut engine, 2, Priority::Medium, &[dep(1, false)]);

        let resolution = engine.remove_task(TaskId::from_u64(1));
        assert_eq!(resolution.failed.len(), 1);
        assert_eq!(resolution.failed[0].0, TaskId::from_u64(2));
    }

    #[test]
    fn test_pattern_matching() {
        let patterns = vec![DependencyPattern {
            id: uuid::Uuid::new_v4(),
            template_deps: vec![dep(1, false)],
            success_rate: 0.9,
            mean_completion_time: Duration::from_millis(200),
            required_resource_tags: vec![ResourceKind::GpuMemory],
        }];

        let hit = DependencyEngine::matching_pattern(
            &[ResourceKind::GpuMemory, ResourceKind::CpuCompute],
            &patterns,
        );
        assert!(hit.is_some());

        let miss = DependencyEngine::matching_pattern(&[ResourceKind::CpuCompute], &patterns);
        assert!(miss.is_none());

        let mut weak = patterns;
        weak[0].success_rate = 0.5;
        let miss =
            DependencyEngine::matching_pattern(&[ResourceKind::GpuMemory], &weak);
        assert!(miss.is_none());
    }

    #[test]
    fn test_reopen_after_failure() {
        let mut engine = DependencyEngine::new();
        register(&mut engine, 1, Priority::Medium, &[]);
        engine.on_failure(TaskId::from_u64(1));
        assert!(engine.reopen(TaskId::from_u64(1)));
    }
}
