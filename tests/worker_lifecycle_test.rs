//! Task lifecycle behavior: cancellation (queued and running), retry,
//! worker errors, cooperative timeouts, and completion callbacks.

use async_trait::async_trait;
use dream_scheduler::config::{AgentConfig, AgentKind};
use dream_scheduler::core::{
    AgentScheduler, AgentWorker, FailureReason, SubmitRequest, TaskContext, TaskState,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

const BLOCK: &[u8] = b"block";
const FAIL: &[u8] = b"fail";
const CANCELLABLE: &[u8] = b"cancellable";

/// Worker with scriptable behavior per payload.
#[derive(Clone)]
struct LifecycleWorker {
    released: Arc<AtomicBool>,
    executions: Arc<AtomicUsize>,
    failures_left: Arc<AtomicUsize>,
}

impl LifecycleWorker {
    fn new() -> Self {
        Self {
            released: Arc::new(AtomicBool::new(false)),
            executions: Arc::new(AtomicUsize::new(0)),
            failures_left: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl AgentWorker for LifecycleWorker {
    fn kind(&self) -> AgentKind {
        AgentKind::Reasoning
    }

    async fn execute(&self, payload: Vec<u8>, ctx: TaskContext) -> Result<Vec<u8>, String> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if payload == BLOCK {
            while !self.released.load(Ordering::Acquire) && !ctx.cancel.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            return Ok(Vec::new());
        }
        if payload == CANCELLABLE {
            // Honor cooperative cancellation at yield points.
            for _ in 0..1000 {
                if ctx.cancel.is_cancelled() {
                    return Err("cancelled mid-flight".into());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            return Ok(Vec::new());
        }
        if payload == FAIL {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err("boom".into());
            }
            return Ok(b"recovered".to_vec());
        }
        Ok(payload)
    }
}

fn scheduler_with(worker: &LifecycleWorker, timeout_ms: u64, interval_ms: u64) -> AgentScheduler {
    let config = AgentConfig::new(AgentKind::Reasoning, "lifecycle-model")
        .with_worker_concurrency(1)
        .with_task_timeout_ms(timeout_ms)
        .with_rebalance_interval_ms(interval_ms);
    AgentScheduler::builder(config)
        .build(Arc::new(worker.clone()))
        .expect("failed to build scheduler")
}

fn wait_until_running(scheduler: &AgentScheduler, id: dream_scheduler::core::TaskId) {
    for _ in 0..1000 {
        if scheduler.task(id).unwrap().state == TaskState::Running {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("task {id} never started running");
}

#[test]
fn test_cancel_queued_task_is_synchronous() {
    let worker = LifecycleWorker::new();
    let scheduler = scheduler_with(&worker, 300_000, 3_600_000);

    let blocker = scheduler
        .submit(SubmitRequest::new("blocker").with_payload(BLOCK.to_vec()))
        .unwrap();
    wait_until_running(&scheduler, blocker);

    let queued = scheduler.submit(SubmitRequest::new("queued")).unwrap();
    scheduler.cancel(queued).unwrap();
    assert_eq!(scheduler.task(queued).unwrap().state, TaskState::Cancelled);
    assert!(!scheduler.is_completed(queued).unwrap());
    // Cancel of a terminal task is an invalid transition, not a panic.
    assert!(scheduler.cancel(queued).is_err());

    worker.released.store(true, Ordering::Release);
    scheduler.wait_timeout(blocker, Duration::from_secs(5)).unwrap();
    // The cancelled task never reached the worker.
    assert_eq!(worker.executions.load(Ordering::SeqCst), 1);
    scheduler.shutdown();
}

#[test]
fn test_cancel_running_task_is_cooperative() {
    let worker = LifecycleWorker::new();
    let scheduler = scheduler_with(&worker, 300_000, 3_600_000);

    let id = scheduler
        .submit(SubmitRequest::new("long job").with_payload(CANCELLABLE.to_vec()))
        .unwrap();
    wait_until_running(&scheduler, id);

    scheduler.cancel(id).unwrap();
    // Still running until the worker observes the flag.
    let state = scheduler.wait_timeout(id, Duration::from_secs(5)).unwrap();
    assert_eq!(state, Some(TaskState::Cancelled));
    assert_eq!(scheduler.metrics().cancelled_tasks, 1);
    scheduler.shutdown();
}

#[test]
fn test_retry_counts_and_recovers() {
    let worker = LifecycleWorker::new();
    worker.failures_left.store(3, Ordering::SeqCst);
    let scheduler = scheduler_with(&worker, 300_000, 3_600_000);

    let id = scheduler
        .submit(SubmitRequest::new("flaky").with_payload(FAIL.to_vec()))
        .unwrap();
    assert_eq!(
        scheduler.wait_timeout(id, Duration::from_secs(5)).unwrap(),
        Some(TaskState::Failed)
    );
    assert_eq!(
        scheduler.task(id).unwrap().failure,
        Some(FailureReason::WorkerError("boom".into()))
    );

    // Two more failing retries, then one that recovers.
    for expected_retry in 1..=2u32 {
        scheduler.retry(id).unwrap();
        assert_eq!(
            scheduler.wait_timeout(id, Duration::from_secs(5)).unwrap(),
            Some(TaskState::Failed)
        );
        assert_eq!(scheduler.task(id).unwrap().retry_count, expected_retry);
    }
    scheduler.retry(id).unwrap();
    assert_eq!(
        scheduler.wait_timeout(id, Duration::from_secs(5)).unwrap(),
        Some(TaskState::Completed)
    );
    let record = scheduler.task(id).unwrap();
    assert_eq!(record.retry_count, 3);
    assert_eq!(record.output.as_deref(), Some(&b"recovered"[..]));
    assert_eq!(scheduler.metrics().retries, 3);
    scheduler.shutdown();
}

#[test]
fn test_task_timeout_records_timed_out() {
    let worker = LifecycleWorker::new();
    // 100ms budget, 50ms maintenance tick: the sweep catches the overrun.
    let scheduler = scheduler_with(&worker, 100, 50);

    let id = scheduler
        .submit(SubmitRequest::new("overrunning").with_payload(CANCELLABLE.to_vec()))
        .unwrap();
    let state = scheduler.wait_timeout(id, Duration::from_secs(10)).unwrap();
    assert_eq!(state, Some(TaskState::Failed));
    assert_eq!(scheduler.task(id).unwrap().failure, Some(FailureReason::TimedOut));
    let metrics = scheduler.metrics();
    assert_eq!(metrics.timeouts, 1);
    assert_eq!(metrics.errors_by_reason.get("timed_out"), Some(&1));
    scheduler.shutdown();
}

#[test]
fn test_worker_error_is_captured() {
    let worker = LifecycleWorker::new();
    worker.failures_left.store(1, Ordering::SeqCst);
    let scheduler = scheduler_with(&worker, 300_000, 3_600_000);

    let id = scheduler
        .submit(SubmitRequest::new("bad").with_payload(FAIL.to_vec()))
        .unwrap();
    assert_eq!(
        scheduler.wait_timeout(id, Duration::from_secs(5)).unwrap(),
        Some(TaskState::Failed)
    );
    let record = scheduler.task(id).unwrap();
    assert_eq!(record.failure, Some(FailureReason::WorkerError("boom".into())));
    assert!(record
        .error_messages
        .iter()
        .any(|m| m.contains("boom")));
    let metrics = scheduler.metrics();
    assert_eq!(metrics.errors_by_reason.get("worker_error"), Some(&1));
    assert!(metrics.recent_errors.iter().any(|m| m.contains("boom")));
    scheduler.shutdown();
}

#[test]
fn test_completion_callback_fires_once() {
    let worker = LifecycleWorker::new();
    let scheduler = scheduler_with(&worker, 300_000, 3_600_000);
    let (tx, rx) = mpsc::channel();

    let id = scheduler
        .submit_with_callback(
            SubmitRequest::new("notify me").with_payload(b"data".to_vec()),
            move |task| {
                let _ = tx.send((task.id, task.state, task.output.clone()));
            },
        )
        .unwrap();

    let (cb_id, cb_state, cb_output) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(cb_id, id);
    assert_eq!(cb_state, TaskState::Completed);
    assert_eq!(cb_output.as_deref(), Some(&b"data"[..]));
    // Exactly one notification.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    scheduler.shutdown();
}

#[test]
fn test_concurrent_submit_and_cancel_single_terminal_state() {
    let worker = LifecycleWorker::new();
    worker.released.store(true, Ordering::Release);
    let config = AgentConfig::new(AgentKind::Reasoning, "lifecycle-model")
        .with_worker_concurrency(2)
        .with_max_queue(200)
        .with_rebalance_interval_ms(3_600_000);
    let scheduler = Arc::new(
        AgentScheduler::builder(config)
            .build(Arc::new(worker.clone()))
            .unwrap(),
    );

    let rounds = 20u64;
    let mut ids = Vec::new();
    for i in 0..rounds {
        let id = scheduler
            .submit(SubmitRequest::new(format!("race-{i}")).with_payload(b"x".to_vec()))
            .unwrap();
        let cancel_side = Arc::clone(&scheduler);
        let handle = std::thread::spawn(move || {
            // Either hits the queued task, the running task, or a terminal
            // one (invalid transition): all acceptable.
            let _ = cancel_side.cancel(id);
        });
        ids.push((id, handle));
    }

    for (id, handle) in ids {
        handle.join().unwrap();
        let state = scheduler
            .wait_timeout(id, Duration::from_secs(5))
            .unwrap()
            .expect("task must reach a terminal state");
        assert!(matches!(
            state,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        ));
        // Terminal states are absorbing: a second read agrees.
        assert_eq!(scheduler.task(id).unwrap().state, state);
    }
    let metrics = scheduler.metrics();
    assert_eq!(
        metrics.completed_tasks + metrics.cancelled_tasks + metrics.failed_tasks,
        rounds
    );
    scheduler.shutdown();
}

#[test]
fn test_live_count_decreases_on_terminal() {
    let worker = LifecycleWorker::new();
    worker.released.store(true, Ordering::Release);
    let scheduler = scheduler_with(&worker, 300_000, 3_600_000);

    let id = scheduler
        .submit(SubmitRequest::new("one").with_payload(b"p".to_vec()))
        .unwrap();
    scheduler.wait_timeout(id, Duration::from_secs(5)).unwrap();
    let metrics = scheduler.metrics();
    assert_eq!(metrics.active_tasks, 0);
    assert_eq!(metrics.queued_tasks, 0);
    assert_eq!(metrics.completed_tasks, 1);
    scheduler.shutdown();
}
