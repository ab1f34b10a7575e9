//! Device manager behavior under a shared process-wide instance: placement,
//! capacity exhaustion, unusable devices, and cross-agent sharing.

use async_trait::async_trait;
use dream_scheduler::config::{AgentConfig, AgentKind};
use dream_scheduler::core::{
    AgentScheduler, AgentWorker, ResourceKind, ResourceRequirement, SchedulerError, SubmitRequest,
    TaskContext, TaskId, TaskState,
};
use dream_scheduler::device::{DeviceManager, InMemoryDriver};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
struct EmbodiedWorker;

#[async_trait]
impl AgentWorker for EmbodiedWorker {
    fn kind(&self) -> AgentKind {
        AgentKind::Embodied
    }

    async fn execute(&self, payload: Vec<u8>, _ctx: TaskContext) -> Result<Vec<u8>, String> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(payload)
    }
}

#[derive(Clone)]
struct InterfaceWorker;

#[async_trait]
impl AgentWorker for InterfaceWorker {
    fn kind(&self) -> AgentKind {
        AgentKind::InterfaceLlm
    }

    async fn execute(&self, payload: Vec<u8>, _ctx: TaskContext) -> Result<Vec<u8>, String> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(payload)
    }
}

#[test]
fn test_direct_manager_placement_and_exhaustion() {
    let driver = Arc::new(InMemoryDriver::new(2, 1000));
    let manager = DeviceManager::initialize(driver, 2, 2);

    // Fill both devices' stream pools.
    for i in 1..=4 {
        manager
            .schedule(TaskId::from_u64(i), "llm-7b", 100)
            .expect("placement should fit");
    }
    assert!(matches!(
        manager.schedule(TaskId::from_u64(5), "llm-7b", 100),
        Err(SchedulerError::NoCapacity)
    ));

    // Releasing one placement frees a stream for the next task.
    manager.release(TaskId::from_u64(1));
    manager.schedule(TaskId::from_u64(5), "llm-7b", 100).unwrap();

    let metrics = manager.device_metrics();
    assert_eq!(metrics.len(), 2);
    assert!(metrics.iter().all(|m| m.usable));
    assert_eq!(
        metrics.iter().map(|m| m.active_streams).sum::<usize>(),
        4
    );
}

#[test]
fn test_unusable_device_does_not_fail_manager() {
    let driver = Arc::new(InMemoryDriver::new(3, 1000));
    driver.break_device(1);
    let manager = DeviceManager::initialize(driver, 3, 2);

    let metrics = manager.device_metrics();
    assert!(metrics[0].usable);
    assert!(!metrics[1].usable);
    assert!(metrics[2].usable);

    // Selection skips the unusable device even when it would tie on load.
    for i in 1..=4 {
        let placement = manager.schedule(TaskId::from_u64(i), "m", 10).unwrap();
        assert_ne!(placement.device, 1);
    }
}

#[test]
fn test_two_agents_share_one_manager() {
    let driver = Arc::new(InMemoryDriver::new(2, 1 << 20));
    let manager = Arc::new(DeviceManager::initialize(driver, 2, 8));

    let embodied = AgentScheduler::builder(
        AgentConfig::new(AgentKind::Embodied, "actuator")
            .with_worker_concurrency(2)
            .with_rebalance_interval_ms(3_600_000),
    )
    .devices(Arc::clone(&manager))
    .build(Arc::new(EmbodiedWorker))
    .unwrap();

    let interface = AgentScheduler::builder(
        AgentConfig::new(AgentKind::InterfaceLlm, "llm-7b")
            .with_worker_concurrency(2)
            .with_rebalance_interval_ms(3_600_000),
    )
    .devices(Arc::clone(&manager))
    .build(Arc::new(InterfaceWorker))
    .unwrap();

    let mut ids = Vec::new();
    for i in 0..8 {
        let req = vec![ResourceRequirement::new(ResourceKind::GpuMemory, 64)];
        ids.push((
            &embodied,
            embodied
                .submit(
                    SubmitRequest::new(format!("act-{i}"))
                        .with_payload(b"go".to_vec())
                        .with_requirements(req.clone()),
                )
                .unwrap(),
        ));
        ids.push((
            &interface,
            interface
                .submit(
                    SubmitRequest::new(format!("chat-{i}"))
                        .with_payload(b"hi".to_vec())
                        .with_requirements(req),
                )
                .unwrap(),
        ));
    }
    for (scheduler, id) in ids {
        assert_eq!(
            scheduler.wait_timeout(id, Duration::from_secs(10)).unwrap(),
            Some(TaskState::Completed)
        );
    }

    // Everything released: no placements left, all streams free.
    assert!(manager.active_placements().is_empty());
    let metrics = manager.device_metrics();
    assert_eq!(metrics.iter().map(|m| m.active_streams).sum::<usize>(), 0);

    embodied.shutdown();
    interface.shutdown();
}
