//! Process-wide device manager: binds tasks to devices and streams, owns
//! device-scoped allocations, and rebalances placements.
//!
//! One manager instance is shared by every agent scheduler. It uses its own
//! lock; no call path holds it together with an agent's state lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::error::SchedulerError;
use crate::core::task::TaskId;
use crate::device::driver::{AllocHandle, DeviceDriver, DeviceId, StreamHandle};

/// A task's binding to a device and stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Device the task was placed on.
    pub device: DeviceId,
    /// Stream reserved for the task.
    pub stream: StreamHandle,
}

/// Point-in-time view of one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMetrics {
    /// Device index.
    pub id: DeviceId,
    /// False when initialization failed; unusable devices are never selected.
    pub usable: bool,
    /// Bytes currently free.
    pub free_memory: u64,
    /// Total bytes at initialization.
    pub total_memory: u64,
    /// `1 - free/total`.
    pub memory_utilization: f64,
    /// Streams currently bound to tasks.
    pub active_streams: usize,
    /// Stream pool size.
    pub stream_pool_size: usize,
    /// `active_streams / stream_pool_size`.
    pub compute_utilization: f64,
}

/// Point-in-time view of one placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementMetrics {
    /// Placed task.
    pub task: TaskId,
    /// Device it sits on.
    pub device: DeviceId,
    /// Model label the placement was requested with.
    pub model_name: String,
    /// Bytes reserved for the task.
    pub reserved_memory: u64,
    /// True once the dispatcher started the worker.
    pub running: bool,
}

#[derive(Debug)]
struct DeviceState {
    id: DeviceId,
    usable: bool,
    total_memory: u64,
    free_streams: Vec<StreamHandle>,
    pool_size: usize,
    active_streams: usize,
}

impl DeviceState {
    fn load(&self) -> f64 {
        if self.pool_size == 0 {
            1.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                self.active_streams as f64 / self.pool_size as f64
            }
        }
    }
}

#[derive(Debug)]
struct PlacementState {
    device: DeviceId,
    stream: StreamHandle,
    allocs: Vec<AllocHandle>,
    model_name: String,
    required_memory: u64,
    running: bool,
}

struct ManagerState {
    devices: Vec<DeviceState>,
    placements: HashMap<TaskId, PlacementState>,
}

/// Process-wide registry of devices and per-task placements.
pub struct DeviceManager {
    driver: Arc<dyn DeviceDriver>,
    state: Mutex<ManagerState>,
}

impl DeviceManager {
    /// Bring up `n_devices` devices, each with a pool of
    /// `streams_per_device` streams. A device whose initialization fails is
    /// marked unusable and skipped by selection; the manager itself never
    /// fails to construct.
    #[must_use]
    pub fn initialize(
        driver: Arc<dyn DeviceDriver>,
        n_devices: usize,
        streams_per_device: usize,
    ) -> Self {
        let mut devices = Vec::with_capacity(n_devices);
        for id in 0..n_devices {
            match driver.init_device(id) {
                Ok(()) => {
                    let mut free_streams = Vec::with_capacity(streams_per_device);
                    for _ in 0..streams_per_device {
                        match driver.create_stream(id) {
                            Ok(stream) => free_streams.push(stream),
                            Err(reason) => {
                                warn!(device = id, %reason, "stream creation failed");
                            }
                        }
                    }
                    let usable = !free_streams.is_empty();
                    let total_memory = driver.query_free_memory(id);
                    info!(device = id, total_memory, streams = free_streams.len(), "device initialized");
                    devices.push(DeviceState {
                        id,
                        usable,
                        total_memory,
                        pool_size: free_streams.len(),
                        free_streams,
                        active_streams: 0,
                    });
                }
                Err(reason) => {
                    warn!(device = id, %reason, "device initialization failed, marking unusable");
                    devices.push(DeviceState {
                        id,
                        usable: false,
                        total_memory: 0,
                        free_streams: Vec::new(),
                        pool_size: 0,
                        active_streams: 0,
                    });
                }
            }
        }
        Self {
            driver,
            state: Mutex::new(ManagerState {
                devices,
                placements: HashMap::new(),
            }),
        }
    }

    /// Pick the device for a task: among usable devices with enough free
    /// memory, the one with the lowest stream load, ties broken by lowest
    /// id.
    ///
    /// # Errors
    /// [`SchedulerError::NoCapacity`] when no device fits.
    pub fn select_device(
        &self,
        model_name: &str,
        required_memory: u64,
    ) -> Result<DeviceId, SchedulerError> {
        let state = self.state.lock();
        Self::select_locked(&self.driver, &state, required_memory).map_or_else(
            || {
                debug!(model_name, required_memory, "no device with sufficient memory");
                Err(SchedulerError::NoCapacity)
            },
            Ok,
        )
    }

    /// Bind a task to a device and stream, reserving `required_memory`.
    ///
    /// # Errors
    /// [`SchedulerError::NoCapacity`] when no device fits or no stream is
    /// free on the selected device.
    pub fn schedule(
        &self,
        task: TaskId,
        model_name: &str,
        required_memory: u64,
    ) -> Result<Placement, SchedulerError> {
        let mut state = self.state.lock();
        let device_id = Self::select_locked(&self.driver, &state, required_memory)
            .ok_or(SchedulerError::NoCapacity)?;

        let alloc = if required_memory > 0 {
            match self.driver.allocate(device_id, required_memory) {
                Ok(handle) => Some(handle),
                Err(reason) => {
                    debug!(device = device_id, %reason, "allocation failed at placement");
                    return Err(SchedulerError::NoCapacity);
                }
            }
        } else {
            None
        };

        let device = &mut state.devices[device_id];
        let Some(stream) = device.free_streams.pop() else {
            if let Some(handle) = alloc {
                self.driver.free(&handle);
            }
            return Err(SchedulerError::NoCapacity);
        };
        device.active_streams += 1;

        debug!(%task, device = device_id, required_memory, "task placed");
        state.placements.insert(
            task,
            PlacementState {
                device: device_id,
                stream: stream.clone(),
                allocs: alloc.into_iter().collect(),
                model_name: model_name.to_owned(),
                required_memory,
                running: false,
            },
        );
        Ok(Placement {
            device: device_id,
            stream,
        })
    }

    /// Reserve additional memory under an existing placement.
    ///
    /// # Errors
    /// [`SchedulerError::UnknownTask`] without a placement,
    /// [`SchedulerError::NoCapacity`] when the device cannot satisfy it.
    pub fn allocate_for(&self, task: TaskId, bytes: u64) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        let Some(placement) = state.placements.get_mut(&task) else {
            return Err(SchedulerError::UnknownTask(task));
        };
        match self.driver.allocate(placement.device, bytes) {
            Ok(handle) => {
                placement.allocs.push(handle);
                Ok(())
            }
            Err(_) => Err(SchedulerError::NoCapacity),
        }
    }

    /// Mark a placement as running. Running placements never migrate.
    pub fn mark_running(&self, task: TaskId) {
        if let Some(placement) = self.state.lock().placements.get_mut(&task) {
            placement.running = true;
        }
    }

    /// Free everything a task holds: allocations, its stream, and the
    /// binding itself. Unknown tasks are a no-op.
    pub fn release(&self, task: TaskId) {
        let mut state = self.state.lock();
        let Some(placement) = state.placements.remove(&task) else {
            return;
        };
        for handle in &placement.allocs {
            self.driver.free(handle);
        }
        let device = &mut state.devices[placement.device];
        device.active_streams = device.active_streams.saturating_sub(1);
        device.free_streams.push(placement.stream);
        debug!(%task, device = placement.device, "placement released");
    }

    /// Migrate queued (not yet running) placements off overloaded devices.
    ///
    /// A device is overloaded when its stream load exceeds 1.2x the mean
    /// across usable devices. Migration targets the least-loaded device that
    /// can fit the placement's memory. Idempotent and safe from a periodic
    /// tick. Returns the number of migrations performed.
    pub fn rebalance(&self) -> usize {
        let mut state = self.state.lock();
        let usable: Vec<DeviceId> = state
            .devices
            .iter()
            .filter(|d| d.usable)
            .map(|d| d.id)
            .collect();
        if usable.len() < 2 {
            return 0;
        }
        #[allow(clippy::cast_precision_loss)]
        let mean_load = usable
            .iter()
            .map(|&id| state.devices[id].load())
            .sum::<f64>()
            / usable.len() as f64;

        let overloaded: Vec<DeviceId> = usable
            .iter()
            .copied()
            .filter(|&id| state.devices[id].load() > 1.2 * mean_load)
            .collect();

        let mut moved = 0;
        for device_id in overloaded {
            let candidates: Vec<TaskId> = state
                .placements
                .iter()
                .filter(|(_, p)| p.device == device_id && !p.running)
                .map(|(&task, _)| task)
                .collect();
            for task in candidates {
                if self.migrate_locked(&mut state, task, device_id) {
                    moved += 1;
                }
            }
        }
        if moved > 0 {
            info!(moved, "rebalanced device placements");
        }
        moved
    }

    /// Snapshot every device.
    #[must_use]
    pub fn device_metrics(&self) -> Vec<DeviceMetrics> {
        let state = self.state.lock();
        state
            .devices
            .iter()
            .map(|d| {
                let free_memory = if d.usable {
                    self.driver.query_free_memory(d.id)
                } else {
                    0
                };
                #[allow(clippy::cast_precision_loss)]
                let memory_utilization = if d.total_memory == 0 {
                    0.0
                } else {
                    1.0 - free_memory as f64 / d.total_memory as f64
                };
                DeviceMetrics {
                    id: d.id,
                    usable: d.usable,
                    free_memory,
                    total_memory: d.total_memory,
                    memory_utilization,
                    active_streams: d.active_streams,
                    stream_pool_size: d.pool_size,
                    compute_utilization: d.load(),
                }
            })
            .collect()
    }

    /// Snapshot every placement, sorted by task id.
    #[must_use]
    pub fn active_placements(&self) -> Vec<PlacementMetrics> {
        let state = self.state.lock();
        let mut out: Vec<PlacementMetrics> = state
            .placements
            .iter()
            .map(|(&task, p)| PlacementMetrics {
                task,
                device: p.device,
                model_name: p.model_name.clone(),
                reserved_memory: p.required_memory,
                running: p.running,
            })
            .collect();
        out.sort_by_key(|p| p.task);
        out
    }

    fn select_locked(
        driver: &Arc<dyn DeviceDriver>,
        state: &ManagerState,
        required_memory: u64,
    ) -> Option<DeviceId> {
        state
            .devices
            .iter()
            .filter(|d| d.usable && !d.free_streams.is_empty())
            .filter(|d| driver.query_free_memory(d.id) >= required_memory)
            .min_by(|a, b| {
                a.load()
                    .partial_cmp(&b.load())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            })
            .map(|d| d.id)
    }

    fn migrate_locked(&self, state: &mut ManagerState, task: TaskId, from: DeviceId) -> bool {
        let required = state
            .placements
            .get(&task)
            .map_or(0, |p| p.required_memory);
        let target = state
            .devices
            .iter()
            .filter(|d| d.usable && d.id != from && !d.free_streams.is_empty())
            .filter(|d| self.driver.query_free_memory(d.id) >= required)
            .min_by(|a, b| {
                a.load()
                    .partial_cmp(&b.load())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            })
            .map(|d| d.id);
        let Some(target) = target else {
            return false;
        };
        // Only move when the target stays below the source afterwards;
        // otherwise migration just swaps the imbalance around.
        #[allow(clippy::cast_precision_loss)]
        let step = 1.0 / state.devices[target].pool_size.max(1) as f64;
        if state.devices[target].load() + step >= state.devices[from].load() {
            return false;
        }

        let new_alloc = if required > 0 {
            match self.driver.allocate(target, required) {
                Ok(handle) => Some(handle),
                Err(_) => return false,
            }
        } else {
            None
        };

        let Some(placement) = state.placements.get_mut(&task) else {
            if let Some(handle) = new_alloc {
                self.driver.free(&handle);
            }
            return false;
        };
        // Swap device-side resources: free old allocations, move the stream
        // back to the old pool, take one from the target pool.
        for handle in placement.allocs.drain(..) {
            self.driver.free(&handle);
        }
        if let Some(handle) = new_alloc {
            placement.allocs.push(handle);
        }
        let old_stream = placement.stream.clone();
        placement.device = target;

        let Some(new_stream) = state.devices[target].free_streams.pop() else {
            return false;
        };
        state.devices[target].active_streams += 1;
        if let Some(p) = state.placements.get_mut(&task) {
            p.stream = new_stream;
        }
        let old = &mut state.devices[from];
        old.active_streams = old.active_streams.saturating_sub(1);
        old.free_streams.push(old_stream);

        debug!(%task, from, to = target, "migrated placement");
        true
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let tasks: Vec<TaskId> = state.placements.keys().copied().collect();
        for task in tasks {
            if let Some(placement) = state.placements.remove(&task) {
                for handle in &placement.allocs {
                    self.driver.free(handle);
                }
                self.driver.destroy_stream(&placement.stream);
            }
        }
        for device in &mut state.devices {
            for stream in device.free_streams.drain(..) {
                self.driver.destroy_stream(&stream);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::driver::InMemoryDriver;

    fn manager(n: usize, mem: u64, streams: usize) -> (Arc<InMemoryDriver>, DeviceManager) {
        let driver = Arc::new(InMemoryDriver::new(n, mem));
        let manager = DeviceManager::initialize(driver.clone(), n, streams);
        (driver, manager)
    }

    #[test]
    fn test_select_prefers_lowest_load_then_lowest_id() {
        let (_driver, manager) = manager(2, 1000, 4);
        // Same load: lowest id wins.
        assert_eq!(manager.select_device("m", 100).unwrap(), 0);

        manager.schedule(TaskId::from_u64(1), "m", 100).unwrap();
        // Device 0 now has load 0.25; device 1 is idle.
        assert_eq!(manager.select_device("m", 100).unwrap(), 1);
    }

    #[test]
    fn test_no_capacity_when_memory_short() {
        let (_driver, manager) = manager(1, 100, 4);
        assert!(matches!(
            manager.select_device("m", 500),
            Err(SchedulerError::NoCapacity)
        ));
    }

    #[test]
    fn test_unusable_device_is_skipped() {
        let driver = Arc::new(InMemoryDriver::new(2, 1000));
        driver.break_device(0);
        let manager = DeviceManager::initialize(driver, 2, 4);

        assert_eq!(manager.select_device("m", 100).unwrap(), 1);
        let metrics = manager.device_metrics();
        assert!(!metrics[0].usable);
        assert!(metrics[1].usable);
    }

    #[test]
    fn test_schedule_and_release_round_trip() {
        let (driver, manager) = manager(1, 1000, 2);
        let t = TaskId::from_u64(5);
        let placement = manager.schedule(t, "llm-7b", 400).unwrap();
        assert_eq!(placement.device, 0);
        assert_eq!(driver.query_free_memory(0), 600);
        assert_eq!(manager.active_placements().len(), 1);

        manager.release(t);
        assert_eq!(driver.query_free_memory(0), 1000);
        assert!(manager.active_placements().is_empty());

        // Idempotent.
        manager.release(t);
        assert_eq!(driver.query_free_memory(0), 1000);
    }

    #[test]
    fn test_stream_pool_exhaustion_refuses() {
        let (_driver, manager) = manager(1, 10_000, 2);
        manager.schedule(TaskId::from_u64(1), "m", 10).unwrap();
        manager.schedule(TaskId::from_u64(2), "m", 10).unwrap();
        assert!(matches!(
            manager.schedule(TaskId::from_u64(3), "m", 10),
            Err(SchedulerError::NoCapacity)
        ));
    }

    #[test]
    fn test_rebalance_migrates_queued_only() {
        let (_driver, manager) = manager(2, 10_000, 4);
        // Fill both devices, then empty device 1 to skew the load.
        for i in 1..=6 {
            manager.schedule(TaskId::from_u64(i), "m", 10).unwrap();
        }
        let placements = manager.active_placements();
        for p in placements.iter().filter(|p| p.device == 1) {
            manager.release(p.task);
        }
        let on_zero: Vec<TaskId> = manager
            .active_placements()
            .iter()
            .map(|p| p.task)
            .collect();
        assert_eq!(on_zero.len(), 3);
        manager.mark_running(on_zero[0]);

        let moved = manager.rebalance();
        assert!(moved >= 1);
        // Running placements never move.
        let placements = manager.active_placements();
        let running = placements.iter().find(|p| p.running).unwrap();
        assert_eq!(running.device, 0);
        // Once balanced, another pass is a no-op.
        assert_eq!(manager.rebalance(), 0);
    }

    #[test]
    fn test_allocate_for_appends_to_placement() {
        let (driver, manager) = manager(1, 1000, 2);
        let t = TaskId::from_u64(9);
        manager.schedule(t, "m", 100).unwrap();
        manager.allocate_for(t, 200).unwrap();
        assert_eq!(driver.query_free_memory(0), 700);

        manager.release(t);
        assert_eq!(driver.query_free_memory(0), 1000);
    }

    #[test]
    fn test_allocate_for_unknown_task() {
        let (_driver, manager) = manager(1, 1000, 2);
        assert!(matches!(
            manager.allocate_for(TaskId::from_u64(42), 10),
            Err(SchedulerError::UnknownTask(_))
        ));
    }
}
