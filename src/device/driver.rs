//! Device driver abstraction.
//!
//! The manager consumes compute devices through this trait; the real CUDA
//! binding lives outside the crate. [`InMemoryDriver`] simulates devices with
//! fixed memory capacities for tests and development.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Index of a device within the driver.
pub type DeviceId = usize;

/// Handle to one device memory allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocHandle {
    /// Device the memory lives on.
    pub device: DeviceId,
    /// Allocation size in bytes.
    pub bytes: u64,
    /// Driver-assigned token identifying the allocation.
    pub token: u64,
}

/// Handle to one execution stream on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    /// Device the stream belongs to.
    pub device: DeviceId,
    /// Driver-assigned token identifying the stream.
    pub token: u64,
}

/// Abstraction over the compute-device runtime.
///
/// Every operation is infallible except initialization, allocation, and
/// stream creation, which report a driver-specific reason. The manager maps
/// those onto device usability and placement refusal.
pub trait DeviceDriver: Send + Sync {
    /// Bring up one device. Called once per device index at manager
    /// initialization; an error marks that device unusable.
    ///
    /// # Errors
    /// Driver-specific reason the device cannot be used.
    fn init_device(&self, device: DeviceId) -> Result<(), String>;

    /// Bytes currently free on the device.
    fn query_free_memory(&self, device: DeviceId) -> u64;

    /// Reserve `bytes` on the device.
    ///
    /// # Errors
    /// Driver-specific reason the allocation failed (typically exhaustion).
    fn allocate(&self, device: DeviceId, bytes: u64) -> Result<AllocHandle, String>;

    /// Release an allocation.
    fn free(&self, handle: &AllocHandle);

    /// Create an execution stream on the device.
    ///
    /// # Errors
    /// Driver-specific reason the stream could not be created.
    fn create_stream(&self, device: DeviceId) -> Result<StreamHandle, String>;

    /// Destroy a stream.
    fn destroy_stream(&self, handle: &StreamHandle);
}

#[derive(Debug)]
struct SimDevice {
    total: u64,
    free: u64,
    broken: bool,
}

/// Simulated driver backed by plain counters.
#[derive(Debug)]
pub struct InMemoryDriver {
    devices: Mutex<Vec<SimDevice>>,
    next_token: AtomicU64,
}

impl InMemoryDriver {
    /// Driver with `n` devices of `bytes_per_device` capacity each.
    #[must_use]
    pub fn new(n: usize, bytes_per_device: u64) -> Self {
        Self {
            devices: Mutex::new(
                (0..n)
                    .map(|_| SimDevice {
                        total: bytes_per_device,
                        free: bytes_per_device,
                        broken: false,
                    })
                    .collect(),
            ),
            next_token: AtomicU64::new(1),
        }
    }

    /// Driver with explicit per-device capacities.
    #[must_use]
    pub fn with_capacities(capacities: &[u64]) -> Self {
        Self {
            devices: Mutex::new(
                capacities
                    .iter()
                    .map(|&total| SimDevice {
                        total,
                        free: total,
                        broken: false,
                    })
                    .collect(),
            ),
            next_token: AtomicU64::new(1),
        }
    }

    /// Mark a device as failing initialization, for failure-path tests.
    pub fn break_device(&self, device: DeviceId) {
        if let Some(d) = self.devices.lock().get_mut(device) {
            d.broken = true;
        }
    }

    fn token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }
}

impl DeviceDriver for InMemoryDriver {
    fn init_device(&self, device: DeviceId) -> Result<(), String> {
        let devices = self.devices.lock();
        match devices.get(device) {
            Some(d) if d.broken => Err(format!("device {device} failed to initialize")),
            Some(_) => Ok(()),
            None => Err(format!("device {device} does not exist")),
        }
    }

    fn query_free_memory(&self, device: DeviceId) -> u64 {
        self.devices.lock().get(device).map_or(0, |d| d.free)
    }

    fn allocate(&self, device: DeviceId, bytes: u64) -> Result<AllocHandle, String> {
        let mut devices = self.devices.lock();
        let Some(d) = devices.get_mut(device) else {
            return Err(format!("device {device} does not exist"));
        };
        if d.free < bytes {
            return Err(format!(
                "device {device} out of memory: requested {bytes}, free {}",
                d.free
            ));
        }
        d.free -= bytes;
        Ok(AllocHandle {
            device,
            bytes,
            token: self.token(),
        })
    }

    fn free(&self, handle: &AllocHandle) {
        let mut devices = self.devices.lock();
        if let Some(d) = devices.get_mut(handle.device) {
            d.free = (d.free + handle.bytes).min(d.total);
        }
    }

    fn create_stream(&self, device: DeviceId) -> Result<StreamHandle, String> {
        if self.devices.lock().get(device).is_none() {
            return Err(format!("device {device} does not exist"));
        }
        Ok(StreamHandle {
            device,
            token: self.token(),
        })
    }

    fn destroy_stream(&self, _handle: &StreamHandle) {}
}
