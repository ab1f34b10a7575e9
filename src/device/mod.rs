//! Device placement layer: driver abstraction and the process-wide manager.

pub mod driver;
pub mod manager;

pub use driver::{AllocHandle, DeviceDriver, DeviceId, InMemoryDriver, StreamHandle};
pub use manager::{DeviceManager, DeviceMetrics, Placement, PlacementMetrics};
