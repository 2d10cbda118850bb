//! Hardware discovery
//!
//! Device enumeration, selection and inventory queries.

pub mod devices;
pub mod gpu;
pub mod resources;

pub use devices::{Device, DeviceError, DeviceInfo, DeviceKind, DeviceManager};
pub use gpu::{AcceleratorInfo, DeviceProbe, FixedProbe, SystemProbe};
pub use resources::{cpu_info, CpuInfo};
