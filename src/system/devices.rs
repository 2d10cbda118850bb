//! Compute device discovery and selection
//!
//! The device list is enumerated once when the [`DeviceManager`] is built and
//! never changes afterwards. Selecting a device only updates the manager's own
//! state; moving a loaded model is the generation service's job.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::system::gpu::DeviceProbe;
use crate::system::resources::cpu_info;

/// Errors raised by device discovery and selection
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Device '{id}' is not available. Available devices: {available}")]
    InvalidDevice { id: String, available: String },

    #[error("No device selected")]
    NoDeviceSelected,

    #[error("Malformed device identifier: {0}")]
    Parse(String),

    #[error("Device query failed: {0}")]
    Query(String),
}

/// Broad class of a compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Accelerator,
}

/// A compute device a model can be placed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    Cpu,
    Accelerator(u32),
}

impl Device {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::Cpu => DeviceKind::Cpu,
            Device::Accelerator(_) => DeviceKind::Accelerator,
        }
    }

    /// Accelerator ordinal, `None` for the CPU
    pub fn index(&self) -> Option<u32> {
        match self {
            Device::Cpu => None,
            Device::Accelerator(index) => Some(*index),
        }
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(index) => write!(f, "cuda:{}", index),
        }
    }
}

impl FromStr for Device {
    type Err = DeviceError;

    /// Accepts `cpu`, `cuda:N` and `gpu:N` (case-insensitive)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.trim().to_ascii_lowercase();
        if id == "cpu" {
            return Ok(Device::Cpu);
        }

        let index = id
            .strip_prefix("cuda:")
            .or_else(|| id.strip_prefix("gpu:"))
            .ok_or_else(|| DeviceError::Parse(s.to_string()))?;

        index
            .parse::<u32>()
            .map(Device::Accelerator)
            .map_err(|_| DeviceError::Parse(s.to_string()))
    }
}

impl TryFrom<String> for Device {
    type Error = DeviceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// Informational key/value fields describing one device
pub type DeviceInfo = BTreeMap<String, String>;

/// Single source of truth for the available devices and the selected one
pub struct DeviceManager {
    devices: Vec<Device>,
    current: Option<Device>,
    probe: Box<dyn DeviceProbe>,
}

impl DeviceManager {
    /// Enumerates devices through `probe`. The CPU is always present and always last.
    pub fn new(probe: Box<dyn DeviceProbe>) -> Self {
        let mut indices = probe.accelerator_indices();
        indices.sort_unstable();
        indices.dedup();

        let mut devices: Vec<Device> = indices.into_iter().map(Device::Accelerator).collect();
        devices.push(Device::Cpu);

        tracing::info!(
            "Discovered {} device(s): {}",
            devices.len(),
            join_devices(&devices)
        );

        Self {
            devices,
            current: None,
            probe,
        }
    }

    /// Devices discovered at construction, accelerators first then CPU
    pub fn list_devices(&self) -> &[Device] {
        &self.devices
    }

    /// Selects the device named by `id`
    ///
    /// Fails with [`DeviceError::InvalidDevice`] when the identifier does not name
    /// a discovered device; the previous selection is kept in that case.
    pub fn select(&mut self, id: &str) -> Result<Device, DeviceError> {
        let invalid = || DeviceError::InvalidDevice {
            id: id.to_string(),
            available: join_devices(&self.devices),
        };

        let device: Device = id.parse().map_err(|_| invalid())?;
        if !self.devices.contains(&device) {
            return Err(invalid());
        }

        self.current = Some(device);
        tracing::info!("Selected device {}", device);
        Ok(device)
    }

    /// The selected device
    pub fn current(&self) -> Result<Device, DeviceError> {
        self.current.ok_or(DeviceError::NoDeviceSelected)
    }

    /// Reports informational fields for `device`
    ///
    /// Driver or OS query failures are returned to the caller and never touch the selection.
    pub fn describe(&self, device: &Device) -> Result<DeviceInfo, DeviceError> {
        match device {
            Device::Cpu => {
                let cpu = cpu_info();
                let mut info = DeviceInfo::new();
                info.insert("name".to_string(), "CPU".to_string());
                info.insert("logical_cores".to_string(), cpu.logical_cores.to_string());
                info.insert(
                    "physical_cores".to_string(),
                    cpu.physical_cores
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                );
                info.insert(
                    "frequency_mhz".to_string(),
                    cpu.frequency_mhz
                        .map(|mhz| format!("{:.0}", mhz))
                        .unwrap_or_else(|| "unknown".to_string()),
                );
                Ok(info)
            }
            Device::Accelerator(index) => {
                if !self.devices.contains(device) {
                    return Err(DeviceError::InvalidDevice {
                        id: device.to_string(),
                        available: join_devices(&self.devices),
                    });
                }
                self.probe.describe_accelerator(*index).map(|gpu| gpu.to_fields())
            }
        }
    }
}

fn join_devices(devices: &[Device]) -> String {
    devices
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::gpu::{AcceleratorInfo, FixedProbe};

    fn gpu(index: u32) -> AcceleratorInfo {
        AcceleratorInfo {
            index,
            name: format!("Test GPU {}", index),
            memory_total_mb: 8192,
            memory_used_mb: 512,
            memory_reserved_mb: 128,
            compute_capability: "8.6".to_string(),
            driver_version: "550.54".to_string(),
        }
    }

    #[test]
    fn test_cpu_only_machine() {
        let manager = DeviceManager::new(Box::new(FixedProbe::cpu_only()));
        assert_eq!(manager.list_devices(), &[Device::Cpu]);
    }

    #[test]
    fn test_accelerators_sorted_cpu_last() {
        let manager = DeviceManager::new(Box::new(FixedProbe::new(vec![gpu(1), gpu(0)])));
        assert_eq!(
            manager.list_devices(),
            &[Device::Accelerator(0), Device::Accelerator(1), Device::Cpu]
        );
    }

    #[test]
    fn test_select_then_current_round_trips() {
        let mut manager = DeviceManager::new(Box::new(FixedProbe::new(vec![gpu(0), gpu(1)])));
        for device in manager.list_devices().to_vec() {
            let selected = manager.select(&device.to_string()).unwrap();
            assert_eq!(selected, device);
            assert_eq!(manager.current().unwrap(), device);
        }
    }

    #[test]
    fn test_current_before_select() {
        let manager = DeviceManager::new(Box::new(FixedProbe::cpu_only()));
        assert_eq!(manager.current(), Err(DeviceError::NoDeviceSelected));
    }

    #[test]
    fn test_invalid_select_keeps_current() {
        let mut manager = DeviceManager::new(Box::new(FixedProbe::cpu_only()));
        manager.select("cpu").unwrap();

        for bad in ["cuda:0", "gpu:3", "tpu", ""] {
            let err = manager.select(bad).unwrap_err();
            assert!(matches!(err, DeviceError::InvalidDevice { .. }), "{bad}");
            assert_eq!(manager.current().unwrap(), Device::Cpu);
        }
    }

    #[test]
    fn test_invalid_select_before_any_selection() {
        let mut manager = DeviceManager::new(Box::new(FixedProbe::cpu_only()));
        assert!(manager.select("cuda:1").is_err());
        assert_eq!(manager.current(), Err(DeviceError::NoDeviceSelected));
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!(" CUDA:2 ".parse::<Device>().unwrap(), Device::Accelerator(2));
        assert_eq!("gpu:0".parse::<Device>().unwrap(), Device::Accelerator(0));
        assert!("cuda:".parse::<Device>().is_err());
        assert!("cuda:-1".parse::<Device>().is_err());
        assert_eq!(Device::Accelerator(3).to_string(), "cuda:3");
    }

    #[test]
    fn test_device_serde_uses_identifier() {
        let json = serde_json::to_string(&Device::Accelerator(1)).unwrap();
        assert_eq!(json, "\"cuda:1\"");
        let device: Device = serde_json::from_str("\"cpu\"").unwrap();
        assert_eq!(device, Device::Cpu);
    }

    #[test]
    fn test_describe_cpu() {
        let manager = DeviceManager::new(Box::new(FixedProbe::cpu_only()));
        let info = manager.describe(&Device::Cpu).unwrap();
        assert_eq!(info["name"], "CPU");
        assert!(info["logical_cores"].parse::<usize>().unwrap() >= 1);
        assert!(info.contains_key("physical_cores"));
        assert!(info.contains_key("frequency_mhz"));
    }

    #[test]
    fn test_describe_accelerator() {
        let manager = DeviceManager::new(Box::new(FixedProbe::new(vec![gpu(0)])));
        let info = manager.describe(&Device::Accelerator(0)).unwrap();
        assert_eq!(info["name"], "Test GPU 0");
        assert_eq!(info["memory_total_mb"], "8192");
        assert_eq!(info["memory_allocated_mb"], "512");
        assert_eq!(info["memory_reserved_mb"], "128");
        assert_eq!(info["compute_capability"], "8.6");
    }

    #[test]
    fn test_describe_failure_does_not_touch_selection() {
        let mut manager =
            DeviceManager::new(Box::new(FixedProbe::new(vec![gpu(0)]).failing_queries()));
        manager.select("cuda:0").unwrap();

        let err = manager.describe(&Device::Accelerator(0)).unwrap_err();
        assert!(matches!(err, DeviceError::Query(_)));
        assert_eq!(manager.current().unwrap(), Device::Accelerator(0));
    }
}
