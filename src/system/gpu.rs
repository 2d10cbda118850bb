//! GPU detection
//!
//! Enumerates accelerators and queries their inventory. The system probe shells
//! out to `nvidia-smi`; [`FixedProbe`] reports a fixed inventory for headless
//! runs and tests.

use std::process::Command;

use crate::system::devices::{DeviceError, DeviceInfo};

/// Fields requested from `nvidia-smi --query-gpu`, in column order
const NVIDIA_SMI_QUERY: &str =
    "index,name,memory.total,memory.used,memory.reserved,compute_cap,driver_version";

/// Inventory of one accelerator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcceleratorInfo {
    pub index: u32,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub memory_reserved_mb: u64,
    pub compute_capability: String,
    pub driver_version: String,
}

impl AcceleratorInfo {
    pub fn to_fields(&self) -> DeviceInfo {
        let mut info = DeviceInfo::new();
        info.insert("index".to_string(), self.index.to_string());
        info.insert("name".to_string(), self.name.clone());
        info.insert("memory_total_mb".to_string(), self.memory_total_mb.to_string());
        info.insert("memory_allocated_mb".to_string(), self.memory_used_mb.to_string());
        info.insert("memory_reserved_mb".to_string(), self.memory_reserved_mb.to_string());
        info.insert("compute_capability".to_string(), self.compute_capability.clone());
        info.insert("driver_version".to_string(), self.driver_version.clone());
        info
    }
}

/// Hardware inventory seam used by the device manager
pub trait DeviceProbe: Send + Sync {
    /// Ordinals of the accelerators present on this machine
    fn accelerator_indices(&self) -> Vec<u32>;

    /// Live inventory for one accelerator
    fn describe_accelerator(&self, index: u32) -> Result<AcceleratorInfo, DeviceError>;
}

/// Probe backed by `nvidia-smi`
///
/// A missing binary or a failing driver means "no accelerators", never an error.
#[derive(Debug, Default)]
pub struct SystemProbe;

impl SystemProbe {
    fn query(&self) -> Result<Vec<AcceleratorInfo>, DeviceError> {
        let output = Command::new("nvidia-smi")
            .arg(format!("--query-gpu={}", NVIDIA_SMI_QUERY))
            .arg("--format=csv,noheader,nounits")
            .output()
            .map_err(|e| DeviceError::Query(format!("nvidia-smi unavailable: {}", e)))?;

        if !output.status.success() {
            return Err(DeviceError::Query(format!(
                "nvidia-smi exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(parse_gpu_query(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl DeviceProbe for SystemProbe {
    fn accelerator_indices(&self) -> Vec<u32> {
        match self.query() {
            Ok(gpus) => {
                tracing::info!("Found {} NVIDIA GPU(s)", gpus.len());
                gpus.into_iter().map(|gpu| gpu.index).collect()
            }
            Err(e) => {
                tracing::debug!("No accelerators detected: {}", e);
                Vec::new()
            }
        }
    }

    fn describe_accelerator(&self, index: u32) -> Result<AcceleratorInfo, DeviceError> {
        self.query()?
            .into_iter()
            .find(|gpu| gpu.index == index)
            .ok_or_else(|| DeviceError::Query(format!("GPU {} no longer reported", index)))
    }
}

/// Parses `nvidia-smi --format=csv,noheader,nounits` rows
///
/// Rows that do not carry a numeric index are skipped. Unreadable numeric
/// columns (`[N/A]`, `[Not Supported]`) read as 0.
pub fn parse_gpu_query(stdout: &str) -> Vec<AcceleratorInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split(',').map(str::trim).collect();
            let index = cols.first()?.parse::<u32>().ok()?;
            let col = |i: usize| cols.get(i).copied().unwrap_or_default();
            let mb = |i: usize| col(i).parse::<f64>().map(|v| v as u64).unwrap_or(0);

            Some(AcceleratorInfo {
                index,
                name: col(1).to_string(),
                memory_total_mb: mb(2),
                memory_used_mb: mb(3),
                memory_reserved_mb: mb(4),
                compute_capability: col(5).to_string(),
                driver_version: col(6).to_string(),
            })
        })
        .collect()
}

/// Probe reporting a fixed accelerator inventory
#[derive(Debug, Clone, Default)]
pub struct FixedProbe {
    accelerators: Vec<AcceleratorInfo>,
    fail_queries: bool,
}

impl FixedProbe {
    pub fn new(accelerators: Vec<AcceleratorInfo>) -> Self {
        Self {
            accelerators,
            fail_queries: false,
        }
    }

    pub fn cpu_only() -> Self {
        Self::default()
    }

    /// Makes every `describe_accelerator` call fail, as a broken driver would
    pub fn failing_queries(mut self) -> Self {
        self.fail_queries = true;
        self
    }
}

impl DeviceProbe for FixedProbe {
    fn accelerator_indices(&self) -> Vec<u32> {
        self.accelerators.iter().map(|gpu| gpu.index).collect()
    }

    fn describe_accelerator(&self, index: u32) -> Result<AcceleratorInfo, DeviceError> {
        if self.fail_queries {
            return Err(DeviceError::Query("driver query failed".to_string()));
        }
        self.accelerators
            .iter()
            .find(|gpu| gpu.index == index)
            .cloned()
            .ok_or_else(|| DeviceError::Query(format!("GPU {} not found", index)))
    }
}
