//! CPU inventory
//!
//! Logical core count comes from the standard library. Physical cores and
//! clock frequency are read from `/proc/cpuinfo` where it exists.

use std::collections::HashSet;

/// CPU inventory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuInfo {
    pub logical_cores: usize,
    pub physical_cores: Option<usize>,
    pub frequency_mhz: Option<f64>,
}

/// Reads the current CPU inventory
pub fn cpu_info() -> CpuInfo {
    let logical_cores = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);

    let (physical_cores, frequency_mhz) = match std::fs::read_to_string("/proc/cpuinfo") {
        Ok(text) => parse_cpuinfo(&text),
        Err(e) => {
            tracing::debug!("cpuinfo unavailable: {}", e);
            (None, None)
        }
    };

    CpuInfo {
        logical_cores,
        physical_cores,
        frequency_mhz,
    }
}

/// Extracts physical core count and mean clock from `/proc/cpuinfo` text
///
/// Physical cores are the distinct `(physical id, core id)` pairs.
fn parse_cpuinfo(text: &str) -> (Option<usize>, Option<f64>) {
    let mut cores = HashSet::new();
    let mut physical_id = String::new();
    let mut freqs = Vec::new();

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "physical id" => physical_id = value.to_string(),
            "core id" => {
                cores.insert((physical_id.clone(), value.to_string()));
            }
            "cpu MHz" => {
                if let Ok(mhz) = value.parse::<f64>() {
                    freqs.push(mhz);
                }
            }
            _ => {}
        }
    }

    let physical = (!cores.is_empty()).then_some(cores.len());
    let mhz = (!freqs.is_empty()).then(|| freqs.iter().sum::<f64>() / freqs.len() as f64);
    (physical, mhz)
}
