use serde::{Deserialize, Serialize};
use std::fmt;

/// Static GPU specification, fixed at discovery time. Used for node
/// registration and identity; never mutated afterwards.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct GpuSpec {
    pub uuid: String,
    pub name: String,
    pub memory_total_mb: u64,
    pub driver_version: String,
}

/// A single utilization sample for one GPU, as reported in heartbeats.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct GpuMetrics {
    pub uuid: String,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub gpu_util_percent: u32,
    pub memory_util_percent: u32,
    pub temperature_c: u32,
}

impl fmt::Display for GpuSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} MB, driver {})",
            self.name, self.memory_total_mb, self.driver_version
        )
    }
}

impl fmt::Display for GpuMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}% gpu, {}/{} MB, {}C",
            self.name,
            self.gpu_util_percent,
            self.memory_used_mb,
            self.memory_total_mb,
            self.temperature_c
        )
    }
}
