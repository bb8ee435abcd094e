use super::{GpuError, GpuProvider};
use shared::models::gpu::{GpuMetrics, GpuSpec};

/// Fixed-data [`GpuProvider`] used for CPU nodes and in tests.
#[derive(Debug, Clone, Default)]
pub struct MockGpuProvider {
    specs: Vec<GpuSpec>,
    metrics: Vec<GpuMetrics>,
}

impl MockGpuProvider {
    pub fn new(specs: Vec<GpuSpec>, metrics: Vec<GpuMetrics>) -> Self {
        Self { specs, metrics }
    }

    /// Synthetic zero-GPU provider for hosts without NVML. Such nodes
    /// register as CPU nodes and never mine.
    pub fn cpu_node() -> Self {
        Self {
            specs: vec![GpuSpec {
                uuid: "cpu-node".to_string(),
                name: "CPU Only".to_string(),
                memory_total_mb: 0,
                driver_version: "N/A".to_string(),
            }],
            metrics: vec![GpuMetrics {
                uuid: "cpu-node".to_string(),
                name: "CPU Only".to_string(),
                memory_total_mb: 0,
                memory_used_mb: 0,
                gpu_util_percent: 0,
                memory_util_percent: 0,
                temperature_c: 0,
            }],
        }
    }
}

impl GpuProvider for MockGpuProvider {
    fn init(&self) -> Result<(), GpuError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), GpuError> {
        Ok(())
    }

    fn device_count(&self) -> Result<usize, GpuError> {
        Ok(self.specs.len())
    }

    fn specs(&self) -> Result<Vec<GpuSpec>, GpuError> {
        Ok(self.specs.clone())
    }

    fn metrics(&self) -> Result<Vec<GpuMetrics>, GpuError> {
        Ok(self.metrics.clone())
    }
}
