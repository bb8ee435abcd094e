mod mock;
mod nvml;

pub use mock::MockGpuProvider;
pub use nvml::NvmlProvider;

use shared::models::gpu::{GpuMetrics, GpuSpec};

#[derive(Debug, Clone, thiserror::Error)]
pub enum GpuError {
    #[error("GPU library initialization failed: {0}")]
    InitFailed(String),
    #[error("GPU query failed: {0}")]
    QueryFailed(String),
}

/// Abstracts GPU discovery and sampling so the daemon can run on hosts
/// without NVML (CPU nodes) and so tests can inject fixed data.
pub trait GpuProvider: Send + Sync {
    /// Brackets library use together with [`GpuProvider::shutdown`].
    fn init(&self) -> Result<(), GpuError>;

    fn shutdown(&self) -> Result<(), GpuError>;

    fn device_count(&self) -> Result<usize, GpuError>;

    /// Static specifications, stable across the daemon's lifetime.
    fn specs(&self) -> Result<Vec<GpuSpec>, GpuError>;

    /// Current utilization samples for all GPUs.
    fn metrics(&self) -> Result<Vec<GpuMetrics>, GpuError>;
}
