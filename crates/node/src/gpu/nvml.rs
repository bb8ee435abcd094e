use super::{GpuError, GpuProvider};
use lazy_static::lazy_static;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;
use shared::models::gpu::{GpuMetrics, GpuSpec};
use std::sync::Mutex;

// NVML is initialized once and shared; repeated Nvml::init calls are not
// cheap and the handle is not Sync by itself.
lazy_static! {
    static ref NVML: Mutex<Option<Nvml>> = Mutex::new(None);
}

const NVML_LIB_PATH: &str = "/usr/lib/x86_64-linux-gnu/libnvidia-ml.so.1";

/// [`GpuProvider`] backed by the NVIDIA management library.
#[derive(Debug, Default)]
pub struct NvmlProvider;

impl NvmlProvider {
    pub fn new() -> Self {
        Self
    }

    fn with_nvml<T>(
        &self,
        f: impl FnOnce(&Nvml) -> Result<T, GpuError>,
    ) -> Result<T, GpuError> {
        let guard = NVML.lock().unwrap();
        match guard.as_ref() {
            Some(nvml) => f(nvml),
            None => Err(GpuError::InitFailed("NVML not initialized".to_string())),
        }
    }
}

impl GpuProvider for NvmlProvider {
    fn init(&self) -> Result<(), GpuError> {
        let mut guard = NVML.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }

        let nvml = match Nvml::init() {
            Ok(nvml) => nvml,
            // Some distros only ship the versioned library name
            Err(_) => Nvml::builder()
                .lib_path(std::ffi::OsStr::new(NVML_LIB_PATH))
                .init()
                .map_err(|e| GpuError::InitFailed(e.to_string()))?,
        };

        *guard = Some(nvml);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), GpuError> {
        let mut guard = NVML.lock().unwrap();
        // Dropping the handle shuts the library down
        guard.take();
        Ok(())
    }

    fn device_count(&self) -> Result<usize, GpuError> {
        self.with_nvml(|nvml| {
            nvml.device_count()
                .map(|count| count as usize)
                .map_err(|e| GpuError::QueryFailed(e.to_string()))
        })
    }

    fn specs(&self) -> Result<Vec<GpuSpec>, GpuError> {
        self.with_nvml(|nvml| {
            let count = nvml
                .device_count()
                .map_err(|e| GpuError::QueryFailed(e.to_string()))?;

            let mut specs = Vec::with_capacity(count as usize);
            for i in 0..count {
                let device = match nvml.device_by_index(i) {
                    Ok(device) => device,
                    Err(e) => {
                        log::warn!("Failed to get device {i}: {e}");
                        continue;
                    }
                };

                specs.push(GpuSpec {
                    uuid: device.uuid().unwrap_or_else(|_| "GPU-UNKNOWN".to_string()),
                    name: device.name().unwrap_or_else(|_| "Unknown".to_string()),
                    memory_total_mb: device
                        .memory_info()
                        .map(|m| m.total / (1024 * 1024))
                        .unwrap_or(0),
                    driver_version: nvml
                        .sys_driver_version()
                        .unwrap_or_else(|_| "Unknown".to_string()),
                });
            }
            Ok(specs)
        })
    }

    fn metrics(&self) -> Result<Vec<GpuMetrics>, GpuError> {
        self.with_nvml(|nvml| {
            let count = nvml
                .device_count()
                .map_err(|e| GpuError::QueryFailed(e.to_string()))?;

            let mut metrics = Vec::with_capacity(count as usize);
            for i in 0..count {
                let device = match nvml.device_by_index(i) {
                    Ok(device) => device,
                    Err(_) => continue, // Skip failed device
                };

                let memory = device.memory_info().ok();
                let util = device.utilization_rates().ok();

                metrics.push(GpuMetrics {
                    uuid: device.uuid().unwrap_or_else(|_| "GPU-UNKNOWN".to_string()),
                    name: device.name().unwrap_or_else(|_| "Unknown".to_string()),
                    memory_total_mb: memory.as_ref().map(|m| m.total / (1024 * 1024)).unwrap_or(0),
                    memory_used_mb: memory.as_ref().map(|m| m.used / (1024 * 1024)).unwrap_or(0),
                    gpu_util_percent: util.as_ref().map(|u| u.gpu).unwrap_or(0),
                    memory_util_percent: util.as_ref().map(|u| u.memory).unwrap_or(0),
                    temperature_c: device.temperature(TemperatureSensor::Gpu).unwrap_or(0),
                });
            }
            Ok(metrics)
        })
    }
}
