use super::MiningConfig;
use crate::docker::{ContainerRuntime, ContainerSpec, RuntimeError};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

const MINING_CONTAINER_NAME: &str = "worldland-mining";
const MINING_MEMORY_BYTES: i64 = 8 * 1024 * 1024 * 1024;
const MINING_CPU_COUNT: i64 = 2;
const MINING_STOP_TIMEOUT_SECONDS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MiningState {
    Stopped,
    Running,
    /// All GPUs are rented out; mining resumes when one is returned.
    Paused,
}

impl fmt::Display for MiningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiningState::Stopped => write!(f, "stopped"),
            MiningState::Running => write!(f, "running"),
            MiningState::Paused => write!(f, "paused"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MiningStatus {
    pub state: MiningState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub available_gpu_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
}

struct MiningInner {
    state: MiningState,
    container_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    paused_at: Option<DateTime<Utc>>,
    /// GPU UUIDs currently rented out. Pure bookkeeping, updated only by
    /// pause/resume; mining may use `configured \ rented`.
    rented_gpus: HashSet<String>,
}

/// Supervises at most one long-running mining container. Mines whenever a
/// GPU is idle, yields to rentals on demand, and restarts itself through the
/// monitor loop when the miner crashes.
///
/// All operations are serialized by one async mutex over the state; the lock
/// is intentionally held across the container runtime calls so start, stop
/// and pause can never interleave.
pub struct MiningSupervisor {
    runtime: Arc<dyn ContainerRuntime>,
    config: MiningConfig,
    inner: Mutex<MiningInner>,
}

impl MiningSupervisor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: MiningConfig) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            config,
            inner: Mutex::new(MiningInner {
                state: MiningState::Stopped,
                container_id: None,
                started_at: None,
                paused_at: None,
                rented_gpus: HashSet::new(),
            }),
        })
    }

    /// Starts the mining container on the first available GPU. No-op when
    /// already running; parks in `Paused` when every GPU is rented.
    pub async fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().await;

        if !self.config.enabled {
            info!("Mining disabled by configuration");
            return Ok(());
        }

        if inner.state == MiningState::Running {
            return Ok(());
        }

        let available = Self::available_gpus(&self.config, &inner.rented_gpus);
        if available.is_empty() {
            info!("No available GPUs for mining, pausing");
            inner.state = MiningState::Paused;
            inner.paused_at = Some(Utc::now());
            return Ok(());
        }

        // Single mining container on the first free GPU; multi-GPU mining is
        // not supported.
        let gpu_device = available[0].clone();

        let mut extra_env = HashMap::new();
        if !self.config.wallet_address.is_empty() {
            extra_env.insert(
                "MINING_WALLET".to_string(),
                self.config.wallet_address.clone(),
            );
        }

        let spec = ContainerSpec {
            name: MINING_CONTAINER_NAME.to_string(),
            image: self.config.image.clone(),
            gpu_device: gpu_device.clone(),
            ssh_password: String::new(),
            ssh_port: None,
            memory_bytes: MINING_MEMORY_BYTES,
            cpu_count: MINING_CPU_COUNT,
            use_image_entrypoint: true,
            extra_env,
        };

        let container_id = self.runtime.create_container(&spec).await?;

        if let Err(e) = self.runtime.start_container(&container_id).await {
            if let Err(remove_err) = self.runtime.remove_container(&container_id, true).await {
                warn!("Failed to remove partially created mining container: {remove_err}");
            }
            return Err(e);
        }

        info!(
            "Mining started: container={} gpu={} image={}",
            container_id, gpu_device, self.config.image
        );

        inner.container_id = Some(container_id);
        inner.state = MiningState::Running;
        inner.started_at = Some(Utc::now());
        inner.paused_at = None;

        Ok(())
    }

    /// Stops and removes the mining container. Best-effort: failures are
    /// logged and the state still transitions to `Stopped`.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;

        if inner.state == MiningState::Stopped {
            return;
        }

        if let Some(container_id) = inner.container_id.take() {
            if let Err(e) = self
                .runtime
                .stop_container(&container_id, MINING_STOP_TIMEOUT_SECONDS)
                .await
            {
                warn!("Failed to stop mining container: {e}");
            }
            if let Err(e) = self.runtime.remove_container(&container_id, true).await {
                warn!("Failed to remove mining container: {e}");
            }
            info!("Mining container stopped: {container_id}");
        }

        inner.state = MiningState::Stopped;
        inner.started_at = None;
        inner.paused_at = None;
    }

    /// Marks `gpus` as rented and gets the miner off them. If any GPU
    /// remains, mining restarts asynchronously on what is left; otherwise
    /// the supervisor parks in `Paused`.
    pub async fn pause_for_rental(self: &Arc<Self>, gpus: &[String]) {
        let mut inner = self.inner.lock().await;

        for gpu in gpus {
            inner.rented_gpus.insert(gpu.clone());
        }

        info!(
            "GPU(s) allocated for rental: {:?} (total rented: {})",
            gpus,
            inner.rented_gpus.len()
        );

        if inner.state != MiningState::Running {
            return;
        }

        if let Some(container_id) = inner.container_id.take() {
            if let Err(e) = self
                .runtime
                .stop_container(&container_id, MINING_STOP_TIMEOUT_SECONDS)
                .await
            {
                warn!("Failed to stop mining for rental: {e}");
            }
            if let Err(e) = self.runtime.remove_container(&container_id, true).await {
                warn!("Failed to remove mining container for rental: {e}");
            }
        }

        let available = Self::available_gpus(&self.config, &inner.rented_gpus);
        if available.is_empty() {
            inner.state = MiningState::Paused;
            inner.paused_at = Some(Utc::now());
            info!("Mining paused: all GPUs allocated for rentals");
            return;
        }

        inner.state = MiningState::Stopped;

        // The restart must not run under our lock: start() takes it too.
        drop(inner);
        let supervisor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = supervisor.start().await {
                warn!("Failed to restart mining with remaining GPUs: {e}");
            }
        });
    }

    /// Returns `gpus` from rental bookkeeping and restarts mining if it was
    /// parked. Already running: nothing to do.
    pub async fn resume_after_rental(self: &Arc<Self>, gpus: &[String]) {
        let should_start = {
            let mut inner = self.inner.lock().await;

            for gpu in gpus {
                inner.rented_gpus.remove(gpu);
            }

            info!(
                "GPU(s) returned from rental: {:?} (remaining rented: {})",
                gpus,
                inner.rented_gpus.len()
            );

            matches!(inner.state, MiningState::Paused | MiningState::Stopped)
        };

        if should_start {
            if let Err(e) = self.start().await {
                warn!("Failed to resume mining after rental: {e}");
            }
        }
    }

    pub async fn status(&self) -> MiningStatus {
        let inner = self.inner.lock().await;
        MiningStatus {
            state: inner.state,
            container_id: inner.container_id.clone(),
            available_gpu_count: Self::available_gpus(&self.config, &inner.rented_gpus).len(),
            started_at: inner.started_at,
            paused_at: inner.paused_at,
        }
    }

    /// Watches the mining container and restarts it when it dies. This is
    /// the only crash-recovery path; runs until the token is cancelled.
    pub async fn monitor_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.monitor_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Mining monitor received cancellation signal");
                    return;
                }
                _ = ticker.tick() => {
                    let crashed = {
                        let mut inner = self.inner.lock().await;
                        match (&inner.state, inner.container_id.clone()) {
                            (MiningState::Running, Some(container_id)) => {
                                let alive = match self.runtime.inspect(&container_id).await {
                                    Ok(status) => status.state == "running",
                                    Err(_) => false,
                                };
                                if !alive {
                                    inner.container_id = None;
                                    inner.state = MiningState::Stopped;
                                }
                                !alive
                            }
                            _ => false,
                        }
                    };

                    if crashed {
                        warn!("Mining container died, restarting...");
                        if let Err(e) = self.start().await {
                            warn!("Failed to restart mining: {e}");
                        }
                    }
                }
            }
        }
    }

    fn available_gpus(config: &MiningConfig, rented: &HashSet<String>) -> Vec<String> {
        if config.gpu_device_ids.is_empty() {
            // No explicit GPU list: mining takes the whole host unless
            // anything at all is rented.
            if rented.is_empty() {
                return vec!["all".to_string()];
            }
            return Vec::new();
        }

        config
            .gpu_device_ids
            .iter()
            .filter(|gpu| !rented.contains(*gpu))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::testing::MockRuntime;
    use crate::docker::ContainerStatus;
    use std::time::Duration;

    fn two_gpu_config() -> MiningConfig {
        MiningConfig {
            gpu_device_ids: vec!["GPU-0".to_string(), "GPU-1".to_string()],
            monitor_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn supervisor_with(
        runtime: MockRuntime,
        config: MiningConfig,
    ) -> (Arc<MiningSupervisor>, Arc<MockRuntime>) {
        let runtime = Arc::new(runtime);
        let supervisor = MiningSupervisor::new(runtime.clone(), config);
        (supervisor, runtime)
    }

    #[tokio::test]
    async fn test_start_runs_container_on_first_available_gpu() {
        let (supervisor, mock) = supervisor_with(MockRuntime::new(), two_gpu_config());

        supervisor.start().await.unwrap();

        let status = supervisor.status().await;
        assert_eq!(status.state, MiningState::Running);
        assert!(status.container_id.is_some());
        assert!(status.started_at.is_some());

        let calls = mock.calls.lock().unwrap();
        assert_eq!(calls.create.len(), 1);
        assert_eq!(calls.create[0].name, "worldland-mining");
        assert_eq!(calls.create[0].gpu_device, "GPU-0");
        assert!(calls.create[0].use_image_entrypoint);
        assert_eq!(calls.create[0].ssh_port, None);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_when_running() {
        let (supervisor, mock) = supervisor_with(MockRuntime::new(), two_gpu_config());

        supervisor.start().await.unwrap();
        supervisor.start().await.unwrap();

        assert_eq!(mock.calls.lock().unwrap().create.len(), 1);
    }

    #[tokio::test]
    async fn test_start_pauses_when_all_gpus_rented() {
        let (supervisor, mock) = supervisor_with(MockRuntime::new(), two_gpu_config());

        supervisor
            .pause_for_rental(&["GPU-0".to_string(), "GPU-1".to_string()])
            .await;
        supervisor.start().await.unwrap();

        let status = supervisor.status().await;
        assert_eq!(status.state, MiningState::Paused);
        assert!(status.paused_at.is_some());
        assert_eq!(status.available_gpu_count, 0);
        assert!(mock.calls.lock().unwrap().create.is_empty());
    }

    #[tokio::test]
    async fn test_start_does_nothing_when_disabled() {
        let config = MiningConfig {
            enabled: false,
            ..two_gpu_config()
        };
        let (supervisor, mock) = supervisor_with(MockRuntime::new(), config);

        supervisor.start().await.unwrap();

        assert_eq!(supervisor.status().await.state, MiningState::Stopped);
        assert!(mock.calls.lock().unwrap().create.is_empty());
    }

    #[tokio::test]
    async fn test_start_cleans_up_on_start_failure() {
        let mut runtime = MockRuntime::new();
        runtime.start_fn = Some(Box::new(|_| {
            Err(RuntimeError::StartFailed("start failed".to_string()))
        }));
        let (supervisor, mock) = supervisor_with(runtime, two_gpu_config());

        let result = supervisor.start().await;
        assert!(result.is_err());

        assert_eq!(mock.calls.lock().unwrap().remove, vec!["container-123"]);
        assert_eq!(supervisor.status().await.state, MiningState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_removes_container() {
        let (supervisor, mock) = supervisor_with(MockRuntime::new(), two_gpu_config());

        supervisor.start().await.unwrap();
        supervisor.stop().await;

        let status = supervisor.status().await;
        assert_eq!(status.state, MiningState::Stopped);
        assert!(status.container_id.is_none());

        let calls = mock.calls.lock().unwrap();
        assert_eq!(calls.stop, vec!["container-123"]);
        assert_eq!(calls.remove, vec!["container-123"]);
    }

    #[tokio::test]
    async fn test_pause_for_rental_moves_miner_to_remaining_gpu() {
        let (supervisor, mock) = supervisor_with(MockRuntime::new(), two_gpu_config());

        supervisor.start().await.unwrap();
        supervisor.pause_for_rental(&["GPU-0".to_string()]).await;

        // Old miner is gone immediately
        {
            let calls = mock.calls.lock().unwrap();
            assert_eq!(calls.stop, vec!["container-123"]);
            assert_eq!(calls.remove, vec!["container-123"]);
        }

        // Restart happens in the background on the remaining GPU
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = supervisor.status().await;
        assert_eq!(status.state, MiningState::Running);
        let calls = mock.calls.lock().unwrap();
        assert_eq!(calls.create.len(), 2);
        assert_eq!(calls.create[1].gpu_device, "GPU-1");
    }

    #[tokio::test]
    async fn test_pause_for_rental_all_gpus_sets_paused() {
        let (supervisor, mock) = supervisor_with(MockRuntime::new(), two_gpu_config());

        supervisor.start().await.unwrap();
        supervisor
            .pause_for_rental(&["GPU-0".to_string(), "GPU-1".to_string()])
            .await;

        let status = supervisor.status().await;
        assert_eq!(status.state, MiningState::Paused);
        assert!(status.paused_at.is_some());
        assert_eq!(mock.calls.lock().unwrap().create.len(), 1);
    }

    #[tokio::test]
    async fn test_resume_after_rental_restarts_paused_miner() {
        let (supervisor, mock) = supervisor_with(MockRuntime::new(), two_gpu_config());

        supervisor.start().await.unwrap();
        supervisor
            .pause_for_rental(&["GPU-0".to_string(), "GPU-1".to_string()])
            .await;
        supervisor.resume_after_rental(&["GPU-0".to_string()]).await;

        let status = supervisor.status().await;
        assert_eq!(status.state, MiningState::Running);
        let calls = mock.calls.lock().unwrap();
        assert_eq!(calls.create.len(), 2);
        assert_eq!(calls.create[1].gpu_device, "GPU-0");
    }

    #[tokio::test]
    async fn test_resume_after_rental_noop_when_running() {
        let (supervisor, mock) = supervisor_with(MockRuntime::new(), two_gpu_config());

        supervisor.start().await.unwrap();
        supervisor.resume_after_rental(&[]).await;

        assert_eq!(mock.calls.lock().unwrap().create.len(), 1);
    }

    #[tokio::test]
    async fn test_default_config_rents_whole_host() {
        let (supervisor, _) = supervisor_with(MockRuntime::new(), MiningConfig::default());

        assert_eq!(supervisor.status().await.available_gpu_count, 1); // "all"

        supervisor.pause_for_rental(&["GPU-0".to_string()]).await;
        assert_eq!(supervisor.status().await.available_gpu_count, 0);

        supervisor.resume_after_rental(&["GPU-0".to_string()]).await;
        assert_eq!(supervisor.status().await.available_gpu_count, 1);
    }

    #[tokio::test]
    async fn test_monitor_restarts_crashed_miner() {
        let mut runtime = MockRuntime::new();
        runtime.inspect_fn = Some(Box::new(|container_id| {
            Ok(ContainerStatus {
                container_id: container_id.to_string(),
                state: "exited".to_string(),
                health: String::new(),
                ssh_host_port: None,
            })
        }));
        let (supervisor, mock) = supervisor_with(runtime, two_gpu_config());

        supervisor.start().await.unwrap();

        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(supervisor.clone().monitor_loop(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let _ = monitor.await;

        // The inspect-always-exited script forces at least one restart
        assert!(mock.calls.lock().unwrap().create.len() >= 2);
    }
}
