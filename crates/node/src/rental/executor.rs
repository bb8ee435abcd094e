use crate::docker::{ContainerRuntime, ContainerSpec, RuntimeError};
use crate::ports::{PortAllocator, PortError};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const STOP_TIMEOUT_SECONDS: i64 = 10;
const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, thiserror::Error)]
pub enum RentalError {
    #[error("session already has active rental")]
    SessionAlreadyActive,
    #[error("rental session not found")]
    SessionNotFound,
    #[error("no available ports in range")]
    NoPortsAvailable,
    #[error("container failed health check within timeout")]
    ContainerNotHealthy,
    #[error("container stopped during startup: state={0}")]
    ContainerStopped(String),
    #[error("rental start cancelled")]
    Cancelled,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl From<PortError> for RentalError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::NoPortsAvailable => RentalError::NoPortsAvailable,
            PortError::NotAllocated => RentalError::SessionNotFound,
        }
    }
}

/// Runtime state of one active rental.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RentalSession {
    pub session_id: String,
    pub container_id: String,
    pub ssh_port: u16,
    pub image: String,
    pub gpu_device: String,
    pub cpu_count: i64,
    pub memory_bytes: i64,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// SSH connection details handed back to the renter.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub command: String,
    pub container_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct StartRentalRequest {
    pub session_id: String,
    pub image: String,
    pub gpu_device: String,
    pub ssh_password: String,
    pub memory_bytes: i64,
    pub cpu_count: i64,
    /// Host address for the SSH command (e.g. "provider.example.com").
    pub host: String,
}

/// Owns the lifecycle of rental sessions end-to-end: port allocation,
/// container create/start, health gate, teardown with grace-period cleanup.
pub struct RentalExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    ports: Arc<PortAllocator>,
    sessions: Arc<Mutex<HashMap<String, RentalSession>>>,
    grace_period: Duration,
    health_timeout: Duration,
    health_interval: Duration,
}

impl RentalExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        ports: Arc<PortAllocator>,
        grace_period: Duration,
    ) -> Self {
        Self {
            runtime,
            ports,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            grace_period,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            health_interval: DEFAULT_HEALTH_INTERVAL,
        }
    }

    /// Overrides the health poll window. Tests shrink it to milliseconds.
    pub fn with_health_window(mut self, timeout: Duration, interval: Duration) -> Self {
        self.health_timeout = timeout;
        self.health_interval = interval;
        self
    }

    /// Allocates a port, creates and starts the container, waits for it to
    /// become healthy, and records the session. Any failure after the port
    /// allocation rolls back everything created so far.
    pub async fn start_rental(
        &self,
        cancel: &CancellationToken,
        req: StartRentalRequest,
    ) -> Result<ConnectionInfo, RentalError> {
        {
            let sessions = self.sessions.lock().unwrap();
            if sessions.contains_key(&req.session_id) {
                return Err(RentalError::SessionAlreadyActive);
            }
        }

        let ssh_port = self.ports.allocate(&req.session_id)?;

        let container_id = match self.provision(cancel, &req, ssh_port).await {
            Ok(container_id) => container_id,
            Err((created, err)) => {
                if let Some(container_id) = created {
                    if let Err(remove_err) =
                        self.runtime.remove_container(&container_id, true).await
                    {
                        warn!("Rollback removal of container {container_id} failed: {remove_err}");
                    }
                }
                if let Err(release_err) = self.ports.release(ssh_port) {
                    warn!("Rollback release of port {ssh_port} failed: {release_err}");
                }
                return Err(err);
            }
        };

        let session = RentalSession {
            session_id: req.session_id.clone(),
            container_id: container_id.clone(),
            ssh_port,
            image: req.image.clone(),
            gpu_device: req.gpu_device.clone(),
            cpu_count: req.cpu_count,
            memory_bytes: req.memory_bytes,
            started_at: Utc::now(),
            stopped_at: None,
        };

        {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.insert(req.session_id.clone(), session);
        }

        info!(
            "Rental started: session={} port={} container={}",
            req.session_id, ssh_port, container_id
        );

        Ok(ConnectionInfo {
            host: req.host.clone(),
            port: ssh_port,
            user: "ubuntu".to_string(),
            command: format!("ssh -p {ssh_port} ubuntu@{}", req.host),
            container_id,
        })
    }

    /// Create + start + health gate. On failure returns whatever container
    /// was created so the caller can roll it back.
    async fn provision(
        &self,
        cancel: &CancellationToken,
        req: &StartRentalRequest,
        ssh_port: u16,
    ) -> Result<String, (Option<String>, RentalError)> {
        let spec = ContainerSpec {
            name: req.session_id.clone(),
            image: req.image.clone(),
            gpu_device: req.gpu_device.clone(),
            ssh_password: req.ssh_password.clone(),
            ssh_port: Some(ssh_port),
            memory_bytes: req.memory_bytes,
            cpu_count: req.cpu_count,
            use_image_entrypoint: false,
            extra_env: HashMap::new(),
        };

        let container_id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| (None, RentalError::from(e)))?;

        if let Err(e) = self.runtime.start_container(&container_id).await {
            return Err((Some(container_id), RentalError::from(e)));
        }

        if let Err(e) = self.wait_for_health(cancel, &container_id).await {
            return Err((Some(container_id), e));
        }

        Ok(container_id)
    }

    /// Polls inspect until the container is running and healthy, stops
    /// early when it exits or dies, and gives up at the health timeout.
    async fn wait_for_health(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
    ) -> Result<(), RentalError> {
        let deadline = Instant::now() + self.health_timeout;

        loop {
            if Instant::now() >= deadline {
                return Err(RentalError::ContainerNotHealthy);
            }
            if cancel.is_cancelled() {
                return Err(RentalError::Cancelled);
            }

            let status = self.runtime.inspect(container_id).await?;

            match status.state.as_str() {
                "running" => match status.health.as_str() {
                    // No health check defined counts as healthy
                    "" | "healthy" => return Ok(()),
                    "unhealthy" => return Err(RentalError::ContainerNotHealthy),
                    _ => {} // still starting
                },
                "exited" | "dead" => {
                    return Err(RentalError::ContainerStopped(status.state));
                }
                _ => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(RentalError::Cancelled),
                _ = tokio::time::sleep(self.health_interval) => {}
            }
        }
    }

    /// Marks the session stopped and synchronously stops its container, then
    /// schedules removal of the container, release of the port, and erasure
    /// of the session entry after the grace period. Cleanup failures are
    /// logged, never returned.
    pub async fn stop_rental(&self, session_id: &str) -> Result<(), RentalError> {
        let (container_id, ssh_port) = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(session_id)
                .ok_or(RentalError::SessionNotFound)?;
            session.stopped_at = Some(Utc::now());
            (session.container_id.clone(), session.ssh_port)
        };

        let stop_result = self
            .runtime
            .stop_container(&container_id, STOP_TIMEOUT_SECONDS)
            .await;

        // Cleanup is scheduled whether or not the stop succeeded, so both
        // sides converge on "stopped" and the port is eventually reclaimed.
        self.schedule_cleanup(session_id.to_string(), container_id.clone(), ssh_port);

        if let Err(e) = stop_result {
            warn!("Failed to stop container {container_id}: {e}");
            return Err(e.into());
        }

        info!("Rental stopped: session={session_id}");
        Ok(())
    }

    fn schedule_cleanup(&self, session_id: String, container_id: String, ssh_port: u16) {
        let runtime = self.runtime.clone();
        let ports = self.ports.clone();
        let sessions = self.sessions.clone();
        let grace_period = self.grace_period;

        tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;

            if let Err(e) = runtime.remove_container(&container_id, true).await {
                error!("Grace-period removal of container {container_id} failed: {e}");
            }
            if let Err(e) = ports.release(ssh_port) {
                error!("Grace-period release of port {ssh_port} failed: {e}");
            }

            let mut sessions = sessions.lock().unwrap();
            sessions.remove(&session_id);
        });
    }

    /// Snapshot of one session. Returns a copy; internal state cannot be
    /// mutated through it.
    pub fn status(&self, session_id: &str) -> Result<RentalSession, RentalError> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(session_id)
            .cloned()
            .ok_or(RentalError::SessionNotFound)
    }

    pub fn list_active(&self) -> Vec<RentalSession> {
        let sessions = self.sessions.lock().unwrap();
        sessions.values().cloned().collect()
    }
}
