mod manager;

pub use manager::DockerManager;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("failed to pull image {image}: {reason}")]
    ImagePullFailed { image: String, reason: String },
    #[error("failed to create container: {0}")]
    CreateFailed(String),
    #[error("failed to start container after retries: {0}")]
    StartFailed(String),
    #[error("failed to stop container: {0}")]
    StopFailed(String),
    #[error("failed to remove container: {0}")]
    RemoveFailed(String),
    #[error("failed to inspect container: {0}")]
    InspectFailed(String),
}

/// Configuration for one container. The name doubles as the session
/// identifier so crashed sessions can be matched back to their containers.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// GPU selector: "all", a device index ("0", "1", ...) or a UUID.
    pub gpu_device: String,
    /// Password for the `ubuntu` user inside rental containers. Opaque to
    /// everything above the adapter; handed to the entrypoint via env.
    pub ssh_password: String,
    /// Host port bound to container port 22. `None` for workloads without
    /// SSH access (mining).
    pub ssh_port: Option<u16>,
    pub memory_bytes: i64,
    pub cpu_count: i64,
    /// Run the image's own entrypoint instead of the SSH bootstrap.
    pub use_image_entrypoint: bool,
    pub extra_env: HashMap<String, String>,
}

/// Snapshot of a container's runtime state, as reported by the daemon.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerStatus {
    pub container_id: String,
    /// "running", "exited", "dead", "created", ...
    pub state: String,
    /// "healthy", "unhealthy", "starting", or "" when the image defines no
    /// health check.
    pub health: String,
    pub ssh_host_port: Option<u16>,
}

/// Minimal lifecycle surface over the local container daemon. The rental
/// executor and mining supervisor only ever talk to this trait, so tests can
/// substitute a scripted runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pulls `image` only if it is not available locally.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Graceful stop with a bounded wait, then force-kill.
    async fn stop_container(&self, container_id: &str, timeout_s: i64) -> Result<(), RuntimeError>;

    /// Removes the container and its anonymous volumes. Removing a container
    /// that is already gone is not an error.
    async fn remove_container(&self, container_id: &str, force: bool) -> Result<(), RuntimeError>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus, RuntimeError>;
}
