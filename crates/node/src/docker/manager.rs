use super::{ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerStateStatusEnum, HealthStatusEnum, HostConfig, PortBinding, PortMap,
};
use bollard::Docker;
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const START_BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const START_BACKOFF_CAP: Duration = Duration::from_secs(10);
const START_ELAPSED_CAP: Duration = Duration::from_secs(30);

/// Entrypoint injected into rental containers. Installs and runs an SSH
/// daemon inside any base image (CUDA, PyTorch, TensorFlow, ...) and creates
/// the `ubuntu` user with the password supplied via environment.
const SSH_SETUP_SCRIPT: &str = r#"set -e
export DEBIAN_FRONTEND=noninteractive
apt-get update -qq
apt-get install -y -qq openssh-server sudo > /dev/null 2>&1

useradd -m -s /bin/bash "$USER_NAME" 2>/dev/null || true
echo "$USER_NAME:$SSH_PASSWORD" | chpasswd
echo "$USER_NAME ALL=(ALL) NOPASSWD:ALL" >> /etc/sudoers

mkdir -p /run/sshd
sed -i 's/#PasswordAuthentication yes/PasswordAuthentication yes/' /etc/ssh/sshd_config
sed -i 's/PasswordAuthentication no/PasswordAuthentication yes/' /etc/ssh/sshd_config
sed -i 's/#PermitRootLogin.*/PermitRootLogin no/' /etc/ssh/sshd_config

echo "SSH server ready on port 22"
exec /usr/sbin/sshd -D
"#;

/// [`ContainerRuntime`] implementation over the local Docker daemon.
pub struct DockerManager {
    docker: Docker,
    pull_timeout: Duration,
}

impl DockerManager {
    pub fn new(pull_timeout: Duration) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_unix_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        Ok(Self {
            docker,
            pull_timeout,
        })
    }

    fn map_unavailable(err: &DockerError) -> Option<RuntimeError> {
        match err {
            DockerError::HyperResponseError { .. }
            | DockerError::IOError { .. }
            | DockerError::RequestTimeoutError => Some(RuntimeError::Unavailable(err.to_string())),
            _ => None,
        }
    }
}

/// Coerces the Hub-supplied GPU selector into a form the local runtime
/// accepts. UUIDs are rejected by runtimes in CDI mode, so they fall back to
/// `all`; single-GPU hosts rely on this. Indices pass through unchanged.
pub(crate) fn resolve_gpu_device(gpu_device: &str) -> String {
    if gpu_device.is_empty() || gpu_device == "all" || is_gpu_uuid(gpu_device) {
        "all".to_string()
    } else {
        gpu_device.to_string()
    }
}

fn is_gpu_uuid(s: &str) -> bool {
    s.starts_with("GPU-") || s.starts_with("MIG-")
}

pub(crate) fn container_env(spec: &ContainerSpec) -> Vec<String> {
    let gpu_device = resolve_gpu_device(&spec.gpu_device);
    let mut env = vec![
        format!("NVIDIA_VISIBLE_DEVICES={gpu_device}"),
        "NVIDIA_DRIVER_CAPABILITIES=all".to_string(),
    ];

    if !spec.use_image_entrypoint {
        env.push(format!("SSH_PASSWORD={}", spec.ssh_password));
        env.push("USER_NAME=ubuntu".to_string());
    }

    for (key, value) in &spec.extra_env {
        env.push(format!("{key}={value}"));
    }

    env
}

fn state_to_str(state: Option<ContainerStateStatusEnum>) -> String {
    match state {
        Some(ContainerStateStatusEnum::CREATED) => "created",
        Some(ContainerStateStatusEnum::RUNNING) => "running",
        Some(ContainerStateStatusEnum::PAUSED) => "paused",
        Some(ContainerStateStatusEnum::RESTARTING) => "restarting",
        Some(ContainerStateStatusEnum::REMOVING) => "removing",
        Some(ContainerStateStatusEnum::EXITED) => "exited",
        Some(ContainerStateStatusEnum::DEAD) => "dead",
        _ => "",
    }
    .to_string()
}

fn health_to_str(health: Option<HealthStatusEnum>) -> String {
    match health {
        Some(HealthStatusEnum::STARTING) => "starting",
        Some(HealthStatusEnum::HEALTHY) => "healthy",
        Some(HealthStatusEnum::UNHEALTHY) => "unhealthy",
        _ => "",
    }
    .to_string()
}

#[async_trait]
impl ContainerRuntime for DockerManager {
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!("Image {image} already exists locally");
            return Ok(());
        }

        info!("Image {image} not found locally, pulling...");

        let (image_name, tag) = match image.split_once(':') {
            Some((name, tag)) => (name, tag),
            None => (image, "latest"),
        };

        let options = CreateImageOptions {
            from_image: image_name,
            tag,
            ..Default::default()
        };

        let pull = async {
            let mut image_stream = self.docker.create_image(Some(options), None, None);
            while let Some(progress) = image_stream.next().await {
                match progress {
                    Ok(create_info) => debug!("Pull progress: {create_info:?}"),
                    Err(e) => {
                        return Err(RuntimeError::ImagePullFailed {
                            image: image.to_string(),
                            reason: e.to_string(),
                        })
                    }
                }
            }
            Ok(())
        };

        // Registries occasionally throttle; the pull gets its own budget so
        // it cannot eat the whole command deadline.
        match tokio::time::timeout(self.pull_timeout, pull).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RuntimeError::ImagePullFailed {
                    image: image.to_string(),
                    reason: format!("pull timed out after {:?}", self.pull_timeout),
                })
            }
        }

        info!("Successfully pulled image {image}");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.ensure_image(&spec.image).await?;

        let env = container_env(spec);

        let mut exposed_ports: Option<HashMap<String, HashMap<(), ()>>> = None;
        let mut port_bindings: Option<PortMap> = None;
        let mut entrypoint: Option<Vec<String>> = None;
        let mut cmd: Option<Vec<String>> = None;

        if !spec.use_image_entrypoint {
            if let Some(ssh_port) = spec.ssh_port {
                exposed_ports = Some(HashMap::from([("22/tcp".to_string(), HashMap::new())]));
                port_bindings = Some(HashMap::from([(
                    "22/tcp".to_string(),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(ssh_port.to_string()),
                    }]),
                )]));
            }
            entrypoint = Some(vec!["/bin/bash".to_string(), "-c".to_string()]);
            cmd = Some(vec![SSH_SETUP_SCRIPT.to_string()]);
        }

        let host_config = HostConfig {
            runtime: Some("nvidia".to_string()),
            memory: Some(spec.memory_bytes),
            nano_cpus: Some(spec.cpu_count * 1_000_000_000),
            port_bindings,
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports,
            entrypoint,
            cmd,
            host_config: Some(host_config),
            ..Default::default()
        };

        info!("Creating container with name: {}", spec.name);
        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| {
                Self::map_unavailable(&e).unwrap_or(RuntimeError::CreateFailed(e.to_string()))
            })?;

        info!("Container created successfully with ID: {}", container.id);
        Ok(container.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        // The daemon occasionally rejects starts during resource
        // negotiation, so retry with exponential backoff within a fixed
        // elapsed budget.
        let started = Instant::now();
        let mut delay = START_BACKOFF_INITIAL;

        loop {
            match self
                .docker
                .start_container(container_id, None::<StartContainerOptions<String>>)
                .await
            {
                Ok(_) => {
                    info!("Container {container_id} started successfully");
                    return Ok(());
                }
                Err(e) => {
                    if started.elapsed() + delay >= START_ELAPSED_CAP {
                        return Err(Self::map_unavailable(&e)
                            .unwrap_or(RuntimeError::StartFailed(e.to_string())));
                    }
                    warn!("Start of container {container_id} failed ({e}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(START_BACKOFF_CAP);
                }
            }
        }
    }

    async fn stop_container(&self, container_id: &str, timeout_s: i64) -> Result<(), RuntimeError> {
        match self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: timeout_s }))
            .await
        {
            Ok(_) => Ok(()),
            // 304: already stopped
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => {
                Err(Self::map_unavailable(&e).unwrap_or(RuntimeError::StopFailed(e.to_string())))
            }
        }
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(_) => {
                info!("Container {container_id} removed successfully");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {container_id} already removed");
                Ok(())
            }
            Err(e) => {
                Err(Self::map_unavailable(&e).unwrap_or(RuntimeError::RemoveFailed(e.to_string())))
            }
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                Self::map_unavailable(&e).unwrap_or(RuntimeError::InspectFailed(e.to_string()))
            })?;

        let state = inspect.state.as_ref().and_then(|s| s.status);
        let health = inspect
            .state
            .as_ref()
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status);

        let ssh_host_port = inspect
            .network_settings
            .as_ref()
            .and_then(|n| n.ports.as_ref())
            .and_then(|ports| ports.get("22/tcp"))
            .and_then(|bindings| bindings.as_ref())
            .and_then(|bindings| bindings.first())
            .and_then(|binding| binding.host_port.as_ref())
            .and_then(|port| port.parse::<u16>().ok());

        Ok(ContainerStatus {
            container_id: inspect.id.unwrap_or_default(),
            state: state_to_str(state),
            health: health_to_str(health),
            ssh_host_port,
        })
    }
}
