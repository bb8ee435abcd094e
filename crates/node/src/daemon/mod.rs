use crate::config::DEFAULT_RENTAL_IMAGE;
use crate::gpu::GpuProvider;
use crate::hub::{CommandHandler, HubChannel};
use crate::mining::MiningSupervisor;
use crate::rental::{RentalExecutor, StartRentalRequest};
use crate::utils::identity::outbound_ip;
use log::{info, warn};
use serde_json::{json, Map, Value};
use shared::models::command::{CommandAck, HeartbeatFrame, HubCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

const START_RENTAL_DEADLINE: Duration = Duration::from_secs(3 * 60);
const STOP_RENTAL_DEADLINE: Duration = Duration::from_secs(30);
const PAUSE_RESUME_DEADLINE: Duration = Duration::from_secs(30);
const MINING_SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

const DEFAULT_CPU_COUNT: i64 = 4;
const DEFAULT_MEMORY_MB: i64 = 16384;

const HEARTBEAT_MODE: &str = "master";

/// Central coordinator: routes Hub commands to the rental executor and
/// mining supervisor, reports GPU metrics in periodic heartbeats, and owns
/// the shutdown sequence.
///
/// The daemon never holds the Hub channel; dispatch goes through a single
/// handler closure registered on it, and the heartbeat task receives the
/// channel when spawned.
pub struct NodeDaemon {
    node_id: String,
    host_addr: String,
    rental: Arc<RentalExecutor>,
    mining: Option<Arc<MiningSupervisor>>,
    gpu: Arc<dyn GpuProvider>,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
}

impl NodeDaemon {
    pub fn new(
        node_id: String,
        host_addr: String,
        rental: Arc<RentalExecutor>,
        mining: Option<Arc<MiningSupervisor>>,
        gpu: Arc<dyn GpuProvider>,
        heartbeat_interval: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            host_addr,
            rental,
            mining,
            gpu,
            heartbeat_interval,
            shutdown,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Handler closure to register on the Hub channel.
    pub fn command_handler(self: &Arc<Self>) -> CommandHandler {
        let daemon = self.clone();
        Arc::new(move |cmd| {
            let daemon = daemon.clone();
            Box::pin(async move { daemon.handle_command(cmd).await })
        })
    }

    pub async fn handle_command(self: &Arc<Self>, cmd: HubCommand) -> CommandAck {
        info!("Received command: {} (type: {})", cmd.id, cmd.command_type);

        match cmd.command_type.as_str() {
            "start_rental" => self.handle_start_rental(cmd).await,
            "stop_rental" => self.handle_stop_rental(cmd).await,
            // Legacy aliases kept for older Hub revisions
            "start_job" => self.handle_start_rental(cmd).await,
            "stop_job" => self.handle_stop_rental(cmd).await,
            other => {
                warn!("Unknown command type: {other}");
                CommandAck::error(cmd.id, "unknown command")
            }
        }
    }

    async fn handle_start_rental(self: &Arc<Self>, cmd: HubCommand) -> CommandAck {
        let Some(session_id) = payload_str(&cmd.payload, "session_id") else {
            return CommandAck::error(cmd.id, "missing session_id");
        };

        let image =
            payload_str(&cmd.payload, "image").unwrap_or_else(|| DEFAULT_RENTAL_IMAGE.to_string());
        let gpu_device = payload_str(&cmd.payload, "gpu_device_id").unwrap_or_default();
        let ssh_password = payload_str(&cmd.payload, "ssh_password").unwrap_or_default();
        let cpu_count = payload_i64(&cmd.payload, "cpu_count").unwrap_or(DEFAULT_CPU_COUNT);
        let memory_mb = payload_i64(&cmd.payload, "memory_mb").unwrap_or(DEFAULT_MEMORY_MB);

        info!("Starting rental: session={session_id} image={image} gpu={gpu_device}");

        // Mining yields the GPU first; failures here never block the rental
        if let Some(mining) = &self.mining {
            if !gpu_device.is_empty() {
                let pause = mining.pause_for_rental(std::slice::from_ref(&gpu_device));
                if tokio::time::timeout(PAUSE_RESUME_DEADLINE, pause).await.is_err() {
                    warn!("Timed out pausing mining for rental {session_id}");
                }
            }
        }

        let request = StartRentalRequest {
            session_id: session_id.clone(),
            image,
            gpu_device,
            ssh_password,
            memory_bytes: memory_mb * 1024 * 1024,
            cpu_count,
            host: self.host_addr.clone(),
        };

        // The deadline fires a cancellation rather than dropping the future,
        // so the executor still runs its rollback on timeout.
        let cancel = self.shutdown.child_token();
        let deadline_token = cancel.clone();
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(START_RENTAL_DEADLINE).await;
            deadline_token.cancel();
        });
        let result = self.rental.start_rental(&cancel, request).await;
        deadline.abort();

        match result {
            Ok(conn) => {
                info!(
                    "Rental started: session={session_id} ssh={}:{}",
                    conn.host, conn.port
                );

                let mut ssh_host = self.host_addr.clone();
                if ssh_host.is_empty() || ssh_host == "localhost" {
                    ssh_host = outbound_ip();
                }

                let mut payload = Map::new();
                payload.insert("session_id".to_string(), json!(session_id));
                payload.insert("ssh_host".to_string(), json!(ssh_host));
                payload.insert("ssh_port".to_string(), json!(conn.port));
                payload.insert("ssh_user".to_string(), json!(conn.user));
                payload.insert("container_id".to_string(), json!(conn.container_id));
                CommandAck::ok_with_payload(cmd.id, payload)
            }
            Err(e) => {
                warn!("Failed to start rental {session_id}: {e}");
                CommandAck::error(cmd.id, format!("failed to start rental: {e}"))
            }
        }
    }

    async fn handle_stop_rental(self: &Arc<Self>, cmd: HubCommand) -> CommandAck {
        let Some(session_id) = payload_str(&cmd.payload, "session_id") else {
            return CommandAck::error(cmd.id, "missing session_id");
        };

        info!("Stopping rental: session={session_id}");

        // Captured before the stop so the GPU can be handed back to mining
        let rented_gpus: Vec<String> = self
            .rental
            .status(&session_id)
            .map(|s| {
                if s.gpu_device.is_empty() {
                    Vec::new()
                } else {
                    vec![s.gpu_device]
                }
            })
            .unwrap_or_default();

        let stop = self.rental.stop_rental(&session_id);
        let warning = match tokio::time::timeout(STOP_RENTAL_DEADLINE, stop).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                warn!("Failed to stop rental {session_id}: {e}");
                Some(format!("stop warning: {e}"))
            }
            Err(_) => {
                warn!("Timed out stopping rental {session_id}");
                Some("stop warning: timed out".to_string())
            }
        };

        // The GPU is free again; mining may resume regardless of how the
        // stop went. Both sides converge on "stopped".
        if let Some(mining) = &self.mining {
            let resume = mining.resume_after_rental(&rented_gpus);
            if tokio::time::timeout(PAUSE_RESUME_DEADLINE, resume).await.is_err() {
                warn!("Timed out resuming mining after rental {session_id}");
            }
        }

        let mut payload = Map::new();
        payload.insert("session_id".to_string(), json!(session_id));
        let ack = CommandAck::ok_with_payload(cmd.id, payload);
        match warning {
            Some(warning) => ack.with_warning(warning),
            None => ack,
        }
    }

    /// Spawns the heartbeat timer. Missed heartbeats are logged and never
    /// retried; the channel reconnects on its own.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        channel: Arc<HubChannel>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let daemon = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(daemon.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Heartbeat task received cancellation signal");
                        return;
                    }
                    _ = ticker.tick() => {
                        let metrics = match daemon.gpu.metrics() {
                            Ok(metrics) => metrics,
                            Err(e) => {
                                warn!("Failed to collect GPU metrics: {e}");
                                Vec::new()
                            }
                        };
                        let frame = HeartbeatFrame::new(HEARTBEAT_MODE, metrics);
                        if let Err(e) = channel.send(&frame).await {
                            warn!("Failed to send heartbeat: {e}");
                        }
                    }
                }
            }
        })
    }

    /// Stops mining within its budget and closes the channel. Active rentals
    /// are left running on purpose; the Hub decides their fate.
    pub async fn shutdown(&self, channel: &HubChannel) {
        if let Some(mining) = &self.mining {
            if tokio::time::timeout(MINING_SHUTDOWN_BUDGET, mining.stop())
                .await
                .is_err()
            {
                warn!("Timed out stopping mining during shutdown");
            }
        }

        channel.close().await;
        info!("Node daemon shut down");
    }
}

fn payload_str(payload: &Map<String, Value>, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn payload_i64(payload: &Map<String, Value>, key: &str) -> Option<i64> {
    let value = payload.get(key)?;
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}
