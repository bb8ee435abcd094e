use crate::api;
use crate::auth::{
    certs_exist, client_tls_config, default_cert_dir, load_identity, save_bundle,
    server_tls_config, SiweClient,
};
use crate::config::{
    derive_hub_http_url, validate_price_per_sec, NodeConfig, DEFAULT_GRACE_PERIOD,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_IMAGE_PULL_TIMEOUT, DEFAULT_MAX_PORT, DEFAULT_MIN_PORT,
    MIN_PRICE_PER_SEC,
};
use crate::daemon::NodeDaemon;
use crate::docker::DockerManager;
use crate::gpu::{GpuProvider, MockGpuProvider, NvmlProvider};
use crate::hub::HubChannel;
use crate::mining::{MiningConfig, MiningSupervisor};
use crate::ports::PortAllocator;
use crate::rental::RentalExecutor;
use crate::utils::identity::machine_id;
use crate::TaskHandles;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(author, version = APP_VERSION, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub async fn run(
        &self,
        cancellation_token: CancellationToken,
        task_handles: TaskHandles,
    ) -> Result<()> {
        execute_command(&self.command, cancellation_token, task_handles).await
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the provider node daemon
    Run {
        /// Hub mTLS address
        #[arg(long, default_value = "localhost:8443")]
        hub: String,

        /// Hub HTTP API URL for authentication (derived from --hub if unset)
        #[arg(long)]
        hub_http: Option<String>,

        /// Port for the node's rental API (mTLS)
        #[arg(long, default_value = "8444")]
        api_port: u16,

        /// Public host address for SSH connections (e.g. provider.example.com)
        #[arg(long)]
        host: Option<String>,

        /// Node certificate file (defaults to <cert-dir>/node.crt)
        #[arg(long)]
        cert: Option<PathBuf>,

        /// Node private key file (defaults to <cert-dir>/node.key)
        #[arg(long)]
        key: Option<PathBuf>,

        /// CA certificate file (defaults to <cert-dir>/ca.crt)
        #[arg(long)]
        ca: Option<PathBuf>,

        /// Directory for auto-generated certificates
        #[arg(long)]
        cert_dir: Option<PathBuf>,

        /// Node ID (from registration, defaults to certificate CN)
        #[arg(long)]
        node_id: Option<String>,

        /// Disable automatic GPU mining when idle
        #[arg(long, default_value = "false")]
        disable_mining: bool,

        /// Container image for mining
        #[arg(long, default_value = "mingeyom/worldland-mio:latest")]
        mining_image: String,

        /// Host path for mining blockchain data
        #[arg(long, default_value = "/data/worldland")]
        mining_data_dir: String,

        /// Ethereum private key (hex) for wallet authentication
        /// (not recommended, use environment variable WALLET_PRIVATE_KEY instead)
        #[arg(long)]
        private_key: Option<String>,

        /// Path to file containing the wallet private key
        #[arg(long)]
        private_key_file: Option<PathBuf>,

        /// SIWE domain for authentication (defaults to hub-http host)
        #[arg(long)]
        siwe_domain: Option<String>,

        /// GPU type for registration (auto-detected if unset)
        #[arg(long)]
        gpu_type: Option<String>,

        /// GPU memory in GB for registration (auto-detected if unset)
        #[arg(long)]
        memory_gb: Option<u32>,

        /// Price per second in wei (default: 0.01 WLC/hr)
        #[arg(long, default_value = MIN_PRICE_PER_SEC)]
        price_per_sec: String,

        /// Log level
        #[arg(long)]
        log_level: Option<String>,
    },
}

pub async fn execute_command(
    command: &Commands,
    cancellation_token: CancellationToken,
    task_handles: TaskHandles,
) -> Result<()> {
    match command {
        Commands::Run {
            hub,
            hub_http,
            api_port,
            host,
            cert,
            key,
            ca,
            cert_dir,
            node_id,
            disable_mining,
            mining_image,
            mining_data_dir,
            private_key,
            private_key_file,
            siwe_domain,
            gpu_type,
            memory_gb,
            price_per_sec,
            log_level: _,
        } => {
            info!("Worldland node starting (version {APP_VERSION})");

            validate_price_per_sec(price_per_sec)?;

            let host_addr = match host {
                Some(host) => host.clone(),
                None => {
                    warn!("Host address not specified, defaulting to localhost");
                    "localhost".to_string()
                }
            };

            let cert_dir = cert_dir.clone().unwrap_or_else(default_cert_dir);
            let config = NodeConfig {
                hub_addr: hub.clone(),
                hub_http_url: hub_http
                    .clone()
                    .unwrap_or_else(|| derive_hub_http_url(hub)),
                api_port: *api_port,
                host_addr: host_addr.clone(),
                cert_path: cert.clone().unwrap_or_else(|| cert_dir.join("node.crt")),
                key_path: key.clone().unwrap_or_else(|| cert_dir.join("node.key")),
                ca_path: ca.clone().unwrap_or_else(|| cert_dir.join("ca.crt")),
                min_port: DEFAULT_MIN_PORT,
                max_port: DEFAULT_MAX_PORT,
                grace_period: DEFAULT_GRACE_PERIOD,
                heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
                image_pull_timeout: DEFAULT_IMAGE_PULL_TIMEOUT,
            };

            /*
             Early GPU detection: runs before authentication so the node
             registers with its real hardware.
            */
            let nvml = NvmlProvider::new();
            let is_cpu_node = nvml.init().is_err();
            let mut detected_gpu_type = "CPU Node".to_string();
            let mut detected_memory_gb: u32 = 1;
            let mut gpu_uuids: Vec<String> = Vec::new();

            if is_cpu_node {
                info!("No GPU detected - will register as CPU Node");
            } else {
                let specs = nvml.specs().unwrap_or_default();
                if let Some(first) = specs.first() {
                    detected_gpu_type = first.name.clone();
                    detected_memory_gb = (first.memory_total_mb / 1024) as u32;
                    info!(
                        "GPU detected: {} ({} GB)",
                        detected_gpu_type, detected_memory_gb
                    );
                }
                gpu_uuids = specs.iter().map(|s| s.uuid.clone()).collect();
            }

            let gpu_type = gpu_type.clone().unwrap_or(detected_gpu_type);
            let memory_gb = memory_gb.unwrap_or(detected_memory_gb.max(1));

            /*
             Wallet authentication and certificate bootstrap
            */
            let wallet_key = resolve_private_key(private_key, private_key_file)?;
            let mut wallet_address = String::new();
            let mut registered_node_id: Option<String> = None;

            if let Some(wallet_key) = wallet_key {
                info!("Authenticating with wallet to Hub at {}", config.hub_http_url);

                let mut siwe =
                    SiweClient::new(&config.hub_http_url, &wallet_key, siwe_domain.clone())
                        .context("failed to create SIWE client")?;
                wallet_address = siwe.address();
                info!("Wallet address: {wallet_address}");

                siwe.login().await.context("SIWE authentication failed")?;
                info!("SIWE authentication successful");

                if !certs_exist(&config.cert_path, &config.key_path, &config.ca_path) {
                    info!("Certificates not found, requesting bootstrap certificate from Hub...");
                    let bundle = siwe
                        .issue_certificate()
                        .await
                        .context("failed to issue bootstrap certificate")?;
                    let (cert_path, key_path, ca_path) = save_bundle(&cert_dir, &bundle)?;
                    info!("Bootstrap certificates saved to {}", cert_dir.display());
                    info!("  Certificate: {}", cert_path.display());
                    info!("  Private Key: {}", key_path.display());
                    info!("  CA Cert: {}", ca_path.display());
                    info!("  Expires: {}", bundle.expires_at);
                } else {
                    info!("Using existing certificates from {}", cert_dir.display());
                }

                let device_uuid = if is_cpu_node {
                    machine_id()
                } else {
                    gpu_uuids
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "GPU-UNKNOWN".to_string())
                };

                match siwe
                    .register_node(&device_uuid, &gpu_type, memory_gb, price_per_sec)
                    .await
                {
                    Ok(id) => {
                        info!("Node registered: {id}");
                        registered_node_id = Some(id);
                    }
                    Err(e) => {
                        // Registration is idempotent on the Hub side
                        warn!("Node registration: {e} (may already exist)");
                    }
                }
            } else {
                info!("No private key provided - using existing certificates");
                if !certs_exist(&config.cert_path, &config.key_path, &config.ca_path) {
                    return Err(anyhow!(
                        "certificates not found at {}. Either provide --private-key for auto-bootstrap or manually place certificates",
                        cert_dir.display()
                    ));
                }
            }

            /*
             Load credentials and resolve node identity
            */
            let identity = load_identity(&config.cert_path, &config.key_path, &config.ca_path)
                .context("failed to load certificates")?;

            let node_id = match node_id.clone().or(registered_node_id) {
                Some(id) => id,
                None => {
                    if identity.common_name.is_empty() {
                        return Err(anyhow!("node-id is required (certificate has no CN)"));
                    }
                    info!("Using certificate CN as node-id: {}", identity.common_name);
                    identity.common_name.clone()
                }
            };

            let client_config = Arc::new(client_tls_config(&identity)?);
            let server_config = server_tls_config(&identity)?;

            /*
             Rental and mining infrastructure
            */
            let gpu_provider: Arc<dyn GpuProvider> = if is_cpu_node {
                Arc::new(MockGpuProvider::cpu_node())
            } else {
                Arc::new(nvml)
            };

            let runtime = Arc::new(
                DockerManager::new(config.image_pull_timeout)
                    .context("failed to initialize container runtime")?,
            );

            let ports = Arc::new(PortAllocator::new(
                config.min_port,
                config.max_port,
                config.grace_period,
            ));
            let rental = Arc::new(RentalExecutor::new(
                runtime.clone(),
                ports,
                config.grace_period,
            ));

            let mining = if !*disable_mining && !is_cpu_node {
                let mining_config = MiningConfig {
                    enabled: true,
                    wallet_address,
                    image: mining_image.clone(),
                    gpu_device_ids: gpu_uuids.clone(),
                    data_dir: mining_data_dir.clone(),
                    ..Default::default()
                };
                info!(
                    "Mining initialized: image={} gpus={}",
                    mining_image,
                    gpu_uuids.len()
                );
                Some(MiningSupervisor::new(runtime.clone(), mining_config))
            } else {
                None
            };

            let daemon = NodeDaemon::new(
                node_id.clone(),
                host_addr.clone(),
                rental.clone(),
                mining.clone(),
                gpu_provider,
                config.heartbeat_interval,
                cancellation_token.clone(),
            );

            /*
             Hub channel: the first connect distinguishes configuration
             errors from steady-state network blips, so it is fatal.
            */
            let channel = Arc::new(
                HubChannel::new(
                    config.hub_addr.clone(),
                    client_config,
                    daemon.command_handler(),
                    cancellation_token.child_token(),
                )
                .context("invalid hub address")?,
            );

            let reader = channel
                .connect()
                .await
                .with_context(|| format!("failed to connect to Hub at {}", config.hub_addr))?;
            info!("Connected to Hub at {}", config.hub_addr);

            {
                let mut handles = task_handles.lock().await;
                handles.push(tokio::spawn(channel.clone().run(reader)));

                if let Some(mining) = &mining {
                    let monitor = mining.clone().monitor_loop(cancellation_token.clone());
                    handles.push(tokio::spawn(monitor));

                    let mining = mining.clone();
                    handles.push(tokio::spawn(async move {
                        if let Err(e) = mining.start().await {
                            warn!("Mining start error: {e}");
                        }
                    }));
                }

                handles.push(
                    daemon.spawn_heartbeat(channel.clone(), cancellation_token.clone()),
                );
            }

            /*
             Rental API server (mTLS)
            */
            let server = api::start_server(
                config.api_port,
                server_config,
                rental.clone(),
                host_addr.clone(),
            )
            .context("failed to bind rental API server")?;
            let server_handle = server.handle();
            task_handles.lock().await.push(tokio::spawn(async move {
                if let Err(e) = server.await {
                    log::error!("API server error: {e}");
                }
            }));

            info!(
                "Node {node_id} ready - API on port {}, connected to {}",
                config.api_port, config.hub_addr
            );

            cancellation_token.cancelled().await;
            info!("Shutting down...");

            // Mining first (frees GPUs), then the channel. Rentals stay up:
            // the Hub decides their fate.
            daemon.shutdown(&channel).await;

            if tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, server_handle.stop(true))
                .await
                .is_err()
            {
                warn!("Timed out waiting for API server shutdown");
            }

            info!("Shutdown complete");
            Ok(())
        }
    }
}

fn resolve_private_key(
    private_key: &Option<String>,
    private_key_file: &Option<PathBuf>,
) -> Result<Option<String>> {
    if let Some(key) = private_key {
        warn!("Using private key from command line is not recommended. Consider using WALLET_PRIVATE_KEY environment variable instead.");
        return Ok(Some(key.clone()));
    }

    if let Ok(key) = std::env::var("WALLET_PRIVATE_KEY") {
        if !key.trim().is_empty() {
            return Ok(Some(key.trim().to_string()));
        }
    }

    if let Some(path) = private_key_file {
        let key = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read private key file {}", path.display()))?;
        return Ok(Some(key.trim().to_string()));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_defaults() {
        let cli = Cli::parse_from(["node", "run"]);
        let Commands::Run {
            hub,
            api_port,
            disable_mining,
            price_per_sec,
            ..
        } = cli.command;

        assert_eq!(hub, "localhost:8443");
        assert_eq!(api_port, 8444);
        assert!(!disable_mining);
        assert_eq!(price_per_sec, MIN_PRICE_PER_SEC);
    }

    #[test]
    fn test_cli_parses_overrides() {
        let cli = Cli::parse_from([
            "node",
            "run",
            "--hub",
            "hub.example.com:9443",
            "--host",
            "provider.example.com",
            "--disable-mining",
            "--price-per-sec",
            "9999999999999",
        ]);
        let Commands::Run {
            hub,
            host,
            disable_mining,
            price_per_sec,
            ..
        } = cli.command;

        assert_eq!(hub, "hub.example.com:9443");
        assert_eq!(host.as_deref(), Some("provider.example.com"));
        assert!(disable_mining);
        assert_eq!(price_per_sec, "9999999999999");
    }

    #[test]
    fn test_resolve_private_key_prefers_flag() {
        let key = resolve_private_key(&Some("0xabc".to_string()), &None).unwrap();
        assert_eq!(key.as_deref(), Some("0xabc"));
    }

    #[test]
    fn test_resolve_private_key_missing_file_errors() {
        let missing = PathBuf::from("/nonexistent/wallet.key");
        assert!(resolve_private_key(&None, &Some(missing)).is_err());
    }
}
