use std::time::Duration;

/// Configuration for the mining supervisor.
#[derive(Debug, Clone)]
pub struct MiningConfig {
    /// Whether mining runs at all when GPUs are idle.
    pub enabled: bool,

    /// Address receiving mining rewards. Optional; the mining image falls
    /// back to its coinbase account.
    pub wallet_address: String,

    /// Container image for the mining workload.
    pub image: String,

    /// GPU UUIDs available to mining. Empty means "whatever the host has".
    pub gpu_device_ids: Vec<String>,

    /// Host path for blockchain data persistence.
    pub data_dir: String,

    /// Extra environment passed to the mining container.
    pub extra_args: Vec<String>,

    /// How often the monitor loop checks the mining container. Tests shrink
    /// this to milliseconds.
    pub monitor_interval: Duration,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wallet_address: String::new(),
            image: "mingeyom/worldland-mio:latest".to_string(),
            gpu_device_ids: Vec::new(),
            data_dir: "/data/worldland".to_string(),
            extra_args: Vec::new(),
            monitor_interval: Duration::from_secs(30),
        }
    }
}
