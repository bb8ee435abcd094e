use alloy::primitives::U256;
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Minimum accepted rental price: 0.01 WLC/hr expressed in wei per second.
pub const MIN_PRICE_PER_SEC: &str = "2777777777778";

pub const DEFAULT_RENTAL_IMAGE: &str = "nvidia/cuda:12.1.1-runtime-ubuntu22.04";
pub const DEFAULT_MIN_PORT: u16 = 30000;
pub const DEFAULT_MAX_PORT: u16 = 32000;
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Process-level configuration assembled from CLI flags at boot.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Hub mTLS address (host:port).
    pub hub_addr: String,
    /// Hub HTTP base URL for bootstrap authentication.
    pub hub_http_url: String,
    /// Port for the node's rental-facing mTLS API.
    pub api_port: u16,
    /// Public host address advertised for SSH connections.
    pub host_addr: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    pub min_port: u16,
    pub max_port: u16,
    pub grace_period: Duration,
    pub heartbeat_interval: Duration,
    pub image_pull_timeout: Duration,
}

/// Parses and validates the wei-per-second price against the platform floor.
/// A price below the floor is a startup configuration error.
pub fn validate_price_per_sec(price: &str) -> Result<U256> {
    let floor = U256::from_str_radix(MIN_PRICE_PER_SEC, 10)
        .expect("minimum price constant is a valid decimal");
    let price = U256::from_str_radix(price, 10)
        .with_context(|| format!("invalid price-per-sec value: {price}"))?;

    if price < floor {
        return Err(anyhow!(
            "price-per-sec must be at least {MIN_PRICE_PER_SEC} (0.01 WLC/hr), got: {price}"
        ));
    }

    Ok(price)
}

/// Derives the Hub's HTTP bootstrap URL from its mTLS address when the user
/// did not supply one (hub:8443 becomes http://hub:8080).
pub fn derive_hub_http_url(hub_addr: &str) -> String {
    let host = hub_addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(hub_addr);
    format!("http://{host}:8080")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_price_is_accepted() {
        assert!(validate_price_per_sec(MIN_PRICE_PER_SEC).is_ok());
    }

    #[test]
    fn test_price_above_floor_is_accepted() {
        assert!(validate_price_per_sec("5000000000000").is_ok());
    }

    #[test]
    fn test_price_below_floor_is_rejected() {
        let err = validate_price_per_sec("1000").unwrap_err();
        assert!(err.to_string().contains("at least"));
    }

    #[test]
    fn test_garbage_price_is_rejected() {
        assert!(validate_price_per_sec("not-a-number").is_err());
        assert!(validate_price_per_sec("").is_err());
    }

    #[test]
    fn test_derive_hub_http_url() {
        assert_eq!(derive_hub_http_url("hub.example.com:8443"), "http://hub.example.com:8080");
        assert_eq!(derive_hub_http_url("localhost:8443"), "http://localhost:8080");
    }
}
