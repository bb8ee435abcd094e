use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use log::debug;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const SIWE_STATEMENT: &str = "Sign in to Worldland GPU Rental Platform as Provider";
const SIWE_VERSION: &str = "1";
const SIWE_CHAIN_ID: &str = "56"; // BNB Chain

/// Certificate bundle issued by the Hub after SIWE login.
#[derive(Debug, Clone, Deserialize)]
pub struct CertificateBundle {
    pub certificate: String,
    pub private_key: String,
    pub ca_certificate: String,
    pub expires_at: String,
}

/// Sign-In with Ethereum (EIP-4361) client for the Hub's bootstrap REST API.
/// One-shot at startup: login, register the node, and fetch mTLS credentials.
pub struct SiweClient {
    hub_url: String,
    signer: PrivateKeySigner,
    domain: Option<String>,
    token: Option<String>,
    http: reqwest::Client,
}

impl SiweClient {
    pub fn new(hub_url: &str, private_key_hex: &str, domain: Option<String>) -> Result<Self> {
        let key = private_key_hex.trim().trim_start_matches("0x");
        let signer: PrivateKeySigner = key.parse().context("invalid private key")?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            hub_url: hub_url.trim_end_matches('/').to_string(),
            signer,
            domain,
            token: None,
            http,
        })
    }

    /// Checksummed wallet address.
    pub fn address(&self) -> String {
        self.signer.address().to_string()
    }

    /// Performs the full SIWE exchange and stores the session token.
    pub async fn login(&mut self) -> Result<()> {
        let nonce = self.get_nonce().await?;
        let message = self.create_siwe_message(&nonce);
        let signature = self.sign_message(&message).await?;
        let token = self.login_with_signature(&message, &signature).await?;
        self.token = Some(token);
        Ok(())
    }

    async fn get_nonce(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct NonceResponse {
            nonce: String,
        }

        let response = self
            .http
            .get(format!("{}/api/v1/auth/nonce", self.hub_url))
            .send()
            .await
            .context("nonce request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("nonce request failed: {status} - {body}"));
        }

        let nonce: NonceResponse = response.json().await.context("invalid nonce response")?;
        Ok(nonce.nonce)
    }

    /// Builds the EIP-4361 message. The domain defaults to the Hub URL's
    /// host unless explicitly overridden.
    pub(crate) fn create_siwe_message(&self, nonce: &str) -> String {
        let domain = self
            .domain
            .clone()
            .unwrap_or_else(|| host_of(&self.hub_url));
        let issued_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        format!(
            "{domain} wants you to sign in with your Ethereum account:\n\
             {address}\n\
             \n\
             {SIWE_STATEMENT}\n\
             \n\
             URI: {uri}\n\
             Version: {SIWE_VERSION}\n\
             Chain ID: {SIWE_CHAIN_ID}\n\
             Nonce: {nonce}\n\
             Issued At: {issued_at}",
            address = self.address(),
            uri = self.hub_url,
        )
    }

    /// EIP-191 personal-message signature, hex-encoded with 0x prefix.
    async fn sign_message(&self, message: &str) -> Result<String> {
        let signature = self
            .signer
            .sign_message(message.as_bytes())
            .await
            .context("failed to sign SIWE message")?;
        Ok(format!("0x{}", alloy::hex::encode(signature.as_bytes())))
    }

    async fn login_with_signature(&self, message: &str, signature: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct LoginResponse {
            token: String,
        }

        let response = self
            .http
            .post(format!("{}/api/v1/auth/login", self.hub_url))
            .json(&json!({ "message": message, "signature": signature }))
            .send()
            .await
            .context("login request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("login failed: {status} - {body}"));
        }

        let login: LoginResponse = response.json().await.context("invalid login response")?;
        Ok(login.token)
    }

    fn bearer_token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| anyhow!("not authenticated - call login() first"))
    }

    /// Registers this node's hardware with the Hub. Returns the node id.
    pub async fn register_node(
        &self,
        gpu_uuid: &str,
        gpu_type: &str,
        memory_gb: u32,
        price_per_sec: &str,
    ) -> Result<String> {
        #[derive(Deserialize)]
        struct RegisterResponse {
            node_id: String,
        }

        let token = self.bearer_token()?;
        let response = self
            .http
            .post(format!("{}/api/v1/nodes", self.hub_url))
            .bearer_auth(token)
            .json(&json!({
                "gpu_uuid": gpu_uuid,
                "gpu_type": gpu_type,
                "memory_gb": memory_gb,
                "price_per_sec": price_per_sec,
            }))
            .send()
            .await
            .context("registration request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("registration failed: {status} - {body}"));
        }

        let registered: RegisterResponse =
            response.json().await.context("invalid registration response")?;
        debug!("Node registered as {}", registered.node_id);
        Ok(registered.node_id)
    }

    /// Requests a fresh mTLS certificate bundle from the Hub.
    pub async fn issue_certificate(&self) -> Result<CertificateBundle> {
        let token = self.bearer_token()?;
        let response = self
            .http
            .post(format!("{}/api/v1/certificates/issue", self.hub_url))
            .bearer_auth(token)
            .send()
            .await
            .context("certificate request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("certificate issuance failed: {status} - {body}"));
        }

        response
            .json::<CertificateBundle>()
            .await
            .context("invalid certificate bundle")
    }
}

fn host_of(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host = without_scheme
        .split(['/', ':'])
        .next()
        .unwrap_or_default();
    if host.is_empty() {
        "localhost".to_string()
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Throwaway development key, never used outside tests
    const TEST_KEY: &str = "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    #[test]
    fn test_new_rejects_invalid_key() {
        assert!(SiweClient::new("http://localhost:8080", "not-hex", None).is_err());
    }

    #[test]
    fn test_new_accepts_0x_prefixed_key() {
        let with_prefix = format!("0x{TEST_KEY}");
        let client = SiweClient::new("http://localhost:8080", &with_prefix, None).unwrap();
        let bare = SiweClient::new("http://localhost:8080", TEST_KEY, None).unwrap();
        assert_eq!(client.address(), bare.address());
    }

    #[test]
    fn test_siwe_message_format() {
        let client = SiweClient::new("http://hub.example.com:8080", TEST_KEY, None).unwrap();
        let message = client.create_siwe_message("abc123");

        assert!(message
            .starts_with("hub.example.com wants you to sign in with your Ethereum account:"));
        assert!(message.contains(&client.address()));
        assert!(message.contains(SIWE_STATEMENT));
        assert!(message.contains("URI: http://hub.example.com:8080"));
        assert!(message.contains("Version: 1"));
        assert!(message.contains("Chain ID: 56"));
        assert!(message.contains("Nonce: abc123"));
        assert!(message.contains("Issued At: "));
    }

    #[test]
    fn test_siwe_message_honours_domain_override() {
        let client = SiweClient::new(
            "http://localhost:8080",
            TEST_KEY,
            Some("provider.example.com".to_string()),
        )
        .unwrap();
        let message = client.create_siwe_message("n");
        assert!(message.starts_with("provider.example.com wants you to sign in"));
    }

    #[tokio::test]
    async fn test_sign_message_produces_65_byte_signature() {
        let client = SiweClient::new("http://localhost:8080", TEST_KEY, None).unwrap();
        let signature = client.sign_message("hello").await.unwrap();

        assert!(signature.starts_with("0x"));
        assert_eq!(signature.len(), 2 + 65 * 2);
    }

    #[test]
    fn test_host_of_parses_urls() {
        assert_eq!(host_of("http://hub.example.com:8080"), "hub.example.com");
        assert_eq!(host_of("https://hub.example.com/path"), "hub.example.com");
        assert_eq!(host_of("hub.example.com:8443"), "hub.example.com");
        assert_eq!(host_of(""), "localhost");
    }
}
