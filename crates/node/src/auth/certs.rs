use super::CertificateBundle;
use anyhow::{anyhow, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Node credentials loaded from disk, ready to back both the Hub channel
/// (client side) and the rental API server (server side).
pub struct TlsIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub ca_certs: Vec<CertificateDer<'static>>,
    /// Common Name of the leaf certificate; authoritative node identity
    /// when none is supplied externally.
    pub common_name: String,
}

pub fn default_cert_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".worldland")
        .join("certs")
}

pub fn certs_exist(cert_path: &Path, key_path: &Path, ca_path: &Path) -> bool {
    cert_path.exists() && key_path.exists() && ca_path.exists()
}

/// Writes a certificate bundle to `cert_dir` with the expected permissions:
/// directory 0700, certificates 0644, private key 0600. Returns the three
/// paths (cert, key, ca).
pub fn save_bundle(cert_dir: &Path, bundle: &CertificateBundle) -> Result<(PathBuf, PathBuf, PathBuf)> {
    fs::create_dir_all(cert_dir).context("failed to create certificate directory")?;
    set_permissions(cert_dir, 0o700)?;

    let cert_path = cert_dir.join("node.crt");
    let key_path = cert_dir.join("node.key");
    let ca_path = cert_dir.join("ca.crt");

    fs::write(&cert_path, &bundle.certificate).context("failed to write node certificate")?;
    set_permissions(&cert_path, 0o644)?;

    fs::write(&key_path, &bundle.private_key).context("failed to write private key")?;
    set_permissions(&key_path, 0o600)?;

    fs::write(&ca_path, &bundle.ca_certificate).context("failed to write CA certificate")?;
    set_permissions(&ca_path, 0o644)?;

    Ok((cert_path, key_path, ca_path))
}

fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

/// Loads the node certificate, private key, and CA from PEM files and
/// extracts the leaf's Common Name.
pub fn load_identity(cert_path: &Path, key_path: &Path, ca_path: &Path) -> Result<TlsIdentity> {
    let certs = read_pem_certs(cert_path)?;
    if certs.is_empty() {
        return Err(anyhow!("no certificate found in {}", cert_path.display()));
    }

    let key_pem = fs::read(key_path)
        .with_context(|| format!("failed to read private key {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("failed to parse private key")?
        .ok_or_else(|| anyhow!("no private key found in {}", key_path.display()))?;

    let ca_certs = read_pem_certs(ca_path)?;
    if ca_certs.is_empty() {
        return Err(anyhow!("no CA certificate found in {}", ca_path.display()));
    }

    let common_name = extract_common_name(&certs[0])?;

    Ok(TlsIdentity {
        certs,
        key,
        ca_certs,
        common_name,
    })
}

fn read_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path)
        .with_context(|| format!("failed to read certificate {}", path.display()))?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates in {}", path.display()))
}

fn extract_common_name(cert: &CertificateDer<'_>) -> Result<String> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| anyhow!("failed to parse certificate: {e}"))?;

    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();

    Ok(cn)
}

/// Ensures a process-wide rustls `CryptoProvider` is installed before any
/// `ClientConfig`/`ServerConfig` builder runs. With both the `aws-lc-rs` and
/// `ring` backends present in the dependency graph, rustls cannot pick one
/// automatically and panics unless we install one explicitly.
fn ensure_crypto_provider() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

fn ca_root_store(ca_certs: &[CertificateDer<'static>]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for ca in ca_certs {
        roots
            .add(ca.clone())
            .context("failed to add CA certificate to root store")?;
    }
    Ok(roots)
}

/// TLS config for the Hub channel: TLS 1.3 only, client certificate
/// presented, peer must chain to the Hub's CA. A handshake below 1.3 fails
/// before any application data.
pub fn client_tls_config(identity: &TlsIdentity) -> Result<ClientConfig> {
    ensure_crypto_provider();
    let roots = ca_root_store(&identity.ca_certs)?;

    ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(roots)
        .with_client_auth_cert(identity.certs.clone(), identity.key.clone_key())
        .context("failed to build client TLS config")
}

/// TLS config for the rental API server: TLS 1.3 only, client certificates
/// required and verified against the same CA.
pub fn server_tls_config(identity: &TlsIdentity) -> Result<ServerConfig> {
    ensure_crypto_provider();
    let roots = ca_root_store(&identity.ca_certs)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("failed to build client certificate verifier")?;

    ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.certs.clone(), identity.key.clone_key())
        .context("failed to build server TLS config")
}
