mod certs;
mod siwe;

pub use certs::{
    certs_exist, client_tls_config, default_cert_dir, load_identity, save_bundle,
    server_tls_config, TlsIdentity,
};
pub use siwe::{CertificateBundle, SiweClient};
