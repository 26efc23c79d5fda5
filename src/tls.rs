//! Loading PEM material into tonic's TLS configuration.
//!
//! Both ends authenticate each other. The server presents its certificate
//! and requires a client certificate signed by the configured CA; the
//! client certificate is also where callers get their identity and roles.

use std::path::{Path, PathBuf};

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

/// Server name used when the client config does not name one.
pub const DEFAULT_SERVER_NAME: &str = "job-worker";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate path not configured")]
    MissingCaCert,

    #[error("Certificate path not configured")]
    MissingCert,

    #[error("Private key path not configured")]
    MissingKey,

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("Certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("Private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),
}

/// A certificate with its private key, plus the CA that peers must chain to.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
}

impl TlsIdentity {
    /// Reads the CA certificate, certificate and key named in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a path is not configured or a file cannot be read.
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca_cert_path = config
            .ca_cert_path
            .as_ref()
            .ok_or(TlsError::MissingCaCert)?;
        let cert_path = config.cert_path.as_ref().ok_or(TlsError::MissingCert)?;
        let key_path = config.key_path.as_ref().ok_or(TlsError::MissingKey)?;

        let ca_pem = read_pem(ca_cert_path, TlsError::CaCertNotFound).await?;
        let cert_pem = read_pem(cert_path, TlsError::CertNotFound).await?;
        let key_pem = read_pem(key_path, TlsError::KeyNotFound).await?;

        Ok(Self {
            identity: Identity::from_pem(cert_pem, key_pem),
            ca_cert: Certificate::from_pem(ca_pem),
        })
    }

    /// Server side: present our certificate and require client certificates
    /// signed by the CA.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca_cert.clone())
    }

    /// Client side: present our certificate and verify the server's against
    /// the CA under `server_name`.
    pub fn client_tls_config(&self, server_name: Option<&str>) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(server_name.unwrap_or(DEFAULT_SERVER_NAME))
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone())
    }
}

async fn read_pem(path: &Path, not_found: fn(PathBuf) -> TlsError) -> Result<Vec<u8>, TlsError> {
    if !path.exists() {
        return Err(not_found(path.to_path_buf()));
    }
    Ok(fs::read(path).await?)
}
