use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::auth::{AccessController, OwnershipStore};
use crate::config::{ServerConfig, TlsConfig};
use crate::grpc::GrpcServer;
use crate::tls::{TlsError, TlsIdentity};
use crate::worker::JobSupervisor;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("TLS certificate loading failed: {0}")]
    Tls(#[from] TlsError),

    #[error("TLS enabled but missing required paths (--ca-cert, --cert, --key)")]
    IncompleteTls,

    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
}

/// Wires the job supervisor, the ownership store and the access controller
/// behind one gRPC endpoint.
pub struct Node {
    pub config: ServerConfig,
    pub supervisor: Arc<JobSupervisor>,
    pub access: Arc<AccessController>,
}

impl Node {
    pub fn new(config: ServerConfig) -> Self {
        let supervisor = Arc::new(JobSupervisor::new(&config.worker));
        let access = Arc::new(AccessController::new(Arc::new(OwnershipStore::new())));
        Self {
            config,
            supervisor,
            access,
        }
    }

    /// Serves until `shutdown` fires. Running jobs are killed on the way out.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS material cannot be loaded (unless insecure
    /// mode is allowed) or the gRPC server fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), NodeError> {
        let tls_identity = load_tls(&self.config.tls).await?;

        tracing::info!(
            listen_addr = %self.config.listen_addr,
            log_dir = %self.config.worker.log_dir.display(),
            cgroups = self.config.worker.cgroup.enabled,
            tls_enabled = tls_identity.is_some(),
            "Starting job worker"
        );

        let server = GrpcServer::new(
            self.config.listen_addr,
            self.supervisor.clone(),
            self.access.clone(),
            tls_identity,
        );
        server.run(shutdown).await?;
        Ok(())
    }
}

/// Loads the server's TLS identity, falling back to plaintext only when
/// `allow_insecure` is set.
pub async fn load_tls(config: &TlsConfig) -> Result<Option<TlsIdentity>, NodeError> {
    if config.is_complete() {
        match TlsIdentity::load(config).await {
            Ok(identity) => {
                tracing::info!("TLS enabled with mTLS authentication");
                Ok(Some(identity))
            }
            Err(e) if config.allow_insecure => {
                tracing::warn!(
                    error = %e,
                    "TLS certificate loading failed, running in insecure mode"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    } else if config.enabled {
        if config.allow_insecure {
            tracing::warn!("TLS enabled but certificate paths incomplete, running in insecure mode");
            Ok(None)
        } else {
            Err(NodeError::IncompleteTls)
        }
    } else {
        tracing::warn!("TLS disabled: callers cannot be identified and every call will be denied");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn plaintext_when_tls_disabled() {
        let identity = load_tls(&TlsConfig::default()).await.unwrap();
        assert!(identity.is_none());
    }

    #[tokio::test]
    async fn incomplete_tls_is_an_error() {
        let config = TlsConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(matches!(
            load_tls(&config).await,
            Err(NodeError::IncompleteTls)
        ));
    }

    #[tokio::test]
    async fn insecure_fallback_when_allowed() {
        let config = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.crt")),
            cert_path: Some(PathBuf::from("/nonexistent/server.crt")),
            key_path: Some(PathBuf::from("/nonexistent/server.key")),
            allow_insecure: true,
            ..Default::default()
        };
        assert!(load_tls(&config).await.unwrap().is_none());

        let strict = TlsConfig {
            allow_insecure: false,
            ..config
        };
        assert!(matches!(load_tls(&strict).await, Err(NodeError::Tls(_))));
    }
}
