use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::auth::{authenticate, AccessController};
use crate::grpc::job_service::JobService;
use crate::proto::job_worker_server::JobWorkerServer;
use crate::tls::TlsIdentity;
use crate::worker::JobSupervisor;

pub struct GrpcServer {
    addr: SocketAddr,
    supervisor: Arc<JobSupervisor>,
    access: Arc<AccessController>,
    tls_identity: Option<TlsIdentity>,
}

impl GrpcServer {
    pub fn new(
        addr: SocketAddr,
        supervisor: Arc<JobSupervisor>,
        access: Arc<AccessController>,
        tls_identity: Option<TlsIdentity>,
    ) -> Self {
        Self {
            addr,
            supervisor,
            access,
            tls_identity,
        }
    }

    /// Serves until `shutdown` is cancelled, then kills the remaining jobs
    /// and waits for their watchers.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let service = JobService::new(
            self.supervisor.clone(),
            self.access.clone(),
            shutdown.clone(),
        );

        let mut builder = Server::builder();
        if let Some(ref tls_identity) = self.tls_identity {
            builder = builder.tls_config(tls_identity.server_tls_config())?;
            tracing::info!(addr = %self.addr, "Starting gRPC server with mTLS");
        } else {
            tracing::warn!(
                addr = %self.addr,
                "Starting gRPC server without TLS, every call will be denied"
            );
        }

        let result = builder
            .add_service(JobWorkerServer::with_interceptor(service, authenticate))
            .serve_with_shutdown(self.addr, shutdown.cancelled_owned())
            .await;

        self.supervisor.shutdown().await;
        result
    }
}
