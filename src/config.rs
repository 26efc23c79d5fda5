use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::worker::cgroup::ResourceLimits;

/// Configuration for the per-job cgroup isolation.
#[derive(Debug, Clone)]
pub struct CgroupConfig {
    /// When false, limits are not applied and no cgroup is ever created.
    pub enabled: bool,
    /// Parent group under which one group per job is created.
    pub root: PathBuf,
    /// Limits applied when a start request does not specify its own.
    pub defaults: ResourceLimits,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("/sys/fs/cgroup"),
            defaults: ResourceLimits::default(),
        }
    }
}

impl CgroupConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Tuning for output streaming.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Maximum size of a single output chunk.
    pub chunk_size: usize,
    /// Number of chunks buffered between the tailer and the caller.
    pub channel_capacity: usize,
    /// Re-read interval used in case a file notification is lost.
    pub rescan_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            channel_capacity: 32,
            rescan_interval: Duration::from_secs(1),
        }
    }
}

/// Configuration of the job supervisor itself.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Directory holding one `<job_id>.log` per job.
    pub log_dir: PathBuf,
    pub cgroup: CgroupConfig,
    pub stream: StreamConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_dir: std::env::temp_dir(),
            cgroup: CgroupConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    pub fn with_cgroup(mut self, cgroup: CgroupConfig) -> Self {
        self.cgroup = cgroup;
        self
    }
}

/// TLS configuration for the gRPC endpoint.
///
/// Callers are identified by their client certificate, so a server without
/// complete TLS material cannot authorize any call.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    pub enabled: bool,

    /// CA certificate (PEM) used to verify peer certificates.
    pub ca_cert_path: Option<PathBuf>,

    /// This endpoint's certificate (PEM).
    pub cert_path: Option<PathBuf>,

    /// Private key (PEM) matching `cert_path`.
    pub key_path: Option<PathBuf>,

    /// Name expected in the server certificate when connecting as a client.
    pub server_name: Option<String>,

    /// Start in plaintext with a warning instead of failing when TLS material
    /// is incomplete. Every call is then denied.
    pub allow_insecure: bool,
}

impl TlsConfig {
    /// Check if TLS is properly configured with all required files.
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub worker: WorkerConfig,
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8010)),
            worker: WorkerConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }
}
