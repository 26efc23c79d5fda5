use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tracing_subscriber::EnvFilter;

use job_worker::config::{CgroupConfig, ServerConfig, TlsConfig, WorkerConfig};
use job_worker::node::Node;
use job_worker::proto::job_worker_client::JobWorkerClient;
use job_worker::proto::{
    GetJobStatusRequest, GetOutputStreamRequest, JobStatus, StartJobRequest, StopJobRequest,
};
use job_worker::shutdown::install_shutdown_handler;
use job_worker::tls::DEFAULT_SERVER_NAME;
use job_worker::worker::cgroup::{BlockDevice, CpuMax, ResourceLimits};

#[derive(Parser, Debug)]
#[command(name = "job-worker")]
#[command(version)]
#[command(about = "Runs Linux processes on behalf of authenticated clients")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the job worker server
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind the gRPC endpoint to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "8010")]
    port: u16,

    /// Directory for job log files (defaults to the system temp dir)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    // === Resource Limits ===
    /// Parent cgroup under which one group per job is created
    #[arg(long, default_value = "/sys/fs/cgroup")]
    cgroup_root: PathBuf,

    /// Do not confine jobs to cgroups (for hosts without cgroup v2 access)
    #[arg(long)]
    no_cgroups: bool,

    /// CPU bandwidth per job, as "<quota_us> <period_us>"
    #[arg(long)]
    cpu_max: Option<CpuMax>,

    /// Memory ceiling per job, in bytes
    #[arg(long)]
    memory_max: Option<u64>,

    /// Block device for I/O limits, as "<major>:<minor>" (default: the device of --log-dir)
    #[arg(long)]
    io_device: Option<BlockDevice>,

    /// Write bandwidth per job on the I/O device, in bytes per second
    #[arg(long)]
    write_bps: Option<u64>,

    // === TLS Options ===
    /// Enable mutual TLS (required to identify callers)
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate (PEM format) that client certificates chain to
    #[arg(long, requires = "tls")]
    ca_cert: Option<PathBuf>,

    /// Path to server certificate (PEM format)
    #[arg(long, requires = "tls")]
    cert: Option<PathBuf>,

    /// Path to server private key (PEM format)
    #[arg(long, requires = "tls")]
    key: Option<PathBuf>,

    /// Allow running without TLS even when --tls is specified but certs are missing.
    /// Every call is denied in that mode. NOT recommended for production.
    #[arg(long)]
    allow_insecure: bool,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address (use https:// for TLS)
    #[arg(long, short = 'a', default_value = "https://127.0.0.1:8010")]
    addr: String,

    /// Path to CA certificate (PEM format) for TLS
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (PEM format) for mTLS
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to client private key (PEM format) for mTLS
    #[arg(long)]
    key: Option<PathBuf>,

    /// Name expected in the server certificate
    #[arg(long, default_value = DEFAULT_SERVER_NAME)]
    server_name: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Start a new job
    Start {
        /// The program to execute (e.g., "sleep")
        command: String,

        /// Arguments passed to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Kill a running job
    Stop {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Follow the output of a job until it ends (Ctrl-C to detach)
    Logs {
        /// The job ID (UUID)
        job_id: String,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobStartOutput {
    job_id: String,
}

#[derive(Serialize)]
struct JobStopOutput {
    job_id: String,
    stopped: bool,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_id: String,
    status: String,
    exit_code: Option<i32>,
    signal: Option<i32>,
    started_at_ms: i64,
    ended_at_ms: Option<i64>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn job_status_to_string(status: i32) -> String {
    match JobStatus::try_from(status) {
        Ok(JobStatus::Running) => "RUNNING".to_string(),
        Ok(JobStatus::Stopped) => "STOPPED".to_string(),
        Ok(JobStatus::Finished) => "FINISHED".to_string(),
        _ => "UNKNOWN".to_string(),
    }
}

fn format_timestamp(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

async fn create_client_channel(args: &ClientArgs) -> Result<Channel, Box<dyn std::error::Error>> {
    let endpoint = Channel::from_shared(args.addr.clone())?;

    // Check if TLS is configured
    let has_tls = args.ca_cert.is_some() || args.addr.starts_with("https://");

    if has_tls {
        let mut tls_config = ClientTlsConfig::new().domain_name(args.server_name.clone());

        if let Some(ca_path) = &args.ca_cert {
            let ca_cert_data = tokio::fs::read(ca_path).await?;
            tls_config = tls_config.ca_certificate(Certificate::from_pem(ca_cert_data));
        }

        // The client certificate is the caller's identity
        if let (Some(cert_path), Some(key_path)) = (&args.cert, &args.key) {
            let cert_data = tokio::fs::read(cert_path).await?;
            let key_data = tokio::fs::read(key_path).await?;
            tls_config = tls_config.identity(Identity::from_pem(cert_data, key_data));
        }

        Ok(endpoint.tls_config(tls_config)?.connect().await?)
    } else {
        Ok(endpoint.connect().await?)
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let tls = TlsConfig {
        enabled: args.tls,
        ca_cert_path: args.ca_cert,
        cert_path: args.cert,
        key_path: args.key,
        server_name: None,
        allow_insecure: args.allow_insecure,
    };

    let cgroup = CgroupConfig {
        enabled: !args.no_cgroups,
        root: args.cgroup_root,
        defaults: ResourceLimits {
            cpu_max: args.cpu_max,
            memory_max: args.memory_max,
            io_device: args.io_device,
            write_bps: args.write_bps,
            ..ResourceLimits::default()
        },
    };

    let mut worker = WorkerConfig::default().with_cgroup(cgroup);
    if let Some(log_dir) = args.log_dir {
        tokio::fs::create_dir_all(&log_dir).await?;
        worker = worker.with_log_dir(log_dir);
    }

    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let config = ServerConfig::new(listen_addr)
        .with_worker(worker)
        .with_tls(tls);

    let shutdown = install_shutdown_handler()?;
    Node::new(config).run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_start(
    client: &mut JobWorkerClient<Channel>,
    command: String,
    args: Vec<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let resp = client
        .start_job(StartJobRequest { command, args })
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output = JobStartOutput {
                job_id: resp.job_id,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job started successfully!");
            println!("Job ID: {}", resp.job_id);
        }
    }
    Ok(())
}

async fn handle_job_stop(
    client: &mut JobWorkerClient<Channel>,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    client
        .stop_job(StopJobRequest {
            job_id: job_id.clone(),
        })
        .await?;

    match output_format {
        OutputFormat::Json => {
            let output = JobStopOutput {
                job_id,
                stopped: true,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => println!("Job {} stopped", job_id),
    }
    Ok(())
}

async fn handle_job_status(
    client: &mut JobWorkerClient<Channel>,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .get_job_status(GetJobStatusRequest { job_id })
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output = JobStatusOutput {
                job_id: response.job_id,
                status: job_status_to_string(response.status),
                exit_code: response.exit_code,
                signal: response.signal,
                started_at_ms: response.started_at_ms,
                ended_at_ms: response.ended_at_ms,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID:     {}", response.job_id);
            println!("Status:     {}", job_status_to_string(response.status));
            if let Some(exit_code) = response.exit_code {
                println!("Exit Code:  {}", exit_code);
            }
            if let Some(signal) = response.signal {
                println!("Signal:     {}", signal);
            }
            println!("Started:    {}", format_timestamp(response.started_at_ms));
            if let Some(ended_at_ms) = response.ended_at_ms {
                println!("Ended:      {}", format_timestamp(ended_at_ms));
            }
        }
    }
    Ok(())
}

async fn handle_job_logs(
    client: &mut JobWorkerClient<Channel>,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut stream = client
        .get_output_stream(GetOutputStreamRequest { job_id })
        .await?
        .into_inner();

    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            chunk = stream.next() => match chunk {
                Some(chunk) => {
                    stdout.write_all(&chunk?.data).await?;
                    stdout.flush().await?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            let channel = create_client_channel(&client).await?;
            let mut grpc_client = JobWorkerClient::new(channel);

            match command {
                JobCommands::Start { command, args } => {
                    handle_job_start(&mut grpc_client, command, args, &client.output).await?;
                }
                JobCommands::Stop { job_id } => {
                    handle_job_stop(&mut grpc_client, job_id, &client.output).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&mut grpc_client, job_id, &client.output).await?;
                }
                JobCommands::Logs { job_id } => {
                    handle_job_logs(&mut grpc_client, job_id).await?;
                }
            }
        }
    }

    Ok(())
}
