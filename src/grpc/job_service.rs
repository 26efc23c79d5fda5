use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::auth::{AccessController, Method};
use crate::error::{ErrorKind, JobError};
use crate::proto::job_worker_server::JobWorker;
use crate::proto::{
    GetJobStatusRequest, GetJobStatusResponse, GetOutputStreamRequest, JobStatus as ProtoJobStatus,
    OutputChunk, StartJobRequest, StartJobResponse, StopJobRequest, StopJobResponse,
};
use crate::worker::{JobStatus, JobSupervisor, StatusSnapshot};

type OutputChunkStream = Pin<Box<dyn Stream<Item = Result<OutputChunk, Status>> + Send>>;

/// gRPC front of the job supervisor. Every call is authorized against the
/// identity the `authenticate` interceptor attached to the request.
pub struct JobService {
    supervisor: Arc<JobSupervisor>,
    access: Arc<AccessController>,
    /// Cancelled on server shutdown; every output stream runs under a child.
    shutdown: CancellationToken,
}

impl JobService {
    pub fn new(
        supervisor: Arc<JobSupervisor>,
        access: Arc<AccessController>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            supervisor,
            access,
            shutdown,
        }
    }
}

#[tonic::async_trait]
impl JobWorker for JobService {
    type GetOutputStreamStream = OutputChunkStream;

    async fn start_job(
        &self,
        request: Request<StartJobRequest>,
    ) -> Result<Response<StartJobResponse>, Status> {
        let caller = self
            .access
            .authorize_request(&request, Method::StartJob, None)?;
        let req = request.into_inner();

        if req.command.trim().is_empty() {
            return Err(Status::invalid_argument("Command cannot be empty"));
        }

        let job_id = self
            .supervisor
            .start(&req.command, &req.args)
            .await
            .map_err(|e| to_status(e, "start"))?;

        if let Err(e) = self.access.record_owner(&caller, job_id) {
            // A job nobody can reach is killed rather than left running.
            tracing::error!(job_id = %job_id, caller = %caller.name, error = %e, "Failed to record job owner");
            if let Err(e) = self.supervisor.stop(&job_id).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to stop orphaned job");
            }
            return Err(Status::internal("Internal error"));
        }

        tracing::info!(job_id = %job_id, caller = %caller.name, "Job submitted");
        Ok(Response::new(StartJobResponse {
            job_id: job_id.to_string(),
        }))
    }

    async fn stop_job(
        &self,
        request: Request<StopJobRequest>,
    ) -> Result<Response<StopJobResponse>, Status> {
        let job_id = request.get_ref().job_id.clone();
        let caller = self
            .access
            .authorize_request(&request, Method::StopJob, Some(&job_id))?;

        let id = parse_job_id(&job_id)?;
        self.supervisor
            .stop(&id)
            .await
            .map_err(|e| to_status(e, "stop"))?;

        tracing::info!(job_id = %id, caller = %caller.name, "Job stop handled");
        Ok(Response::new(StopJobResponse {}))
    }

    async fn get_job_status(
        &self,
        request: Request<GetJobStatusRequest>,
    ) -> Result<Response<GetJobStatusResponse>, Status> {
        let job_id = request.get_ref().job_id.clone();
        self.access
            .authorize_request(&request, Method::GetJobStatus, Some(&job_id))?;

        let id = parse_job_id(&job_id)?;
        let snapshot = self
            .supervisor
            .status(&id)
            .await
            .map_err(|e| to_status(e, "status"))?;

        Ok(Response::new(status_response(&id, &snapshot)))
    }

    async fn get_output_stream(
        &self,
        request: Request<GetOutputStreamRequest>,
    ) -> Result<Response<Self::GetOutputStreamStream>, Status> {
        // The target is only known once the request message has arrived.
        let job_id = request.get_ref().job_id.clone();
        let caller = self
            .access
            .authorize_request(&request, Method::GetOutputStream, Some(&job_id))?;

        let id = parse_job_id(&job_id)?;
        let cancel = self.shutdown.child_token();
        let output = self
            .supervisor
            .output(cancel.clone(), &id)
            .await
            .map_err(|e| to_status(e, "output"))?;

        tracing::debug!(job_id = %id, caller = %caller.name, "Output stream opened");

        // Dropped together with the response stream when the caller goes away.
        let guard = cancel.drop_guard();
        let stream = output.map(move |chunk| {
            let _guard = &guard;
            chunk
                .map(|data| OutputChunk { data })
                .map_err(|e| to_status(e, "output"))
        });

        Ok(Response::new(Box::pin(stream)))
    }
}

/// Malformed IDs cannot name a job.
fn parse_job_id(job_id: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(job_id).map_err(|_| Status::from(JobError::NotFound(job_id.to_string())))
}

/// Logs failures the caller will only see as an opaque status.
fn to_status(err: JobError, operation: &str) -> Status {
    if matches!(err.kind(), ErrorKind::Internal | ErrorKind::InvalidState) {
        tracing::error!(operation, error = %err, "Job operation failed");
    }
    err.into()
}

fn status_to_proto(status: JobStatus) -> ProtoJobStatus {
    match status {
        JobStatus::Running => ProtoJobStatus::Running,
        JobStatus::Stopped => ProtoJobStatus::Stopped,
        JobStatus::Finished => ProtoJobStatus::Finished,
    }
}

fn status_response(id: &Uuid, snapshot: &StatusSnapshot) -> GetJobStatusResponse {
    GetJobStatusResponse {
        job_id: id.to_string(),
        status: status_to_proto(snapshot.status).into(),
        exit_code: snapshot.exit_code,
        signal: snapshot.signal,
        started_at_ms: snapshot.started_at.timestamp_millis(),
        ended_at_ms: snapshot.ended_at.map(|t| t.timestamp_millis()),
    }
}
