//! Authorization and error mapping of the gRPC service, driven without a
//! network: requests carry the caller identity the interceptor would attach.


use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Request};
use uuid::Uuid;

use job_worker::auth::{AccessController, OwnershipStore, PeerIdentity, Role};
use job_worker::grpc::JobService;
use job_worker::proto::job_worker_server::JobWorker;
use job_worker::proto::{
    GetJobStatusRequest, GetOutputStreamRequest, JobStatus, StartJobRequest, StopJobRequest,
};
use job_worker::worker::JobSupervisor;
use test_harness::{collect_stream, test_supervisor};

struct Fixture {
    _dir: TempDir,
    supervisor: Arc<JobSupervisor>,
    owners: Arc<OwnershipStore>,
    service: JobService,
}

fn fixture() -> Fixture {
    let (dir, supervisor) = test_supervisor();
    let owners = Arc::new(OwnershipStore::new());
    let access = Arc::new(AccessController::new(owners.clone()));
    let service = JobService::new(supervisor.clone(), access, CancellationToken::new());
    Fixture {
        _dir: dir,
        supervisor,
        owners,
        service,
    }
}

fn admin() -> PeerIdentity {
    PeerIdentity::new("alice", [Role::Admin])
}

fn user(name: &str) -> PeerIdentity {
    PeerIdentity::new(name, [Role::User])
}

fn request<T>(message: T, caller: &PeerIdentity) -> Request<T> {
    let mut request = Request::new(message);
    request.extensions_mut().insert(caller.clone());
    request
}

async fn start(service: &JobService, caller: &PeerIdentity, command: &str, args: &[&str]) -> String {
    service
        .start_job(request(
            StartJobRequest {
                command: command.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
            },
            caller,
        ))
        .await
        .unwrap()
        .into_inner()
        .job_id
}

async fn status(
    service: &JobService,
    caller: &PeerIdentity,
    job_id: &str,
) -> Result<job_worker::proto::GetJobStatusResponse, tonic::Status> {
    service
        .get_job_status(request(
            GetJobStatusRequest {
                job_id: job_id.to_string(),
            },
            caller,
        ))
        .await
        .map(|r| r.into_inner())
}

async fn stop(service: &JobService, caller: &PeerIdentity, job_id: &str) -> Result<(), tonic::Status> {
    service
        .stop_job(request(
            StopJobRequest {
                job_id: job_id.to_string(),
            },
            caller,
        ))
        .await
        .map(|_| ())
}

#[tokio::test]
async fn test_start_records_caller_as_owner() {
    let f = fixture();
    let bob = user("bob");

    let job_id = start(&f.service, &bob, "sleep", &["5"]).await;
    let id = Uuid::parse_str(&job_id).unwrap();
    assert_eq!(f.owners.get_owner(&id).unwrap(), "bob");

    let resp = status(&f.service, &bob, &job_id).await.unwrap();
    assert_eq!(resp.status, JobStatus::Running as i32);
    assert_eq!(resp.exit_code, None);

    stop(&f.service, &bob, &job_id).await.unwrap();
}

#[tokio::test]
async fn test_sleep_scenario() {
    let f = fixture();
    let bob = user("bob");

    let job_id = start(&f.service, &bob, "sleep", &["5"]).await;
    assert_eq!(
        status(&f.service, &bob, &job_id).await.unwrap().status,
        JobStatus::Running as i32
    );

    stop(&f.service, &bob, &job_id).await.unwrap();
    f.supervisor
        .wait(&Uuid::parse_str(&job_id).unwrap())
        .await
        .unwrap();

    let resp = status(&f.service, &bob, &job_id).await.unwrap();
    assert_eq!(resp.status, JobStatus::Stopped as i32);
    assert_eq!(resp.exit_code, Some(137));
    assert_eq!(resp.signal, Some(9));

    // second stop is a no-op
    stop(&f.service, &bob, &job_id).await.unwrap();
    assert_eq!(status(&f.service, &bob, &job_id).await.unwrap(), resp);

    let stream = f
        .service
        .get_output_stream(request(GetOutputStreamRequest { job_id }, &bob))
        .await
        .unwrap()
        .into_inner();
    let (_, err) = collect_stream(stream, Duration::from_secs(5)).await;
    assert!(err.is_none());
}

#[tokio::test]
async fn test_other_user_is_denied() {
    let f = fixture();
    let job_id = start(&f.service, &user("bob"), "sleep", &["5"]).await;
    let mallory = user("mallory");

    let err = status(&f.service, &mallory, &job_id).await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    let err = stop(&f.service, &mallory, &job_id).await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    let err = f
        .service
        .get_output_stream(request(
            GetOutputStreamRequest {
                job_id: job_id.clone(),
            },
            &mallory,
        ))
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), Code::PermissionDenied);

    // the job itself is untouched
    let resp = status(&f.service, &user("bob"), &job_id).await.unwrap();
    assert_eq!(resp.status, JobStatus::Running as i32);
    stop(&f.service, &user("bob"), &job_id).await.unwrap();
}

#[tokio::test]
async fn test_admin_can_manage_any_job() {
    let f = fixture();
    let job_id = start(&f.service, &user("bob"), "sleep", &["5"]).await;

    status(&f.service, &admin(), &job_id).await.unwrap();
    stop(&f.service, &admin(), &job_id).await.unwrap();

    let resp = status(&f.service, &admin(), &job_id).await.unwrap();
    assert_eq!(resp.status, JobStatus::Stopped as i32);
}

#[tokio::test]
async fn test_caller_without_role_is_denied() {
    let f = fixture();
    let nobody = PeerIdentity::new("nobody", []);

    let err = f
        .service
        .start_job(request(
            StartJobRequest {
                command: "true".to_string(),
                args: vec![],
            },
            &nobody,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    assert!(f.supervisor.list().await.is_empty());
}

#[tokio::test]
async fn test_missing_identity_is_denied() {
    let f = fixture();
    let err = f
        .service
        .start_job(Request::new(StartJobRequest {
            command: "true".to_string(),
            args: vec![],
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
}

#[tokio::test]
async fn test_unknown_job() {
    let f = fixture();
    let unknown = Uuid::new_v4().to_string();

    let err = status(&f.service, &admin(), &unknown).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    assert!(err.message().contains(&unknown));

    let err = stop(&f.service, &admin(), &unknown).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    let err = status(&f.service, &admin(), "not-a-uuid").await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    // no owner exists, so a regular user cannot even learn it is unknown
    let err = status(&f.service, &user("bob"), &unknown).await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
}

#[tokio::test]
async fn test_empty_command_is_rejected() {
    let f = fixture();
    let err = f
        .service
        .start_job(request(
            StartJobRequest {
                command: "  ".to_string(),
                args: vec![],
            },
            &user("bob"),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_spawn_failure_is_opaque() {
    let f = fixture();
    let err = f
        .service
        .start_job(request(
            StartJobRequest {
                command: "/nonexistent/secret-tool".to_string(),
                args: vec![],
            },
            &user("bob"),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert!(!err.message().contains("nonexistent"));
    assert!(f.owners.is_empty());
}

#[tokio::test]
async fn test_output_stream_delivers_job_output() {
    let f = fixture();
    let bob = user("bob");
    let job_id = start(&f.service, &bob, "sh", &["-c", "echo one; echo two"]).await;

    let stream = f
        .service
        .get_output_stream(request(GetOutputStreamRequest { job_id }, &bob))
        .await
        .unwrap()
        .into_inner();
    let (chunks, err) = collect_stream(stream, Duration::from_secs(5)).await;

    assert!(err.is_none());
    let data: Vec<u8> = chunks.into_iter().flat_map(|c| c.data).collect();
    assert_eq!(data, b"one\ntwo\n");
}

#[tokio::test]
async fn test_shutdown_token_ends_open_streams() {
    let (_dir, supervisor) = test_supervisor();
    let access = Arc::new(AccessController::new(Arc::new(OwnershipStore::new())));
    let shutdown = CancellationToken::new();
    let service = JobService::new(supervisor.clone(), access, shutdown.clone());
    let bob = user("bob");

    let job_id = start(&service, &bob, "sleep", &["5"]).await;
    let stream = service
        .get_output_stream(request(GetOutputStreamRequest { job_id: job_id.clone() }, &bob))
        .await
        .unwrap()
        .into_inner();

    shutdown.cancel();
    let (_, err) = collect_stream(stream, Duration::from_secs(2)).await;
    assert!(err.is_none());

    stop(&service, &bob, &job_id).await.unwrap();
}
