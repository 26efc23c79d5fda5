
use std::collections::HashSet;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use job_worker::config::{CgroupConfig, WorkerConfig};
use job_worker::error::{ErrorKind, JobError};
use job_worker::worker::cgroup::{BlockDevice, CpuMax, ResourceLimits};
use job_worker::worker::{JobStatus, JobSupervisor};
use test_harness::{args, assert_eventually, collect_stream, test_supervisor, test_worker_config};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_job_ids_are_unique() {
    let (_dir, supervisor) = test_supervisor();

    let mut ids = HashSet::new();
    for _ in 0..20 {
        let id = supervisor.start("true", &[]).await.unwrap();
        assert!(ids.insert(id), "duplicate job id {}", id);
    }
    assert_eq!(supervisor.list().await.len(), 20);
}

#[tokio::test]
async fn test_running_job_reports_running() {
    let (_dir, supervisor) = test_supervisor();
    let id = supervisor.start("sleep", &args(&["5"])).await.unwrap();

    let snapshot = supervisor.status(&id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Running);
    assert!(snapshot.exit_code.is_none());
    assert!(snapshot.ended_at.is_none());

    supervisor.stop(&id).await.unwrap();
}

#[tokio::test]
async fn test_stop_marks_job_stopped() {
    let (_dir, supervisor) = test_supervisor();
    let id = supervisor.start("sleep", &args(&["5"])).await.unwrap();

    supervisor.stop(&id).await.unwrap();
    assert_eq!(supervisor.status(&id).await.unwrap().status, JobStatus::Stopped);

    let snapshot = supervisor.wait(&id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Stopped);
    assert_eq!(snapshot.signal, Some(9));
    assert_eq!(snapshot.exit_code, Some(137));
    assert!(snapshot.ended_at.is_some());
}

#[tokio::test]
async fn test_status_right_after_stop_has_exit_code() {
    let (_dir, supervisor) = test_supervisor();
    let id = supervisor.start("sleep", &args(&["5"])).await.unwrap();

    supervisor.stop(&id).await.unwrap();
    let snapshot = supervisor.status(&id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Stopped);
    assert_eq!(snapshot.exit_code, Some(137));
    assert_eq!(snapshot.signal, Some(9));
}

#[tokio::test]
async fn test_stop_racing_natural_exit() {
    let (_dir, supervisor) = test_supervisor();

    for _ in 0..50 {
        let id = supervisor.start("true", &[]).await.unwrap();
        supervisor.stop(&id).await.unwrap();

        let after_stop = supervisor.status(&id).await.unwrap();
        assert!(
            matches!(after_stop.status, JobStatus::Stopped | JobStatus::Finished),
            "unexpected status {:?}",
            after_stop.status
        );
        assert!(after_stop.exit_code.is_some());

        let snapshot = supervisor.wait(&id).await.unwrap();
        assert_eq!(snapshot.status, after_stop.status);
        assert_eq!(snapshot.exit_code, after_stop.exit_code);
        if snapshot.status == JobStatus::Finished {
            assert_eq!(snapshot.exit_code, Some(0));
        }
    }
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (_dir, supervisor) = test_supervisor();
    let id = supervisor.start("sleep", &args(&["5"])).await.unwrap();

    supervisor.stop(&id).await.unwrap();
    let first = supervisor.wait(&id).await.unwrap();

    supervisor.stop(&id).await.unwrap();
    let second = supervisor.status(&id).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_stopped_job_never_becomes_finished() {
    let (_dir, supervisor) = test_supervisor();
    let id = supervisor.start("sleep", &args(&["5"])).await.unwrap();

    supervisor.stop(&id).await.unwrap();
    supervisor.wait(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(supervisor.status(&id).await.unwrap().status, JobStatus::Stopped);
}

#[tokio::test]
async fn test_natural_exit_records_exit_code() {
    let (_dir, supervisor) = test_supervisor();
    let id = supervisor
        .start("sh", &args(&["-c", "exit 3"]))
        .await
        .unwrap();

    let snapshot = supervisor.wait(&id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Finished);
    assert_eq!(snapshot.exit_code, Some(3));
    assert!(snapshot.signal.is_none());
}

#[tokio::test]
async fn test_stop_after_finish_keeps_status() {
    let (_dir, supervisor) = test_supervisor();
    let id = supervisor.start("true", &[]).await.unwrap();

    let finished = supervisor.wait(&id).await.unwrap();
    assert_eq!(finished.status, JobStatus::Finished);
    assert_eq!(finished.exit_code, Some(0));

    supervisor.stop(&id).await.unwrap();
    assert_eq!(supervisor.status(&id).await.unwrap(), finished);
}

#[tokio::test]
async fn test_concurrent_stops_all_succeed() {
    let (_dir, supervisor) = test_supervisor();
    let id = supervisor.start("sleep", &args(&["5"])).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.stop(&id).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let snapshot = supervisor.wait(&id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Stopped);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let (_dir, supervisor) = test_supervisor();
    let id = Uuid::new_v4();

    assert!(matches!(supervisor.stop(&id).await, Err(JobError::NotFound(_))));
    assert!(matches!(supervisor.status(&id).await, Err(JobError::NotFound(_))));
    let output = supervisor.output(CancellationToken::new(), &id).await;
    assert!(matches!(output, Err(JobError::NotFound(_))));
}

#[tokio::test]
async fn test_spawn_failure_leaves_nothing_behind() {
    let (dir, supervisor) = test_supervisor();

    let err = supervisor
        .start("/nonexistent/definitely-not-a-command", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Spawn { .. }));
    assert_eq!(err.kind(), ErrorKind::Internal);

    assert!(supervisor.list().await.is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_log_file_named_after_job() {
    let (dir, supervisor) = test_supervisor();
    let id = supervisor
        .start("sh", &args(&["-c", "echo out; echo err >&2"]))
        .await
        .unwrap();
    supervisor.wait(&id).await.unwrap();

    let path = dir.path().join(format!("{}.log", id));
    assert_eq!(supervisor.log_path(&id), path);

    let contents = std::fs::read_to_string(path).unwrap();
    assert!(contents.contains("out\n"));
    assert!(contents.contains("err\n"));
}

#[tokio::test]
async fn test_output_of_finished_job_ends() {
    let (_dir, supervisor) = test_supervisor();
    let id = supervisor
        .start("sh", &args(&["-c", "echo hello; echo world"]))
        .await
        .unwrap();

    let stream = supervisor
        .output(CancellationToken::new(), &id)
        .await
        .unwrap();
    let (chunks, err) = collect_stream(stream, WAIT).await;

    assert!(err.is_none());
    assert_eq!(chunks.concat(), b"hello\nworld\n");
}

#[tokio::test]
async fn test_output_of_stopped_job_ends() {
    let (_dir, supervisor) = test_supervisor();
    let id = supervisor
        .start("sh", &args(&["-c", "echo started; sleep 30"]))
        .await
        .unwrap();

    let stream = supervisor
        .output(CancellationToken::new(), &id)
        .await
        .unwrap();

    let log = supervisor.log_path(&id);
    assert_eventually(
        || {
            let log = log.clone();
            async move { std::fs::read_to_string(log).is_ok_and(|s| s.contains("started")) }
        },
        WAIT,
        "job never wrote its first line",
    )
    .await;
    supervisor.stop(&id).await.unwrap();

    let (chunks, err) = collect_stream(stream, WAIT).await;
    assert!(err.is_none());
    assert_eq!(chunks.concat(), b"started\n");
}

#[tokio::test]
async fn test_cancelling_output_does_not_affect_job() {
    let (_dir, supervisor) = test_supervisor();
    let id = supervisor.start("sleep", &args(&["5"])).await.unwrap();

    let cancel = CancellationToken::new();
    let stream = supervisor.output(cancel.clone(), &id).await.unwrap();
    cancel.cancel();

    let (_, err) = collect_stream(stream, Duration::from_secs(2)).await;
    assert!(err.is_none());
    assert_eq!(supervisor.status(&id).await.unwrap().status, JobStatus::Running);

    supervisor.stop(&id).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_running_jobs() {
    let (_dir, supervisor) = test_supervisor();
    let running = supervisor.start("sleep", &args(&["30"])).await.unwrap();
    let done = supervisor.start("true", &[]).await.unwrap();
    supervisor.wait(&done).await.unwrap();

    tokio::time::timeout(WAIT, supervisor.shutdown())
        .await
        .expect("shutdown did not finish");

    let summaries = supervisor.list().await;
    assert_eq!(summaries.len(), 2);
    for summary in summaries {
        let expected = if summary.id == running {
            JobStatus::Stopped
        } else {
            JobStatus::Finished
        };
        assert_eq!(summary.snapshot.status, expected);
        assert!(summary.snapshot.exit_code.is_some());
    }
}

#[tokio::test]
async fn test_limits_written_to_job_cgroup() {
    let logs = TempDir::new().unwrap();
    let cgroups = TempDir::new().unwrap();
    let config = WorkerConfig {
        cgroup: CgroupConfig {
            enabled: true,
            root: cgroups.path().to_path_buf(),
            defaults: ResourceLimits {
                io_device: Some(BlockDevice { major: 8, minor: 0 }),
                ..ResourceLimits::default()
            },
        },
        ..test_worker_config(logs.path())
    };
    let supervisor = JobSupervisor::new(&config);

    let limits = ResourceLimits {
        cpu_max: Some(CpuMax {
            quota_us: 50_000,
            period_us: 100_000,
        }),
        memory_max: Some(10_000_000),
        ..ResourceLimits::default()
    };
    let id = supervisor
        .start_with_limits("sleep", &args(&["5"]), &limits)
        .await
        .unwrap();

    let group = cgroups.path().join(id.to_string());
    let read = |file: &str| std::fs::read_to_string(group.join(file)).unwrap();
    assert_eq!(read("cpu.max"), "50000 100000");
    assert_eq!(read("memory.max"), "10000000");
    assert_eq!(read("io.max"), "8:0 wbps=1048576");
    let pid: u32 = read("cgroup.procs").trim().parse().unwrap();
    assert!(pid > 0);

    supervisor.stop(&id).await.unwrap();
    supervisor.wait(&id).await.unwrap();
}

#[tokio::test]
async fn test_limit_failure_is_a_start_failure() {
    let logs = TempDir::new().unwrap();
    let not_a_dir = logs.path().join("cgroup-root");
    std::fs::write(&not_a_dir, "").unwrap();

    let config = WorkerConfig {
        cgroup: CgroupConfig {
            enabled: true,
            root: not_a_dir,
            defaults: ResourceLimits::default(),
        },
        ..test_worker_config(logs.path())
    };
    let supervisor = JobSupervisor::new(&config);

    let err = supervisor
        .start("sleep", &args(&["5"]))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Cgroup(_)));
    assert!(supervisor.list().await.is_empty());

    // Only the file standing in for the cgroup root is left.
    assert_eq!(std::fs::read_dir(logs.path()).unwrap().count(), 1);
}
