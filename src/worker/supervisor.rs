use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{JobError, Result};
use crate::worker::cgroup::{ResourceLimiter, ResourceLimits};
use crate::worker::job::{Job, JobSummary, KillOutcome, KillRequest, StatusSnapshot};
use crate::worker::output::{wait_done, OutputStream, OutputStreamer};

/// Pending stop requests per job; callers wait for capacity.
const KILL_QUEUE_DEPTH: usize = 4;

/// Owns the process table.
///
/// Every started job gets a watcher task that owns the child process, waits
/// for it to exit and records the outcome. The table lock only guards
/// insertion and lookup; status changes take the job's own lock.
pub struct JobSupervisor {
    jobs: RwLock<HashMap<Uuid, Arc<Job>>>,
    log_dir: PathBuf,
    limiter: ResourceLimiter,
    streamer: OutputStreamer,
    watchers: TaskTracker,
}

impl JobSupervisor {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            log_dir: config.log_dir.clone(),
            limiter: ResourceLimiter::with_device_of(&config.cgroup, &config.log_dir),
            streamer: OutputStreamer::new(&config.stream),
            watchers: TaskTracker::new(),
        }
    }

    pub fn log_path(&self, id: &Uuid) -> PathBuf {
        self.log_dir.join(format!("{}.log", id))
    }

    /// Starts `command` with the limiter's default limits.
    pub async fn start(&self, command: &str, args: &[String]) -> Result<Uuid> {
        self.start_with_limits(command, args, &ResourceLimits::default())
            .await
    }

    /// Spawns `command` as the leader of a new process group with stdout and
    /// stderr redirected to the job's log file, confines it to its cgroup and
    /// registers it as running.
    pub async fn start_with_limits(
        &self,
        command: &str,
        args: &[String],
        limits: &ResourceLimits,
    ) -> Result<Uuid> {
        let id = self.unused_id().await;
        let log_path = self.log_path(&id);

        let stdout = std::fs::File::options()
            .write(true)
            .create_new(true)
            .open(&log_path)
            .map_err(|source| JobError::LogFile {
                path: log_path.clone(),
                source,
            })?;
        let stderr = match stdout.try_clone() {
            Ok(file) => file,
            Err(source) => {
                remove_log(&id, &log_path);
                return Err(JobError::LogFile {
                    path: log_path,
                    source,
                });
            }
        };

        let spawned = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                remove_log(&id, &log_path);
                return Err(JobError::Spawn {
                    command: command.to_string(),
                    source,
                });
            }
        };

        let Some(pid) = child.id() else {
            // Only possible once the child has been reaped.
            if let Err(e) = child.wait().await {
                tracing::warn!(job_id = %id, error = %e, "Failed to wait for job process");
            }
            remove_log(&id, &log_path);
            return Err(JobError::Internal(format!(
                "process for job {} exited before it was registered",
                id
            )));
        };

        let applied = {
            let limiter = self.limiter.clone();
            let limits = limits.clone();
            tokio::task::spawn_blocking(move || limiter.apply_limits(&id, pid, &limits))
                .await
                .map_err(|e| JobError::Internal(format!("limit task for job {} failed: {}", id, e)))
                .and_then(|applied| applied.map_err(JobError::from))
        };
        if let Err(e) = applied {
            tracing::error!(job_id = %id, pid, error = %e, "Failed to apply limits, killing job");
            if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                tracing::warn!(job_id = %id, pid, error = %err, "Failed to kill unconfined job");
            }
            if let Err(err) = child.wait().await {
                tracing::warn!(job_id = %id, pid, error = %err, "Failed to reap unconfined job");
            }
            remove_cgroup(self.limiter.clone(), id).await;
            remove_log(&id, &log_path);
            return Err(e);
        }

        let (kill_tx, kill_rx) = mpsc::channel(KILL_QUEUE_DEPTH);
        let job = Arc::new(Job::new(
            id,
            command.to_string(),
            args.to_vec(),
            pid,
            log_path,
            kill_tx,
        ));
        self.jobs.write().await.insert(id, job.clone());

        let limiter = self.limiter.clone();
        self.watchers
            .spawn(async move { watch_process(job, child, kill_rx, limiter).await });

        tracing::info!(job_id = %id, pid, command, args = ?args, "Job started");
        Ok(id)
    }

    /// Kills the job's process group and waits until the process has been
    /// reaped, so the exit code is readable as soon as this returns.
    ///
    /// Stopping a job that already ended, or whose process exits while the
    /// signal is being sent, succeeds without changing anything.
    pub async fn stop(&self, id: &Uuid) -> Result<()> {
        let job = self.get(id).await?;

        let terminal = job.is_done() || job.state.lock().await.status.is_terminal();
        if !terminal {
            let (reply_tx, reply_rx) = oneshot::channel();
            // A closed channel or a dropped reply means the watcher already
            // left its loop: the process has exited.
            if job.kill_tx.send(reply_tx).await.is_ok() {
                match reply_rx.await {
                    Ok(Ok(outcome)) => {
                        tracing::info!(job_id = %id, outcome = ?outcome, "Stop requested");
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {}
                }
            }
        }

        // Terminal jobs are always reaped shortly: either they were killed
        // or their exit has already been recorded.
        wait_done(&mut job.subscribe_done()).await;
        Ok(())
    }

    pub async fn status(&self, id: &Uuid) -> Result<StatusSnapshot> {
        let job = self.get(id).await?;
        Ok(job.snapshot().await)
    }

    /// Streams the job's combined stdout/stderr from the beginning, following
    /// new output until the job is done or `cancel` fires.
    pub async fn output(&self, cancel: CancellationToken, id: &Uuid) -> Result<OutputStream> {
        let job = self.get(id).await?;
        self.streamer
            .tail(cancel, &job.log_path, job.subscribe_done())
            .inspect_err(|e| tracing::error!(job_id = %id, error = %e, "Failed to tail output"))
    }

    /// Waits until the job's process has exited and returns its final state.
    pub async fn wait(&self, id: &Uuid) -> Result<StatusSnapshot> {
        let job = self.get(id).await?;
        wait_done(&mut job.subscribe_done()).await;
        Ok(job.snapshot().await)
    }

    pub async fn list(&self) -> Vec<JobSummary> {
        let jobs: Vec<Arc<Job>> = self.jobs.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(jobs.len());
        for job in jobs {
            summaries.push(JobSummary {
                id: job.id,
                command: job.command.clone(),
                args: job.args.clone(),
                snapshot: job.snapshot().await,
            });
        }
        summaries.sort_by_key(|s| s.snapshot.started_at);
        summaries
    }

    /// Kills every running job and waits for all watchers to finish.
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.jobs.read().await.keys().copied().collect();
        tracing::info!(jobs = ids.len(), "Shutting down job supervisor");

        for id in &ids {
            if let Err(e) = self.stop(id).await {
                tracing::warn!(job_id = %id, error = %e, "Failed to stop job during shutdown");
            }
        }

        self.watchers.close();
        self.watchers.wait().await;
        tracing::info!("All job watchers finished");
    }

    async fn get(&self, id: &Uuid) -> Result<Arc<Job>> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    async fn unused_id(&self) -> Uuid {
        let jobs = self.jobs.read().await;
        loop {
            let id = Uuid::new_v4();
            if !jobs.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Owns the child until it exits. Kill requests are served here so the
/// process group is only ever signalled while the child is unreaped, which
/// rules out hitting a recycled PID.
async fn watch_process(
    job: Arc<Job>,
    mut child: Child,
    mut kill_rx: mpsc::Receiver<KillRequest>,
    limiter: ResourceLimiter,
) {
    let pgid = Pid::from_raw(job.pid as i32);

    let exit = loop {
        tokio::select! {
            exit = child.wait() => break exit,
            Some(reply) = kill_rx.recv() => {
                let _ = reply.send(kill_group(&job, pgid).await);
            }
        }
    };

    {
        let mut state = job.state.lock().await;
        match exit {
            Ok(status) => state.record_exit(status),
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to wait for job process");
                state.record_lost();
            }
        }
        tracing::info!(
            job_id = %job.id,
            status = %state.status,
            exit_code = ?state.exit_code,
            signal = ?state.signal,
            "Job exited"
        );
    }

    remove_cgroup(limiter, job.id).await;

    job.mark_done();
}

async fn kill_group(job: &Job, pgid: Pid) -> Result<KillOutcome> {
    let mut state = job.state.lock().await;
    if state.status.is_terminal() {
        return Ok(KillOutcome::AlreadyTerminal);
    }
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => {
            // Marked before the exit is observed so the watcher keeps it.
            state.mark_stopped();
            Ok(KillOutcome::Signalled)
        }
        Err(Errno::ESRCH) => Ok(KillOutcome::AlreadyExited),
        Err(source) => {
            tracing::error!(job_id = %job.id, error = %source, "Failed to signal job");
            Err(JobError::Signal {
                pgid: pgid.as_raw(),
                source,
            })
        }
    }
}

async fn remove_cgroup(limiter: ResourceLimiter, id: Uuid) {
    let removed = tokio::task::spawn_blocking(move || limiter.remove(&id)).await;
    match removed {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(job_id = %id, error = %e, "Failed to remove cgroup"),
        Err(e) => tracing::warn!(job_id = %id, error = %e, "Cgroup removal task failed"),
    }
}

fn remove_log(id: &Uuid, path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::error!(job_id = %id, error = %e, "Unable to remove log file");
    }
}
