use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Stopped,
    Finished,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Finished => write!(f, "finished"),
        }
    }
}

/// Point-in-time copy of a job's mutable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub status: JobStatus,
    /// Exit code, or `128 + signal` when the process was killed. `None`
    /// until the process has been reaped.
    pub exit_code: Option<i32>,
    /// Signal that terminated the process, if any.
    pub signal: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub command: String,
    pub args: Vec<String>,
    pub snapshot: StatusSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KillOutcome {
    Signalled,
    AlreadyExited,
    AlreadyTerminal,
}

/// Sent to a job's watcher, which owns the child process, to kill it.
pub(crate) type KillRequest = oneshot::Sender<Result<KillOutcome>>;

#[derive(Debug)]
pub(crate) struct JobState {
    pub(crate) status: JobStatus,
    pub(crate) exit_code: Option<i32>,
    pub(crate) signal: Option<i32>,
    pub(crate) ended_at: Option<DateTime<Utc>>,
}

impl JobState {
    pub(crate) fn new() -> Self {
        Self {
            status: JobStatus::Running,
            exit_code: None,
            signal: None,
            ended_at: None,
        }
    }

    /// Moves a running job to `Stopped`. Terminal states are left alone.
    pub(crate) fn mark_stopped(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Stopped;
        true
    }

    /// Records how the process exited. A job already marked `Stopped` keeps
    /// that status.
    pub(crate) fn record_exit(&mut self, exit: ExitStatus) {
        self.signal = exit.signal();
        self.exit_code = exit.code().or(self.signal.map(|sig| 128 + sig));
        self.finish();
    }

    /// The process is gone but its exit status could not be collected.
    pub(crate) fn record_lost(&mut self) {
        self.exit_code = Some(-1);
        self.finish();
    }

    fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
        if self.status == JobStatus::Running {
            self.status = JobStatus::Finished;
        }
    }
}

/// One supervised process.
///
/// Identity and command are immutable. The mutable state sits behind a
/// per-job lock so that jobs never contend with each other.
#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    pub command: String,
    pub args: Vec<String>,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub log_path: PathBuf,
    pub(crate) state: Mutex<JobState>,
    pub(crate) kill_tx: mpsc::Sender<KillRequest>,
    done: watch::Sender<bool>,
}

impl Job {
    pub(crate) fn new(
        id: Uuid,
        command: String,
        args: Vec<String>,
        pid: u32,
        log_path: PathBuf,
        kill_tx: mpsc::Sender<KillRequest>,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            id,
            command,
            args,
            pid,
            started_at: Utc::now(),
            log_path,
            state: Mutex::new(JobState::new()),
            kill_tx,
            done,
        }
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let state = self.state.lock().await;
        StatusSnapshot {
            status: state.status,
            exit_code: state.exit_code,
            signal: state.signal,
            started_at: self.started_at,
            ended_at: state.ended_at,
        }
    }

    /// Whether the process has exited and been reaped.
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Completion signal: the value flips to `true` exactly once, after the
    /// exit has been recorded.
    pub fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    pub(crate) fn mark_done(&self) {
        self.done.send_replace(true);
    }
}
