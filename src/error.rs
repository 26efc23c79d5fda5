use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tonic::Status;

use crate::worker::cgroup::CgroupError;

/// Category of a [`JobError`] as seen by callers.
///
/// Everything that is not a missing job or a corrupted state is `Internal`
/// and is surfaced without any detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    Internal,
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid job state: {0}")]
    InvalidState(String),

    #[error("Failed to create log file {path:?}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to apply resource limits: {0}")]
    Cgroup(#[from] CgroupError),

    #[error("Failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: i32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("Failed to watch log file: {0}")]
    Watch(#[from] notify::Error),

    #[error("Failed to read log file: {0}")]
    Read(#[source] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::NotFound(_) => ErrorKind::NotFound,
            JobError::InvalidState(_) => ErrorKind::InvalidState,
            JobError::LogFile { .. }
            | JobError::Spawn { .. }
            | JobError::Cgroup(_)
            | JobError::Signal { .. }
            | JobError::Watch(_)
            | JobError::Read(_)
            | JobError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Converts a core error into the status returned over the wire.
///
/// Only `NotFound` carries the job ID back. Paths, OS error text and internal
/// state never leave the process; log the error before converting it.
impl From<JobError> for Status {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(id) => Status::not_found(format!("Job not found: {}", id)),
            _ => Status::internal("Internal error"),
        }
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
