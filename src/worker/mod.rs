//! Job execution engine.
//!
//! - [`JobSupervisor`]: starts, stops and inspects jobs, one watcher task per job
//! - [`OutputStreamer`]: follows a job's log file as a live chunk stream
//! - [`ResourceLimiter`]: per-job cgroup v2 CPU, memory and I/O ceilings
//!
//! # Job lifecycle
//!
//! 1. [`JobSupervisor::start`] creates `<log_dir>/<job_id>.log` and spawns the
//!    command as a process group leader writing to it
//! 2. The process is moved into its cgroup, then registered as `Running`
//! 3. The watcher waits for exit and records `Finished`, unless a stop
//!    already marked the job `Stopped`
//! 4. The completion signal fires, letting output streams do a final drain

pub mod cgroup;
pub mod job;
pub mod output;
pub mod supervisor;

pub use cgroup::{ResourceLimiter, ResourceLimits};
pub use job::{Job, JobStatus, JobSummary, StatusSnapshot};
pub use output::{OutputStream, OutputStreamer};
pub use supervisor::JobSupervisor;
