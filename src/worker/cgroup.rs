//! cgroup v2 resource limits for job processes.
//!
//! Every job gets its own group `<root>/<job_id>`. Limits are written before
//! the process is attached, so a job is never observed inside a group whose
//! limits are only partially configured.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::sys::stat::{major, minor, stat};
use thiserror::Error;
use uuid::Uuid;

use crate::config::CgroupConfig;

const CONTROLLERS: &str = "+cpu +memory +io";

/// 60% of one CPU.
pub const DEFAULT_CPU_MAX: CpuMax = CpuMax {
    quota_us: 60_000,
    period_us: 100_000,
};

/// 50MB.
pub const DEFAULT_MEMORY_MAX: u64 = 50_000_000;

/// 1MiB/s.
pub const DEFAULT_WRITE_BPS: u64 = 1_048_576;

#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("failed to create cgroup {path:?}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {file} for cgroup {path:?}: {source}")]
    Write {
        path: PathBuf,
        file: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("no block device for io.max; set one explicitly")]
    NoIoDevice,

    #[error("failed to remove cgroup {path:?}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// CPU bandwidth as written to `cpu.max`: `quota` microseconds of CPU time
/// per `period` microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMax {
    pub quota_us: u64,
    pub period_us: u64,
}

/// Block device the `io.max` limits apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDevice {
    pub major: u64,
    pub minor: u64,
}

impl BlockDevice {
    /// Device holding the filesystem `path` lives on. Filesystems without a
    /// backing block device (tmpfs, overlay) report major 0 and yield `None`.
    pub fn of_path(path: &Path) -> Option<Self> {
        let st = stat(path).ok()?;
        let dev = st.st_dev as u64;
        let device = Self {
            major: major(dev),
            minor: minor(dev),
        };
        (device.major != 0).then_some(device)
    }
}

impl FromStr for CpuMax {
    type Err = String;

    /// Parses the `cpu.max` form `"<quota> <period>"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let (Some(quota), Some(period), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("expected \"<quota> <period>\", got {:?}", s));
        };
        let quota_us = quota.parse().map_err(|e| format!("invalid quota {:?}: {}", quota, e))?;
        let period_us: u64 = period
            .parse()
            .map_err(|e| format!("invalid period {:?}: {}", period, e))?;
        if period_us == 0 {
            return Err("period must be positive".to_string());
        }
        Ok(Self {
            quota_us,
            period_us,
        })
    }
}

impl FromStr for BlockDevice {
    type Err = String;

    /// Parses `"<major>:<minor>"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once(':')
            .ok_or_else(|| format!("expected \"<major>:<minor>\", got {:?}", s))?;
        Ok(Self {
            major: major.trim().parse().map_err(|e| format!("invalid major: {}", e))?,
            minor: minor.trim().parse().map_err(|e| format!("invalid minor: {}", e))?,
        })
    }
}

/// Per-job ceilings. Unset fields fall back to the limiter defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_max: Option<CpuMax>,
    pub memory_max: Option<u64>,
    pub io_device: Option<BlockDevice>,
    pub read_bps: Option<u64>,
    pub write_bps: Option<u64>,
    pub read_iops: Option<u64>,
    pub write_iops: Option<u64>,
}

impl ResourceLimits {
    fn has_io_limits(&self) -> bool {
        self.read_bps.is_some()
            || self.write_bps.is_some()
            || self.read_iops.is_some()
            || self.write_iops.is_some()
    }
}

/// Builds the `io.max` line for `device`, falling back to the default write
/// bandwidth when no I/O limit was requested.
pub fn io_max_line(device: BlockDevice, limits: &ResourceLimits) -> String {
    let mut line = format!("{}:{}", device.major, device.minor);
    if !limits.has_io_limits() {
        let _ = write!(line, " wbps={}", DEFAULT_WRITE_BPS);
        return line;
    }
    if let Some(v) = limits.read_bps {
        let _ = write!(line, " rbps={}", v);
    }
    if let Some(v) = limits.write_bps {
        let _ = write!(line, " wbps={}", v);
    }
    if let Some(v) = limits.read_iops {
        let _ = write!(line, " riops={}", v);
    }
    if let Some(v) = limits.write_iops {
        let _ = write!(line, " wiops={}", v);
    }
    line
}

/// Applies and removes per-job cgroups under a configured root.
///
/// A disabled limiter performs no filesystem access at all, for hosts (and
/// tests) without a writable cgroup hierarchy.
#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    root: PathBuf,
    enabled: bool,
    defaults: ResourceLimits,
}

impl ResourceLimiter {
    pub fn new(config: &CgroupConfig) -> Self {
        Self {
            root: config.root.clone(),
            enabled: config.enabled,
            defaults: config.defaults.clone(),
        }
    }

    /// Like [`ResourceLimiter::new`], but when no default block device is
    /// configured the one backing `dir` is used for `io.max`.
    pub fn with_device_of(config: &CgroupConfig, dir: &Path) -> Self {
        let mut limiter = Self::new(config);
        if limiter.enabled && limiter.defaults.io_device.is_none() {
            limiter.defaults.io_device = BlockDevice::of_path(dir);
            match limiter.defaults.io_device {
                Some(device) => tracing::info!(
                    dir = ?dir,
                    device = %format!("{}:{}", device.major, device.minor),
                    "Using block device of log directory for io.max"
                ),
                None => tracing::warn!(
                    dir = ?dir,
                    "No block device found for log directory; jobs will fail to start until one is configured"
                ),
            }
        }
        limiter
    }

    pub fn group_path(&self, job_id: &Uuid) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Creates the job's group, writes every limit and finally moves `pid`
    /// into it. Any failing step fails the whole call, including a missing
    /// block device for `io.max`.
    pub fn apply_limits(
        &self,
        job_id: &Uuid,
        pid: u32,
        limits: &ResourceLimits,
    ) -> Result<(), CgroupError> {
        if !self.enabled {
            return Ok(());
        }
        let device = limits
            .io_device
            .or(self.defaults.io_device)
            .ok_or(CgroupError::NoIoDevice)?;

        // Controllers are enabled on the parent so that the child group gets
        // the corresponding interface files.
        write_file(&self.root, "cgroup.subtree_control", CONTROLLERS)?;

        let path = self.group_path(job_id);
        fs::create_dir_all(&path).map_err(|source| CgroupError::Create {
            path: path.clone(),
            source,
        })?;

        let cpu = limits
            .cpu_max
            .or(self.defaults.cpu_max)
            .unwrap_or(DEFAULT_CPU_MAX);
        write_file(
            &path,
            "cpu.max",
            &format!("{} {}", cpu.quota_us, cpu.period_us),
        )?;

        let memory = limits
            .memory_max
            .or(self.defaults.memory_max)
            .unwrap_or(DEFAULT_MEMORY_MAX);
        write_file(&path, "memory.max", &memory.to_string())?;

        let io_limits = if limits.has_io_limits() {
            limits
        } else {
            &self.defaults
        };
        write_file(&path, "io.max", &io_max_line(device, io_limits))?;

        // Attaching is always last: the process must not run in a group
        // whose limits are not all in place.
        write_file(&path, "cgroup.procs", &pid.to_string())?;

        tracing::debug!(job_id = %job_id, pid, path = ?path, "Applied cgroup limits");
        Ok(())
    }

    /// Removes the job's group and any sub-groups. A group that is already
    /// gone counts as removed.
    pub fn remove(&self, job_id: &Uuid) -> Result<(), CgroupError> {
        if !self.enabled {
            return Ok(());
        }
        let path = self.group_path(job_id);
        remove_group(&path).map_err(|source| CgroupError::Remove { path, source })
    }
}

fn write_file(dir: &Path, file: &'static str, value: &str) -> Result<(), CgroupError> {
    fs::write(dir.join(file), value).map_err(|source| CgroupError::Write {
        path: dir.to_path_buf(),
        file,
        source,
    })
}

fn remove_group(path: &Path) -> io::Result<()> {
    // cgroupfs directories only hold interface files, which rmdir ignores,
    // so the fast path succeeds unless there are sub-groups.
    match fs::remove_dir(path) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(_) => {}
    }

    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            remove_group(&entry.path())?;
        }
    }

    match fs::remove_dir(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
