//! Launch a child process confined to a memory ceiling, a CPU-rate cap, and optionally one CPU.
//!
//! The limits live in a fresh cgroup v2 directory. The child moves itself into that cgroup
//! between fork and exec, so it never runs a single instruction of the target program outside
//! of it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use thiserror::Error;
use tracing::{debug, warn};

pub const CPU_PERIOD_US: u64 = 100_000;
pub const MIN_MEMORY_MB: f64 = 1.0;
pub const MAX_MEMORY_MB: f64 = 100_000.0;
pub const MIN_CPU_RATE: f64 = 0.01;
pub const MAX_CPU_RATE: f64 = 1.0;
// Pinned to the second processor (affinity mask 0x2).
pub const AFFINITIZE_CPUS: &str = "1";

#[derive(Debug, Error)]
pub enum JobError {
    #[error("memory limit must be between 1 and 100000 MB (got {0})")]
    InvalidMemoryLimit(f64),

    #[error("cpu rate hard cap must be between 0.01 and 1 (got {0})")]
    InvalidCpuRate(f64),

    #[error("failure in {op} for {path}: {source}")]
    Cgroup {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for the child: {0}")]
    Wait(#[source] io::Error),
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct JobLimits {
    pub memory_limit_bytes: Option<u64>,
    /// Fraction of the whole machine's CPU time.
    pub cpu_rate_hard_cap: Option<f64>,
    pub affinitize: bool,
}

impl JobLimits {
    pub fn new(memory_mb: Option<f64>, cpu_rate_hard_cap: Option<f64>, affinitize: bool) -> Result<Self, JobError> {
        if let Some(mb) = memory_mb {
            if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&mb) {
                return Err(JobError::InvalidMemoryLimit(mb));
            }
        }
        if let Some(cap) = cpu_rate_hard_cap {
            if !(MIN_CPU_RATE..=MAX_CPU_RATE).contains(&cap) {
                return Err(JobError::InvalidCpuRate(cap));
            }
        }
        Ok(Self {
            memory_limit_bytes: memory_mb.map(crate::units::mb_to_bytes),
            cpu_rate_hard_cap,
            affinitize,
        })
    }

    pub fn is_unlimited(&self) -> bool {
        self.memory_limit_bytes.is_none() && self.cpu_rate_hard_cap.is_none() && !self.affinitize
    }

    /// The `(file, contents)` pairs to write into the cgroup directory, in order.
    pub fn cgroup_settings(&self, n_cpus: usize) -> Vec<(&'static str, String)> {
        let mut settings = Vec::new();
        if self.affinitize {
            settings.push(("cpuset.cpus", AFFINITIZE_CPUS.to_string()));
        }
        if let Some(bytes) = self.memory_limit_bytes {
            settings.push(("memory.max", bytes.to_string()));
            // Without this the kernel would page the job out instead of holding it to the limit.
            settings.push(("memory.swap.max", "0".to_string()));
        }
        if let Some(cap) = self.cpu_rate_hard_cap {
            settings.push(("cpu.max", cpu_max_line(cap, CPU_PERIOD_US, n_cpus)));
        }
        settings
    }
}

/// cgroup v2 `cpu.max` for a cap expressed as a fraction of all `n_cpus` processors.
pub fn cpu_max_line(cap: f64, period_us: u64, n_cpus: usize) -> String {
    let quota = (cap * period_us as f64 * n_cpus as f64).round().max(1000.0) as u64;
    format!("{quota} {period_us}")
}

/// A cgroup directory that is removed again when dropped.
#[derive(Debug)]
pub struct Job {
    dir: PathBuf,
}

impl Job {
    pub fn create(cgroup_root: &Path, name: &str, limits: &JobLimits, n_cpus: usize) -> Result<Self, JobError> {
        let dir = cgroup_root.join(name);
        fs::create_dir(&dir).map_err(|source| JobError::Cgroup { op: "create", path: dir.clone(), source })?;
        let job = Self { dir };
        for (file, contents) in limits.cgroup_settings(n_cpus) {
            let path = job.dir.join(file);
            debug!(path = %path.display(), contents = %contents, "setting limit");
            fs::write(&path, contents).map_err(|source| JobError::Cgroup { op: "write", path, source })?;
        }
        Ok(job)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start `command` inside this job.
    pub fn spawn(&self, command: &mut Command) -> Result<Child, JobError> {
        let procs_path = self.dir.join("cgroup.procs");
        let procs = open_for_write(&procs_path).map_err(|source| JobError::Cgroup { op: "open", path: procs_path, source })?;
        // SAFETY: the hook only makes a raw write(2) on an fd opened before the fork.
        unsafe {
            std::os::unix::process::CommandExt::pre_exec(command, move || {
                // Writing "0" moves the writing process itself.
                rustix::io::write(&procs, b"0")?;
                Ok(())
            });
        }
        command.spawn().map_err(|source| JobError::Spawn { command: describe(command), source })
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir(&self.dir) {
            warn!(path = %self.dir.display(), error = %e, "could not remove cgroup");
        }
    }
}

fn open_for_write(path: &Path) -> io::Result<rustix::fd::OwnedFd> {
    use rustix::fs::{Mode, OFlags, open};
    Ok(open(path, OFlags::WRONLY | OFlags::CLOEXEC, Mode::empty())?)
}

fn describe(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}

/// Run `command` under `limits` and wait for it. Returns the child's pid and exit code (1 when
/// it was killed by a signal).
pub fn run_in_job(cgroup_root: &Path, limits: &JobLimits, command: &mut Command) -> Result<(u32, i32), JobError> {
    let (pid, status) = if limits.is_unlimited() {
        let mut child = command.spawn().map_err(|source| JobError::Spawn { command: describe(command), source })?;
        (child.id(), child.wait().map_err(JobError::Wait)?)
    } else {
        let n_cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let name = format!("run_in_job-{}", std::process::id());
        let job = Job::create(cgroup_root, &name, limits, n_cpus)?;
        let mut child = job.spawn(command)?;
        let status = child.wait().map_err(JobError::Wait)?;
        (child.id(), status)
    };
    Ok((pid, status.code().unwrap_or(1)))
}
