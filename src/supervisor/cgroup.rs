//! Per-computation cgroup v2 resource limits.
//!
//! Each enforced computation gets its own group under
//! `/sys/fs/cgroup/arras/`. Memory enforcement writes `memory.max` (or
//! `memory.high` when loaning is allowed, so the kernel reclaims before
//! killing); cpu enforcement writes a `cpu.max` quota. The spawned child
//! is attached via `cgroup.procs`.

use std::fs;
use std::path::PathBuf;

use crate::{NodeError, Result};

/// Default cgroup v2 mount point.
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// cpu.max period in microseconds.
const CPU_PERIOD_USEC: u64 = 100_000;

/// A per-process control group.
#[derive(Debug)]
pub struct Cgroup {
    dir: PathBuf,
}

impl Cgroup {
    /// Create `arras/<name>` under the cgroup root.
    ///
    /// # Errors
    ///
    /// `NodeError::Io` when the hierarchy cannot be created (typically the
    /// agent lacks permission or cgroup v2 is not mounted).
    pub fn create(name: &str) -> Result<Self> {
        let dir = PathBuf::from(CGROUP_ROOT).join("arras").join(name);
        fs::create_dir_all(&dir).map_err(|err| {
            NodeError::Io(format!("cannot create cgroup {}: {err}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    /// Limit memory to `assigned_mb`.
    ///
    /// With `loan_pool_mb` set, `memory.high` carries the assignment and
    /// `memory.max` the pool ceiling, letting the computation borrow
    /// unreserved memory while reclaim pressure starts at its own share.
    ///
    /// # Errors
    ///
    /// `NodeError::Io` when the limit files cannot be written.
    pub fn set_memory_limit(&self, assigned_mb: u64, loan_pool_mb: Option<u64>) -> Result<()> {
        let assigned_bytes = assigned_mb << 20;
        match loan_pool_mb {
            Some(pool_mb) => {
                self.write("memory.high", &assigned_bytes.to_string())?;
                self.write("memory.max", &(pool_mb << 20).to_string())
            }
            None => self.write("memory.max", &assigned_bytes.to_string()),
        }
    }

    /// Limit cpu to `cores` worth of quota.
    ///
    /// # Errors
    ///
    /// `NodeError::Io` when `cpu.max` cannot be written.
    pub fn set_cpu_limit(&self, cores: f64) -> Result<()> {
        let quota = ((cores * CPU_PERIOD_USEC as f64).round() as u64).max(1000);
        self.write("cpu.max", &format!("{quota} {CPU_PERIOD_USEC}"))
    }

    /// Attach a process to the group.
    ///
    /// # Errors
    ///
    /// `NodeError::Io` when `cgroup.procs` cannot be written.
    pub fn add_pid(&self, pid: u32) -> Result<()> {
        self.write("cgroup.procs", &pid.to_string())
    }

    /// Remove the group directory. The group must be empty, which it is
    /// once the child has exited.
    pub fn remove(&self) {
        let _ = fs::remove_dir(&self.dir);
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        let path = self.dir.join(file);
        fs::write(&path, value)
            .map_err(|err| NodeError::Io(format!("cannot write {}: {err}", path.display())))
    }
}
