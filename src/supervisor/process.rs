//! Child process spawning and supervision.
//!
//! A [`ProcessHandle`] walks the state machine
//! `NotSpawned → Spawned → Terminating → Exited`. Termination is
//! two-stage: SIGTERM, a grace window, then SIGKILL. Exits are classified
//! and reported to an observer so the agent can distinguish a computation
//! that was told to stop from one that died.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cgroup::Cgroup;
use crate::{NodeError, Result};

/// Time between SIGTERM and SIGKILL on a soft terminate.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// How a child process left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal exit with a code.
    Exit,
    /// Killed by a signal.
    Signal,
    /// Never ran or could not be classified.
    Internal,
}

/// Classified exit of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub kind: ExitKind,
    pub status: i32,
}

impl ExitStatus {
    /// Human-readable reason string, distinguishing expected termination
    /// from an unexpected death.
    #[must_use]
    pub fn describe(&self, expected: bool) -> String {
        match self.kind {
            ExitKind::Exit => {
                if self.status == 0 {
                    "exited normally (code 0)".to_owned()
                } else if expected {
                    format!("stopped as requested (code {})", self.status)
                } else {
                    format!("exited unexpectedly with code {}", self.status)
                }
            }
            ExitKind::Signal => {
                if expected {
                    format!("terminated by signal {} during shutdown", self.status)
                } else {
                    format!("exited due to signal {}", self.status)
                }
            }
            ExitKind::Internal => format!("internal failure (code {})", self.status),
        }
    }
}

/// Lifecycle of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotSpawned,
    Spawned,
    Terminating,
    Exited(ExitStatus),
}

/// Everything needed to launch one computation process.
#[derive(Debug, Clone, Default)]
pub struct SpawnArgs {
    pub program: String,
    pub args: Vec<String>,
    pub environment: HashMap<String, String>,
    pub working_directory: String,
    pub assigned_mb: u64,
    pub assigned_cores: f64,
    pub enforce_memory: bool,
    pub enforce_cores: bool,
    pub cleanup_process_group: bool,
}

impl SpawnArgs {
    /// Resolve `program` against the PATH of the spawn environment,
    /// falling back to the agent's own PATH. Returns false when not found.
    pub fn find_program_in_path(&mut self, program: &str) -> bool {
        let path = self
            .environment
            .get("PATH")
            .cloned()
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_default();
        for dir in path.split(':').filter(|d| !d.is_empty()) {
            let candidate = std::path::Path::new(dir).join(program);
            if candidate.is_file() {
                self.program = candidate.to_string_lossy().into_owned();
                return true;
            }
        }
        false
    }
}

/// Observer notified when a supervised process exits.
pub trait ExitObserver: Send + Sync {
    fn on_exit(&self, id: Uuid, session_id: Uuid, status: ExitStatus);
}

/// A supervised child process.
pub struct ProcessHandle {
    id: Uuid,
    name: String,
    session_id: Uuid,
    limits: CgroupPolicy,
    state: Mutex<ProcessState>,
    pid: Mutex<Option<u32>>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
    cleanup_process_group: Mutex<bool>,
}

#[derive(Debug, Clone, Copy)]
struct CgroupPolicy {
    use_cgroups: bool,
    enforce_memory: bool,
    enforce_cores: bool,
    loan_memory: bool,
    pool_mb: u64,
}

impl ProcessHandle {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Current state snapshot.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.lock_state()
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        *self
            .pid
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Spawn the child and start its supervision task.
    ///
    /// # Errors
    ///
    /// `NodeError::Process` when already spawned or when the OS spawn
    /// fails; the state is left `Exited(Internal)` in the latter case so
    /// status queries report a launch error.
    pub fn spawn(
        self: &Arc<Self>,
        spawn_args: SpawnArgs,
        observer: Option<Arc<dyn ExitObserver>>,
    ) -> Result<()> {
        {
            let mut state = self.lock_state();
            if *state != ProcessState::NotSpawned {
                return Err(NodeError::Process(format!(
                    "process {} already spawned",
                    self.name
                )));
            }
            *state = ProcessState::Spawned;
        }
        *self
            .cleanup_process_group
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) =
            spawn_args.cleanup_process_group;

        let mut command = tokio::process::Command::new(&spawn_args.program);
        command
            .args(&spawn_args.args)
            .env_clear()
            .envs(&spawn_args.environment)
            .kill_on_drop(true)
            .process_group(0);
        if !spawn_args.working_directory.is_empty() {
            command.current_dir(&spawn_args.working_directory);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let status = ExitStatus {
                    kind: ExitKind::Internal,
                    status: -1,
                };
                *self.lock_state() = ProcessState::Exited(status);
                let _ = self.exit_tx.send(Some(status));
                return Err(NodeError::Process(format!(
                    "failed to spawn {} ({}): {err}",
                    self.name, spawn_args.program
                )));
            }
        };

        let pid = child.id().unwrap_or_default();
        *self
            .pid
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(pid);
        info!(session_id = %self.session_id, name = %self.name, pid,
            "spawned computation process");

        let cgroup = self.apply_limits(&spawn_args, pid);

        let handle = Arc::clone(self);
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => classify_exit(status),
                Err(err) => {
                    warn!(name = %handle.name, %err, "failed to wait on child process");
                    ExitStatus {
                        kind: ExitKind::Internal,
                        status: -1,
                    }
                }
            };
            if let Some(cgroup) = cgroup {
                cgroup.remove();
            }
            *handle.lock_state() = ProcessState::Exited(exit);
            let _ = handle.exit_tx.send(Some(exit));
            debug!(session_id = %handle.session_id, name = %handle.name,
                ?exit, "computation process exited");
            if let Some(observer) = observer {
                observer.on_exit(handle.id, handle.session_id, exit);
            }
        });

        Ok(())
    }

    fn apply_limits(&self, spawn_args: &SpawnArgs, pid: u32) -> Option<Cgroup> {
        let policy = self.limits;
        if !policy.use_cgroups || !(policy.enforce_memory || policy.enforce_cores) {
            return None;
        }
        let name = format!("{}-{}", self.name, self.id);
        let cgroup = match Cgroup::create(&name) {
            Ok(cgroup) => cgroup,
            Err(err) => {
                warn!(name = %self.name, %err, "cannot create cgroup; limits not enforced");
                return None;
            }
        };
        if policy.enforce_memory && spawn_args.enforce_memory {
            let loan = policy.loan_memory.then_some(policy.pool_mb);
            if let Err(err) = cgroup.set_memory_limit(spawn_args.assigned_mb, loan) {
                warn!(name = %self.name, %err, "cannot set memory limit");
            }
        }
        if policy.enforce_cores && spawn_args.enforce_cores {
            if let Err(err) = cgroup.set_cpu_limit(spawn_args.assigned_cores) {
                warn!(name = %self.name, %err, "cannot set cpu limit");
            }
        }
        if let Err(err) = cgroup.add_pid(pid) {
            warn!(name = %self.name, %err, "cannot attach process to cgroup");
        }
        Some(cgroup)
    }

    /// Ask the process to stop.
    ///
    /// Soft termination sends SIGTERM and escalates to SIGKILL after
    /// [`TERMINATION_GRACE`]; hard termination kills outright.
    pub fn terminate(self: &Arc<Self>, soft: bool) {
        let pid = {
            let mut state = self.lock_state();
            match *state {
                ProcessState::Spawned | ProcessState::Terminating => {
                    *state = ProcessState::Terminating;
                    self.pid()
                }
                _ => None,
            }
        };
        let Some(pid) = pid else { return };

        let target = self.signal_target(pid);
        if soft {
            send_signal(target, Signal::SIGTERM, &self.name);
            let handle = Arc::clone(self);
            tokio::spawn(async move {
                if !handle.wait_for(TERMINATION_GRACE).await {
                    warn!(name = %handle.name,
                        "process did not exit within grace period, forcing kill");
                    send_signal(target, Signal::SIGKILL, &handle.name);
                }
            });
        } else {
            send_signal(target, Signal::SIGKILL, &self.name);
        }
    }

    /// Wait until the process has exited, bounded by `deadline`.
    /// Returns false on timeout.
    pub async fn wait_until_exit(&self, deadline: tokio::time::Instant) -> bool {
        let mut rx = self.exit_tx.subscribe();
        loop {
            if rx.borrow().is_some() {
                return true;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return rx.borrow().is_some(),
                Err(_) => return false,
            }
        }
    }

    async fn wait_for(&self, window: Duration) -> bool {
        self.wait_until_exit(tokio::time::Instant::now() + window)
            .await
    }

    fn signal_target(&self, pid: u32) -> Pid {
        let cleanup_group = *self
            .cleanup_process_group
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if cleanup_group {
            // negative pid signals the whole process group
            Pid::from_raw(-(pid as i32))
        } else {
            Pid::from_raw(pid as i32)
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ProcessState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn send_signal(target: Pid, signal: Signal, name: &str) {
    if let Err(err) = kill(target, signal) {
        debug!(name, %signal, %err, "signal delivery failed (process may have exited)");
    }
}

fn classify_exit(status: std::process::ExitStatus) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    if let Some(code) = status.code() {
        ExitStatus {
            kind: ExitKind::Exit,
            status: code,
        }
    } else if let Some(signal) = status.signal() {
        ExitStatus {
            kind: ExitKind::Signal,
            status: signal,
        }
    } else {
        ExitStatus {
            kind: ExitKind::Internal,
            status: -1,
        }
    }
}

/// Factory and registry for supervised processes.
pub struct ProcessManager {
    pool_mb: u64,
    use_cgroups: bool,
    enforce_memory: bool,
    enforce_cores: bool,
    loan_memory: bool,
    processes: Mutex<HashMap<Uuid, Arc<ProcessHandle>>>,
}

impl ProcessManager {
    #[must_use]
    pub fn new(
        pool_mb: u64,
        use_cgroups: bool,
        enforce_memory: bool,
        enforce_cores: bool,
        loan_memory: bool,
    ) -> Self {
        Self {
            pool_mb,
            use_cgroups,
            enforce_memory,
            enforce_cores,
            loan_memory,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a process handle.
    #[must_use]
    pub fn add_process(&self, id: Uuid, name: &str, session_id: Uuid) -> Arc<ProcessHandle> {
        let (exit_tx, _) = watch::channel(None);
        let handle = Arc::new(ProcessHandle {
            id,
            name: name.to_owned(),
            session_id,
            limits: CgroupPolicy {
                use_cgroups: self.use_cgroups,
                enforce_memory: self.enforce_memory,
                enforce_cores: self.enforce_cores,
                loan_memory: self.loan_memory,
                pool_mb: self.pool_mb,
            },
            state: Mutex::new(ProcessState::NotSpawned),
            pid: Mutex::new(None),
            exit_tx,
            cleanup_process_group: Mutex::new(true),
        });
        self.processes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, Arc::clone(&handle));
        handle
    }

    pub fn remove_process(&self, id: Uuid) {
        self.processes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&id);
    }

    /// Total memory pool available to computations, in MiB.
    #[must_use]
    pub fn pool_mb(&self) -> u64 {
        self.pool_mb
    }
}
