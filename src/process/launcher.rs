//! Stateless OS-facing process primitives.
//!
//! Everything here operates on raw pids so the rest of the crate stays
//! agnostic to how children are tracked. All operations are idempotent and
//! safe to call on an already-dead pid; escalation from graceful to forced
//! termination is a deliberate caller decision.

use crate::error::{HerdError, Result};
use crate::process::limits::ResourceLimits;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything needed to spawn one node process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Path to the executable to run
    pub executable: PathBuf,

    /// Command-line arguments
    pub args: Vec<String>,

    /// Environment variables
    pub env: HashMap<String, String>,

    /// Working directory for the process
    pub working_dir: Option<PathBuf>,

    /// Resource ceilings applied inside the child before exec
    pub limits: ResourceLimits,

    /// Detach the child into its own session
    pub new_session: bool,

    /// Apply kernel rlimit ceilings at spawn time. When disabled the limits
    /// are still enforced by the monitoring loop, just not by the kernel.
    pub apply_rlimits: bool,

    /// Redirect child stdout to this file (null when absent)
    pub stdout_file: Option<PathBuf>,

    /// Redirect child stderr to this file (null when absent)
    pub stderr_file: Option<PathBuf>,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            executable: PathBuf::new(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            limits: ResourceLimits::default(),
            new_session: false,
            apply_rlimits: true,
            stdout_file: None,
            stderr_file: None,
        }
    }
}

impl LaunchSpec {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }
}

/// Result of a successful launch.
#[derive(Debug, Clone, Copy)]
pub struct Launched {
    pub pid: u32,
    pub started_at: SystemTime,
}

/// Collected exit status of a reaped child.
#[derive(Debug, Clone)]
pub struct ExitOutcome {
    /// Exit code when the child exited normally
    pub code: Option<i32>,
    /// Human-readable description of how the child went away
    pub reason: String,
}

/// Spawn a node process from the provided spec.
///
/// Resource ceilings, scheduling priority, and session detachment are
/// applied inside the child between fork and exec. The returned pid stays a
/// direct child of the caller, which owns reaping it via [`try_reap`] or
/// [`reap_blocking`].
pub fn launch(spec: &LaunchSpec) -> Result<Launched> {
    if spec.executable.as_os_str().is_empty() {
        return Err(HerdError::InvalidArgument(
            "executable path is empty".to_string(),
        ));
    }

    let mut command = Command::new(&spec.executable);
    command.args(&spec.args);

    if let Some(ref dir) = spec.working_dir {
        command.current_dir(dir);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    command.stdin(Stdio::null());
    command.stdout(output_target(spec.stdout_file.as_deref())?);
    command.stderr(output_target(spec.stderr_file.as_deref())?);

    let limits = spec.limits.clone();
    let apply_rlimits = spec.apply_rlimits;
    let new_session = spec.new_session;
    unsafe {
        command.pre_exec(move || {
            if apply_rlimits {
                set_child_rlimits(&limits)?;
            }
            if limits.nice_level != 0 {
                // Best effort; an unprivileged supervisor cannot raise priority
                nix::libc::nice(limits.nice_level);
            }
            if new_session {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(|e| {
        HerdError::LaunchFailure(format!("'{}': {}", spec.executable.display(), e))
    })?;

    let pid = child.id();
    debug!(executable = %spec.executable.display(), pid, "spawned node process");

    // The handle is dropped on purpose: the caller tracks the pid and reaps
    // it through waitpid, which keeps restart-spawned children and the
    // original under the same collection path.
    drop(child);

    Ok(Launched {
        pid,
        started_at: SystemTime::now(),
    })
}

fn output_target(path: Option<&Path>) -> Result<Stdio> {
    match path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            Ok(Stdio::from(file))
        }
        None => Ok(Stdio::null()),
    }
}

/// Runs in the child between fork and exec.
fn set_child_rlimits(limits: &ResourceLimits) -> std::io::Result<()> {
    use nix::sys::resource::{setrlimit, Resource, RLIM_INFINITY};

    let memory_bytes = limits.max_memory_mb.saturating_mul(1024 * 1024);
    setrlimit(Resource::RLIMIT_AS, memory_bytes, memory_bytes)?;

    setrlimit(
        Resource::RLIMIT_NOFILE,
        limits.max_open_files,
        limits.max_open_files,
    )?;

    let cpu_secs = limits.timeout.as_secs();
    setrlimit(Resource::RLIMIT_CPU, cpu_secs, cpu_secs)?;

    let core = if limits.enable_core_dumps {
        RLIM_INFINITY
    } else {
        0
    };
    setrlimit(Resource::RLIMIT_CORE, core, core)?;

    Ok(())
}

/// Gracefully stop a process: SIGTERM, then poll liveness until it exits or
/// the timeout elapses. Never escalates to SIGKILL on its own.
pub async fn terminate(pid: u32, timeout: Duration) -> Result<()> {
    let target = checked_pid(pid)?;

    match signal::kill(target, Signal::SIGTERM) {
        Ok(()) => {}
        // Already gone counts as terminated
        Err(Errno::ESRCH) => return Ok(()),
        Err(e) => {
            return Err(HerdError::SystemError(format!(
                "failed to send SIGTERM to {pid}: {e}"
            )))
        }
    }

    let deadline = Instant::now() + timeout;
    loop {
        if !is_running(pid) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(HerdError::Timeout(format!(
                "process {pid} did not exit within {timeout:?}"
            )));
        }
        tokio::time::sleep(TERMINATE_POLL_INTERVAL).await;
    }
}

/// Request a graceful stop without waiting for the exit.
pub fn signal_stop(pid: u32) -> Result<()> {
    let target = checked_pid(pid)?;
    match signal::kill(target, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(HerdError::SystemError(format!(
            "failed to send SIGTERM to {pid}: {e}"
        ))),
    }
}

/// Forcibly stop a process with SIGKILL.
pub fn kill(pid: u32) -> Result<()> {
    let target = checked_pid(pid)?;
    match signal::kill(target, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(HerdError::SystemError(format!(
            "failed to send SIGKILL to {pid}: {e}"
        ))),
    }
}

/// Liveness probe using the zero-effect signal.
///
/// An exited-but-unreaped child still accepts signals, so the process state
/// from `/proc` is consulted to tell zombies apart from live processes.
pub fn is_running(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    !is_zombie(pid)
}

fn is_zombie(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // The state field follows the parenthesized command name
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map(|rest| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Non-blocking reap. Returns the exit outcome once the child's status has
/// been collected, `None` while it is still alive.
pub fn try_reap(pid: u32) -> Option<ExitOutcome> {
    match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => Some(ExitOutcome {
            code: Some(code),
            reason: format!("exited with code {code}"),
        }),
        Ok(WaitStatus::Signaled(_, sig, _)) => Some(ExitOutcome {
            code: None,
            reason: format!("killed by {sig}"),
        }),
        Ok(_) => None,
        // Not our child anymore: nothing left to collect
        Err(Errno::ECHILD) => Some(ExitOutcome {
            code: None,
            reason: "already collected".to_string(),
        }),
        Err(_) => None,
    }
}

/// Blocking reap, used during teardown once the child is known to be dead or
/// dying. Returns `None` when there was nothing to collect.
pub fn reap_blocking(pid: u32) -> Option<ExitOutcome> {
    match waitpid(Pid::from_raw(pid as i32), None) {
        Ok(WaitStatus::Exited(_, code)) => Some(ExitOutcome {
            code: Some(code),
            reason: format!("exited with code {code}"),
        }),
        Ok(WaitStatus::Signaled(_, sig, _)) => Some(ExitOutcome {
            code: None,
            reason: format!("killed by {sig}"),
        }),
        _ => None,
    }
}

fn checked_pid(pid: u32) -> Result<Pid> {
    if pid == 0 {
        return Err(HerdError::InvalidArgument("pid must be positive".to_string()));
    }
    Ok(Pid::from_raw(pid as i32))
}
