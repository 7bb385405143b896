use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Lifecycle state of a managed node process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    /// Not running
    Stopped,
    /// Being spawned
    Starting,
    /// Active
    Running,
    /// Being terminated
    Stopping,
    /// Exited unexpectedly
    Crashed,
    /// Failed to start
    Failed,
    /// Exceeded its execution timeout
    Timeout,
    /// Hit a memory or CPU ceiling
    ResourceLimit,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Crashed => write!(f, "crashed"),
            ProcessState::Failed => write!(f, "failed"),
            ProcessState::Timeout => write!(f, "timeout"),
            ProcessState::ResourceLimit => write!(f, "resource-limit"),
        }
    }
}

/// Runtime statistics for one managed process, refreshed by its monitoring
/// loop. Owned exclusively by the `ManagedProcess`; callers get snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessStats {
    /// OS process id of the current incarnation, if any
    pub pid: Option<u32>,

    /// When the current incarnation was launched
    pub started_at: Option<SystemTime>,

    /// CPU usage in percent, as sampled by the OS accounting reader
    pub cpu_usage: f32,

    /// Current resident memory in bytes
    pub memory_bytes: u64,

    /// Largest resident memory observed in bytes
    pub peak_memory_bytes: u64,

    /// Open file descriptor count
    pub open_fds: usize,

    /// Exit code of the last collected incarnation, if it exited normally
    pub exit_code: Option<i32>,

    /// Human-readable reason for the last exit
    pub exit_reason: Option<String>,

    /// Automatic restart attempts performed so far
    pub restarts: u32,

    /// When the last automatic restart was scheduled
    pub last_restart: Option<SystemTime>,
}

impl ProcessStats {
    /// Time since launch, or zero when no process is attached.
    pub fn uptime(&self) -> Duration {
        match (self.pid, self.started_at) {
            (Some(_), Some(started_at)) => SystemTime::now()
                .duration_since(started_at)
                .unwrap_or(Duration::ZERO),
            _ => Duration::ZERO,
        }
    }

    /// Current resident memory in megabytes.
    pub fn memory_mb(&self) -> f64 {
        self.memory_bytes as f64 / (1024.0 * 1024.0)
    }

    pub(crate) fn record_launch(&mut self, pid: u32, started_at: SystemTime) {
        self.pid = Some(pid);
        self.started_at = Some(started_at);
        self.cpu_usage = 0.0;
        self.memory_bytes = 0;
        self.open_fds = 0;
        self.exit_code = None;
        self.exit_reason = None;
    }
}
