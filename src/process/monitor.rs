//! OS process accounting, isolated behind a small reader type so the rest of
//! the crate never touches the platform-specific format directly.

use crate::error::{HerdError, Result};
use sysinfo::{Pid, ProcessRefreshKind, System};

/// One accounting sample for a single process.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSample {
    /// CPU usage in percent since the previous sample
    pub cpu_usage: f32,
    /// Resident memory in bytes
    pub memory_bytes: u64,
    /// Open file descriptor count
    pub open_fds: usize,
}

/// Reads per-process resource usage from the OS.
///
/// Keeps a `sysinfo::System` between samples because CPU percentages are
/// computed from consecutive refreshes.
pub struct StatsReader {
    system: System,
}

impl StatsReader {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Sample resource usage for one pid.
    ///
    /// Fails with `InvalidArgument` for pid 0 and with `SystemError` when the
    /// OS no longer has accounting data, which means the process is gone.
    pub fn sample(&mut self, pid: u32) -> Result<StatsSample> {
        if pid == 0 {
            return Err(HerdError::InvalidArgument(
                "pid must be positive".to_string(),
            ));
        }

        let sys_pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::everything(),
        );

        let process = self.system.process(sys_pid).ok_or_else(|| {
            HerdError::SystemError(format!("no accounting data for pid {pid}"))
        })?;

        Ok(StatsSample {
            cpu_usage: process.cpu_usage(),
            memory_bytes: process.memory(),
            open_fds: open_fd_count(pid),
        })
    }
}

impl Default for StatsReader {
    fn default() -> Self {
        Self::new()
    }
}

fn open_fd_count(pid: u32) -> usize {
    std::fs::read_dir(format!("/proc/{pid}/fd"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}
