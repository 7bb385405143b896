// Process module - node process lifecycle management

pub mod launcher;
pub mod limits;
mod managed;
pub mod monitor;
mod types;

pub use launcher::{ExitOutcome, LaunchSpec, Launched};
pub use limits::{LimitBreach, ResourceLimits};
pub use managed::{
    ManagedProcess, StateChangeFn, StatsUpdateFn, DEFAULT_MONITOR_INTERVAL, DEFAULT_STOP_TIMEOUT,
};
pub use monitor::{StatsReader, StatsSample};
pub use types::{ProcessState, ProcessStats};
