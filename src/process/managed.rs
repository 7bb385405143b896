//! One node's full lifecycle: state machine, resource accounting, a
//! dedicated monitoring loop, crash detection, bounded auto-restart, and
//! leak-free teardown.

use crate::error::Result;
use crate::process::launcher::{self, LaunchSpec};
use crate::process::limits::{LimitBreach, ResourceLimits};
use crate::process::monitor::StatsReader;
use crate::process::types::{ProcessState, ProcessStats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default grace period for `stop` before escalation to SIGKILL
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default polling interval for the per-process monitoring loop
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Grace period granted when the monitoring loop itself forces a stop
const FORCE_STOP_GRACE: Duration = Duration::from_secs(2);

/// Observer for state transitions, invoked as `(old, new)`.
pub type StateChangeFn = dyn Fn(ProcessState, ProcessState) + Send + Sync;

/// Observer for stats refreshes.
pub type StatsUpdateFn = dyn Fn(&ProcessStats) + Send + Sync;

/// Handle to one supervised node process. Clones share the same underlying
/// process, so a handle can be kept by the fleet while background tasks hold
/// their own.
#[derive(Clone)]
pub struct ManagedProcess {
    inner: Arc<ProcessInner>,
}

struct ProcessInner {
    node_id: String,

    /// Launch configuration; replaced wholesale by `configure`
    spec: Mutex<LaunchSpec>,

    // Each piece of shared state sits behind its own lock. No two of these
    // are held at the same time when a callback may fire.
    state: Mutex<ProcessState>,
    stats: Mutex<ProcessStats>,
    callbacks: Mutex<Callbacks>,
    /// Spawned-but-unreaped child pids
    children: Mutex<Vec<u32>>,

    /// Armed while crashes should trigger an automatic restart
    should_restart: AtomicBool,
    /// Caller-facing restart policy switch; `start` re-arms from this
    auto_restart: AtomicBool,

    monitoring: AtomicBool,
    monitor_wake: Notify,
    monitor_task: Mutex<Option<JoinHandle<()>>>,

    /// At most one restart attempt is in flight; the slot owner joins the
    /// previous task before installing a new one
    restart_task: Mutex<Option<JoinHandle<()>>>,

    /// Serializes start/stop/restart/kill against each other and against the
    /// monitoring loop's own interventions
    lifecycle: tokio::sync::Mutex<()>,

    reader: Mutex<StatsReader>,
}

#[derive(Default)]
struct Callbacks {
    on_state_change: Vec<Arc<StateChangeFn>>,
    on_stats_update: Vec<Arc<StatsUpdateFn>>,
}

/// Poison-tolerant lock helper; state must stay reachable for teardown even
/// after a panicked callback.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ManagedProcess {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ProcessInner {
                node_id: node_id.into(),
                spec: Mutex::new(LaunchSpec::default()),
                state: Mutex::new(ProcessState::Stopped),
                stats: Mutex::new(ProcessStats::default()),
                callbacks: Mutex::new(Callbacks::default()),
                children: Mutex::new(Vec::new()),
                should_restart: AtomicBool::new(false),
                auto_restart: AtomicBool::new(true),
                monitoring: AtomicBool::new(false),
                monitor_wake: Notify::new(),
                monitor_task: Mutex::new(None),
                restart_task: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                reader: Mutex::new(StatsReader::new()),
            }),
        }
    }

    /// Replace the launch configuration. Must happen before `start`; the
    /// default spec fails launch with an empty-executable error.
    pub fn configure(&self, spec: LaunchSpec) {
        *lock(&self.inner.spec) = spec;
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn state(&self) -> ProcessState {
        self.inner.state()
    }

    /// Snapshot of the current runtime statistics.
    pub fn stats(&self) -> ProcessStats {
        lock(&self.inner.stats).clone()
    }

    pub fn limits(&self) -> ResourceLimits {
        lock(&self.inner.spec).limits.clone()
    }

    /// Pids spawned by this process that have not been reaped yet.
    pub fn tracked_children(&self) -> Vec<u32> {
        lock(&self.inner.children).clone()
    }

    /// True when the state machine says running and the OS confirms it.
    pub fn is_running(&self) -> bool {
        if self.inner.state() != ProcessState::Running {
            return false;
        }
        match lock(&self.inner.stats).pid {
            Some(pid) => launcher::is_running(pid),
            None => false,
        }
    }

    /// Running and within every resource ceiling.
    pub fn is_healthy(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let stats = self.stats();
        self.limits().breach(&stats).is_none()
    }

    /// Enable or disable crash-triggered restarts. Always cleared internally
    /// before a deliberate stop.
    pub fn set_auto_restart(&self, enabled: bool) {
        self.inner.auto_restart.store(enabled, Ordering::Release);
        self.inner.should_restart.store(enabled, Ordering::Release);
    }

    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(ProcessState, ProcessState) + Send + Sync + 'static,
    {
        lock(&self.inner.callbacks)
            .on_state_change
            .push(Arc::new(callback));
    }

    pub fn on_stats_update<F>(&self, callback: F)
    where
        F: Fn(&ProcessStats) + Send + Sync + 'static,
    {
        lock(&self.inner.callbacks)
            .on_stats_update
            .push(Arc::new(callback));
    }

    /// Launch the configured process. A no-op success while already
    /// `Running` or `Starting`; resets the restart counter.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.start_locked(true)
    }

    /// Gracefully stop, escalating to SIGKILL when the timeout elapses. On
    /// return the process is guaranteed non-running.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.stop_locked(timeout).await
    }

    /// Stop, wait out the restart delay, start again.
    pub async fn restart(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.restart_locked().await
    }

    /// Unconditional forced stop.
    pub async fn kill(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.kill_locked()
    }

    /// Begin the background monitoring loop. Idempotent.
    pub fn start_monitoring(&self, interval: Duration) {
        if self.inner.monitoring.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            debug!(node = %inner.node_id, ?interval, "monitoring started");
            while inner.monitoring.load(Ordering::Acquire) {
                monitor_tick(&inner).await;
                tokio::select! {
                    _ = inner.monitor_wake.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!(node = %inner.node_id, "monitoring stopped");
        });
        *lock(&self.inner.monitor_task) = Some(handle);
    }

    /// Stop the monitoring loop and wait for it to wind down. Idempotent.
    pub async fn stop_monitoring(&self) {
        self.inner.monitoring.store(false, Ordering::Release);
        self.inner.monitor_wake.notify_one();
        let handle = lock(&self.inner.monitor_task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner.monitoring.load(Ordering::Acquire)
    }

    /// Full teardown: monitoring joined, restarts cancelled and joined, the
    /// process stopped, and every tracked child reaped. After this call no
    /// task or OS process belonging to this object remains.
    pub async fn shutdown(&self) {
        self.stop_monitoring().await;

        self.inner.auto_restart.store(false, Ordering::Release);
        self.inner.should_restart.store(false, Ordering::Release);

        let restart = lock(&self.inner.restart_task).take();
        if let Some(handle) = restart {
            handle.abort();
            let _ = handle.await;
        }

        if self.inner.state() == ProcessState::Running {
            if let Err(e) = self.stop(DEFAULT_STOP_TIMEOUT).await {
                warn!(node = %self.inner.node_id, error = %e, "stop during shutdown failed");
            }
        }

        self.inner.reap_all_blocking();
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("node_id", &self.inner.node_id)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl ProcessInner {
    fn state(&self) -> ProcessState {
        *lock(&self.state)
    }

    /// Publish a state transition and deliver callbacks with no lock held.
    fn set_state(&self, new_state: ProcessState) {
        let old_state = {
            let mut state = lock(&self.state);
            let old = *state;
            *state = new_state;
            old
        };
        if old_state == new_state {
            return;
        }

        debug!(node = %self.node_id, from = %old_state, to = %new_state, "state transition");

        let observers: Vec<Arc<StateChangeFn>> =
            lock(&self.callbacks).on_state_change.to_vec();
        for observer in observers {
            observer(old_state, new_state);
        }
    }

    /// Launch while holding the lifecycle lock. `reset_restarts` is true for
    /// caller-initiated starts; the internal restart path preserves the
    /// counter so the restart bound holds across relaunches.
    fn start_locked(&self, reset_restarts: bool) -> Result<()> {
        match self.state() {
            ProcessState::Running | ProcessState::Starting => return Ok(()),
            _ => {}
        }

        self.set_state(ProcessState::Starting);
        let spec = lock(&self.spec).clone();

        let launched = match launcher::launch(&spec) {
            Ok(launched) => launched,
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "launch failed");
                self.set_state(ProcessState::Failed);
                return Err(e);
            }
        };

        {
            let mut stats = lock(&self.stats);
            stats.record_launch(launched.pid, launched.started_at);
            if reset_restarts {
                stats.restarts = 0;
            }
        }
        lock(&self.children).push(launched.pid);

        self.should_restart
            .store(self.auto_restart.load(Ordering::Acquire), Ordering::Release);
        self.set_state(ProcessState::Running);

        info!(node = %self.node_id, pid = launched.pid, "node process started");
        Ok(())
    }

    async fn stop_locked(&self, timeout: Duration) -> Result<()> {
        let pid = lock(&self.stats).pid;
        let Some(pid) = pid else {
            if self.state() != ProcessState::Stopped {
                self.set_state(ProcessState::Stopped);
            }
            return Ok(());
        };
        if self.state() == ProcessState::Stopped {
            return Ok(());
        }

        self.should_restart.store(false, Ordering::Release);
        self.set_state(ProcessState::Stopping);

        match launcher::terminate(pid, timeout).await {
            Ok(()) => {
                info!(node = %self.node_id, pid, "node process stopped gracefully");
            }
            Err(e) => {
                warn!(node = %self.node_id, pid, error = %e, "graceful stop failed, sending SIGKILL");
                launcher::kill(pid)?;
            }
        }

        self.finalize_exit(pid);
        self.set_state(ProcessState::Stopped);
        Ok(())
    }

    async fn restart_locked(&self) -> Result<()> {
        let delay = lock(&self.spec).limits.restart_delay;
        self.stop_locked(DEFAULT_STOP_TIMEOUT).await?;
        tokio::time::sleep(delay).await;
        self.start_locked(false)
    }

    fn kill_locked(&self) -> Result<()> {
        self.should_restart.store(false, Ordering::Release);

        let pid = lock(&self.stats).pid;
        if let Some(pid) = pid {
            launcher::kill(pid)?;
            self.finalize_exit(pid);
        }
        self.set_state(ProcessState::Stopped);
        Ok(())
    }

    /// Collect the exit status and detach the pid from the stats.
    fn finalize_exit(&self, pid: u32) {
        if let Some(outcome) = launcher::reap_blocking(pid) {
            let mut stats = lock(&self.stats);
            stats.exit_code = outcome.code;
            stats.exit_reason = Some(outcome.reason);
        }
        lock(&self.children).retain(|&p| p != pid);
        lock(&self.stats).pid = None;
    }

    /// Refresh the stats snapshot from OS accounting and notify observers.
    fn refresh_stats(&self) {
        let pid = lock(&self.stats).pid;
        let Some(pid) = pid else { return };

        let sample = lock(&self.reader).sample(pid);
        let snapshot = match sample {
            Ok(sample) => {
                let mut stats = lock(&self.stats);
                stats.cpu_usage = sample.cpu_usage;
                stats.memory_bytes = sample.memory_bytes;
                stats.peak_memory_bytes = stats.peak_memory_bytes.max(sample.memory_bytes);
                stats.open_fds = sample.open_fds;
                stats.clone()
            }
            // Accounting gone means the process exited; the liveness check
            // in the next phase of the tick classifies it
            Err(_) => return,
        };

        let observers: Vec<Arc<StatsUpdateFn>> =
            lock(&self.callbacks).on_stats_update.to_vec();
        for observer in observers {
            observer(&snapshot);
        }
    }

    /// Non-blocking pass over the tracked children, collecting any that have
    /// exited so no zombie outlives its slot in the set.
    fn reap_children(&self) {
        let pids: Vec<u32> = lock(&self.children).clone();
        for pid in pids {
            if let Some(outcome) = launcher::try_reap(pid) {
                debug!(node = %self.node_id, pid, reason = %outcome.reason, "reaped child");
                {
                    let mut stats = lock(&self.stats);
                    if stats.pid == Some(pid) {
                        stats.exit_code = outcome.code;
                        stats.exit_reason = Some(outcome.reason);
                    }
                }
                lock(&self.children).retain(|&p| p != pid);
            }
        }
    }

    /// Immediate stop after a limit breach. Keeps whatever breach state was
    /// just published instead of moving to `Stopped`.
    async fn force_stop(&self, pid: u32) {
        if let Err(e) = launcher::terminate(pid, FORCE_STOP_GRACE).await {
            debug!(node = %self.node_id, pid, error = %e, "escalating forced stop");
            if let Err(e) = launcher::kill(pid) {
                error!(node = %self.node_id, pid, error = %e, "SIGKILL failed");
            }
        }
        self.finalize_exit(pid);
    }

    /// Last-resort synchronous teardown of every tracked child:
    /// graceful-then-forced termination followed by a blocking reap.
    fn reap_all_blocking(&self) {
        let pids: Vec<u32> = {
            let mut children = lock(&self.children);
            std::mem::take(&mut *children)
        };

        for pid in pids {
            if launcher::is_running(pid) {
                let _ = launcher::signal_stop(pid);
                std::thread::sleep(Duration::from_millis(50));
                if launcher::is_running(pid) {
                    let _ = launcher::kill(pid);
                }
            }
            launcher::reap_blocking(pid);
        }
        lock(&self.stats).pid = None;
    }
}

/// One pass of the monitoring loop: refresh accounting, reap exited
/// children, then enforce limits or detect a crash.
async fn monitor_tick(inner: &Arc<ProcessInner>) {
    inner.refresh_stats();
    inner.reap_children();

    if inner.state() != ProcessState::Running {
        return;
    }

    let guard = inner.lifecycle.lock().await;
    // A lifecycle operation may have intervened while the lock was taken
    if inner.state() != ProcessState::Running {
        return;
    }
    let pid = lock(&inner.stats).pid;
    let Some(pid) = pid else { return };

    if launcher::is_running(pid) {
        let stats = lock(&inner.stats).clone();
        let limits = lock(&inner.spec).limits.clone();
        if let Some(breach) = limits.breach(&stats) {
            warn!(
                node = %inner.node_id,
                pid,
                ?breach,
                memory_mb = stats.memory_mb(),
                cpu = stats.cpu_usage,
                "resource limit breached, stopping process"
            );
            // A breach is not a crash: no restart, and the breach state
            // stays visible after the stop
            inner.should_restart.store(false, Ordering::Release);
            inner.set_state(match breach {
                LimitBreach::Timeout => ProcessState::Timeout,
                LimitBreach::Memory | LimitBreach::Cpu => ProcessState::ResourceLimit,
            });
            inner.force_stop(pid).await;
        }
    } else {
        info!(node = %inner.node_id, pid, "node process exited unexpectedly");
        inner.set_state(ProcessState::Crashed);
        drop(guard);

        let (restarts, max_restarts) = {
            let restarts = lock(&inner.stats).restarts;
            (restarts, lock(&inner.spec).limits.max_restarts)
        };
        if inner.should_restart.load(Ordering::Acquire) && restarts < max_restarts {
            schedule_restart(inner).await;
        } else if restarts >= max_restarts {
            warn!(
                node = %inner.node_id,
                restarts,
                "restart limit reached, leaving process crashed"
            );
        }
    }
}

/// Put a one-shot restart attempt in flight. The previous attempt's task is
/// always joined first so only one can ever exist.
async fn schedule_restart(inner: &Arc<ProcessInner>) {
    let previous = lock(&inner.restart_task).take();
    if let Some(handle) = previous {
        handle.abort();
        let _ = handle.await;
    }

    {
        let mut stats = lock(&inner.stats);
        stats.restarts += 1;
        stats.last_restart = Some(SystemTime::now());
    }

    let delay = lock(&inner.spec).limits.restart_delay;
    info!(node = %inner.node_id, ?delay, "scheduling automatic restart");

    let task_inner = Arc::clone(inner);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if !task_inner.should_restart.load(Ordering::Acquire) {
            debug!(node = %task_inner.node_id, "restart cancelled");
            return;
        }
        let _guard = task_inner.lifecycle.lock().await;
        if let Err(e) = task_inner.restart_locked().await {
            error!(node = %task_inner.node_id, error = %e, "automatic restart failed");
        }
    });
    *lock(&inner.restart_task) = Some(handle);
}

impl Drop for ProcessInner {
    fn drop(&mut self) {
        // Background tasks hold their own Arc, so by the time this runs no
        // task references the inner state; any handle left here is finished
        if let Some(handle) = lock(&self.monitor_task).take() {
            handle.abort();
        }
        if let Some(handle) = lock(&self.restart_task).take() {
            handle.abort();
        }
        self.reap_all_blocking();
    }
}
