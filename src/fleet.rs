//! Fleet-wide supervision: a named collection of managed processes with
//! admission control, batch lifecycle operations, aggregate statistics, and
//! an independent monitoring loop for budget enforcement.

use crate::error::{HerdError, Result};
use crate::manifest::NodeManifest;
use crate::process::{
    LaunchSpec, ManagedProcess, ProcessState, ProcessStats, ResourceLimits,
    DEFAULT_MONITOR_INTERVAL, DEFAULT_STOP_TIMEOUT,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Fleet-wide configuration and defaults.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Limits applied when a manifest does not override them
    pub default_limits: ResourceLimits,
    /// Maximum number of processes the fleet will admit
    pub max_total_processes: usize,
    /// Maximum aggregate resident memory across the fleet, in MB
    pub max_total_memory_mb: u64,
    /// Per-process monitoring interval used by `start_process`
    pub monitor_interval: Duration,
    /// Grace period for fleet-initiated stops
    pub stop_timeout: Duration,
    /// Default interval for the fleet-wide monitoring loop
    pub global_monitor_interval: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            default_limits: ResourceLimits {
                timeout: Duration::from_secs(300),
                ..ResourceLimits::default()
            },
            max_total_processes: 100,
            max_total_memory_mb: 4096,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            global_monitor_interval: Duration::from_secs(10),
        }
    }
}

/// Snapshot of fleet-level statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub total_processes: usize,
    pub running_processes: usize,
    pub crashed_processes: usize,
    pub total_memory_mb: u64,
    pub total_cpu_percent: f32,
    pub uptime: Duration,
    pub total_started: u64,
    pub total_crashed: u64,
    pub total_restarts: u64,
}

/// Handle to a fleet of managed node processes. Clones share the fleet.
#[derive(Clone)]
pub struct FleetManager {
    inner: Arc<FleetInner>,
}

struct FleetInner {
    config: FleetConfig,

    /// Process table. Held only long enough to look a handle up or mutate
    /// the map itself; lifecycle calls happen after release.
    processes: Mutex<HashMap<String, ManagedProcess>>,

    started_at: SystemTime,
    total_started: AtomicU64,
    total_crashed: Arc<AtomicU64>,
    total_restarts: AtomicU64,

    global_monitoring: AtomicBool,
    global_wake: Notify,
    global_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FleetManager {
    pub fn new(config: FleetConfig) -> Self {
        Self {
            inner: Arc::new(FleetInner {
                config,
                processes: Mutex::new(HashMap::new()),
                started_at: SystemTime::now(),
                total_started: AtomicU64::new(0),
                total_crashed: Arc::new(AtomicU64::new(0)),
                total_restarts: AtomicU64::new(0),
                global_monitoring: AtomicBool::new(false),
                global_wake: Notify::new(),
                global_task: Mutex::new(None),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(FleetConfig::default())
    }

    pub fn config(&self) -> &FleetConfig {
        &self.inner.config
    }

    /// Register a new process under `node_id`, derived from the manifest.
    ///
    /// Admission control runs first: the fleet rejects the node with
    /// `ResourceExhausted` when either the process-count or the aggregate
    /// memory budget is already used up. Any process previously registered
    /// under the same id is fully shut down and replaced. The new process is
    /// stored but not started.
    pub async fn create_process(&self, node_id: &str, manifest: &NodeManifest) -> Result<()> {
        self.check_capacity()?;

        let limits = ResourceLimits::from_manifest(manifest, &self.inner.config.default_limits);
        let process = ManagedProcess::new(node_id);

        let mut spec = LaunchSpec::new(&manifest.executable);
        spec.args = manifest.args.clone();
        spec.env = manifest.env.clone();
        spec.working_dir = manifest.working_dir.clone();
        spec.limits = limits;
        process.configure(spec);

        let crashed = Arc::clone(&self.inner.total_crashed);
        process.on_state_change(move |_, new_state| {
            if new_state == ProcessState::Crashed {
                crashed.fetch_add(1, Ordering::Relaxed);
            }
        });

        info!(node = node_id, executable = %manifest.executable.display(), "registered node process");

        let previous = lock(&self.inner.processes).insert(node_id.to_string(), process);
        if let Some(previous) = previous {
            warn!(node = node_id, "replacing existing process registration");
            previous.shutdown().await;
        }
        Ok(())
    }

    fn check_capacity(&self) -> Result<()> {
        let count = self.process_count();
        if count >= self.inner.config.max_total_processes {
            return Err(HerdError::ResourceExhausted(format!(
                "process count {count} is at the fleet limit of {}",
                self.inner.config.max_total_processes
            )));
        }

        let memory_mb = self.total_memory_mb();
        if memory_mb >= self.inner.config.max_total_memory_mb {
            return Err(HerdError::ResourceExhausted(format!(
                "aggregate memory {memory_mb} MB is at the fleet budget of {} MB",
                self.inner.config.max_total_memory_mb
            )));
        }

        Ok(())
    }

    /// Look up a handle to a registered process.
    pub fn get_process(&self, node_id: &str) -> Option<ManagedProcess> {
        lock(&self.inner.processes).get(node_id).cloned()
    }

    fn require(&self, node_id: &str) -> Result<ManagedProcess> {
        self.get_process(node_id)
            .ok_or_else(|| HerdError::ProcessNotFound(node_id.to_string()))
    }

    /// Start a registered process and begin monitoring it.
    pub async fn start_process(&self, node_id: &str) -> Result<()> {
        let process = self.require(node_id)?;
        process.start().await?;
        self.inner.total_started.fetch_add(1, Ordering::Relaxed);
        process.start_monitoring(self.inner.config.monitor_interval);
        Ok(())
    }

    pub async fn stop_process(&self, node_id: &str, timeout: Duration) -> Result<()> {
        let process = self.require(node_id)?;
        process.stop_monitoring().await;
        process.stop(timeout).await
    }

    pub async fn restart_process(&self, node_id: &str) -> Result<()> {
        let process = self.require(node_id)?;
        process.restart().await?;
        self.inner.total_restarts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Fully shut the process down and erase it from the fleet.
    pub async fn remove_process(&self, node_id: &str) -> Result<()> {
        let process = lock(&self.inner.processes)
            .remove(node_id)
            .ok_or_else(|| HerdError::ProcessNotFound(node_id.to_string()))?;
        process.shutdown().await;
        info!(node = node_id, "removed node process");
        Ok(())
    }

    /// Start every registered process. One failure never aborts the batch;
    /// the result maps each node id to its own outcome.
    pub async fn start_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for node_id in self.process_ids() {
            let ok = self.start_process(&node_id).await.is_ok();
            results.insert(node_id, ok);
        }
        results
    }

    pub async fn stop_all(&self, timeout: Duration) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for node_id in self.process_ids() {
            let ok = self.stop_process(&node_id, timeout).await.is_ok();
            results.insert(node_id, ok);
        }
        results
    }

    pub async fn restart_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for node_id in self.process_ids() {
            let ok = self.restart_process(&node_id).await.is_ok();
            results.insert(node_id, ok);
        }
        results
    }

    pub async fn remove_all(&self) {
        for node_id in self.process_ids() {
            let _ = self.remove_process(&node_id).await;
        }
    }

    pub fn process_ids(&self) -> Vec<String> {
        lock(&self.inner.processes).keys().cloned().collect()
    }

    pub fn running_process_ids(&self) -> Vec<String> {
        self.handles()
            .into_iter()
            .filter(|(_, process)| process.is_running())
            .map(|(node_id, _)| node_id)
            .collect()
    }

    pub fn process_count(&self) -> usize {
        lock(&self.inner.processes).len()
    }

    pub fn running_process_count(&self) -> usize {
        self.handles()
            .iter()
            .filter(|(_, process)| process.is_running())
            .count()
    }

    /// Aggregate resident memory of all running processes, in MB.
    pub fn total_memory_mb(&self) -> u64 {
        self.handles()
            .iter()
            .filter(|(_, process)| process.is_running())
            .map(|(_, process)| process.stats().memory_mb() as u64)
            .sum()
    }

    /// Aggregate CPU usage of all running processes, in percent.
    pub fn total_cpu_percent(&self) -> f32 {
        self.handles()
            .iter()
            .filter(|(_, process)| process.is_running())
            .map(|(_, process)| process.stats().cpu_usage)
            .sum()
    }

    /// Per-node stats snapshots.
    pub fn all_process_stats(&self) -> HashMap<String, ProcessStats> {
        self.handles()
            .into_iter()
            .map(|(node_id, process)| (node_id, process.stats()))
            .collect()
    }

    /// Per-node health snapshot: running and within limits.
    pub fn perform_health_check(&self) -> HashMap<String, bool> {
        self.handles()
            .into_iter()
            .map(|(node_id, process)| (node_id, process.is_healthy()))
            .collect()
    }

    pub fn manager_stats(&self) -> ManagerStats {
        let handles = self.handles();
        let running = handles
            .iter()
            .filter(|(_, process)| process.is_running())
            .count();
        let crashed = handles
            .iter()
            .filter(|(_, process)| process.state() == ProcessState::Crashed)
            .count();

        ManagerStats {
            total_processes: handles.len(),
            running_processes: running,
            crashed_processes: crashed,
            total_memory_mb: self.total_memory_mb(),
            total_cpu_percent: self.total_cpu_percent(),
            uptime: SystemTime::now()
                .duration_since(self.inner.started_at)
                .unwrap_or(Duration::ZERO),
            total_started: self.inner.total_started.load(Ordering::Relaxed),
            total_crashed: self.inner.total_crashed.load(Ordering::Relaxed),
            total_restarts: self.inner.total_restarts.load(Ordering::Relaxed),
        }
    }

    /// Start the fleet-wide monitoring loop, independent from each process's
    /// own loop. Logs aggregate health and evicts the largest consumers
    /// while the fleet is over its memory budget. Idempotent.
    pub fn start_global_monitoring(&self, interval: Duration) {
        if self.inner.global_monitoring.swap(true, Ordering::AcqRel) {
            return;
        }

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            debug!(?interval, "fleet monitoring started");
            while manager.inner.global_monitoring.load(Ordering::Acquire) {
                manager.global_tick().await;
                tokio::select! {
                    _ = manager.inner.global_wake.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("fleet monitoring stopped");
        });
        *lock(&self.inner.global_task) = Some(handle);
    }

    /// Stop the fleet-wide loop and wait for it to wind down. Idempotent.
    pub async fn stop_global_monitoring(&self) {
        self.inner.global_monitoring.store(false, Ordering::Release);
        self.inner.global_wake.notify_one();
        let handle = lock(&self.inner.global_task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_global_monitoring(&self) -> bool {
        self.inner.global_monitoring.load(Ordering::Acquire)
    }

    /// Tear the whole fleet down: global loop joined, every process removed.
    pub async fn shutdown(&self) {
        self.stop_global_monitoring().await;
        self.remove_all().await;
    }

    async fn global_tick(&self) {
        let stats = self.manager_stats();
        debug!(
            processes = stats.total_processes,
            running = stats.running_processes,
            memory_mb = stats.total_memory_mb,
            cpu = stats.total_cpu_percent,
            "fleet health check"
        );

        // Evict the heaviest running processes until the fleet is back
        // under its memory budget
        let budget = self.inner.config.max_total_memory_mb;
        while self.total_memory_mb() > budget {
            let heaviest = self
                .handles()
                .into_iter()
                .filter(|(_, process)| process.is_running())
                .max_by(|(_, a), (_, b)| {
                    a.stats()
                        .memory_bytes
                        .cmp(&b.stats().memory_bytes)
                });

            let Some((node_id, process)) = heaviest else { break };
            warn!(
                node = %node_id,
                memory_mb = process.stats().memory_mb(),
                budget_mb = budget,
                "fleet over memory budget, evicting heaviest process"
            );
            process.stop_monitoring().await;
            if let Err(e) = process.stop(self.inner.config.stop_timeout).await {
                warn!(node = %node_id, error = %e, "eviction stop failed");
                break;
            }
        }
    }

    fn handles(&self) -> Vec<(String, ManagedProcess)> {
        lock(&self.inner.processes)
            .iter()
            .map(|(node_id, process)| (node_id.clone(), process.clone()))
            .collect()
    }
}

impl Default for FleetManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for FleetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetManager")
            .field("processes", &self.process_count())
            .finish()
    }
}
