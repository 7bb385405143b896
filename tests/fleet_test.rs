//! Fleet-level tests: admission control, batch lifecycle operations,
//! aggregate statistics, and manifest-driven limit enforcement.

use nodeherd::{FleetConfig, FleetManager, HerdError, NodeManifest, ProcessState, ResourceLimits};
use std::time::Duration;

fn sleep_manifest(seconds: u32) -> NodeManifest {
    let mut manifest = NodeManifest::new("/bin/sleep");
    manifest.args = vec![seconds.to_string()];
    manifest
}

fn shell_manifest(script: &str) -> NodeManifest {
    let mut manifest = NodeManifest::new("/bin/sh");
    manifest.args = vec!["-c".to_string(), script.to_string()];
    manifest
}

fn fast_config() -> FleetConfig {
    FleetConfig {
        default_limits: ResourceLimits {
            restart_delay: Duration::ZERO,
            ..ResourceLimits::default()
        },
        monitor_interval: Duration::from_millis(100),
        stop_timeout: Duration::from_secs(5),
        ..FleetConfig::default()
    }
}

#[tokio::test]
async fn test_admission_rejects_when_count_exhausted() {
    let fleet = FleetManager::new(FleetConfig {
        max_total_processes: 1,
        ..fast_config()
    });

    fleet
        .create_process("node-a", &sleep_manifest(30))
        .await
        .unwrap();

    match fleet.create_process("node-b", &sleep_manifest(30)).await {
        Err(HerdError::ResourceExhausted(msg)) => assert!(msg.contains("count")),
        other => panic!("expected ResourceExhausted, got {other:?}"),
    }
    assert_eq!(fleet.process_count(), 1);

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_admission_rejects_when_memory_budget_exhausted() {
    let fleet = FleetManager::new(FleetConfig {
        max_total_memory_mb: 0,
        ..fast_config()
    });

    match fleet.create_process("node-a", &sleep_manifest(30)).await {
        Err(HerdError::ResourceExhausted(msg)) => assert!(msg.contains("memory")),
        other => panic!("expected ResourceExhausted, got {other:?}"),
    }
    assert_eq!(fleet.process_count(), 0);
}

#[tokio::test]
async fn test_operations_on_unknown_node_fail() {
    let fleet = FleetManager::new(fast_config());

    for result in [
        fleet.start_process("ghost").await,
        fleet.stop_process("ghost", Duration::from_secs(1)).await,
        fleet.restart_process("ghost").await,
        fleet.remove_process("ghost").await,
    ] {
        match result {
            Err(HerdError::ProcessNotFound(id)) => assert_eq!(id, "ghost"),
            other => panic!("expected ProcessNotFound, got {other:?}"),
        }
    }
    assert!(fleet.get_process("ghost").is_none());
}

#[tokio::test]
async fn test_full_lifecycle_through_fleet() {
    let fleet = FleetManager::new(fast_config());

    fleet
        .create_process("worker", &sleep_manifest(30))
        .await
        .unwrap();
    assert_eq!(fleet.process_count(), 1);
    assert_eq!(fleet.running_process_count(), 0);

    fleet.start_process("worker").await.unwrap();
    let process = fleet.get_process("worker").unwrap();
    assert!(process.is_running());
    assert!(process.is_monitoring());
    assert_eq!(fleet.running_process_ids(), vec!["worker".to_string()]);

    let stats = fleet.manager_stats();
    assert_eq!(stats.total_processes, 1);
    assert_eq!(stats.running_processes, 1);
    assert_eq!(stats.total_started, 1);
    assert_eq!(stats.total_crashed, 0);

    fleet
        .stop_process("worker", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(!process.is_running());
    assert!(!process.is_monitoring());

    fleet.remove_process("worker").await.unwrap();
    assert_eq!(fleet.process_count(), 0);
}

#[tokio::test]
async fn test_batch_operations_report_per_node() {
    let fleet = FleetManager::new(fast_config());
    fleet
        .create_process("node-a", &sleep_manifest(30))
        .await
        .unwrap();
    fleet
        .create_process("node-b", &sleep_manifest(30))
        .await
        .unwrap();

    let started = fleet.start_all().await;
    assert_eq!(started.len(), 2);
    assert!(started["node-a"]);
    assert!(started["node-b"]);
    assert_eq!(fleet.running_process_count(), 2);

    let stopped = fleet.stop_all(Duration::from_secs(5)).await;
    assert!(stopped["node-a"]);
    assert!(stopped["node-b"]);
    assert_eq!(fleet.running_process_count(), 0);

    fleet.remove_all().await;
    assert_eq!(fleet.process_count(), 0);
}

#[tokio::test]
async fn test_restart_through_fleet_counts_and_replaces_pid() {
    let fleet = FleetManager::new(fast_config());
    fleet
        .create_process("worker", &sleep_manifest(30))
        .await
        .unwrap();
    fleet.start_process("worker").await.unwrap();

    let process = fleet.get_process("worker").unwrap();
    let first_pid = process.stats().pid.unwrap();

    fleet.restart_process("worker").await.unwrap();
    assert!(process.is_running());
    assert_ne!(process.stats().pid.unwrap(), first_pid);
    assert_eq!(fleet.manager_stats().total_restarts, 1);

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_health_check_distinguishes_states() {
    let fleet = FleetManager::new(fast_config());
    fleet
        .create_process("live", &sleep_manifest(30))
        .await
        .unwrap();
    fleet
        .create_process("idle", &sleep_manifest(30))
        .await
        .unwrap();
    fleet.start_process("live").await.unwrap();

    let health = fleet.perform_health_check();
    assert!(health["live"]);
    assert!(!health["idle"]);

    let all_stats = fleet.all_process_stats();
    assert!(all_stats["live"].pid.is_some());
    assert!(all_stats["idle"].pid.is_none());

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_crash_is_counted_once_when_restarts_disabled() {
    let fleet = FleetManager::new(FleetConfig {
        default_limits: ResourceLimits {
            max_restarts: 0,
            restart_delay: Duration::ZERO,
            ..ResourceLimits::default()
        },
        monitor_interval: Duration::from_millis(100),
        ..FleetConfig::default()
    });

    fleet
        .create_process("flaky", &shell_manifest("exit 7"))
        .await
        .unwrap();
    fleet.start_process("flaky").await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;

    let process = fleet.get_process("flaky").unwrap();
    assert_eq!(process.state(), ProcessState::Crashed);
    assert_eq!(process.stats().exit_code, Some(7));

    let stats = fleet.manager_stats();
    assert_eq!(stats.total_crashed, 1);
    assert_eq!(stats.crashed_processes, 1);
    assert_eq!(stats.running_processes, 0);

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_manifest_timeout_enforced_without_crash_count() {
    let fleet = FleetManager::new(FleetConfig {
        monitor_interval: Duration::from_millis(200),
        ..fast_config()
    });

    let mut manifest = sleep_manifest(30);
    manifest.resources.timeout_seconds = Some(1);
    fleet.create_process("overdue", &manifest).await.unwrap();

    let process = fleet.get_process("overdue").unwrap();
    assert_eq!(process.limits().timeout, Duration::from_secs(1));

    fleet.start_process("overdue").await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert_eq!(process.state(), ProcessState::Timeout);
    assert!(!process.is_running());
    // A timeout stop is enforcement, not a crash
    assert_eq!(fleet.manager_stats().total_crashed, 0);

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_manifest_env_and_working_dir_reach_the_child() {
    let dir = tempfile::tempdir().unwrap();

    let mut manifest = shell_manifest("printf '%s' \"$HERD_MARKER\" > marker.txt");
    manifest.working_dir = Some(dir.path().to_path_buf());
    manifest
        .env
        .insert("HERD_MARKER".to_string(), "configured".to_string());

    let fleet = FleetManager::new(fast_config());
    fleet.create_process("writer", &manifest).await.unwrap();
    fleet.start_process("writer").await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    let contents = std::fs::read_to_string(dir.path().join("marker.txt")).unwrap();
    assert_eq!(contents, "configured");

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_global_monitoring_start_stop() {
    let fleet = FleetManager::new(fast_config());
    assert!(!fleet.is_global_monitoring());

    fleet.start_global_monitoring(Duration::from_millis(100));
    fleet.start_global_monitoring(Duration::from_millis(100));
    assert!(fleet.is_global_monitoring());

    fleet.stop_global_monitoring().await;
    assert!(!fleet.is_global_monitoring());
    fleet.stop_global_monitoring().await;
}

#[tokio::test]
async fn test_shutdown_tears_down_the_whole_fleet() {
    let fleet = FleetManager::new(fast_config());
    fleet
        .create_process("node-a", &sleep_manifest(30))
        .await
        .unwrap();
    fleet
        .create_process("node-b", &sleep_manifest(30))
        .await
        .unwrap();
    fleet.start_all().await;
    fleet.start_global_monitoring(Duration::from_millis(100));

    let a = fleet.get_process("node-a").unwrap();
    let b = fleet.get_process("node-b").unwrap();
    let pids = vec![a.stats().pid.unwrap(), b.stats().pid.unwrap()];

    fleet.shutdown().await;

    assert!(!fleet.is_global_monitoring());
    assert_eq!(fleet.process_count(), 0);
    for pid in pids {
        assert!(!nodeherd::process::launcher::is_running(pid));
    }
    assert!(a.tracked_children().is_empty());
    assert!(b.tracked_children().is_empty());
}
