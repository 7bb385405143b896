use nodeherd::{FleetConfig, FleetManager, NodeManifest, ResourceLimits};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging; try RUST_LOG=nodeherd=debug for the full picture
    tracing_subscriber::fmt::init();

    println!("=== nodeherd demo ===\n");

    let fleet = FleetManager::new(FleetConfig {
        default_limits: ResourceLimits {
            max_restarts: 3,
            restart_delay: Duration::from_secs(1),
            ..ResourceLimits::default()
        },
        monitor_interval: Duration::from_secs(2),
        ..FleetConfig::default()
    });

    // A node that crashes on every launch
    let mut crasher = NodeManifest::new("/bin/sh");
    crasher.args = vec![
        "-c".to_string(),
        "echo 'going down'; exit 1".to_string(),
    ];

    // A node that just runs
    let mut stable = NodeManifest::new("/bin/sleep");
    stable.args = vec!["60".to_string()];

    println!("Registering and starting nodes...");
    fleet.create_process("crasher", &crasher).await?;
    fleet.create_process("stable", &stable).await?;
    for (node, ok) in fleet.start_all().await {
        println!("  {node}: started={ok}");
    }
    println!();

    fleet.start_global_monitoring(Duration::from_secs(5));

    for round in 1..=7 {
        tokio::time::sleep(Duration::from_secs(2)).await;

        println!("--- health check #{round} ---");
        let health = fleet.perform_health_check();
        for (node, stats) in fleet.all_process_stats() {
            let process = fleet.get_process(&node);
            let state = process
                .map(|p| p.state().to_string())
                .unwrap_or_else(|| "gone".to_string());
            println!(
                "  {node} [{state}]: healthy={}, restarts={}, memory={:.1} MB",
                health.get(&node).copied().unwrap_or(false),
                stats.restarts,
                stats.memory_mb(),
            );
        }
        println!();
    }

    println!("=== final fleet stats ===");
    let stats = fleet.manager_stats();
    println!("  processes: {}", stats.total_processes);
    println!("  running:   {}", stats.running_processes);
    println!("  crashed:   {}", stats.crashed_processes);
    println!("  crash events: {}", stats.total_crashed);

    println!("\nShutting down...");
    fleet.shutdown().await;
    println!("Demo complete!");
    Ok(())
}
