use crate::manifest::NodeManifest;
use crate::process::types::ProcessStats;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-process resource ceilings, fixed once a process is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum resident memory in MB
    pub max_memory_mb: u64,
    /// Maximum CPU usage percentage
    pub max_cpu_percent: f32,
    /// Maximum open file descriptors
    pub max_open_files: u64,
    /// Execution timeout
    pub timeout: Duration,
    /// Maximum automatic restart attempts
    pub max_restarts: u32,
    /// Delay between restart attempts
    pub restart_delay: Duration,
    /// Allow core dumps on crash
    pub enable_core_dumps: bool,
    /// Scheduling priority hint (-20 to 19)
    pub nice_level: i32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 128,
            max_cpu_percent: 100.0,
            max_open_files: 1024,
            timeout: Duration::from_secs(30),
            max_restarts: 3,
            restart_delay: Duration::from_secs(5),
            enable_core_dumps: false,
            nice_level: 0,
        }
    }
}

/// Which ceiling a running process went over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitBreach {
    Memory,
    Cpu,
    Timeout,
}

impl ResourceLimits {
    /// Derive limits from a manifest, falling back to `defaults` for every
    /// field the manifest does not carry.
    pub fn from_manifest(manifest: &NodeManifest, defaults: &ResourceLimits) -> Self {
        let mut limits = defaults.clone();

        if let Some(memory) = manifest.resources.memory.as_deref() {
            if let Some(mb) = parse_memory_mb(memory) {
                limits.max_memory_mb = mb;
            }
        }

        if let Some(secs) = manifest.resources.timeout_seconds {
            if secs > 0 {
                limits.timeout = Duration::from_secs(secs);
            }
        }

        limits
    }

    /// Check a stats snapshot against these ceilings.
    pub fn breach(&self, stats: &ProcessStats) -> Option<LimitBreach> {
        if stats.memory_mb() > self.max_memory_mb as f64 {
            return Some(LimitBreach::Memory);
        }
        if stats.cpu_usage > self.max_cpu_percent {
            return Some(LimitBreach::Cpu);
        }
        if stats.uptime() > self.timeout {
            return Some(LimitBreach::Timeout);
        }
        None
    }
}

/// Parse a manifest memory string such as "512MB" or "2GB" into megabytes.
///
/// The unit defaults to MB. KB values divide by 1024 with integer
/// truncation, so "512KB" yields 0 MB; this mirrors the discovery format's
/// established behavior and is covered by tests.
pub fn parse_memory_mb(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());

    let value: u64 = trimmed[..digits_end].parse().ok()?;
    let unit = trimmed[digits_end..].trim().to_ascii_uppercase();

    match unit.as_str() {
        "GB" => Some(value.saturating_mul(1024)),
        "KB" => Some(value / 1024),
        "" | "MB" => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ResourceSpec;
    use std::time::SystemTime;

    #[test]
    fn test_parse_memory_units() {
        assert_eq!(parse_memory_mb("256MB"), Some(256));
        assert_eq!(parse_memory_mb("2GB"), Some(2048));
        assert_eq!(parse_memory_mb("64"), Some(64));
        assert_eq!(parse_memory_mb(" 512 MB "), Some(512));
        assert_eq!(parse_memory_mb("1gb"), Some(1024));
    }

    #[test]
    fn test_parse_memory_kb_truncates_to_zero() {
        // Sub-megabyte strings truncate via integer division
        assert_eq!(parse_memory_mb("512KB"), Some(0));
        assert_eq!(parse_memory_mb("2048KB"), Some(2));
    }

    #[test]
    fn test_parse_memory_rejects_garbage() {
        assert_eq!(parse_memory_mb("lots"), None);
        assert_eq!(parse_memory_mb(""), None);
        assert_eq!(parse_memory_mb("12TB"), None);
    }

    #[test]
    fn test_limits_from_manifest() {
        let mut manifest = NodeManifest::new("/usr/bin/node-a");
        manifest.resources = ResourceSpec {
            memory: Some("2GB".to_string()),
            timeout_seconds: Some(45),
        };

        let defaults = ResourceLimits::default();
        let limits = ResourceLimits::from_manifest(&manifest, &defaults);

        assert_eq!(limits.max_memory_mb, 2048);
        assert_eq!(limits.timeout, Duration::from_secs(45));
        // Untouched fields come from the defaults
        assert_eq!(limits.max_restarts, defaults.max_restarts);
        assert_eq!(limits.max_open_files, defaults.max_open_files);
    }

    #[test]
    fn test_limits_from_empty_manifest_are_defaults() {
        let manifest = NodeManifest::new("/usr/bin/node-a");
        let defaults = ResourceLimits {
            max_memory_mb: 777,
            ..ResourceLimits::default()
        };

        let limits = ResourceLimits::from_manifest(&manifest, &defaults);
        assert_eq!(limits.max_memory_mb, 777);
        assert_eq!(limits.timeout, defaults.timeout);
    }

    #[test]
    fn test_unparseable_memory_keeps_default() {
        let mut manifest = NodeManifest::new("/usr/bin/node-a");
        manifest.resources.memory = Some("plenty".to_string());

        let limits = ResourceLimits::from_manifest(&manifest, &ResourceLimits::default());
        assert_eq!(limits.max_memory_mb, 128);
    }

    #[test]
    fn test_breach_detection() {
        let limits = ResourceLimits {
            max_memory_mb: 100,
            max_cpu_percent: 50.0,
            timeout: Duration::from_secs(60),
            ..ResourceLimits::default()
        };

        let mut stats = ProcessStats {
            pid: Some(1),
            started_at: Some(SystemTime::now()),
            ..ProcessStats::default()
        };
        assert_eq!(limits.breach(&stats), None);

        stats.memory_bytes = 101 * 1024 * 1024;
        assert_eq!(limits.breach(&stats), Some(LimitBreach::Memory));

        stats.memory_bytes = 0;
        stats.cpu_usage = 75.0;
        assert_eq!(limits.breach(&stats), Some(LimitBreach::Cpu));

        stats.cpu_usage = 0.0;
        stats.started_at = Some(SystemTime::now() - Duration::from_secs(120));
        assert_eq!(limits.breach(&stats), Some(LimitBreach::Timeout));
    }

    #[test]
    fn test_no_timeout_breach_when_stopped() {
        let limits = ResourceLimits {
            timeout: Duration::from_secs(1),
            ..ResourceLimits::default()
        };

        // No pid attached: uptime is zero, the timeout cannot fire
        let stats = ProcessStats {
            started_at: Some(SystemTime::now() - Duration::from_secs(100)),
            ..ProcessStats::default()
        };
        assert_eq!(limits.breach(&stats), None);
    }
}
