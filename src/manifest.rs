use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Descriptor for one external node, produced by the discovery subsystem.
///
/// The supervisor consumes this as an opaque input: how manifests are found
/// and parsed is the discovery collaborator's concern. Missing fields fall
/// back to fleet-wide defaults when limits are derived.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeManifest {
    /// Path to the node executable
    pub executable: PathBuf,

    /// Command-line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the node process
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Free-form resource requirements
    #[serde(default)]
    pub resources: ResourceSpec,
}

/// Textual resource requirements carried by a manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Memory budget string such as "256MB" or "2GB"; unit defaults to MB
    #[serde(default)]
    pub memory: Option<String>,

    /// Execution timeout in seconds; zero or absent means "use the default"
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl NodeManifest {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }
}
