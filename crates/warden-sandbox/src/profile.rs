//! Per-policy sandbox profiles and the global floor that narrows them.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Sandbox settings a tool policy asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SandboxProfile {
    /// CPU-time ceiling in seconds; the floor's maximum when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_time_secs: Option<u64>,
    /// Memory ceiling in MiB; the floor's maximum when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    /// Whether the tool needs outbound network access.
    pub network: bool,
    /// Environment variables the tool may see. Empty inherits the floor list.
    pub env_allowlist: Vec<String>,
}

/// Global limits every sandbox is clamped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxFloor {
    /// Global allow-list; policy paths are intersected with it.
    pub allowed_paths: Vec<String>,
    /// Working directory for sandboxes with no filesystem grant.
    pub scratch_dir: PathBuf,
    /// Hard CPU-time ceiling in seconds.
    pub max_cpu_time_secs: u64,
    /// Hard per-sandbox memory ceiling in MiB.
    pub max_memory_mb: u64,
    /// Memory that all active sandboxes may reserve together, in MiB.
    pub memory_budget_mb: u64,
    /// Maximum number of simultaneously active sandboxes.
    pub max_active: usize,
    /// Environment variables any sandbox may see.
    pub env_allowlist: Vec<String>,
    /// Whether any sandbox may reach the network.
    pub allow_network: bool,
}

impl Default for SandboxFloor {
    fn default() -> Self {
        Self {
            allowed_paths: vec!["/".to_string()],
            scratch_dir: std::env::temp_dir(),
            max_cpu_time_secs: 300,
            max_memory_mb: 2048,
            memory_budget_mb: 8192,
            max_active: 64,
            env_allowlist: ["PATH", "HOME", "LANG", "LC_ALL", "TERM", "TMPDIR", "USER"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allow_network: false,
        }
    }
}
