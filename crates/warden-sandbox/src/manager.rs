//! Sandbox preparation and allocation tracking.

use crate::error::SandboxError;
use crate::paths::{compile_patterns, intersect_roots, normalize_path, PathPattern};
use crate::profile::{SandboxFloor, SandboxProfile};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Substrings that mark an environment variable as secret regardless of lists.
const SECRET_ENV_MARKERS: &[&str] = &["KEY", "SECRET", "TOKEN", "PASSWORD", "CREDENTIAL"];

/// Everything the manager needs to know about an approved request.
#[derive(Debug, Clone, Copy)]
pub struct SandboxRequest<'a> {
    /// Request the sandbox is for.
    pub request_id: &'a str,
    /// Normalised absolute target path, if the request has one.
    pub target_path: Option<&'a Path>,
    /// The policy's allowed path patterns.
    pub allowed_paths: &'a [String],
    /// The policy's forbidden path patterns; masked inside the sandbox.
    pub forbidden_paths: &'a [String],
    /// The policy's sandbox profile.
    pub profile: &'a SandboxProfile,
    /// Whether allowed paths are mounted writable.
    pub writable: bool,
}

/// Isolation parameters for one approved execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxConfig {
    /// Request the sandbox belongs to.
    pub request_id: String,
    /// Directory the executor starts in.
    pub working_dir: PathBuf,
    /// Directories the executor may touch.
    pub allowed_paths: Vec<PathBuf>,
    /// Paths inside `allowed_paths` hidden from the executor.
    pub masked_paths: Vec<PathBuf>,
    /// Whether `allowed_paths` are writable.
    pub writable: bool,
    /// CPU-time ceiling.
    pub cpu_time_limit: Duration,
    /// Memory ceiling in bytes.
    pub memory_limit_bytes: u64,
    /// Environment exposed to the executor.
    pub env: BTreeMap<String, String>,
    /// Whether the executor is cut off from the network.
    pub network_isolated: bool,
}

impl SandboxConfig {
    /// Whether `path` (after normalisation) lies inside the allow-list.
    pub fn permits(&self, path: &Path) -> bool {
        let path = normalize_path(path);
        self.allowed_paths.iter().any(|root| path.starts_with(root))
            && !self.masked_paths.iter().any(|masked| path.starts_with(masked))
    }
}

#[derive(Default)]
struct Allocations {
    active: HashMap<String, u64>,
    reserved_bytes: u64,
}

impl Allocations {
    fn release(&mut self, request_id: &str) -> bool {
        match self.active.remove(request_id) {
            Some(bytes) => {
                self.reserved_bytes = self.reserved_bytes.saturating_sub(bytes);
                true
            }
            None => false,
        }
    }
}

/// Derives sandbox configurations and tracks their reservations.
pub struct SandboxManager {
    floor: SandboxFloor,
    floor_patterns: Vec<PathPattern>,
    env_source: BTreeMap<String, String>,
    allocations: Arc<Mutex<Allocations>>,
}

impl SandboxManager {
    /// Create a manager clamped to `floor`, exposing the process environment.
    pub fn new(floor: SandboxFloor) -> Result<Self, SandboxError> {
        let floor_patterns = compile_patterns(&floor.allowed_paths)?;
        Ok(Self {
            floor,
            floor_patterns,
            env_source: std::env::vars().collect(),
            allocations: Arc::new(Mutex::new(Allocations::default())),
        })
    }

    /// Replace the environment sandboxes are filtered from.
    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env_source = env.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// The global floor in effect.
    pub fn floor(&self) -> &SandboxFloor {
        &self.floor
    }

    /// Derive and reserve a sandbox for an approved request.
    ///
    /// The returned lease releases the reservation when dropped, so the
    /// reservation cannot outlive the caller even on error or cancellation.
    pub fn prepare(&self, request: SandboxRequest<'_>) -> Result<SandboxLease, SandboxError> {
        let config = self.derive(&request)?;
        let bytes = config.memory_limit_bytes;

        let mut allocations = self.lock();
        if allocations.active.contains_key(request.request_id) {
            return Err(SandboxError::AlreadyActive(request.request_id.to_string()));
        }
        if allocations.active.len() >= self.floor.max_active {
            return Err(SandboxError::Capacity(format!(
                "{} sandboxes already active",
                allocations.active.len()
            )));
        }
        let budget = self.floor.memory_budget_mb.saturating_mul(MIB);
        if allocations.reserved_bytes.saturating_add(bytes) > budget {
            return Err(SandboxError::Capacity(format!(
                "memory budget exhausted ({} of {} MiB reserved)",
                allocations.reserved_bytes / MIB,
                self.floor.memory_budget_mb
            )));
        }
        allocations.active.insert(request.request_id.to_string(), bytes);
        allocations.reserved_bytes += bytes;
        drop(allocations);

        tracing::debug!(
            request_id = request.request_id,
            roots = config.allowed_paths.len(),
            masked = config.masked_paths.len(),
            network_isolated = config.network_isolated,
            "Sandbox prepared"
        );

        Ok(SandboxLease {
            config,
            allocations: self.allocations.clone(),
        })
    }

    /// Release the reservation held for `request_id`. Returns whether one existed.
    pub fn release(&self, request_id: &str) -> bool {
        self.lock().release(request_id)
    }

    /// Whether `request_id` currently holds a sandbox.
    pub fn is_active(&self, request_id: &str) -> bool {
        self.lock().active.contains_key(request_id)
    }

    /// Number of active sandboxes.
    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Memory reserved by active sandboxes, in bytes.
    pub fn reserved_memory_bytes(&self) -> u64 {
        self.lock().reserved_bytes
    }

    fn derive(&self, request: &SandboxRequest<'_>) -> Result<SandboxConfig, SandboxError> {
        let target = request.target_path.map(normalize_path);
        let target = target.as_deref();

        let policy_patterns = compile_patterns(request.allowed_paths)?;
        let policy_roots: Vec<PathBuf> = policy_patterns
            .iter()
            .filter_map(|p| p.concrete_root(target))
            .collect();
        let floor_roots: Vec<PathBuf> = self
            .floor_patterns
            .iter()
            .filter_map(|p| p.concrete_root(target))
            .collect();

        let allowed_paths = intersect_roots(&policy_roots, &floor_roots);
        if allowed_paths.is_empty() && !request.allowed_paths.is_empty() {
            return Err(SandboxError::EmptyAllowList);
        }

        let mut masked_paths: Vec<PathBuf> = compile_patterns(request.forbidden_paths)?
            .iter()
            .flat_map(PathPattern::expand)
            .filter(|path| allowed_paths.iter().any(|root| path.starts_with(root)))
            .collect();
        masked_paths.sort();
        masked_paths.dedup();

        let working_dir = match target {
            Some(target) => allowed_paths
                .iter()
                .filter(|root| target.starts_with(root))
                .max_by_key(|root| root.as_os_str().len())
                .cloned()
                .ok_or_else(|| SandboxError::PathOutsideAllowList(target.display().to_string()))?,
            None => allowed_paths
                .first()
                .cloned()
                .unwrap_or_else(|| self.floor.scratch_dir.clone()),
        };

        let cpu_secs = request
            .profile
            .cpu_time_secs
            .map_or(self.floor.max_cpu_time_secs, |s| s.min(self.floor.max_cpu_time_secs));
        let memory_mb = request
            .profile
            .memory_mb
            .map_or(self.floor.max_memory_mb, |m| m.min(self.floor.max_memory_mb));

        Ok(SandboxConfig {
            request_id: request.request_id.to_string(),
            working_dir,
            allowed_paths,
            masked_paths,
            writable: request.writable,
            cpu_time_limit: Duration::from_secs(cpu_secs),
            memory_limit_bytes: memory_mb.saturating_mul(MIB),
            env: self.filter_env(request.profile),
            network_isolated: !(request.profile.network && self.floor.allow_network),
        })
    }

    fn filter_env(&self, profile: &SandboxProfile) -> BTreeMap<String, String> {
        self.env_source
            .iter()
            .filter(|(key, _)| self.floor.env_allowlist.iter().any(|k| k == *key))
            .filter(|(key, _)| {
                profile.env_allowlist.is_empty() || profile.env_allowlist.iter().any(|k| k == *key)
            })
            .filter(|(key, _)| {
                let upper = key.to_uppercase();
                !SECRET_ENV_MARKERS.iter().any(|m| upper.contains(m))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Allocations> {
        self.allocations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// An active sandbox reservation. Dropping it releases the reservation.
#[derive(Debug)]
pub struct SandboxLease {
    config: SandboxConfig,
    allocations: Arc<Mutex<Allocations>>,
}

impl SandboxLease {
    /// The prepared configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Release explicitly. Equivalent to dropping the lease.
    pub fn release(self) {}
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let released = self
            .allocations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .release(&self.config.request_id);
        if released {
            tracing::debug!(request_id = %self.config.request_id, "Sandbox released");
        }
    }
}

impl std::fmt::Debug for Allocations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocations")
            .field("active", &self.active.len())
            .field("reserved_bytes", &self.reserved_bytes)
            .finish()
    }
}
