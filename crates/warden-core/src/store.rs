//! Immutable policy snapshots and the store that swaps them.

use crate::error::WardenError;
use crate::policy::{CompiledPolicy, Policy};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A complete, validated set of policies. Never mutated once published.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    version: u64,
    policies: HashMap<String, Arc<CompiledPolicy>>,
    source: Option<PathBuf>,
}

impl PolicySnapshot {
    /// A snapshot with no policies: everything is denied.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from in-memory documents. Fails on the first invalid or duplicate policy.
    pub fn from_policies(policies: impl IntoIterator<Item = Policy>) -> Result<Self, WardenError> {
        let mut snapshot = Self::default();
        for policy in policies {
            let source = format!("<{}>", policy.tool_name);
            snapshot.insert(CompiledPolicy::compile(policy, &source)?, &source)?;
        }
        Ok(snapshot)
    }

    /// Load every `<tool>.json` document in `dir`.
    ///
    /// All-or-nothing: a single unreadable or invalid file fails the load.
    pub fn load_dir(dir: &Path) -> Result<Self, WardenError> {
        let entries = fs::read_dir(dir).map_err(|e| WardenError::InvalidPolicyDocument {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut snapshot = Self {
            source: Some(dir.to_path_buf()),
            ..Self::default()
        };
        for file in files {
            let source = file.display().to_string();
            let invalid = |reason: String| WardenError::InvalidPolicyDocument {
                path: source.clone(),
                reason,
            };

            let content = fs::read_to_string(&file).map_err(|e| invalid(e.to_string()))?;
            let policy: Policy = serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;

            let stem = file.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
            if stem != policy.tool_name {
                return Err(invalid(format!(
                    "tool_name '{}' does not match file name '{stem}'",
                    policy.tool_name
                )));
            }
            snapshot.insert(CompiledPolicy::compile(policy, &source)?, &source)?;
        }
        Ok(snapshot)
    }

    fn insert(&mut self, policy: CompiledPolicy, source: &str) -> Result<(), WardenError> {
        let name = policy.name().to_string();
        if self.policies.contains_key(&name) {
            return Err(WardenError::InvalidPolicyDocument {
                path: source.to_string(),
                reason: format!("duplicate policy for tool '{name}'"),
            });
        }
        self.policies.insert(name, Arc::new(policy));
        Ok(())
    }

    /// Version assigned when the snapshot was published (0 before).
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, tool_name: &str) -> Option<&Arc<CompiledPolicy>> {
        self.policies.get(tool_name)
    }

    /// Tool names in sorted order.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Directory the snapshot was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

/// Holds the active snapshot. Readers clone the `Arc` once per evaluation;
/// the lock is only held for the pointer copy or swap.
#[derive(Debug)]
pub struct PolicyStore {
    current: RwLock<Arc<PolicySnapshot>>,
    next_version: AtomicU64,
}

impl PolicyStore {
    pub fn new(initial: PolicySnapshot) -> Self {
        let store = Self {
            current: RwLock::new(Arc::new(PolicySnapshot::empty())),
            next_version: AtomicU64::new(1),
        };
        store.publish(initial);
        store
    }

    /// The active snapshot.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Stamp `snapshot` with the next version and make it active.
    /// Returns the published snapshot.
    pub fn publish(&self, mut snapshot: PolicySnapshot) -> Arc<PolicySnapshot> {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        snapshot.version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let snapshot = Arc::new(snapshot);
        *current = snapshot.clone();
        snapshot
    }

    /// Load `dir` and publish it. On error the active snapshot is untouched.
    pub fn reload_dir(&self, dir: &Path) -> Result<Arc<PolicySnapshot>, WardenError> {
        let snapshot = PolicySnapshot::load_dir(dir)?;
        Ok(self.publish(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, doc: serde_json::Value) {
        fs::write(dir.path().join(name), doc.to_string()).unwrap();
    }

    #[test]
    fn test_load_dir_reads_json_documents() {
        let dir = TempDir::new().unwrap();
        write(&dir, "file_ops.json", json!({"tool_name": "file_ops", "allowed_paths": ["/workspace/**"]}));
        write(&dir, "search.json", json!({"tool_name": "search"}));
        fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let snapshot = PolicySnapshot::load_dir(dir.path()).unwrap();
        assert_eq!(snapshot.tool_names(), vec!["file_ops", "search"]);
        assert_eq!(snapshot.source(), Some(dir.path()));
        assert!(snapshot.get("terminal").is_none());
    }

    #[test]
    fn test_load_dir_is_all_or_nothing() {
        let dir = TempDir::new().unwrap();
        write(&dir, "search.json", json!({"tool_name": "search"}));
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let err = PolicySnapshot::load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, WardenError::InvalidPolicyDocument { ref path, .. } if path.ends_with("broken.json")));
    }

    #[test]
    fn test_file_stem_must_match_tool_name() {
        let dir = TempDir::new().unwrap();
        write(&dir, "search.json", json!({"tool_name": "terminal"}));
        let err = PolicySnapshot::load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("does not match file name 'search'"));
    }

    #[test]
    fn test_duplicate_in_memory_policies_rejected() {
        let err = PolicySnapshot::from_policies([Policy::new("a"), Policy::new("a")]).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_publish_bumps_version_and_failed_reload_keeps_snapshot() {
        let dir = TempDir::new().unwrap();
        write(&dir, "search.json", json!({"tool_name": "search"}));

        let store = PolicyStore::new(PolicySnapshot::empty());
        assert_eq!(store.snapshot().version(), 1);

        let loaded = store.reload_dir(dir.path()).unwrap();
        assert_eq!(loaded.version(), 2);
        let held = store.snapshot();

        write(&dir, "bad.json", json!({"tool_name": "bad", "rate_limit": {"quota": 0, "window_secs": 1}}));
        assert!(store.reload_dir(dir.path()).is_err());
        assert_eq!(store.snapshot().version(), 2);
        assert!(Arc::ptr_eq(&held, &store.snapshot()));
    }
}
