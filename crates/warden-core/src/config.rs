//! Kernel configuration, stored at `~/.warden/config.json`.

use crate::confirmation::ConfirmationConfig;
use crate::engine::EngineConfig;
use crate::policy::RateLimitRule;
use crate::risk::RiskConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use warden_audit::AuditConfig;
use warden_sandbox::SandboxFloor;

/// Overrides `policy_dir`.
pub const POLICY_DIR_ENV: &str = "WARDEN_POLICY_DIR";
/// Overrides `audit.dir`.
pub const AUDIT_DIR_ENV: &str = "WARDEN_AUDIT_DIR";

/// Kernel-wide rate limits layered over per-tool policy rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global: Option<RateLimitRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_user: Option<RateLimitRule>,
}

/// Serialized settings from ~/.warden/config.json
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Directory of `<tool>.json` policy documents; `~/.warden/policies` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_dir: Option<PathBuf>,
    pub rate_limits: RateLimitConfig,
    pub risk: RiskConfig,
    pub confirmation: ConfirmationConfig,
    pub sandbox: SandboxFloor,
    pub audit: AuditConfig,
}

impl KernelConfig {
    pub fn resolved_policy_dir(&self) -> PathBuf {
        self.policy_dir.clone().unwrap_or_else(|| warden_home().join("policies"))
    }

    /// Apply `WARDEN_POLICY_DIR` / `WARDEN_AUDIT_DIR` when set and non-empty.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(POLICY_DIR_ENV).filter(|v| !v.is_empty()) {
            self.policy_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup(AUDIT_DIR_ENV).filter(|v| !v.is_empty()) {
            self.audit.dir = Some(PathBuf::from(dir));
        }
    }

    pub(crate) fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            risk: self.risk.clone(),
            global_rate_limit: self.rate_limits.global.clone(),
            per_user_rate_limit: self.rate_limits.per_user.clone(),
            default_confirmation_timeout: Duration::from_secs(self.confirmation.default_timeout_secs.max(1)),
        }
    }
}

fn warden_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".warden")
}

/// Location of the global settings file.
pub struct ConfigStore {
    path: PathBuf,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            path: warden_home().join("config.json"),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Load the saved config, or fall back to defaults. A malformed file is
    /// reported and ignored.
    pub fn load(&self) -> KernelConfig {
        let Ok(content) = fs::read_to_string(&self.path) else {
            return KernelConfig::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Ignoring malformed config: {e}");
                KernelConfig::default()
            }
        }
    }

    /// Load and apply environment overrides.
    pub fn load_with_env(&self) -> KernelConfig {
        let mut config = self.load();
        config.apply_env_overrides();
        config
    }

    pub fn save(&self, config: &KernelConfig) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RateScope;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: KernelConfig = serde_json::from_str(
            r#"{
                "rate_limits": {"global": {"scope": "global", "quota": 100, "window_secs": 60}},
                "confirmation": {"grace_period_secs": 30}
            }"#,
        )
        .unwrap();
        assert_eq!(parsed.rate_limits.global.as_ref().unwrap().scope, RateScope::Global);
        assert!(parsed.rate_limits.per_user.is_none());
        assert_eq!(parsed.confirmation.grace_period_secs, 30);
        assert_eq!(parsed.confirmation.default_timeout_secs, 300);
        assert_eq!(parsed.risk.max_path_depth, 12);
        assert_eq!(parsed.sandbox.allowed_paths, vec!["/".to_string()]);
    }

    #[test]
    fn test_store_round_trip_and_malformed_fallback() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::at(dir.path().join("nested").join("config.json"));
        assert_eq!(store.load(), KernelConfig::default());

        let config = KernelConfig {
            policy_dir: Some(PathBuf::from("/etc/warden/policies")),
            ..Default::default()
        };
        store.save(&config).unwrap();
        assert_eq!(store.load(), config);

        fs::write(store.path(), "{oops").unwrap();
        assert_eq!(store.load(), KernelConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = KernelConfig::default();
        config.apply_overrides(|key| match key {
            POLICY_DIR_ENV => Some("/srv/policies".to_string()),
            AUDIT_DIR_ENV => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.resolved_policy_dir(), PathBuf::from("/srv/policies"));
        assert!(config.audit.dir.is_none());
    }

    #[test]
    fn test_engine_config_mapping() {
        let mut config = KernelConfig::default();
        config.confirmation.default_timeout_secs = 42;
        assert_eq!(config.engine_config().default_confirmation_timeout, Duration::from_secs(42));
    }
}
