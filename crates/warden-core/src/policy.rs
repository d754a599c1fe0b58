//! Per-tool policy documents and their validated, compiled form.

use crate::error::WardenError;
use crate::request::Operation;
use crate::risk::RiskLevel;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use warden_sandbox::{compile_patterns, PathPattern, SandboxProfile};

/// Which counter a rate-limit rule charges.
/// Checked in declaration order: global, then tool, then user.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum RateScope {
    /// One counter shared by every tool and user.
    Global,
    /// One counter per tool.
    #[default]
    Tool,
    /// One counter per (tool, user).
    User,
}

impl RateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateScope::Global => "global",
            RateScope::Tool => "tool",
            RateScope::User => "user",
        }
    }
}

/// Sliding-window quota with an optional burst allowance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RateLimitRule {
    #[serde(default)]
    pub scope: RateScope,
    /// Requests admitted per window.
    pub quota: u32,
    pub window_secs: u64,
    /// Extra requests a token bucket admits once the window is full.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u32>,
}

impl RateLimitRule {
    pub fn new(scope: RateScope, quota: u32, window: Duration) -> Self {
        Self {
            scope,
            quota,
            window_secs: window.as_secs(),
            burst: None,
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn window_ms(&self) -> u64 {
        self.window_secs.saturating_mul(1000)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.quota == 0 {
            return Err("rate_limit.quota must be greater than zero".to_string());
        }
        if self.window_secs == 0 {
            return Err("rate_limit.window_secs must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// How loudly decisions under a policy are logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Also records request parameters in the decision audit payload.
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
}

/// Policy document for a single tool, loaded from `<tool>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    pub tool_name: String,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub forbidden_paths: Vec<String>,
    /// Empty means every operation not forbidden.
    #[serde(default)]
    pub allowed_operations: Vec<Operation>,
    #[serde(default)]
    pub forbidden_operations: Vec<Operation>,
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Restricts `requires_confirmation` to these operations when non-empty.
    #[serde(default)]
    pub confirmation_operations: Vec<Operation>,
    /// Falls back to the kernel's default timeout when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitRule>,
    #[serde(default)]
    pub require_user_context: bool,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub min_auth_level: u8,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub sandbox: SandboxProfile,
}

impl Policy {
    /// A permissive-by-omission policy for `tool_name`: every operation, no paths.
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            risk_level: RiskLevel::Low,
            allowed_paths: Vec::new(),
            forbidden_paths: Vec::new(),
            allowed_operations: Vec::new(),
            forbidden_operations: Vec::new(),
            requires_confirmation: false,
            confirmation_operations: Vec::new(),
            confirmation_timeout_secs: None,
            rate_limit: None,
            require_user_context: false,
            required_capabilities: Vec::new(),
            min_auth_level: 0,
            log_level: LogLevel::Info,
            sandbox: SandboxProfile::default(),
        }
    }

    pub fn confirmation_timeout(&self, default: Duration) -> Duration {
        self.confirmation_timeout_secs.map_or(default, Duration::from_secs)
    }

    /// Whether the declared confirmation requirement covers `operation`.
    pub fn requires_confirmation_for(&self, operation: Operation) -> bool {
        self.requires_confirmation
            && (self.confirmation_operations.is_empty() || self.confirmation_operations.contains(&operation))
    }

    /// JSON schema for policy documents.
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(Policy)).unwrap_or_default()
    }
}

/// A validated policy with its path patterns compiled.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    policy: Policy,
    allowed: Vec<PathPattern>,
    forbidden: Vec<PathPattern>,
}

impl CompiledPolicy {
    /// Validate `policy`; `source` names the document in errors.
    pub fn compile(policy: Policy, source: &str) -> Result<Self, WardenError> {
        let invalid = |reason: String| WardenError::InvalidPolicyDocument {
            path: source.to_string(),
            reason,
        };

        if policy.tool_name.trim().is_empty() {
            return Err(invalid("tool_name must not be empty".to_string()));
        }
        if policy.confirmation_timeout_secs == Some(0) {
            return Err(invalid("confirmation_timeout_secs must be greater than zero".to_string()));
        }
        if let Some(rule) = &policy.rate_limit {
            rule.validate().map_err(invalid)?;
        }
        if let Some(op) = policy
            .allowed_operations
            .iter()
            .find(|op| policy.forbidden_operations.contains(op))
        {
            return Err(invalid(format!("operation '{op}' is both allowed and forbidden")));
        }

        let allowed = compile_patterns(&policy.allowed_paths)
            .map_err(|e| invalid(format!("allowed_paths: {e}")))?;
        let forbidden = compile_patterns(&policy.forbidden_paths)
            .map_err(|e| invalid(format!("forbidden_paths: {e}")))?;

        Ok(Self {
            policy,
            allowed,
            forbidden,
        })
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn name(&self) -> &str {
        &self.policy.tool_name
    }

    pub fn allowed_patterns(&self) -> &[PathPattern] {
        &self.allowed
    }

    pub fn forbidden_patterns(&self) -> &[PathPattern] {
        &self.forbidden
    }
}
