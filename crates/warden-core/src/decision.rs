//! The verdict returned for every evaluated request.

use crate::rate_limit::RateLimitInfo;
use crate::risk::RiskLevel;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Policy name recorded when no policy matched the tool.
pub const DEFAULT_DENY_POLICY: &str = "default-deny";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Allow,
    Deny,
    RequireConfirmation,
    RateLimited,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Allow => "allow",
            DecisionKind::Deny => "deny",
            DecisionKind::RequireConfirmation => "require_confirmation",
            DecisionKind::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one evaluation. Only the kernel constructs these, and every
/// constructor takes a reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    request_id: String,
    decision: DecisionKind,
    risk_level: RiskLevel,
    reason: String,
    policy_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    confirmation_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    confirmation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rate_limit_info: Option<RateLimitInfo>,
    policy_version: u64,
}

impl PolicyDecision {
    fn base(
        decision: DecisionKind,
        request_id: &str,
        policy_name: &str,
        policy_version: u64,
        risk_level: RiskLevel,
        reason: String,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            decision,
            risk_level,
            reason,
            policy_name: policy_name.to_string(),
            confirmation_prompt: None,
            confirmation_id: None,
            rate_limit_info: None,
            policy_version,
        }
    }

    pub(crate) fn allow(
        request_id: &str,
        policy_name: &str,
        policy_version: u64,
        risk_level: RiskLevel,
        reason: impl Into<String>,
    ) -> Self {
        Self::base(DecisionKind::Allow, request_id, policy_name, policy_version, risk_level, reason.into())
    }

    pub(crate) fn deny(
        request_id: &str,
        policy_name: &str,
        policy_version: u64,
        risk_level: RiskLevel,
        reason: impl Into<String>,
    ) -> Self {
        Self::base(DecisionKind::Deny, request_id, policy_name, policy_version, risk_level, reason.into())
    }

    pub(crate) fn rate_limited(
        request_id: &str,
        policy_name: &str,
        policy_version: u64,
        risk_level: RiskLevel,
        info: RateLimitInfo,
    ) -> Self {
        let reason = format!(
            "rate limit exceeded for {} '{}' ({} per window), retry after {} ms",
            info.scope.as_str(),
            info.key,
            info.limit,
            info.retry_after_ms
        );
        let mut decision = Self::base(
            DecisionKind::RateLimited,
            request_id,
            policy_name,
            policy_version,
            risk_level,
            reason,
        );
        decision.rate_limit_info = Some(info);
        decision
    }

    pub(crate) fn require_confirmation(
        request_id: &str,
        policy_name: &str,
        policy_version: u64,
        risk_level: RiskLevel,
        reason: impl Into<String>,
        prompt: impl Into<String>,
        confirmation_id: impl Into<String>,
    ) -> Self {
        let mut decision = Self::base(
            DecisionKind::RequireConfirmation,
            request_id,
            policy_name,
            policy_version,
            risk_level,
            reason.into(),
        );
        decision.confirmation_prompt = Some(prompt.into());
        decision.confirmation_id = Some(confirmation_id.into());
        decision
    }

    pub(crate) fn with_rate_limit_info(mut self, info: Option<RateLimitInfo>) -> Self {
        self.rate_limit_info = info;
        self
    }

    /// Turn an ALLOW into a DENY after the sandbox could not be prepared.
    pub(crate) fn into_sandbox_denial(self, error: impl fmt::Display) -> Self {
        Self {
            decision: DecisionKind::Deny,
            reason: format!("sandbox preparation failed: {error}"),
            confirmation_prompt: None,
            confirmation_id: None,
            ..self
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn kind(&self) -> DecisionKind {
        self.decision
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == DecisionKind::Allow
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn policy_name(&self) -> &str {
        &self.policy_name
    }

    pub fn confirmation_prompt(&self) -> Option<&str> {
        self.confirmation_prompt.as_deref()
    }

    pub fn confirmation_id(&self) -> Option<&str> {
        self.confirmation_id.as_deref()
    }

    pub fn rate_limit_info(&self) -> Option<&RateLimitInfo> {
        self.rate_limit_info.as_ref()
    }

    pub fn policy_version(&self) -> u64 {
        self.policy_version
    }
}
