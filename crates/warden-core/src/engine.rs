//! Fixed-priority decision table.
//!
//! Rows, first match wins: missing policy, caller context, operation, paths,
//! earlier confirmation, rate limit, confirmation requirement, allow.

use crate::clock::Clock;
use crate::confirmation::{ConfirmationCoordinator, PriorConfirmation};
use crate::decision::{PolicyDecision, DEFAULT_DENY_POLICY};
use crate::policy::{CompiledPolicy, LogLevel, Policy, RateLimitRule, RateScope};
use crate::rate_limit::{RateCheck, RateLimitOutcome, RateLimiter};
use crate::request::{Operation, SecurityContext, ToolRequest};
use crate::risk::{assess, RiskConfig, RiskLevel};
use crate::store::PolicyStore;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use warden_audit::{AuditEvent, AuditEventKind, AuditLogger};
use warden_sandbox::{longest_match, normalize_path};

const GLOBAL_KEY: &str = "*";

/// Kernel-wide settings the engine applies on top of each policy.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub risk: RiskConfig,
    /// Charged for every request, before any policy rule.
    pub global_rate_limit: Option<RateLimitRule>,
    /// Charged per user across all tools, after policy rules.
    pub per_user_rate_limit: Option<RateLimitRule>,
    pub default_confirmation_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            risk: RiskConfig::default(),
            global_rate_limit: None,
            per_user_rate_limit: None,
            default_confirmation_timeout: Duration::from_secs(300),
        }
    }
}

/// A decision plus the policy it was made under, from the same snapshot.
pub(crate) struct Evaluation {
    pub decision: PolicyDecision,
    pub policy: Option<Arc<CompiledPolicy>>,
}

pub struct PolicyEngine {
    store: Arc<PolicyStore>,
    rate_limiter: Arc<RateLimiter>,
    confirmations: Arc<ConfirmationCoordinator>,
    audit: AuditLogger,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl PolicyEngine {
    pub fn new(
        store: Arc<PolicyStore>,
        rate_limiter: Arc<RateLimiter>,
        confirmations: Arc<ConfirmationCoordinator>,
        audit: AuditLogger,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            rate_limiter,
            confirmations,
            audit,
            clock,
            config,
        }
    }

    /// Decide on `request`. Emits exactly one decision audit event.
    pub fn evaluate(&self, request: &ToolRequest, context: &SecurityContext) -> PolicyDecision {
        self.evaluate_detailed(request, context).decision
    }

    pub(crate) fn evaluate_detailed(&self, request: &ToolRequest, context: &SecurityContext) -> Evaluation {
        let snapshot = self.store.snapshot();
        let version = snapshot.version();

        let Some(policy) = snapshot.get(request.tool_name()).cloned() else {
            let decision = PolicyDecision::deny(
                request.request_id(),
                DEFAULT_DENY_POLICY,
                version,
                RiskLevel::Low,
                format!("default-deny: no policy for tool '{}'", request.tool_name()),
            );
            self.record(request, &decision, LogLevel::Warn);
            return Evaluation { decision, policy: None };
        };

        let decision = self.decide(&policy, version, request, context);
        self.record(request, &decision, policy.policy().log_level);
        Evaluation {
            decision,
            policy: Some(policy),
        }
    }

    fn decide(
        &self,
        compiled: &CompiledPolicy,
        version: u64,
        request: &ToolRequest,
        context: &SecurityContext,
    ) -> PolicyDecision {
        let policy = compiled.policy();
        let name = compiled.name();
        let request_id = request.request_id();
        let deny = |risk: RiskLevel, reason: String| PolicyDecision::deny(request_id, name, version, risk, reason);

        if let Err(reason) = check_context(policy, request, context) {
            return deny(policy.risk_level, reason);
        }
        if let Err(reason) = check_operation(policy, request.operation()) {
            return deny(policy.risk_level, reason);
        }
        let matched = match check_path(compiled, request.target_path()) {
            Ok(matched) => matched,
            Err(reason) => return deny(policy.risk_level, reason),
        };

        let risk = assess(request, context, policy.risk_level, &self.config.risk);

        match self.confirmations.prior(&request.fingerprint()) {
            PriorConfirmation::Pending { id, prompt } => {
                return PolicyDecision::require_confirmation(
                    request_id,
                    name,
                    version,
                    risk.level,
                    format!("awaiting confirmation {id}"),
                    prompt,
                    id,
                );
            }
            PriorConfirmation::Granted { id, actor } => {
                return PolicyDecision::allow(
                    request_id,
                    name,
                    version,
                    risk.level,
                    format!("confirmed by '{actor}' (confirmation {id})"),
                );
            }
            PriorConfirmation::Refused { id, state } => {
                return deny(
                    risk.level,
                    format!("confirmation {id} was {state}; identical request refused until the grace period ends"),
                );
            }
            PriorConfirmation::None => {}
        }

        let user_key = format!("{}:{}", request.tool_name(), request.user_id());
        let checks = self.rate_checks(policy, request, &user_key);
        let (permit, rate_info) = match self.rate_limiter.acquire(&checks, self.clock.now_ms()) {
            RateLimitOutcome::Admitted { permit, info } => (permit, info),
            RateLimitOutcome::Limited(info) => {
                return PolicyDecision::rate_limited(request_id, name, version, risk.level, info);
            }
        };

        let mut rationale = Vec::new();
        if risk.level >= RiskLevel::High {
            rationale.push(format!("{} risk: {}", risk.level, risk.rationale(policy.risk_level)));
        }
        if policy.requires_confirmation_for(request.operation()) {
            rationale.push(format!(
                "policy '{name}' requires confirmation for {}",
                request.operation()
            ));
        }

        if !rationale.is_empty() {
            let rationale = rationale.join("; ");
            let target = request
                .target_path()
                .map(|p| format!(" on {}", p.display()))
                .unwrap_or_default();
            let prompt = format!(
                "Allow '{}' to {}{target}? Reason: {rationale}",
                request.tool_name(),
                request.operation()
            );
            // A racing identical submission may have opened the record first.
            let ticket = self.confirmations.pending_or_create(
                request,
                prompt,
                policy.confirmation_timeout(self.config.default_confirmation_timeout),
                Some(permit),
            );
            let reason = if ticket.created {
                format!("confirmation required: {rationale}")
            } else {
                format!("awaiting confirmation {}", ticket.id)
            };
            return PolicyDecision::require_confirmation(
                request_id,
                name,
                version,
                risk.level,
                reason,
                ticket.prompt,
                ticket.id,
            );
        }

        // The charge stays with the admitted request.
        drop(permit);
        let reason = match matched {
            Some(pattern) => format!("allowed by policy '{name}' (path matches '{pattern}')"),
            None => format!("allowed by policy '{name}'"),
        };
        PolicyDecision::allow(request_id, name, version, risk.level, reason).with_rate_limit_info(rate_info)
    }

    fn rate_checks<'a>(
        &'a self,
        policy: &'a Policy,
        request: &'a ToolRequest,
        user_key: &'a str,
    ) -> Vec<RateCheck<'a>> {
        let mut checks = Vec::new();
        if let Some(rule) = &self.config.global_rate_limit {
            checks.push(RateCheck {
                scope: RateScope::Global,
                key: GLOBAL_KEY,
                rule,
            });
        }
        if let Some(rule) = &policy.rate_limit {
            let key = match rule.scope {
                RateScope::Global => GLOBAL_KEY,
                RateScope::Tool => request.tool_name(),
                RateScope::User => user_key,
            };
            checks.push(RateCheck {
                scope: rule.scope,
                key,
                rule,
            });
        }
        if let Some(rule) = &self.config.per_user_rate_limit {
            checks.push(RateCheck {
                scope: RateScope::User,
                key: request.user_id(),
                rule,
            });
        }
        checks.sort_by_key(|c| c.scope);
        checks
    }

    fn record(&self, request: &ToolRequest, decision: &PolicyDecision, level: LogLevel) {
        let kind = decision.kind().as_str();
        if decision.is_allowed() {
            tracing::debug!(
                tool = request.tool_name(),
                request_id = request.request_id(),
                decision = kind,
                "{}",
                decision.reason()
            );
        } else if level == LogLevel::Warn {
            tracing::warn!(
                tool = request.tool_name(),
                request_id = request.request_id(),
                decision = kind,
                "{}",
                decision.reason()
            );
        } else {
            tracing::info!(
                tool = request.tool_name(),
                request_id = request.request_id(),
                decision = kind,
                "{}",
                decision.reason()
            );
        }

        let mut payload = json!({
            "reason": decision.reason(),
            "policy": decision.policy_name(),
            "policy_version": decision.policy_version(),
            "risk_level": decision.risk_level(),
            "operation": request.operation(),
            "user_id": request.user_id(),
            "session_id": request.session_id(),
            "target_path": request.target_path().map(|p| p.display().to_string()),
            "confirmation_id": decision.confirmation_id(),
            "rate_limit": decision.rate_limit_info(),
        });
        if let Value::Object(map) = &mut payload {
            if level == LogLevel::Debug {
                map.insert("parameters".to_string(), Value::Object(request.parameters().clone()));
            } else {
                let keys: Vec<&String> = request.parameters().keys().collect();
                map.insert("parameter_keys".to_string(), json!(keys));
            }
        }

        self.audit.append(
            AuditEvent::new(AuditEventKind::Decision, request.request_id(), self.clock.now_ms())
                .with_tool(request.tool_name())
                .with_decision(kind)
                .with_payload(payload),
        );
    }
}

fn check_context(policy: &Policy, request: &ToolRequest, context: &SecurityContext) -> Result<(), String> {
    if request.user_id() != context.user_id || request.session_id() != context.session_id {
        return Err("request user/session does not match the security context".to_string());
    }
    if policy.require_user_context && context.user_id.trim().is_empty() {
        return Err("policy requires an identified user".to_string());
    }
    if context.auth_level < policy.min_auth_level {
        return Err(format!(
            "authentication level {} below required {}",
            context.auth_level, policy.min_auth_level
        ));
    }
    if let Some(missing) = policy
        .required_capabilities
        .iter()
        .find(|cap| !context.has_capability(cap))
    {
        return Err(format!("missing required capability '{missing}'"));
    }
    Ok(())
}

fn check_operation(policy: &Policy, operation: Operation) -> Result<(), String> {
    if policy.forbidden_operations.contains(&operation) {
        return Err(format!("operation '{operation}' is forbidden"));
    }
    if !policy.allowed_operations.is_empty() && !policy.allowed_operations.contains(&operation) {
        return Err(format!("operation '{operation}' not in allowed_operations"));
    }
    Ok(())
}

/// Returns the allow pattern that matched, if the request has a target.
fn check_path(policy: &CompiledPolicy, target: Option<&Path>) -> Result<Option<String>, String> {
    let Some(raw) = target else {
        return Ok(None);
    };
    if !raw.is_absolute() {
        return Err(format!("target path '{}' must be absolute", raw.display()));
    }
    let path = normalize_path(raw);

    if let Some(pattern) = longest_match(policy.forbidden_patterns(), &path) {
        return Err(format!(
            "path '{}' matches forbidden pattern '{}'",
            path.display(),
            pattern.as_str()
        ));
    }
    match longest_match(policy.allowed_patterns(), &path) {
        Some(pattern) => Ok(Some(pattern.as_str().to_string())),
        None => Err(format!("path not in allowed_paths: '{}'", path.display())),
    }
}
