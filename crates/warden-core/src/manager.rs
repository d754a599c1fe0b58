//! `SafetyManager`: the single entry point collaborators call before any
//! tool side effect.

use crate::clock::{Clock, SystemClock};
use crate::config::KernelConfig;
use crate::confirmation::{ConfirmationCoordinator, ConfirmationOutcome, ConfirmationState, ConfirmationView};
use crate::decision::{DecisionKind, PolicyDecision};
use crate::engine::PolicyEngine;
use crate::error::WardenError;
use crate::policy::CompiledPolicy;
use crate::rate_limit::RateLimiter;
use crate::request::{SecurityContext, ToolRequest};
use crate::store::{PolicySnapshot, PolicyStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use warden_audit::{AuditEvent, AuditEventKind, AuditLogger, AuditStats};
use warden_sandbox::{SandboxConfig, SandboxError, SandboxLease, SandboxManager, SandboxRequest};

/// What happened to a request passed to [`SafetyManager::evaluate_and_execute`].
#[derive(Debug)]
pub enum Outcome<T, E> {
    /// The executor ran; `result` is whatever it returned.
    Executed { decision: PolicyDecision, result: Result<T, E> },
    /// A human must confirm before the identical request is resubmitted.
    PendingConfirmation { decision: PolicyDecision, confirmation_id: String },
    /// Denied, rate limited, or the sandbox could not be prepared.
    Blocked { decision: PolicyDecision },
}

impl<T, E> Outcome<T, E> {
    pub fn decision(&self) -> &PolicyDecision {
        match self {
            Outcome::Executed { decision, .. }
            | Outcome::PendingConfirmation { decision, .. }
            | Outcome::Blocked { decision } => decision,
        }
    }

    pub fn is_executed(&self) -> bool {
        matches!(self, Outcome::Executed { .. })
    }
}

/// Totals since startup plus live gauges.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelStatus {
    pub evaluated: u64,
    pub allowed: u64,
    pub denied: u64,
    pub rate_limited: u64,
    pub confirmation_required: u64,
    pub confirmed: u64,
    pub rejected: u64,
    pub executions: u64,
    pub execution_failures: u64,
    pub sandbox_failures: u64,
    pub active_sandboxes: usize,
    pub pending_confirmations: usize,
    pub policy_version: u64,
    pub policy_count: usize,
    pub rate_limit_counters: usize,
    pub audit: AuditStats,
}

#[derive(Debug, Default)]
struct Counters {
    evaluated: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    rate_limited: AtomicU64,
    confirmation_required: AtomicU64,
    confirmed: AtomicU64,
    rejected: AtomicU64,
    executions: AtomicU64,
    execution_failures: AtomicU64,
    sandbox_failures: AtomicU64,
}

impl Counters {
    fn count(&self, decision: &PolicyDecision) {
        self.evaluated.fetch_add(1, Ordering::Relaxed);
        let counter = match decision.kind() {
            DecisionKind::Allow => &self.allowed,
            DecisionKind::Deny => &self.denied,
            DecisionKind::RateLimited => &self.rate_limited,
            DecisionKind::RequireConfirmation => &self.confirmation_required,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Builder for [`SafetyManager`].
pub struct SafetyManagerBuilder {
    config: KernelConfig,
    policies: Option<PolicySnapshot>,
    audit: Option<AuditLogger>,
    clock: Arc<dyn Clock>,
    sandbox_env: Option<BTreeMap<String, String>>,
}

impl SafetyManagerBuilder {
    /// Start from `policies` instead of loading the configured directory.
    pub fn policies(mut self, snapshot: PolicySnapshot) -> Self {
        self.policies = Some(snapshot);
        self
    }

    pub fn audit(mut self, logger: AuditLogger) -> Self {
        self.audit = Some(logger);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Environment sandboxes filter from, instead of the process environment.
    pub fn sandbox_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.sandbox_env = Some(env);
        self
    }

    pub fn build(self) -> Result<SafetyManager, WardenError> {
        let audit = self
            .audit
            .ok_or_else(|| WardenError::Config("an audit logger is required".to_string()))?;

        let snapshot = match self.policies {
            Some(snapshot) => snapshot,
            None => {
                let dir = self.config.resolved_policy_dir();
                if dir.is_dir() {
                    PolicySnapshot::load_dir(&dir)?
                } else {
                    tracing::warn!(dir = %dir.display(), "Policy directory missing, every tool is denied");
                    PolicySnapshot::empty()
                }
            }
        };

        let mut sandbox = SandboxManager::new(self.config.sandbox.clone())?;
        if let Some(env) = self.sandbox_env {
            sandbox = sandbox.with_env(env);
        }

        let store = Arc::new(PolicyStore::new(snapshot));
        let rate_limiter = Arc::new(RateLimiter::new());
        let confirmations = Arc::new(ConfirmationCoordinator::new(
            self.config.confirmation.clone(),
            rate_limiter.clone(),
            audit.clone(),
            self.clock.clone(),
        ));
        let engine = PolicyEngine::new(
            store.clone(),
            rate_limiter.clone(),
            confirmations.clone(),
            audit.clone(),
            self.clock.clone(),
            self.config.engine_config(),
        );

        tracing::info!(
            policies = store.snapshot().len(),
            version = store.snapshot().version(),
            "Safety kernel ready"
        );

        Ok(SafetyManager {
            config: self.config,
            store,
            rate_limiter,
            confirmations,
            engine,
            sandbox,
            audit,
            clock: self.clock,
            counters: Counters::default(),
        })
    }
}

/// Facade over the policy engine, sandbox manager, confirmations and audit.
pub struct SafetyManager {
    config: KernelConfig,
    store: Arc<PolicyStore>,
    rate_limiter: Arc<RateLimiter>,
    confirmations: Arc<ConfirmationCoordinator>,
    engine: PolicyEngine,
    sandbox: SandboxManager,
    audit: AuditLogger,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl SafetyManager {
    pub fn builder(config: KernelConfig) -> SafetyManagerBuilder {
        SafetyManagerBuilder {
            config,
            policies: None,
            audit: None,
            clock: Arc::new(SystemClock),
            sandbox_env: None,
        }
    }

    /// Decide without executing anything.
    pub fn evaluate(&self, request: &ToolRequest, context: &SecurityContext) -> PolicyDecision {
        let decision = self.engine.evaluate(request, context);
        self.counters.count(&decision);
        decision
    }

    /// Evaluate `request` and, if allowed, run `executor` inside a prepared
    /// sandbox. The sandbox is released however the executor finishes,
    /// including when this future is dropped mid-flight.
    pub async fn evaluate_and_execute<F, Fut, T, E>(
        &self,
        request: ToolRequest,
        context: &SecurityContext,
        executor: F,
    ) -> Outcome<T, E>
    where
        F: FnOnce(SandboxConfig) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let evaluation = self.engine.evaluate_detailed(&request, context);
        let decision = evaluation.decision;
        self.counters.count(&decision);

        match decision.kind() {
            DecisionKind::Allow => {}
            DecisionKind::RequireConfirmation => {
                let confirmation_id = decision.confirmation_id().unwrap_or_default().to_string();
                return Outcome::PendingConfirmation {
                    decision,
                    confirmation_id,
                };
            }
            DecisionKind::Deny | DecisionKind::RateLimited => return Outcome::Blocked { decision },
        }

        let Some(policy) = evaluation.policy else {
            return Outcome::Blocked {
                decision: decision.into_sandbox_denial("no policy available for sandbox"),
            };
        };

        let lease = match self.sandbox.prepare(sandbox_request(&request, &policy)) {
            Ok(lease) => lease,
            Err(e) => {
                self.counters.sandbox_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    tool = request.tool_name(),
                    request_id = request.request_id(),
                    "Sandbox preparation failed: {e}"
                );
                self.audit.append(
                    AuditEvent::new(AuditEventKind::SandboxFailure, request.request_id(), self.clock.now_ms())
                        .with_tool(request.tool_name())
                        .with_decision(DecisionKind::Deny.as_str())
                        .with_payload(serde_json::json!({ "error": e.to_string() })),
                );
                return Outcome::Blocked {
                    decision: decision.into_sandbox_denial(e),
                };
            }
        };

        self.counters.executions.fetch_add(1, Ordering::Relaxed);
        let config = lease.config().clone();
        self.audit.append(
            AuditEvent::new(AuditEventKind::ExecutionStart, request.request_id(), self.clock.now_ms())
                .with_tool(request.tool_name())
                .with_payload(serde_json::json!({
                    "working_dir": config.working_dir,
                    "allowed_paths": config.allowed_paths,
                    "writable": config.writable,
                    "network_isolated": config.network_isolated,
                    "cpu_time_secs": config.cpu_time_limit.as_secs(),
                    "memory_limit_bytes": config.memory_limit_bytes,
                })),
        );

        let guard = ExecutionGuard {
            manager: self,
            request: &request,
            finished: false,
        };
        let result = executor(config).await;
        match &result {
            Ok(_) => guard.finish("success", None),
            Err(e) => {
                self.counters.execution_failures.fetch_add(1, Ordering::Relaxed);
                guard.finish("failure", Some(e.to_string()));
            }
        }
        lease.release();

        Outcome::Executed { decision, result }
    }

    /// Resolve a pending confirmation. Returns false for unknown ids, late
    /// answers and records someone else already resolved.
    pub fn confirm(&self, confirmation_id: &str, outcome: impl Into<ConfirmationOutcome>, actor: &str) -> bool {
        match self.resolve_confirmation(confirmation_id, outcome.into(), actor) {
            Ok(_) => true,
            Err(e) => {
                tracing::info!(confirmation_id, actor, "Confirmation not applied: {e}");
                false
            }
        }
    }

    /// Like [`confirm`](Self::confirm) but reports why a resolution failed.
    pub fn resolve_confirmation(
        &self,
        confirmation_id: &str,
        outcome: ConfirmationOutcome,
        actor: &str,
    ) -> Result<ConfirmationState, WardenError> {
        let state = self.confirmations.resolve(confirmation_id, outcome, actor)?;
        let counter = match state {
            ConfirmationState::Confirmed => &self.counters.confirmed,
            _ => &self.counters.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(state)
    }

    /// Withdraw a pending confirmation and refund its rate budget.
    pub fn cancel_confirmation(&self, confirmation_id: &str, actor: &str) -> Result<(), WardenError> {
        self.confirmations.cancel(confirmation_id, actor)?;
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn confirmation(&self, confirmation_id: &str) -> Option<ConfirmationView> {
        self.confirmations.get(confirmation_id)
    }

    /// Reload the configured policy directory. On error the active snapshot
    /// stays in place.
    pub fn reload_policies(&self) -> Result<u64, WardenError> {
        let dir = self.config.resolved_policy_dir();
        match PolicySnapshot::load_dir(&dir) {
            Ok(snapshot) => Ok(self.reload_with(snapshot)),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), "Policy reload rejected: {e}");
                self.audit_reload("rejected", serde_json::json!({
                    "source": dir.display().to_string(),
                    "error": e.to_string(),
                    "active_version": self.store.snapshot().version(),
                }));
                Err(e)
            }
        }
    }

    /// Publish a prepared snapshot. Returns its version.
    pub fn reload_with(&self, snapshot: PolicySnapshot) -> u64 {
        let previous = self.store.snapshot().version();
        let published = self.store.publish(snapshot);
        tracing::info!(
            previous,
            version = published.version(),
            policies = published.len(),
            "Policies reloaded"
        );
        self.audit_reload("applied", serde_json::json!({
            "previous_version": previous,
            "version": published.version(),
            "tools": published.tool_names(),
            "source": published.source().map(|p| p.display().to_string()),
        }));
        published.version()
    }

    /// Prepare a sandbox for a request this kernel already allowed, for
    /// collaborators that drive execution themselves. The lease releases the
    /// reservation when dropped.
    pub fn prepare_sandbox(
        &self,
        request: &ToolRequest,
        decision: &PolicyDecision,
    ) -> Result<SandboxLease, WardenError> {
        if !decision.is_allowed() || decision.request_id() != request.request_id() {
            return Err(SandboxError::NotAllowed(decision.kind().to_string()).into());
        }
        let policy = self.policy(request.tool_name())?;
        Ok(self.sandbox.prepare(sandbox_request(request, &policy))?)
    }

    /// The active policy for `tool_name`.
    pub fn policy(&self, tool_name: &str) -> Result<Arc<CompiledPolicy>, WardenError> {
        self.store
            .snapshot()
            .get(tool_name)
            .cloned()
            .ok_or_else(|| WardenError::PolicyNotFound(tool_name.to_string()))
    }

    pub fn policies(&self) -> Arc<PolicySnapshot> {
        self.store.snapshot()
    }

    pub fn get_status(&self) -> KernelStatus {
        let c = &self.counters;
        let snapshot = self.store.snapshot();
        KernelStatus {
            evaluated: c.evaluated.load(Ordering::Relaxed),
            allowed: c.allowed.load(Ordering::Relaxed),
            denied: c.denied.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            confirmation_required: c.confirmation_required.load(Ordering::Relaxed),
            confirmed: c.confirmed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            executions: c.executions.load(Ordering::Relaxed),
            execution_failures: c.execution_failures.load(Ordering::Relaxed),
            sandbox_failures: c.sandbox_failures.load(Ordering::Relaxed),
            active_sandboxes: self.sandbox.active_count(),
            pending_confirmations: self.confirmations.pending_count(),
            policy_version: snapshot.version(),
            policy_count: snapshot.len(),
            rate_limit_counters: self.rate_limiter.counter_count(),
            audit: self.audit.stats(),
        }
    }

    /// Expire overdue confirmations and prune idle rate counters once.
    pub fn run_maintenance(&self) {
        let report = self.confirmations.sweep();
        let pruned = self.rate_limiter.prune(self.clock.now_ms());
        if report.expired > 0 || report.removed > 0 || pruned > 0 {
            tracing::debug!(
                expired = report.expired,
                removed = report.removed,
                pruned,
                "Maintenance pass"
            );
        }
    }

    /// Run [`run_maintenance`](Self::run_maintenance) every `interval` until
    /// the manager is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval.max(Duration::from_millis(10)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.run_maintenance();
            }
        })
    }

    /// Sweep interval from the configuration.
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.config.confirmation.sweep_interval_secs.max(1))
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn sandbox(&self) -> &SandboxManager {
        &self.sandbox
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn audit_reload(&self, outcome: &str, payload: serde_json::Value) {
        let request_id = format!("policy-reload-{}", ulid::Ulid::new());
        self.audit.append(
            AuditEvent::new(AuditEventKind::PolicyReload, request_id, self.clock.now_ms())
                .with_decision(outcome)
                .with_payload(payload),
        );
    }
}

fn sandbox_request<'a>(request: &'a ToolRequest, policy: &'a CompiledPolicy) -> SandboxRequest<'a> {
    SandboxRequest {
        request_id: request.request_id(),
        target_path: request.target_path(),
        allowed_paths: &policy.policy().allowed_paths,
        forbidden_paths: &policy.policy().forbidden_paths,
        profile: &policy.policy().sandbox,
        writable: request.operation().needs_write_access(),
    }
}

/// Emits the execution-end event exactly once, as "cancelled" if the
/// executor never completed.
struct ExecutionGuard<'a> {
    manager: &'a SafetyManager,
    request: &'a ToolRequest,
    finished: bool,
}

impl ExecutionGuard<'_> {
    fn finish(mut self, status: &str, error: Option<String>) {
        self.finished = true;
        self.emit(status, error);
    }

    fn emit(&self, status: &str, error: Option<String>) {
        let mut payload = serde_json::json!({ "status": status });
        if let Some(error) = error {
            payload["error"] = serde_json::Value::String(error);
        }
        self.manager.audit.append(
            AuditEvent::new(
                AuditEventKind::ExecutionEnd,
                self.request.request_id(),
                self.manager.clock.now_ms(),
            )
            .with_tool(self.request.tool_name())
            .with_decision(status)
            .with_payload(payload),
        );
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                tool = self.request.tool_name(),
                request_id = self.request.request_id(),
                "Execution cancelled before completion"
            );
            self.emit("cancelled", None);
        }
    }
}
