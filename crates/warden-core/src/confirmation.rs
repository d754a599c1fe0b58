//! Human-in-the-loop confirmation records.
//!
//! A record moves PENDING -> CONFIRMED | DENIED | EXPIRED exactly once; the
//! transition is a compare-and-swap on the state byte, so concurrent resolvers
//! cannot both win.

use crate::clock::Clock;
use crate::error::WardenError;
use crate::rate_limit::{RateLimitPermit, RateLimiter};
use crate::request::ToolRequest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use warden_audit::{AuditEvent, AuditEventKind, AuditLogger};

/// State of a confirmation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConfirmationState {
    Pending = 0,
    Confirmed = 1,
    Denied = 2,
    Expired = 3,
}

impl ConfirmationState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Confirmed,
            2 => Self::Denied,
            _ => Self::Expired,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ConfirmationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A human's answer to a confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    Approved,
    Rejected,
}

impl From<bool> for ConfirmationOutcome {
    fn from(approved: bool) -> Self {
        if approved {
            Self::Approved
        } else {
            Self::Rejected
        }
    }
}

impl ConfirmationOutcome {
    fn target_state(self) -> ConfirmationState {
        match self {
            Self::Approved => ConfirmationState::Confirmed,
            Self::Rejected => ConfirmationState::Denied,
        }
    }
}

/// Timing for confirmation records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// Used when a policy does not set its own timeout.
    pub default_timeout_secs: u64,
    /// How long a terminal record still answers an identical resubmission.
    pub grace_period_secs: u64,
    /// Interval of the maintenance sweep.
    pub sweep_interval_secs: u64,
    /// How long terminal records are kept for inspection before removal.
    pub retention_secs: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            grace_period_secs: 60,
            sweep_interval_secs: 5,
            retention_secs: 3600,
        }
    }
}

#[derive(Debug, Clone)]
struct Resolution {
    actor: String,
    at: u64,
}

#[derive(Debug)]
struct ConfirmationRecord {
    id: String,
    request_id: String,
    fingerprint: String,
    tool_name: String,
    prompt: String,
    created_at: u64,
    expires_at: u64,
    state: AtomicU8,
    resolution: Mutex<Option<Resolution>>,
    permit: Mutex<Option<RateLimitPermit>>,
    grant_used: AtomicBool,
}

impl ConfirmationRecord {
    fn state(&self) -> ConfirmationState {
        ConfirmationState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn resolution(&self) -> Option<Resolution> {
        self.resolution
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// When the record reached its terminal state.
    fn terminal_at(&self) -> Option<u64> {
        match self.state() {
            ConfirmationState::Pending => None,
            ConfirmationState::Expired => Some(self.resolution().map_or(self.expires_at, |r| r.at)),
            _ => self.resolution().map(|r| r.at),
        }
    }

    fn take_permit(&self) -> Option<RateLimitPermit> {
        self.permit
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    fn view(&self) -> ConfirmationView {
        let resolution = self.resolution();
        ConfirmationView {
            id: self.id.clone(),
            request_id: self.request_id.clone(),
            tool_name: self.tool_name.clone(),
            prompt: self.prompt.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            state: self.state(),
            resolved_by: resolution.as_ref().map(|r| r.actor.clone()),
            resolved_at: resolution.map(|r| r.at),
        }
    }
}

/// Read-only copy of a confirmation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationView {
    pub id: String,
    pub request_id: String,
    pub tool_name: String,
    pub prompt: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub state: ConfirmationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<u64>,
}

/// What an earlier confirmation says about an identical resubmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorConfirmation {
    /// No record, or the last one is outside its grace horizon.
    None,
    /// Still waiting for a human.
    Pending { id: String, prompt: String },
    /// Approved; this call consumed the one-time grant.
    Granted { id: String, actor: String },
    /// Denied or expired recently.
    Refused { id: String, state: ConfirmationState },
}

/// The record a confirmation-requiring request was attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationTicket {
    pub id: String,
    pub prompt: String,
    /// False when an identical request was already pending.
    pub created: bool,
}

/// Counts from a [`ConfirmationCoordinator::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub removed: usize,
}

/// Owns every confirmation record and its state machine.
pub struct ConfirmationCoordinator {
    records: RwLock<HashMap<String, Arc<ConfirmationRecord>>>,
    by_fingerprint: Mutex<HashMap<String, String>>,
    rate_limiter: Arc<RateLimiter>,
    audit: AuditLogger,
    clock: Arc<dyn Clock>,
    config: ConfirmationConfig,
}

impl ConfirmationCoordinator {
    pub fn new(
        config: ConfirmationConfig,
        rate_limiter: Arc<RateLimiter>,
        audit: AuditLogger,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            by_fingerprint: Mutex::new(HashMap::new()),
            rate_limiter,
            audit,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ConfirmationConfig {
        &self.config
    }

    /// Open a PENDING record for `request`. Returns its id.
    pub fn create(&self, request: &ToolRequest, prompt: impl Into<String>, timeout: Duration) -> String {
        self.create_with_permit(request, prompt, timeout, None)
    }

    /// Like [`create`](Self::create), parking `permit` on the record. The
    /// budget is refunded if the record ends denied or expired.
    pub fn create_with_permit(
        &self,
        request: &ToolRequest,
        prompt: impl Into<String>,
        timeout: Duration,
        permit: Option<RateLimitPermit>,
    ) -> String {
        let fingerprint = request.fingerprint();
        let mut fingerprints = self.fingerprints();
        self.insert_locked(&mut fingerprints, request, fingerprint, prompt.into(), timeout, permit)
    }

    /// Join the PENDING record for an identical request, or open one.
    ///
    /// The lookup and the insert happen under the fingerprint lock, so
    /// concurrent identical submissions share a single record. A caller that
    /// joins an existing record gets `permit` refunded.
    pub fn pending_or_create(
        &self,
        request: &ToolRequest,
        prompt: impl Into<String>,
        timeout: Duration,
        permit: Option<RateLimitPermit>,
    ) -> ConfirmationTicket {
        let fingerprint = request.fingerprint();
        let mut fingerprints = self.fingerprints();

        let existing = fingerprints.get(&fingerprint).and_then(|id| self.record(id));
        if let Some(record) = existing {
            self.expire_if_due(&record, self.clock.now_ms());
            if record.state() == ConfirmationState::Pending {
                drop(fingerprints);
                if let Some(permit) = permit {
                    self.rate_limiter.release(permit);
                }
                tracing::debug!(
                    confirmation_id = %record.id,
                    request_id = request.request_id(),
                    "Joined pending confirmation"
                );
                return ConfirmationTicket {
                    id: record.id.clone(),
                    prompt: record.prompt.clone(),
                    created: false,
                };
            }
        }

        let prompt = prompt.into();
        let id = self.insert_locked(&mut fingerprints, request, fingerprint, prompt.clone(), timeout, permit);
        ConfirmationTicket {
            id,
            prompt,
            created: true,
        }
    }

    /// Caller holds the fingerprint lock; records are locked after it.
    fn insert_locked(
        &self,
        fingerprints: &mut HashMap<String, String>,
        request: &ToolRequest,
        fingerprint: String,
        prompt: String,
        timeout: Duration,
        permit: Option<RateLimitPermit>,
    ) -> String {
        let now = self.clock.now_ms();
        let id = ulid::Ulid::new().to_string();
        let record = Arc::new(ConfirmationRecord {
            id: id.clone(),
            request_id: request.request_id().to_string(),
            fingerprint: fingerprint.clone(),
            tool_name: request.tool_name().to_string(),
            prompt,
            created_at: now,
            expires_at: now.saturating_add(timeout.as_millis() as u64),
            state: AtomicU8::new(ConfirmationState::Pending as u8),
            resolution: Mutex::new(None),
            permit: Mutex::new(permit),
            grant_used: AtomicBool::new(false),
        });

        self.records_write().insert(id.clone(), record);
        fingerprints.insert(fingerprint, id.clone());

        tracing::info!(
            confirmation_id = %id,
            request_id = request.request_id(),
            tool = request.tool_name(),
            timeout_secs = timeout.as_secs(),
            "Confirmation requested"
        );
        id
    }

    /// Resolve a PENDING record. The first resolver wins; later calls get
    /// `ConfirmationConflict` with the final state and change nothing.
    /// A resolution arriving after the deadline expires the record instead.
    pub fn resolve(
        &self,
        id: &str,
        outcome: ConfirmationOutcome,
        actor: &str,
    ) -> Result<ConfirmationState, WardenError> {
        let record = self
            .record(id)
            .ok_or_else(|| WardenError::ConfirmationNotFound(id.to_string()))?;
        let now = self.clock.now_ms();

        if self.expire_if_due(&record, now) || now >= record.expires_at {
            return Err(conflict(&record));
        }

        let target = outcome.target_state();
        if self.transition(&record, target, actor, now) {
            Ok(target)
        } else {
            Err(conflict(&record))
        }
    }

    /// Withdraw a PENDING record (recorded as DENIED) and refund its budget.
    pub fn cancel(&self, id: &str, actor: &str) -> Result<ConfirmationState, WardenError> {
        let record = self
            .record(id)
            .ok_or_else(|| WardenError::ConfirmationNotFound(id.to_string()))?;
        let now = self.clock.now_ms();
        if self.expire_if_due(&record, now) {
            return Err(conflict(&record));
        }
        if self.transition(&record, ConfirmationState::Denied, actor, now) {
            Ok(ConfirmationState::Denied)
        } else {
            Err(conflict(&record))
        }
    }

    /// Current view of a record, expiring it first if its deadline passed.
    pub fn get(&self, id: &str) -> Option<ConfirmationView> {
        let record = self.record(id)?;
        self.expire_if_due(&record, self.clock.now_ms());
        Some(record.view())
    }

    /// Look up the latest record for `fingerprint`.
    ///
    /// A CONFIRMED record within the grace period yields `Granted` exactly
    /// once; every later lookup sees `None`.
    pub fn prior(&self, fingerprint: &str) -> PriorConfirmation {
        let id = match self.fingerprints().get(fingerprint) {
            Some(id) => id.clone(),
            None => return PriorConfirmation::None,
        };
        let Some(record) = self.record(&id) else {
            return PriorConfirmation::None;
        };
        let now = self.clock.now_ms();
        self.expire_if_due(&record, now);

        let state = record.state();
        if state == ConfirmationState::Pending {
            return PriorConfirmation::Pending {
                id,
                prompt: record.prompt.clone(),
            };
        }

        let grace = self.config.grace_period_secs.saturating_mul(1000);
        let within_grace = record
            .terminal_at()
            .is_some_and(|at| now < at.saturating_add(grace));
        if !within_grace {
            return PriorConfirmation::None;
        }

        match state {
            ConfirmationState::Confirmed => {
                if record.grant_used.swap(true, Ordering::SeqCst) {
                    return PriorConfirmation::None;
                }
                // The parked budget is now spent by the execution.
                drop(record.take_permit());
                PriorConfirmation::Granted {
                    id,
                    actor: record.resolution().map(|r| r.actor).unwrap_or_default(),
                }
            }
            _ => PriorConfirmation::Refused { id, state },
        }
    }

    /// Expire overdue records and drop terminal ones past retention.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now_ms();
        let records: Vec<_> = self.records_read().values().cloned().collect();

        let mut report = SweepReport::default();
        let keep_ms = self
            .config
            .retention_secs
            .max(self.config.grace_period_secs)
            .saturating_mul(1000);
        let mut stale = Vec::new();
        for record in records {
            if self.expire_if_due(&record, now) {
                report.expired += 1;
            }
            if record
                .terminal_at()
                .is_some_and(|at| now >= at.saturating_add(keep_ms))
            {
                stale.push(record);
            }
        }

        if !stale.is_empty() {
            let mut fingerprints = self.fingerprints();
            let mut records = self.records_write();
            for record in &stale {
                records.remove(&record.id);
                if fingerprints.get(&record.fingerprint) == Some(&record.id) {
                    fingerprints.remove(&record.fingerprint);
                }
            }
            report.removed = stale.len();
        }
        report
    }

    pub fn pending_count(&self) -> usize {
        self.records_read()
            .values()
            .filter(|r| r.state() == ConfirmationState::Pending)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records_read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records_read().is_empty()
    }

    fn expire_if_due(&self, record: &ConfirmationRecord, now: u64) -> bool {
        now >= record.expires_at
            && self.transition(record, ConfirmationState::Expired, "system", record.expires_at)
    }

    /// PENDING -> `to`. Returns false if another transition won.
    fn transition(&self, record: &ConfirmationRecord, to: ConfirmationState, actor: &str, at: u64) -> bool {
        if record
            .state
            .compare_exchange(
                ConfirmationState::Pending as u8,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }

        *record
            .resolution
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Resolution {
            actor: actor.to_string(),
            at,
        });

        if to != ConfirmationState::Confirmed {
            if let Some(permit) = record.take_permit() {
                self.rate_limiter.release(permit);
            }
        }

        tracing::info!(
            confirmation_id = %record.id,
            request_id = %record.request_id,
            tool = %record.tool_name,
            state = to.as_str(),
            actor,
            "Confirmation resolved"
        );
        self.audit.append(
            AuditEvent::new(AuditEventKind::ConfirmationTransition, &record.request_id, at.max(record.created_at))
                .with_tool(&record.tool_name)
                .with_decision(to.as_str())
                .with_payload(serde_json::json!({
                    "confirmation_id": record.id,
                    "from": ConfirmationState::Pending.as_str(),
                    "to": to.as_str(),
                    "actor": actor,
                })),
        );
        true
    }

    fn record(&self, id: &str) -> Option<Arc<ConfirmationRecord>> {
        self.records_read().get(id).cloned()
    }

    fn records_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ConfirmationRecord>>> {
        self.records.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn records_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ConfirmationRecord>>> {
        self.records.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn fingerprints(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.by_fingerprint
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn conflict(record: &ConfirmationRecord) -> WardenError {
    WardenError::ConfirmationConflict {
        id: record.id.clone(),
        state: record.state().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::policy::{RateLimitRule, RateScope};
    use crate::rate_limit::{RateCheck, RateLimitOutcome};
    use crate::request::{Operation, SecurityContext};
    use tempfile::TempDir;
    use warden_audit::{AuditConfig, AuditFilter, MemorySink};

    struct Fixture {
        coordinator: Arc<ConfirmationCoordinator>,
        clock: ManualClock,
        limiter: Arc<RateLimiter>,
        audit: AuditLogger,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let audit_config = AuditConfig {
            dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let (audit, _writer) = AuditLogger::spawn(&audit_config, Arc::new(MemorySink::new())).unwrap();
        let clock = ManualClock::new(1_000_000);
        let limiter = Arc::new(RateLimiter::new());
        let coordinator = Arc::new(ConfirmationCoordinator::new(
            ConfirmationConfig::default(),
            limiter.clone(),
            audit.clone(),
            Arc::new(clock.clone()),
        ));
        Fixture {
            coordinator,
            clock,
            limiter,
            audit,
            _dir: dir,
        }
    }

    fn request() -> ToolRequest {
        ToolRequest::new("terminal", Operation::Execute, &SecurityContext::new("alice", "s1"))
            .with_parameter("cmd", "ls")
    }

    #[tokio::test]
    async fn test_first_resolver_wins() {
        let fx = fixture();
        let id = fx.coordinator.create(&request(), "run ls?", Duration::from_secs(30));

        let first = fx.coordinator.resolve(&id, ConfirmationOutcome::Approved, "alice");
        assert_eq!(first.unwrap(), ConfirmationState::Confirmed);

        let second = fx.coordinator.resolve(&id, ConfirmationOutcome::Rejected, "bob");
        assert!(matches!(second, Err(WardenError::ConfirmationConflict { ref state, .. }) if state == "confirmed"));

        let view = fx.coordinator.get(&id).unwrap();
        assert_eq!(view.state, ConfirmationState::Confirmed);
        assert_eq!(view.resolved_by.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let fx = fixture();
        assert!(matches!(
            fx.coordinator.resolve("nope", ConfirmationOutcome::Approved, "a"),
            Err(WardenError::ConfirmationNotFound(_))
        ));
        assert!(fx.coordinator.get("nope").is_none());
    }

    #[tokio::test]
    async fn test_late_confirmation_is_expired() {
        let fx = fixture();
        let id = fx.coordinator.create(&request(), "p", Duration::from_secs(5));
        fx.clock.advance(Duration::from_secs(5));

        let late = fx.coordinator.resolve(&id, ConfirmationOutcome::Approved, "alice");
        assert!(matches!(late, Err(WardenError::ConfirmationConflict { ref state, .. }) if state == "expired"));
        assert_eq!(fx.coordinator.get(&id).unwrap().state, ConfirmationState::Expired);
    }

    #[tokio::test]
    async fn test_grant_is_consumed_once() {
        let fx = fixture();
        let req = request();
        let id = fx.coordinator.create(&req, "p", Duration::from_secs(30));
        assert!(matches!(fx.coordinator.prior(&req.fingerprint()), PriorConfirmation::Pending { .. }));

        fx.coordinator.resolve(&id, ConfirmationOutcome::Approved, "alice").unwrap();
        assert!(matches!(
            fx.coordinator.prior(&req.fingerprint()),
            PriorConfirmation::Granted { ref actor, .. } if actor == "alice"
        ));
        assert_eq!(fx.coordinator.prior(&req.fingerprint()), PriorConfirmation::None);
    }

    #[tokio::test]
    async fn test_refusal_answers_within_grace_only() {
        let fx = fixture();
        let req = request();
        let id = fx.coordinator.create(&req, "p", Duration::from_secs(30));
        fx.coordinator.resolve(&id, ConfirmationOutcome::Rejected, "alice").unwrap();

        assert_eq!(
            fx.coordinator.prior(&req.fingerprint()),
            PriorConfirmation::Refused {
                id,
                state: ConfirmationState::Denied
            }
        );
        fx.clock.advance(Duration::from_secs(61));
        assert_eq!(fx.coordinator.prior(&req.fingerprint()), PriorConfirmation::None);
    }

    #[tokio::test]
    async fn test_cancel_refunds_parked_budget() {
        let fx = fixture();
        let rule = RateLimitRule::new(RateScope::Tool, 1, Duration::from_secs(60));
        let checks = [RateCheck {
            scope: RateScope::Tool,
            key: "terminal",
            rule: &rule,
        }];
        let RateLimitOutcome::Admitted { permit, .. } = fx.limiter.acquire(&checks, 0) else {
            panic!("first request admitted");
        };
        let id = fx
            .coordinator
            .create_with_permit(&request(), "p", Duration::from_secs(30), Some(permit));
        assert_eq!(fx.limiter.remaining(&checks[0], 1).remaining, 0);

        assert_eq!(fx.coordinator.cancel(&id, "alice").unwrap(), ConfirmationState::Denied);
        assert_eq!(fx.limiter.remaining(&checks[0], 1).remaining, 1);
        assert!(fx.coordinator.cancel(&id, "alice").is_err());
    }

    #[tokio::test]
    async fn test_sweep_expires_and_removes() {
        let fx = fixture();
        fx.coordinator.create(&request(), "p", Duration::from_secs(5));
        assert_eq!(fx.coordinator.pending_count(), 1);

        fx.clock.advance(Duration::from_secs(6));
        assert_eq!(fx.coordinator.sweep(), SweepReport { expired: 1, removed: 0 });
        assert_eq!(fx.coordinator.pending_count(), 0);

        fx.clock.advance(Duration::from_secs(3600));
        assert_eq!(fx.coordinator.sweep(), SweepReport { expired: 0, removed: 1 });
        assert!(fx.coordinator.is_empty());
    }

    #[tokio::test]
    async fn test_transitions_are_audited() {
        let fx = fixture();
        let req = request();
        let id = fx.coordinator.create(&req, "p", Duration::from_secs(5));
        fx.clock.advance(Duration::from_secs(10));
        fx.coordinator.sweep();
        fx.audit.flush().await.unwrap();

        let events = fx
            .audit
            .search(&AuditFilter {
                request_id: Some(req.request_id().to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AuditEventKind::ConfirmationTransition);
        assert_eq!(events[0].decision.as_deref(), Some("expired"));
        assert_eq!(events[0].payload["confirmation_id"], id.as_str());
    }

    #[tokio::test]
    async fn test_identical_pending_request_joins_and_refunds() {
        let fx = fixture();
        let rule = RateLimitRule::new(RateScope::Tool, 2, Duration::from_secs(60));
        let check = RateCheck {
            scope: RateScope::Tool,
            key: "terminal",
            rule: &rule,
        };
        let admit = || match fx.limiter.acquire(std::slice::from_ref(&check), 0) {
            RateLimitOutcome::Admitted { permit, .. } => permit,
            RateLimitOutcome::Limited(_) => panic!("budget available"),
        };

        let req = request();
        let first = fx
            .coordinator
            .pending_or_create(&req, "first", Duration::from_secs(30), Some(admit()));
        let second = fx
            .coordinator
            .pending_or_create(&req, "second", Duration::from_secs(30), Some(admit()));

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.prompt, "first");
        assert_eq!(fx.coordinator.len(), 1);
        assert_eq!(fx.limiter.remaining(&check, 1).remaining, 1);

        fx.coordinator.resolve(&first.id, ConfirmationOutcome::Rejected, "alice").unwrap();
        fx.clock.advance(Duration::from_secs(61));
        let third = fx
            .coordinator
            .pending_or_create(&req, "third", Duration::from_secs(30), None);
        assert!(third.created);
        assert_ne!(third.id, first.id);
    }

    #[test]
    fn test_concurrent_identical_requests_share_one_record() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let fx = runtime.block_on(async { fixture() });
        let req = request();

        for _ in 0..20 {
            let barrier = Arc::new(std::sync::Barrier::new(8));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let coordinator = fx.coordinator.clone();
                    let barrier = barrier.clone();
                    let req = req.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        coordinator
                            .pending_or_create(&req, "p", Duration::from_secs(30), None)
                            .id
                    })
                })
                .collect();
            let ids: std::collections::HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(ids.len(), 1);
            assert_eq!(fx.coordinator.pending_count(), 1);

            let id = ids.into_iter().next().unwrap();
            fx.coordinator.cancel(&id, "alice").unwrap();
            fx.clock.advance(Duration::from_secs(61));
        }
        assert_eq!(fx.coordinator.len(), 20);
    }

    #[test]
    fn test_concurrent_resolvers_single_winner() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let fx = runtime.block_on(async { fixture() });
        let id = fx.coordinator.create(&request(), "p", Duration::from_secs(30));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let coordinator = fx.coordinator.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    coordinator
                        .resolve(&id, ConfirmationOutcome::from(i % 2 == 0), &format!("actor-{i}"))
                        .is_ok()
                })
            })
            .collect();
        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(winners, 1);
        assert!(fx.coordinator.get(&id).unwrap().state.is_terminal());
    }
}
