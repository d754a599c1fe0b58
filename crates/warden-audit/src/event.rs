//! Audit event types and the hash chain that links persisted events.

use serde::{Deserialize, Serialize};

/// Anchor digest used as `prev_digest` for the very first persisted event.
pub const GENESIS_DIGEST: &str = "genesis";

/// What a single audit event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// The policy decision rendered for a request.
    Decision,
    /// The executor was handed a sandbox and started.
    ExecutionStart,
    /// The executor finished, failed, or was cancelled.
    ExecutionEnd,
    /// A confirmation record changed state.
    ConfirmationTransition,
    /// Sandbox preparation failed after an allow decision.
    SandboxFailure,
    /// A policy snapshot was swapped in (or a reload was rejected).
    PolicyReload,
}

impl AuditEventKind {
    /// Stable string identifier.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::ExecutionStart => "execution_start",
            Self::ExecutionEnd => "execution_end",
            Self::ConfirmationTransition => "confirmation_transition",
            Self::SandboxFailure => "sandbox_failure",
            Self::PolicyReload => "policy_reload",
        }
    }
}

/// A single append-only audit record.
///
/// `seq` and the final `timestamp` are assigned by the logger on append, the
/// digests by the writer when the event reaches the durable sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event identifier (ULID).
    pub id: String,
    /// Request the event belongs to.
    pub request_id: String,
    /// Per-request sequence number, starting at 0.
    pub seq: u64,
    /// Event kind.
    pub kind: AuditEventKind,
    /// Tool the request targeted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Decision label (`allow`, `deny`, ...) when relevant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    /// Event details, redacted before persistence.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    /// Digest of the previously persisted event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_digest: Option<String>,
    /// Digest of this event chained onto `prev_digest`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl AuditEvent {
    /// Create an event for `request_id` observed at `timestamp` (unix ms).
    pub fn new(kind: AuditEventKind, request_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            request_id: request_id.into(),
            seq: 0,
            kind,
            tool_name: None,
            decision: None,
            payload: serde_json::Value::Null,
            timestamp,
            prev_digest: None,
            digest: None,
        }
    }

    /// Attach the tool name.
    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    /// Attach a decision label.
    pub fn with_decision(mut self, decision: impl Into<String>) -> Self {
        self.decision = Some(decision.into());
        self
    }

    /// Attach the payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Compute this event's digest chained onto `prev`.
    pub fn compute_digest(&self, prev: &str) -> String {
        let mut body = self.clone();
        body.prev_digest = None;
        body.digest = None;
        let bytes = serde_json::to_vec(&body).unwrap_or_default();

        let mut hasher = blake3::Hasher::new();
        hasher.update(prev.as_bytes());
        hasher.update(&bytes);
        hasher.finalize().to_hex().to_string()
    }

    /// Strip chain fields, e.g. before spilling an event whose write failed.
    pub(crate) fn unchain(&mut self) {
        self.prev_digest = None;
        self.digest = None;
    }
}

/// Search filter over audit events. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Only events for this tool.
    pub tool_name: Option<String>,
    /// Only events for this request.
    pub request_id: Option<String>,
    /// Only events of this kind.
    pub kind: Option<AuditEventKind>,
    /// Only events with this decision label.
    pub decision: Option<String>,
    /// Inclusive lower bound (unix ms).
    pub since: Option<u64>,
    /// Exclusive upper bound (unix ms).
    pub until: Option<u64>,
    /// Maximum number of events returned (oldest first).
    pub limit: Option<usize>,
}

impl AuditFilter {
    /// Whether `event` passes every set criterion.
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(ref tool) = self.tool_name {
            if event.tool_name.as_deref() != Some(tool.as_str()) {
                return false;
            }
        }
        if let Some(ref request_id) = self.request_id {
            if &event.request_id != request_id {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if event.kind != kind {
                return false;
            }
        }
        if let Some(ref decision) = self.decision {
            if event.decision.as_deref() != Some(decision.as_str()) {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.timestamp >= until) {
            return false;
        }
        true
    }
}

/// Order events by time, then request, then per-request sequence.
///
/// Timestamps never decrease within one request, so this ordering keeps each
/// request's events in sequence order.
pub fn sort_events(events: &mut [AuditEvent]) {
    events.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.request_id.cmp(&b.request_id))
            .then_with(|| a.seq.cmp(&b.seq))
    });
}

/// Where a persisted chain stops verifying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Audit chain broken at index {index} (event {event_id}): {reason}")]
pub struct ChainBreak {
    /// Position in persistence order.
    pub index: usize,
    /// Offending event.
    pub event_id: String,
    /// What failed.
    pub reason: String,
}

/// Verify a chain of events in persistence order; returns the number checked.
///
/// The first event's `prev_digest` is trusted as the anchor so that a chain
/// truncated by retention still verifies.
pub fn verify_chain(events: &[AuditEvent]) -> Result<usize, ChainBreak> {
    let mut expected_prev: Option<&str> = None;

    for (index, event) in events.iter().enumerate() {
        let brk = |reason: &str| ChainBreak {
            index,
            event_id: event.id.clone(),
            reason: reason.to_string(),
        };

        let prev = event.prev_digest.as_deref().ok_or_else(|| brk("missing prev_digest"))?;
        let digest = event.digest.as_deref().ok_or_else(|| brk("missing digest"))?;

        if let Some(expected) = expected_prev {
            if prev != expected {
                return Err(brk("prev_digest does not link to previous event"));
            }
        }
        if event.compute_digest(prev) != digest {
            return Err(brk("digest mismatch"));
        }
        expected_prev = Some(digest);
    }

    Ok(events.len())
}
