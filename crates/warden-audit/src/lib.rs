//! warden-audit: ordered, redacting, hash-chained audit trail for kernel decisions.

mod error;
pub mod event;
pub mod logger;
pub mod redact;
pub mod sink;
mod spill;

pub use error::AuditError;
pub use event::{
    sort_events, verify_chain, AuditEvent, AuditEventKind, AuditFilter, ChainBreak, GENESIS_DIGEST,
};
pub use logger::{AuditConfig, AuditLogger, AuditStats};
pub use redact::{Redactor, REDACTED_MARKER};
pub use sink::{AuditSink, JsonlSink, MemorySink};
