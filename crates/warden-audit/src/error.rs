//! Error types for the warden-audit crate.

/// Errors raised by audit sinks and the spill store.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The durable backend refused or failed the write.
    #[error("Audit sink unavailable: {0}")]
    SinkUnavailable(String),

    /// A persisted line could not be parsed.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// The writer task has stopped.
    #[error("Audit writer stopped")]
    WriterStopped,

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
