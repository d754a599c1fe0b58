//! Error types for the warden-core crate.

use warden_audit::AuditError;
use warden_sandbox::SandboxError;

/// Core error type for the safety kernel.
///
/// Policy outcomes (deny, rate-limited, confirmation required) are decisions,
/// not errors; these variants cover loading, resolution and plumbing failures.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// No policy is registered for the tool.
    #[error("No policy for tool '{0}'")]
    PolicyNotFound(String),

    /// A policy document failed to parse or validate; the reload was aborted.
    #[error("Invalid policy document {path}: {reason}")]
    InvalidPolicyDocument { path: String, reason: String },

    /// Unknown confirmation id.
    #[error("Confirmation not found: {0}")]
    ConfirmationNotFound(String),

    /// The confirmation was already resolved (or expired).
    #[error("Confirmation {id} already {state}")]
    ConfirmationConflict { id: String, state: String },

    /// Sandbox preparation failed.
    #[error("Sandbox preparation failed: {0}")]
    SandboxPreparation(#[from] SandboxError),

    /// Audit pipeline error (only surfaced by audit queries, never by decisions).
    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    /// Invalid kernel configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
