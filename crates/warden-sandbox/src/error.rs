//! Error types for the warden-sandbox crate.

/// Reasons a sandbox cannot be prepared. Every variant is treated as a deny.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    /// A path pattern is malformed.
    #[error("Invalid path pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The policy allow-list and the global floor do not overlap.
    #[error("Policy allow-list does not intersect the global sandbox floor")]
    EmptyAllowList,

    /// The target lies outside every resolved root.
    #[error("Path '{0}' is outside the sandbox allow-list")]
    PathOutsideAllowList(String),

    /// The decision handed in was not an ALLOW for this request.
    #[error("Sandbox requested without an allow decision ({0})")]
    NotAllowed(String),

    /// The request already holds an active sandbox.
    #[error("A sandbox is already active for request {0}")]
    AlreadyActive(String),

    /// Too many concurrent sandboxes or not enough memory budget.
    #[error("Sandbox capacity exhausted: {0}")]
    Capacity(String),

    /// The isolation backend cannot express this configuration.
    #[error("{0}")]
    BackendUnavailable(String),
}
