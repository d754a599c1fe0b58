//! warden-sandbox: derives least-privilege isolation parameters for approved
//! tool executions and tracks their reservations.

pub mod backend;
mod error;
pub mod manager;
pub mod paths;
pub mod profile;

pub use backend::{wrap_command, IsolationBackend};
pub use error::SandboxError;
pub use manager::{SandboxConfig, SandboxLease, SandboxManager, SandboxRequest};
pub use paths::{compile_patterns, longest_match, normalize_path, path_depth, PathPattern};
pub use profile::{SandboxFloor, SandboxProfile};
