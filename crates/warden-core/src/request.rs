//! Request and caller-context types evaluated by the kernel.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Kind of side effect a tool invocation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Write,
    Delete,
    Execute,
    Network,
    Generate,
    Automate,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::Read,
        Operation::Write,
        Operation::Delete,
        Operation::Execute,
        Operation::Network,
        Operation::Generate,
        Operation::Automate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Delete => "delete",
            Operation::Execute => "execute",
            Operation::Network => "network",
            Operation::Generate => "generate",
            Operation::Automate => "automate",
        }
    }

    /// Whether a sandbox for this operation gets writable mounts.
    pub fn needs_write_access(&self) -> bool {
        !matches!(self, Operation::Read | Operation::Network)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == lowered)
            .ok_or_else(|| format!("unknown operation '{s}'"))
    }
}

/// Who is asking, supplied by the caller and read-only to the kernel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityContext {
    pub user_id: String,
    pub session_id: String,
    /// Ordinal authentication strength; higher is stronger.
    pub auth_level: u8,
    pub capabilities: BTreeSet<String>,
    /// Accumulated risk in `0.0..=1.0`.
    pub risk_score: f64,
}

impl SecurityContext {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_auth_level(mut self, level: u8) -> Self {
        self.auth_level = level;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_risk_score(mut self, score: f64) -> Self {
        self.risk_score = score.clamp(0.0, 1.0);
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// A single tool invocation awaiting a decision.
///
/// Built with [`ToolRequest::new`] and the `with_*` builders; there are no
/// setters once it is handed to the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    tool_name: String,
    operation: Operation,
    parameters: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_path: Option<PathBuf>,
    user_id: String,
    session_id: String,
    request_id: String,
    timestamp: u64,
}

impl ToolRequest {
    /// New request bound to `context`'s user and session, stamped with a fresh
    /// ULID and the current time.
    pub fn new(tool_name: impl Into<String>, operation: Operation, context: &SecurityContext) -> Self {
        Self {
            tool_name: tool_name.into(),
            operation,
            parameters: Map::new(),
            target_path: None,
            user_id: context.user_id.clone(),
            session_id: context.session_id.clone(),
            request_id: ulid::Ulid::new().to_string(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_target_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.target_path = Some(path.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    pub fn target_path(&self) -> Option<&Path> {
        self.target_path.as_deref()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Stable digest identifying an identical resubmission.
    ///
    /// Covers everything except the request id and timestamp. Parameter maps
    /// serialize with sorted keys, so key order does not matter.
    pub fn fingerprint(&self) -> String {
        let params = canonical_json(&self.parameters);
        let target = self
            .target_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let parts: [&str; 6] = [
            &self.tool_name,
            self.operation.as_str(),
            &params,
            &target,
            &self.user_id,
            &self.session_id,
        ];

        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

fn canonical_json(map: &Map<String, Value>) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), sorted(v))).collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(&Value::Object(map.clone())).to_string()
}
