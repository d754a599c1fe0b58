//! CLI argument and command definitions.

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use warden_core::Operation;

#[derive(Parser)]
#[command(name = "warden", version, about = "Tool-access safety kernel")]
pub struct Cli {
    /// Config file (defaults to ~/.warden/config.json).
    #[arg(long, global = true, env = "WARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Policy directory, overriding config and WARDEN_POLICY_DIR.
    #[arg(long, global = true)]
    pub policy_dir: Option<PathBuf>,

    /// Audit directory, overriding config and WARDEN_AUDIT_DIR.
    #[arg(long, global = true)]
    pub audit_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate a request without executing anything and print the decision.
    Check {
        #[command(flatten)]
        request: RequestArgs,

        /// Operation kind.
        #[arg(long, short = 'o', value_parser = parse_operation)]
        operation: Operation,

        /// Request parameter as key=value (value parsed as JSON when possible).
        #[arg(long = "param", short = 'p', value_parser = parse_param)]
        params: Vec<(String, Value)>,
    },

    /// Run a command through the full evaluate/confirm/execute cycle.
    Exec {
        #[command(flatten)]
        request: RequestArgs,

        /// Operation kind.
        #[arg(long, short = 'o', default_value = "execute", value_parser = parse_operation)]
        operation: Operation,

        /// Wrap the command with the native isolation backend.
        #[arg(long)]
        isolate: bool,

        /// Approve confirmation prompts without asking.
        #[arg(long, short = 'y')]
        yes: bool,

        /// Command and arguments.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Inspect and validate policy documents.
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Query the audit trail.
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

/// Identity and target shared by `check` and `exec`.
#[derive(Args, Debug, Clone)]
pub struct RequestArgs {
    /// Tool name the request is for.
    #[arg(long, short = 't')]
    pub tool: String,

    /// Target path.
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// User id (defaults to $USER).
    #[arg(long, env = "USER", default_value = "")]
    pub user: String,

    /// Session id (defaults to a fresh one per invocation).
    #[arg(long)]
    pub session: Option<String>,

    /// Authentication level of the caller.
    #[arg(long, default_value = "0")]
    pub auth_level: u8,

    /// Capability granted to the caller (repeatable).
    #[arg(long = "capability")]
    pub capabilities: Vec<String>,

    /// Accumulated caller risk score (0.0 - 1.0).
    #[arg(long, default_value = "0.0")]
    pub risk_score: f64,
}

#[derive(Subcommand)]
pub enum PolicyAction {
    /// Validate every document in a directory (defaults to the configured one).
    Validate {
        dir: Option<PathBuf>,
    },
    /// Print the JSON schema for policy documents.
    Schema,
    /// List the policies in the configured directory.
    List,
}

#[derive(Subcommand)]
pub enum AuditAction {
    /// Search persisted and spilled events.
    Search {
        #[arg(long)]
        tool: Option<String>,

        #[arg(long)]
        request: Option<String>,

        /// Decision label, e.g. deny or rate_limited.
        #[arg(long)]
        decision: Option<String>,

        /// Event kind, e.g. decision or execution_end.
        #[arg(long)]
        kind: Option<String>,

        /// Only events from the last N seconds.
        #[arg(long)]
        since_secs: Option<u64>,

        /// Maximum number of events.
        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Print raw JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Verify the audit hash chain.
    Verify,
}

fn parse_operation(raw: &str) -> Result<Operation, String> {
    raw.parse()
}

/// `key=value`, where value is JSON if it parses and a string otherwise.
pub fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
