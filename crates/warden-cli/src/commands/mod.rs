//! Subcommand implementations.

pub mod audit;
pub mod check;
pub mod exec;
pub mod policy;

use crate::cli::RequestArgs;
use std::sync::Arc;
use tokio::task::JoinHandle;
use warden_audit::{AuditLogger, JsonlSink};
use warden_core::{KernelConfig, Operation, SafetyManager, SecurityContext, ToolRequest};

/// Terminates the process with `code` after printing `message` to stderr.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct CommandExit {
    pub code: i32,
    pub message: String,
}

impl CommandExit {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Exit code for requests the kernel denied or rate limited.
pub const EXIT_BLOCKED: i32 = 2;
/// Exit code for confirmations that were rejected or not answered.
pub const EXIT_NOT_CONFIRMED: i32 = 3;

/// A running kernel plus its audit writer task.
pub struct Kernel {
    pub manager: SafetyManager,
    writer: JoinHandle<()>,
}

impl Kernel {
    /// Drain the audit queue and stop the writer.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.manager.audit().shutdown().await?;
        drop(self.manager);
        if let Err(e) = self.writer.await {
            tracing::warn!("Audit writer task ended abnormally: {e}");
        }
        Ok(())
    }
}

/// Path of the JSONL audit log for `config`.
pub fn audit_log_path(config: &KernelConfig) -> std::path::PathBuf {
    config.audit.resolved_dir().join("audit.jsonl")
}

/// Spawn the audit pipeline only, for commands that just read the trail.
pub fn open_audit(config: &KernelConfig) -> anyhow::Result<(AuditLogger, JoinHandle<()>)> {
    let sink = Arc::new(JsonlSink::new(audit_log_path(config)));
    Ok(AuditLogger::spawn(&config.audit, sink)?)
}

/// Build a kernel over the configured policy directory and JSONL audit log.
pub fn open_kernel(config: KernelConfig) -> anyhow::Result<Kernel> {
    let (audit, writer) = open_audit(&config)?;
    let manager = SafetyManager::builder(config)
        .audit(audit)
        .sandbox_env(std::env::vars().collect())
        .build()?;
    Ok(Kernel { manager, writer })
}

impl RequestArgs {
    pub fn context(&self) -> SecurityContext {
        let session = self
            .session
            .clone()
            .unwrap_or_else(|| format!("cli-{}", ulid::Ulid::new()));
        let mut context = SecurityContext::new(self.user.clone(), session)
            .with_auth_level(self.auth_level)
            .with_risk_score(self.risk_score);
        for capability in &self.capabilities {
            context = context.with_capability(capability.clone());
        }
        context
    }

    pub fn request(&self, operation: Operation, context: &SecurityContext) -> ToolRequest {
        let request = ToolRequest::new(self.tool.clone(), operation, context);
        match &self.path {
            Some(path) => request.with_target_path(path.clone()),
            None => request,
        }
    }
}
