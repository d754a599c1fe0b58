//! Durable audit backends.

use crate::error::AuditError;
use crate::event::AuditEvent;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// A durable destination for audit events.
///
/// Sinks are only ever driven by the single writer task, so implementations
/// do not need to serialize concurrent writes themselves.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Persist a batch of events in order.
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), AuditError>;

    /// Read every retained event in persistence order.
    async fn read_all(&self) -> Result<Vec<AuditEvent>, AuditError>;

    /// Drop the leading run of events older than `cutoff` (unix ms); returns
    /// how many were removed.
    ///
    /// Replayed events can persist out of timestamp order, so pruning stops at
    /// the first event inside the window to keep the remaining chain intact.
    async fn retain_since(&self, cutoff: u64) -> Result<usize, AuditError>;
}

// Compile-time check: AuditSink must be object-safe
const _: () = {
    fn _assert_object_safe(_: &dyn AuditSink) {}
};

/// Append-only JSONL file sink, one event per line.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    /// Create a sink writing to `path`. Parent directories are created lazily.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), AuditError> {
        if events.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut buf = String::new();
        for event in events {
            buf.push_str(&serde_json::to_string(event)?);
            buf.push('\n');
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<AuditEvent>, AuditError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).await?;
        parse_lines(&content)
    }

    async fn retain_since(&self, cutoff: u64) -> Result<usize, AuditError> {
        let events = self.read_all().await?;
        let removed = expired_prefix(&events, cutoff);
        if removed == 0 {
            return Ok(0);
        }

        let mut buf = String::new();
        for event in &events[removed..] {
            buf.push_str(&serde_json::to_string(event)?);
            buf.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp, buf).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(removed)
    }
}

/// Length of the leading run of events older than `cutoff`.
fn expired_prefix(events: &[AuditEvent], cutoff: u64) -> usize {
    events.iter().take_while(|e| e.timestamp < cutoff).count()
}

/// Parse JSONL content, skipping blank lines.
pub(crate) fn parse_lines(content: &str) -> Result<Vec<AuditEvent>, AuditError> {
    let mut events = Vec::new();
    for (line_num, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: AuditEvent = serde_json::from_str(line)
            .map_err(|e| AuditError::InvalidFormat(format!("Line {}: {e}", line_num + 1)))?;
        events.push(event);
    }
    Ok(events)
}

/// In-process sink that can be switched offline, for embedding and tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
    offline: AtomicBool,
}

impl MemorySink {
    /// Create an empty, online sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going down (`false`) or recovering (`true`).
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Snapshot of persisted events in write order.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn check_online(&self) -> Result<(), AuditError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AuditError::SinkUnavailable("memory sink offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), AuditError> {
        self.check_online()?;
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend_from_slice(events);
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<AuditEvent>, AuditError> {
        self.check_online()?;
        Ok(self.events())
    }

    async fn retain_since(&self, cutoff: u64) -> Result<usize, AuditError> {
        self.check_online()?;
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let removed = expired_prefix(&events, cutoff);
        events.drain(..removed);
        Ok(removed)
    }
}
