//! Local spill file holding events that could not reach the sink yet.
//!
//! Uses blocking `std::fs` so callers on the decision path can spill without
//! awaiting; writes are single small appends to local disk.

use crate::error::AuditError;
use crate::event::AuditEvent;
use crate::sink::parse_lines;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

pub(crate) struct SpillFile {
    path: PathBuf,
    lock: Mutex<()>,
    pending: AtomicUsize,
}

impl SpillFile {
    /// Open (or adopt a leftover) spill file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let pending = if path.exists() {
            parse_lines(&fs::read_to_string(&path)?)?.len()
        } else {
            0
        };
        Ok(Self {
            path,
            lock: Mutex::new(()),
            pending: AtomicUsize::new(pending),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    pub fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.append_batch(std::slice::from_ref(event))
    }

    pub fn append_batch(&self, events: &[AuditEvent]) -> Result<(), AuditError> {
        let _guard = self.guard();
        self.write_locked(events, true)?;
        self.pending.fetch_add(events.len(), Ordering::SeqCst);
        Ok(())
    }

    /// Remove and return everything spilled so far, oldest first.
    pub fn take_all(&self) -> Result<Vec<AuditEvent>, AuditError> {
        let _guard = self.guard();
        let events = self.read_locked()?;
        if self.path.exists() {
            fs::write(&self.path, "")?;
        }
        self.pending.store(0, Ordering::SeqCst);
        Ok(events)
    }

    /// Put `events` back in front of anything spilled since `take_all`.
    pub fn restore_front(&self, mut events: Vec<AuditEvent>) -> Result<(), AuditError> {
        let _guard = self.guard();
        events.extend(self.read_locked()?);
        self.write_locked(&events, false)?;
        self.pending.store(events.len(), Ordering::SeqCst);
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<AuditEvent>, AuditError> {
        let _guard = self.guard();
        self.read_locked()
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn read_locked(&self) -> Result<Vec<AuditEvent>, AuditError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        parse_lines(&fs::read_to_string(&self.path)?)
    }

    fn write_locked(&self, events: &[AuditEvent], append: bool) -> Result<(), AuditError> {
        let mut buf = String::new();
        for event in events {
            buf.push_str(&serde_json::to_string(event)?);
            buf.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&self.path)?;
        file.write_all(buf.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}
