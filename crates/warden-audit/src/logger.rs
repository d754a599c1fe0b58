//! Non-blocking audit logger backed by a dedicated writer task.
//!
//! `append` never waits on the durable sink: events go through a bounded
//! channel, and when the channel is full (or the writer is gone) they are
//! spilled to a local file that the writer replays once it catches up.

use crate::error::AuditError;
use crate::event::{sort_events, verify_chain, AuditEvent, AuditFilter, ChainBreak, GENESIS_DIGEST};
use crate::redact::{Redactor, DEFAULT_SENSITIVE_FIELDS};
use crate::sink::AuditSink;
use crate::spill::SpillFile;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Idle per-request sequence state is dropped after this long (ms).
const SEQUENCER_IDLE_MS: u64 = 10 * 60 * 1000;
const SEQUENCER_SOFT_CAP: usize = 4096;

/// Audit logger settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Directory for the spill file (and the JSONL sink when used).
    pub dir: Option<PathBuf>,
    /// Bounded queue size between callers and the writer.
    pub queue_capacity: usize,
    /// Field names redacted from payloads.
    pub sensitive_fields: Vec<String>,
    /// How long persisted events are retained.
    pub retention_secs: u64,
    /// How often the writer retries a failed sink.
    pub retry_interval_ms: u64,
    /// How often the writer prunes expired events.
    pub prune_interval_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: None,
            queue_capacity: 1024,
            sensitive_fields: DEFAULT_SENSITIVE_FIELDS.iter().map(|s| s.to_string()).collect(),
            retention_secs: 30 * 24 * 60 * 60,
            retry_interval_ms: 1000,
            prune_interval_secs: 60 * 60,
        }
    }
}

impl AuditConfig {
    /// Resolved audit directory (`~/.local/share/warden/audit` by default).
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("warden")
                .join("audit")
        })
    }
}

/// Point-in-time audit counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    /// Events accepted by `append`.
    pub appended: u64,
    /// Events persisted to the sink.
    pub written: u64,
    /// Events that went to the spill file.
    pub spilled: u64,
    /// Spilled events later persisted to the sink.
    pub replayed: u64,
    /// Events lost because even the spill file failed.
    pub dropped: u64,
    /// Events currently waiting in the spill file.
    pub pending_spill: u64,
    /// Whether the sink is currently failing.
    pub degraded: bool,
}

#[derive(Default)]
struct Counters {
    appended: AtomicU64,
    written: AtomicU64,
    spilled: AtomicU64,
    replayed: AtomicU64,
    dropped: AtomicU64,
    degraded: AtomicBool,
}

enum WriterCommand {
    Event(Box<AuditEvent>),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
    Prune {
        cutoff: u64,
        ack: oneshot::Sender<Result<usize, AuditError>>,
    },
}

struct SeqState {
    next: u64,
    last_timestamp: u64,
}

struct Inner {
    tx: mpsc::Sender<WriterCommand>,
    redactor: Redactor,
    sink: Arc<dyn AuditSink>,
    spill: Arc<SpillFile>,
    counters: Arc<Counters>,
    sequencer: Mutex<HashMap<String, SeqState>>,
}

/// Cloneable handle to the audit pipeline.
#[derive(Clone)]
pub struct AuditLogger {
    inner: Arc<Inner>,
}

impl AuditLogger {
    /// Start the writer task and return the logger plus the task handle.
    ///
    /// Must be called from within a tokio runtime. The writer stops once every
    /// clone of the logger has been dropped, after draining its queue.
    pub fn spawn(
        config: &AuditConfig,
        sink: Arc<dyn AuditSink>,
    ) -> Result<(Self, JoinHandle<()>), AuditError> {
        let spill = Arc::new(SpillFile::open(config.resolved_dir().join("spill.jsonl"))?);
        if !spill.is_empty() {
            tracing::warn!(
                pending = spill.pending(),
                path = %spill.path().display(),
                "Found spilled audit events from a previous run; they will be replayed"
            );
        }

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());

        let writer = Writer {
            sink: sink.clone(),
            spill: spill.clone(),
            counters: counters.clone(),
            last_digest: None,
            retention: Duration::from_secs(config.retention_secs),
        };
        let retry = Duration::from_millis(config.retry_interval_ms.max(1));
        let prune_every = Duration::from_secs(config.prune_interval_secs.max(1));
        let handle = tokio::spawn(writer.run(rx, retry, prune_every));

        let logger = Self {
            inner: Arc::new(Inner {
                tx,
                redactor: Redactor::new(&config.sensitive_fields),
                sink,
                spill,
                counters,
                sequencer: Mutex::new(HashMap::new()),
            }),
        };
        Ok((logger, handle))
    }

    /// Record an event. Returns without waiting for persistence.
    pub fn append(&self, mut event: AuditEvent) {
        self.inner.redactor.redact(&mut event.payload);
        self.stamp(&mut event);
        self.inner.counters.appended.fetch_add(1, Ordering::Relaxed);

        let rejected = match self.inner.tx.try_send(WriterCommand::Event(Box::new(event))) {
            Ok(()) => return,
            Err(TrySendError::Full(cmd)) | Err(TrySendError::Closed(cmd)) => cmd,
        };

        if let WriterCommand::Event(event) = rejected {
            tracing::debug!(request_id = %event.request_id, "Audit queue unavailable, spilling event");
            self.spill_from_caller(&event);
        }
    }

    /// Wait until every event appended before this call has been handled.
    pub async fn flush(&self) -> Result<(), AuditError> {
        let (ack, done) = oneshot::channel();
        self.inner
            .tx
            .send(WriterCommand::Flush(ack))
            .await
            .map_err(|_| AuditError::WriterStopped)?;
        done.await.map_err(|_| AuditError::WriterStopped)
    }

    /// Drain the queue, replay the spill once more and stop the writer.
    ///
    /// Events appended afterwards go to the spill file and are replayed by the
    /// next logger opened on the same directory.
    pub async fn shutdown(&self) -> Result<(), AuditError> {
        let (ack, done) = oneshot::channel();
        self.inner
            .tx
            .send(WriterCommand::Shutdown(ack))
            .await
            .map_err(|_| AuditError::WriterStopped)?;
        done.await.map_err(|_| AuditError::WriterStopped)
    }

    /// Remove persisted events older than `cutoff` (unix ms).
    pub async fn prune_before(&self, cutoff: u64) -> Result<usize, AuditError> {
        let (ack, done) = oneshot::channel();
        self.inner
            .tx
            .send(WriterCommand::Prune { cutoff, ack })
            .await
            .map_err(|_| AuditError::WriterStopped)?;
        done.await.map_err(|_| AuditError::WriterStopped)?
    }

    /// Search persisted and spilled events, ordered per request.
    ///
    /// Events still queued for the writer are not visible; call `flush` first
    /// when read-your-writes is needed.
    pub async fn search(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        let mut events = match self.inner.sink.read_all().await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(sink = self.inner.sink.name(), "Audit sink unreadable, searching spill only: {e}");
                Vec::new()
            }
        };
        events.extend(self.inner.spill.read_all()?);

        let mut seen = HashSet::new();
        let mut matched: Vec<_> = events
            .into_iter()
            .filter(|e| filter.matches(e) && seen.insert(e.id.clone()))
            .collect();
        sort_events(&mut matched);
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    /// Verify the hash chain of everything persisted in the sink.
    pub async fn verify(&self) -> Result<Result<usize, ChainBreak>, AuditError> {
        let events = self.inner.sink.read_all().await?;
        Ok(verify_chain(&events))
    }

    /// Current counters.
    pub fn stats(&self) -> AuditStats {
        let c = &self.inner.counters;
        AuditStats {
            appended: c.appended.load(Ordering::Relaxed),
            written: c.written.load(Ordering::Relaxed),
            spilled: c.spilled.load(Ordering::Relaxed),
            replayed: c.replayed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            pending_spill: self.inner.spill.pending() as u64,
            degraded: c.degraded.load(Ordering::Relaxed),
        }
    }

    /// Assign the per-request sequence number and keep timestamps monotonic
    /// within the request.
    fn stamp(&self, event: &mut AuditEvent) {
        let mut sequencer = self
            .inner
            .sequencer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if sequencer.len() > SEQUENCER_SOFT_CAP {
            let horizon = event.timestamp.saturating_sub(SEQUENCER_IDLE_MS);
            sequencer.retain(|_, state| state.last_timestamp >= horizon);
        }

        let state = sequencer
            .entry(event.request_id.clone())
            .or_insert(SeqState {
                next: 0,
                last_timestamp: 0,
            });
        event.seq = state.next;
        event.timestamp = event.timestamp.max(state.last_timestamp);
        state.next += 1;
        state.last_timestamp = event.timestamp;
    }

    fn spill_from_caller(&self, event: &AuditEvent) {
        let counters = &self.inner.counters;
        match self.inner.spill.append(event) {
            Ok(()) => {
                counters.spilled.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(request_id = %event.request_id, "Audit event lost, spill failed: {e}");
            }
        }
    }
}

struct Writer {
    sink: Arc<dyn AuditSink>,
    spill: Arc<SpillFile>,
    counters: Arc<Counters>,
    last_digest: Option<String>,
    retention: Duration,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::Receiver<WriterCommand>, retry: Duration, prune_every: Duration) {
        let mut tick = tokio::time::interval(retry);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_prune = Instant::now();

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(WriterCommand::Event(event)) => self.handle(*event).await,
                    Some(WriterCommand::Flush(ack)) => {
                        self.replay().await;
                        let _ = ack.send(());
                    }
                    Some(WriterCommand::Shutdown(ack)) => {
                        self.replay().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(WriterCommand::Prune { cutoff, ack }) => {
                        let _ = ack.send(self.sink.retain_since(cutoff).await);
                    }
                    None => {
                        self.replay().await;
                        break;
                    }
                },
                _ = tick.tick() => {
                    self.replay().await;
                    if last_prune.elapsed() >= prune_every {
                        last_prune = Instant::now();
                        self.prune_expired().await;
                    }
                }
            }
        }
        tracing::debug!("Audit writer stopped");
    }

    async fn handle(&mut self, event: AuditEvent) {
        if !self.spill.is_empty() {
            self.replay().await;
        }
        if !self.spill.is_empty() {
            // Keep persistence order: nothing may overtake spilled events.
            self.spill_events(vec![event]);
            return;
        }
        if let Err(events) = self.persist(vec![event]).await {
            self.spill_events(events);
        }
    }

    /// Chain and write `events`; on failure hand them back unchained.
    async fn persist(&mut self, mut events: Vec<AuditEvent>) -> Result<(), Vec<AuditEvent>> {
        if self.last_digest.is_none() {
            match self.load_chain_head().await {
                Ok(head) => self.last_digest = Some(head),
                Err(e) => {
                    self.mark_degraded(&e);
                    return Err(events);
                }
            }
        }
        let mut prev = self.last_digest.clone().unwrap_or_else(|| GENESIS_DIGEST.to_string());
        for event in events.iter_mut() {
            let digest = event.compute_digest(&prev);
            event.prev_digest = Some(prev);
            event.digest = Some(digest.clone());
            prev = digest;
        }

        match self.sink.write_batch(&events).await {
            Ok(()) => {
                self.last_digest = Some(prev);
                self.counters.written.fetch_add(events.len() as u64, Ordering::Relaxed);
                if self.counters.degraded.swap(false, Ordering::Relaxed) {
                    tracing::info!(sink = self.sink.name(), "Audit sink recovered");
                }
                Ok(())
            }
            Err(e) => {
                self.mark_degraded(&e);
                for event in events.iter_mut() {
                    event.unchain();
                }
                Err(events)
            }
        }
    }

    fn mark_degraded(&self, err: &AuditError) {
        if !self.counters.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(sink = self.sink.name(), "Audit sink failed, spilling to disk: {err}");
        }
    }

    async fn load_chain_head(&self) -> Result<String, AuditError> {
        let events = self.sink.read_all().await?;
        Ok(events
            .last()
            .and_then(|e| e.digest.clone())
            .unwrap_or_else(|| GENESIS_DIGEST.to_string()))
    }

    async fn replay(&mut self) {
        if self.spill.is_empty() {
            return;
        }
        let events = match self.spill.take_all() {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!("Cannot read audit spill file: {e}");
                return;
            }
        };
        let count = events.len() as u64;
        match self.persist(events).await {
            Ok(()) => {
                self.counters.replayed.fetch_add(count, Ordering::Relaxed);
                tracing::info!(count, "Replayed spilled audit events");
            }
            Err(events) => {
                if let Err(e) = self.spill.restore_front(events) {
                    self.counters.dropped.fetch_add(count, Ordering::Relaxed);
                    tracing::error!(count, "Audit events lost while restoring spill file: {e}");
                }
            }
        }
    }

    fn spill_events(&self, events: Vec<AuditEvent>) {
        let count = events.len() as u64;
        match self.spill.append_batch(&events) {
            Ok(()) => {
                self.counters.spilled.fetch_add(count, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.dropped.fetch_add(count, Ordering::Relaxed);
                tracing::error!(count, "Audit events lost, spill failed: {e}");
            }
        }
    }

    async fn prune_expired(&self) {
        let now = now_ms();
        let cutoff = now.saturating_sub(self.retention.as_millis() as u64);
        match self.sink.retain_since(cutoff).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Pruned expired audit events"),
            Err(e) => tracing::warn!("Audit retention pruning failed: {e}"),
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
