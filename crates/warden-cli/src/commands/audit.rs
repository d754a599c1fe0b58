//! `warden audit`: search and verify the persisted trail.

use super::{open_audit, CommandExit};
use std::time::{SystemTime, UNIX_EPOCH};
use warden_audit::{AuditEvent, AuditEventKind, AuditFilter};
use warden_core::KernelConfig;

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub tool: Option<String>,
    pub request: Option<String>,
    pub decision: Option<String>,
    pub kind: Option<String>,
    pub since_secs: Option<u64>,
    pub limit: usize,
    pub json: bool,
}

impl SearchQuery {
    fn filter(&self, now_ms: u64) -> anyhow::Result<AuditFilter> {
        let kind = match &self.kind {
            Some(raw) => Some(
                serde_json::from_value::<AuditEventKind>(serde_json::Value::String(raw.clone()))
                    .map_err(|_| CommandExit::new(1, format!("unknown event kind '{raw}'")))?,
            ),
            None => None,
        };
        Ok(AuditFilter {
            tool_name: self.tool.clone(),
            request_id: self.request.clone(),
            kind,
            decision: self.decision.clone(),
            since: self.since_secs.map(|secs| now_ms.saturating_sub(secs.saturating_mul(1000))),
            until: None,
            limit: Some(self.limit),
        })
    }
}

pub async fn search(config: KernelConfig, query: SearchQuery) -> anyhow::Result<()> {
    let filter = query.filter(now_ms())?;
    let (audit, writer) = open_audit(&config)?;
    let events = audit.search(&filter).await?;
    audit.shutdown().await?;
    drop(audit);
    let _ = writer.await;

    if events.is_empty() && !query.json {
        println!("No matching audit events.");
        return Ok(());
    }
    for line in render(&events, query.json)? {
        println!("{line}");
    }
    Ok(())
}

pub async fn verify(config: KernelConfig) -> anyhow::Result<()> {
    let (audit, writer) = open_audit(&config)?;
    let result = audit.verify().await;
    audit.shutdown().await?;
    drop(audit);
    let _ = writer.await;

    match result? {
        Ok(count) => {
            println!("Audit chain intact: {count} event(s)");
            Ok(())
        }
        Err(brk) => Err(CommandExit::new(
            1,
            format!("Audit chain broken at event {} ({}): {}", brk.index, brk.event_id, brk.reason),
        )
        .into()),
    }
}

fn render(events: &[AuditEvent], json: bool) -> anyhow::Result<Vec<String>> {
    if json {
        return events
            .iter()
            .map(|e| serde_json::to_string(e).map_err(Into::into))
            .collect();
    }
    Ok(events
        .iter()
        .map(|e| {
            format!(
                "{} {} {:<24} {:<16} {:<20} {}",
                e.timestamp,
                e.request_id,
                e.kind.as_str(),
                e.tool_name.as_deref().unwrap_or("-"),
                e.decision.as_deref().unwrap_or("-"),
                e.payload
            )
        })
        .collect())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
