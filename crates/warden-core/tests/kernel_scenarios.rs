use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use warden_core::audit::{AuditEventKind, AuditFilter, AuditLogger, MemorySink};
use warden_core::sandbox::{SandboxError, SandboxFloor};
use warden_core::{
    ConfirmationState, DecisionKind, KernelConfig, ManualClock, Operation, Outcome, Policy, PolicySnapshot,
    SafetyManager, SecurityContext, ToolRequest, WardenError,
};

const START: u64 = 1_700_000_000_000;

struct Kernel {
    manager: Arc<SafetyManager>,
    clock: ManualClock,
    sink: Arc<MemorySink>,
    dir: TempDir,
}

fn policies(docs: Vec<Value>) -> PolicySnapshot {
    PolicySnapshot::from_policies(docs.into_iter().map(|doc| serde_json::from_value::<Policy>(doc).unwrap()))
        .unwrap()
}

fn kernel(docs: Vec<Value>) -> Kernel {
    kernel_with(KernelConfig::default(), Some(policies(docs)))
}

fn kernel_with(mut config: KernelConfig, snapshot: Option<PolicySnapshot>) -> Kernel {
    let dir = TempDir::new().unwrap();
    config.audit.dir = Some(dir.path().join("audit"));
    config.audit.retry_interval_ms = 20;

    let sink = Arc::new(MemorySink::new());
    let (audit, _writer) = AuditLogger::spawn(&config.audit, sink.clone()).unwrap();
    let clock = ManualClock::new(START);

    let mut builder = SafetyManager::builder(config)
        .audit(audit)
        .clock(Arc::new(clock.clone()))
        .sandbox_env(BTreeMap::from([
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("HOME".to_string(), "/home/alice".to_string()),
            ("GITHUB_TOKEN".to_string(), "ghp_x".to_string()),
        ]));
    if let Some(snapshot) = snapshot {
        builder = builder.policies(snapshot);
    }
    Kernel {
        manager: Arc::new(builder.build().unwrap()),
        clock,
        sink,
        dir,
    }
}

fn ctx() -> SecurityContext {
    SecurityContext::new("alice", "session-1").with_auth_level(1)
}

fn file_ops() -> Value {
    json!({
        "tool_name": "file_ops",
        "allowed_paths": ["/workspace/**"],
        "forbidden_paths": ["/workspace/.git/**"],
        "allowed_operations": ["read", "write"]
    })
}

fn terminal(timeout_secs: u64) -> Value {
    json!({
        "tool_name": "terminal",
        "risk_level": "medium",
        "allowed_paths": ["/workspace/**"],
        "allowed_operations": ["execute", "read"],
        "requires_confirmation": true,
        "confirmation_operations": ["execute"],
        "confirmation_timeout_secs": timeout_secs,
        "sandbox": {"cpu_time_secs": 60, "memory_mb": 512, "env_allowlist": ["PATH", "GITHUB_TOKEN"]}
    })
}

fn search(quota: u32) -> Value {
    json!({
        "tool_name": "search",
        "rate_limit": {"scope": "tool", "quota": quota, "window_secs": 60}
    })
}

fn terminal_request() -> ToolRequest {
    ToolRequest::new("terminal", Operation::Execute, &ctx())
        .with_parameter("cmd", "cargo fmt")
        .with_target_path("/workspace/project")
}

async fn events_for(kernel: &Kernel, request_id: &str) -> Vec<warden_core::audit::AuditEvent> {
    kernel.manager.audit().flush().await.unwrap();
    kernel
        .manager
        .audit()
        .search(&AuditFilter {
            request_id: Some(request_id.to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_unknown_tool_is_denied() {
    let k = kernel(vec![file_ops()]);
    let req = ToolRequest::new("shell", Operation::Execute, &ctx());
    let decision = k.manager.evaluate(&req, &ctx());
    assert_eq!(decision.kind(), DecisionKind::Deny);
    assert_eq!(decision.reason(), "default-deny: no policy for tool 'shell'");
}

#[tokio::test]
async fn test_file_outside_allowed_paths_is_denied() {
    let k = kernel(vec![file_ops()]);
    let req = ToolRequest::new("file_ops", Operation::Read, &ctx()).with_target_path("/etc/passwd");

    let outcome = k
        .manager
        .evaluate_and_execute(req.clone(), &ctx(), |_| async { Ok::<_, String>(()) })
        .await;
    let Outcome::Blocked { decision } = outcome else {
        panic!("expected a blocked outcome");
    };
    assert!(decision.reason().contains("path not in allowed_paths"));
    assert_eq!(decision.policy_name(), "file_ops");
    assert_eq!(k.manager.sandbox().active_count(), 0);

    let events = events_for(&k, req.request_id()).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AuditEventKind::Decision);
    assert_eq!(events[0].decision.as_deref(), Some("deny"));
}

#[tokio::test]
async fn test_forbidden_path_wins_over_allow() {
    let k = kernel(vec![file_ops()]);
    let req = ToolRequest::new("file_ops", Operation::Write, &ctx()).with_target_path("/workspace/.git/config");
    let decision = k.manager.evaluate(&req, &ctx());
    assert_eq!(decision.kind(), DecisionKind::Deny);
    assert!(decision.reason().contains("forbidden pattern"));
}

#[tokio::test]
async fn test_forbidden_glob_wins_over_broader_allow() {
    let k = kernel(vec![json!({
        "tool_name": "file_ops",
        "allowed_paths": ["/home/**"],
        "forbidden_paths": ["/home/*/.ssh"],
        "allowed_operations": ["read"]
    })]);

    let req = ToolRequest::new("file_ops", Operation::Read, &ctx()).with_target_path("/home/bob/.ssh/id_rsa");
    let request_id = req.request_id().to_string();
    let outcome = k
        .manager
        .evaluate_and_execute(req, &ctx(), |_| async { Ok::<(), String>(()) })
        .await;
    let Outcome::Blocked { decision } = outcome else {
        panic!("key file must be blocked");
    };
    assert!(decision.reason().contains("forbidden pattern '/home/*/.ssh'"));
    assert_eq!(k.manager.get_status().executions, 0);

    let events = events_for(&k, &request_id).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].decision.as_deref(), Some("deny"));
}

#[tokio::test]
async fn test_confirm_then_identical_resubmission_executes_once() {
    let k = kernel(vec![terminal(300)]);

    let first = k
        .manager
        .evaluate_and_execute(terminal_request(), &ctx(), |_| async { Ok::<_, String>(()) })
        .await;
    let Outcome::PendingConfirmation { decision, confirmation_id } = first else {
        panic!("expected a pending confirmation");
    };
    assert!(decision
        .confirmation_prompt()
        .unwrap()
        .contains("requires confirmation for execute"));
    assert_eq!(
        k.manager.confirmation(&confirmation_id).unwrap().state,
        ConfirmationState::Pending
    );

    assert!(k.manager.confirm(&confirmation_id, true, "alice"));
    assert!(!k.manager.confirm(&confirmation_id, false, "mallory"));

    let resubmitted = terminal_request();
    let request_id = resubmitted.request_id().to_string();
    let outcome = k
        .manager
        .evaluate_and_execute(resubmitted, &ctx(), |sandbox| async move {
            Ok::<_, String>(sandbox)
        })
        .await;
    let Outcome::Executed { decision, result } = outcome else {
        panic!("expected execution after confirmation");
    };
    assert_eq!(decision.kind(), DecisionKind::Allow);
    let sandbox = result.unwrap();
    assert_eq!(sandbox.working_dir, PathBuf::from("/workspace"));
    assert!(sandbox.network_isolated);
    assert!(sandbox.writable);
    assert_eq!(sandbox.cpu_time_limit, Duration::from_secs(60));
    assert_eq!(sandbox.memory_limit_bytes, 512 * 1024 * 1024);
    assert_eq!(sandbox.env.keys().collect::<Vec<_>>(), vec!["PATH"]);
    assert_eq!(k.manager.sandbox().active_count(), 0);

    let kinds: Vec<_> = events_for(&k, &request_id).await.into_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            AuditEventKind::Decision,
            AuditEventKind::ExecutionStart,
            AuditEventKind::ExecutionEnd
        ]
    );

    // The grant is single-use: the next identical request asks again.
    let third = k.manager.evaluate(&terminal_request(), &ctx());
    assert_eq!(third.kind(), DecisionKind::RequireConfirmation);
    assert_ne!(third.confirmation_id(), Some(confirmation_id.as_str()));
}

#[tokio::test]
async fn test_rate_limit_reports_reset_and_recovers_after_window() {
    let k = kernel(vec![search(3)]);
    let query = || ToolRequest::new("search", Operation::Read, &ctx()).with_parameter("q", "rust");

    for _ in 0..3 {
        assert_eq!(k.manager.evaluate(&query(), &ctx()).kind(), DecisionKind::Allow);
        k.clock.advance(Duration::from_secs(1));
    }
    let limited = k.manager.evaluate(&query(), &ctx());
    assert_eq!(limited.kind(), DecisionKind::RateLimited);
    let info = limited.rate_limit_info().unwrap();
    assert_eq!(info.reset_at, START + 60_000);
    assert_eq!(info.retry_after_ms, 57_000);

    k.clock.set(START + 60_000);
    assert_eq!(k.manager.evaluate(&query(), &ctx()).kind(), DecisionKind::Allow);
}

#[tokio::test]
async fn test_unanswered_confirmation_expires_and_resubmission_is_denied() {
    let k = kernel(vec![terminal(5)]);
    let decision = k.manager.evaluate(&terminal_request(), &ctx());
    let id = decision.confirmation_id().unwrap().to_string();

    k.clock.advance(Duration::from_secs(6));
    assert_eq!(k.manager.confirmation(&id).unwrap().state, ConfirmationState::Expired);
    assert!(!k.manager.confirm(&id, true, "alice"));

    let again = k.manager.evaluate(&terminal_request(), &ctx());
    assert_eq!(again.kind(), DecisionKind::Deny);
    assert!(again.reason().contains("expired"));

    // After the grace period a fresh confirmation cycle starts.
    k.clock.advance(Duration::from_secs(61));
    let fresh = k.manager.evaluate(&terminal_request(), &ctx());
    assert_eq!(fresh.kind(), DecisionKind::RequireConfirmation);
}

#[tokio::test]
async fn test_rejected_confirmation_refunds_rate_budget() {
    let mut doc = terminal(300);
    doc["rate_limit"] = json!({"quota": 1, "window_secs": 60});
    let k = kernel(vec![doc]);

    let pending = k.manager.evaluate(&terminal_request(), &ctx());
    let id = pending.confirmation_id().unwrap().to_string();
    let other = ToolRequest::new("terminal", Operation::Read, &ctx()).with_target_path("/workspace");
    assert_eq!(k.manager.evaluate(&other, &ctx()).kind(), DecisionKind::RateLimited);

    k.manager.cancel_confirmation(&id, "alice").unwrap();
    assert_eq!(k.manager.evaluate(&other, &ctx()).kind(), DecisionKind::Allow);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_never_exceed_quota() {
    let k = kernel(vec![search(5)]);
    let mut tasks = Vec::new();
    for i in 0..40 {
        let manager = k.manager.clone();
        tasks.push(tokio::spawn(async move {
            let req = ToolRequest::new("search", Operation::Read, &ctx()).with_parameter("q", i);
            manager.evaluate(&req, &ctx()).kind()
        }));
    }
    let kinds: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(kinds.iter().filter(|k| **k == DecisionKind::Allow).count(), 5);
    assert_eq!(kinds.iter().filter(|k| **k == DecisionKind::RateLimited).count(), 35);
    assert_eq!(k.manager.get_status().rate_limited, 35);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_confirmations_have_one_winner() {
    let k = kernel(vec![terminal(300)]);
    let id = k
        .manager
        .evaluate(&terminal_request(), &ctx())
        .confirmation_id()
        .unwrap()
        .to_string();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let manager = k.manager.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            manager.confirm(&id, i % 2 == 0, &format!("reviewer-{i}"))
        }));
    }
    let wins = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();
    assert_eq!(wins, 1);
    assert!(k.manager.confirmation(&id).unwrap().state.is_terminal());

    k.manager.audit().flush().await.unwrap();
    let transitions = k
        .manager
        .audit()
        .search(&AuditFilter {
            kind: Some(AuditEventKind::ConfirmationTransition),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(transitions.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_submissions_share_one_confirmation() {
    let mut doc = terminal(300);
    doc["rate_limit"] = json!({"quota": 8, "window_secs": 60});
    let k = kernel(vec![doc]);

    let barrier = Arc::new(tokio::sync::Barrier::new(8));
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let manager = k.manager.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            manager.evaluate(&terminal_request(), &ctx())
        }));
    }
    let decisions: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert!(decisions
        .iter()
        .all(|d| d.kind() == DecisionKind::RequireConfirmation));
    let ids: std::collections::HashSet<_> = decisions.iter().filter_map(|d| d.confirmation_id()).collect();
    assert_eq!(ids.len(), 1);
    assert_eq!(k.manager.get_status().pending_confirmations, 1);

    // Only the pending record holds budget.
    let other = || ToolRequest::new("terminal", Operation::Read, &ctx()).with_target_path("/workspace");
    for _ in 0..7 {
        assert_eq!(k.manager.evaluate(&other(), &ctx()).kind(), DecisionKind::Allow);
    }
    assert_eq!(k.manager.evaluate(&other(), &ctx()).kind(), DecisionKind::RateLimited);

    let id = ids.into_iter().next().unwrap().to_string();
    assert!(k.manager.confirm(&id, true, "alice"));
    assert_eq!(
        k.manager.evaluate(&terminal_request(), &ctx()).kind(),
        DecisionKind::Allow
    );
}

#[test]
fn test_reload_never_mixes_snapshots() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let allow_read = json!({"tool_name": "file_ops", "allowed_operations": ["read"]});
    let forbid_read = json!({"tool_name": "file_ops", "forbidden_operations": ["read"], "risk_level": "high"});
    let k = runtime.block_on(async { kernel(vec![allow_read.clone()]) });

    let expected: Arc<Mutex<HashMap<u64, DecisionKind>>> =
        Arc::new(Mutex::new(HashMap::from([(1, DecisionKind::Allow)])));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let manager = k.manager.clone();
            std::thread::spawn(move || {
                (0..200)
                    .map(|_| {
                        let req = ToolRequest::new("file_ops", Operation::Read, &ctx());
                        let decision = manager.evaluate(&req, &ctx());
                        (decision.policy_version(), decision.kind(), decision.risk_level())
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for i in 0..50 {
        let doc = if i % 2 == 0 { forbid_read.clone() } else { allow_read.clone() };
        let kind = if i % 2 == 0 { DecisionKind::Deny } else { DecisionKind::Allow };
        let mut expected = expected.lock().unwrap();
        let version = k.manager.reload_with(policies(vec![doc]));
        expected.insert(version, kind);
    }

    let expected = expected.lock().unwrap();
    for reader in readers {
        for (version, kind, risk) in reader.join().unwrap() {
            assert_eq!(expected.get(&version), Some(&kind), "version {version}");
            let high = risk == warden_core::RiskLevel::High;
            assert_eq!(high, kind == DecisionKind::Deny, "version {version}");
        }
    }
}

#[tokio::test]
async fn test_reload_from_directory_keeps_old_snapshot_on_error() {
    let policy_dir = TempDir::new().unwrap();
    std::fs::write(policy_dir.path().join("search.json"), search(10).to_string()).unwrap();
    let config = KernelConfig {
        policy_dir: Some(policy_dir.path().to_path_buf()),
        ..Default::default()
    };
    let k = kernel_with(config, None);
    assert_eq!(k.manager.get_status().policy_version, 1);
    assert_eq!(k.manager.policies().tool_names(), vec!["search"]);

    std::fs::write(policy_dir.path().join("terminal.json"), "{\"tool_name\": \"terminal\", ").unwrap();
    let err = k.manager.reload_policies().unwrap_err();
    assert!(err.to_string().contains("terminal.json"));
    assert_eq!(k.manager.get_status().policy_version, 1);
    assert!(k.manager.policy("terminal").is_err());

    std::fs::write(policy_dir.path().join("terminal.json"), terminal(30).to_string()).unwrap();
    assert_eq!(k.manager.reload_policies().unwrap(), 2);
    assert!(k.manager.policy("terminal").is_ok());

    k.manager.audit().flush().await.unwrap();
    let reloads = k
        .manager
        .audit()
        .search(&AuditFilter {
            kind: Some(AuditEventKind::PolicyReload),
            ..Default::default()
        })
        .await
        .unwrap();
    let outcomes: Vec<_> = reloads.iter().filter_map(|e| e.decision.clone()).collect();
    assert_eq!(outcomes, vec!["rejected", "applied"]);
}

#[tokio::test]
async fn test_decisions_are_audited_while_sink_is_down() {
    let k = kernel(vec![search(100)]);
    k.sink.set_available(false);

    let req = ToolRequest::new("search", Operation::Read, &ctx())
        .with_parameter("q", "rust")
        .with_parameter("token", "secret-value");
    assert_eq!(k.manager.evaluate(&req, &ctx()).kind(), DecisionKind::Allow);
    k.manager.audit().flush().await.unwrap();

    assert!(k.sink.events().is_empty());
    let spilled = events_for(&k, req.request_id()).await;
    assert_eq!(spilled.len(), 1);
    assert!(k.manager.get_status().audit.degraded);
    let spill_text = std::fs::read_to_string(k.dir.path().join("audit").join("spill.jsonl")).unwrap();
    assert!(!spill_text.contains("secret-value"));

    k.sink.set_available(true);
    k.manager.audit().flush().await.unwrap();
    assert_eq!(k.sink.events().len(), 1);
    assert_eq!(k.manager.audit().verify().await.unwrap(), Ok(1));
}

#[tokio::test]
async fn test_sandbox_released_when_executor_fails() {
    let k = kernel(vec![file_ops()]);
    let req = ToolRequest::new("file_ops", Operation::Read, &ctx()).with_target_path("/workspace/notes.md");
    let request_id = req.request_id().to_string();

    let manager = k.manager.clone();
    let outcome = k
        .manager
        .evaluate_and_execute(req, &ctx(), |sandbox| async move {
            assert!(manager.sandbox().is_active(&sandbox.request_id));
            assert!(!sandbox.writable);
            Err::<(), _>("disk full".to_string())
        })
        .await;
    let Outcome::Executed { result, .. } = outcome else {
        panic!("expected execution");
    };
    assert_eq!(result.unwrap_err(), "disk full");
    assert_eq!(k.manager.sandbox().active_count(), 0);
    assert_eq!(k.manager.sandbox().reserved_memory_bytes(), 0);

    let events = events_for(&k, &request_id).await;
    let end = events.last().unwrap();
    assert_eq!(end.kind, AuditEventKind::ExecutionEnd);
    assert_eq!(end.decision.as_deref(), Some("failure"));
    assert_eq!(end.payload["error"], "disk full");
    assert_eq!(k.manager.get_status().execution_failures, 1);
}

#[tokio::test]
async fn test_writable_sandbox_masks_forbidden_subtree() {
    let k = kernel(vec![file_ops()]);
    let req = ToolRequest::new("file_ops", Operation::Write, &ctx()).with_target_path("/workspace/out.txt");

    let outcome = k
        .manager
        .evaluate_and_execute(req, &ctx(), |sandbox| async move { Ok::<_, String>(sandbox) })
        .await;
    let Outcome::Executed { result, .. } = outcome else {
        panic!("expected execution");
    };
    let sandbox = result.unwrap();
    assert!(sandbox.writable);
    assert_eq!(sandbox.allowed_paths, vec![PathBuf::from("/workspace")]);
    assert_eq!(sandbox.masked_paths, vec![PathBuf::from("/workspace/.git")]);
    assert!(sandbox.permits(std::path::Path::new("/workspace/out.txt")));
    assert!(!sandbox.permits(std::path::Path::new("/workspace/.git/hooks/pre-commit")));
}

#[tokio::test]
async fn test_cancelled_execution_releases_sandbox() {
    let k = kernel(vec![file_ops()]);
    let req = ToolRequest::new("file_ops", Operation::Read, &ctx()).with_target_path("/workspace/notes.md");
    let request_id = req.request_id().to_string();

    let c = ctx();
    let run = k.manager.evaluate_and_execute(req, &c, |_| async {
        std::future::pending::<Result<(), String>>().await
    });
    assert!(tokio::time::timeout(Duration::from_millis(50), run).await.is_err());
    assert_eq!(k.manager.sandbox().active_count(), 0);

    let events = events_for(&k, &request_id).await;
    assert_eq!(events.last().unwrap().decision.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn test_prepare_sandbox_requires_allow_for_same_request() {
    let k = kernel(vec![file_ops(), terminal(300)]);

    let req = ToolRequest::new("file_ops", Operation::Write, &ctx()).with_target_path("/workspace/out.txt");
    let decision = k.manager.evaluate(&req, &ctx());
    assert!(decision.is_allowed());

    let other = ToolRequest::new("file_ops", Operation::Write, &ctx()).with_target_path("/workspace/out.txt");
    assert!(matches!(
        k.manager.prepare_sandbox(&other, &decision),
        Err(WardenError::SandboxPreparation(SandboxError::NotAllowed(_)))
    ));

    let lease = k.manager.prepare_sandbox(&req, &decision).unwrap();
    assert!(lease.config().writable);
    assert_eq!(lease.config().working_dir, PathBuf::from("/workspace"));
    assert_eq!(k.manager.sandbox().active_count(), 1);
    drop(lease);
    assert_eq!(k.manager.sandbox().active_count(), 0);

    let pending_req = terminal_request();
    let pending = k.manager.evaluate(&pending_req, &ctx());
    assert_eq!(pending.kind(), DecisionKind::RequireConfirmation);
    assert!(k.manager.prepare_sandbox(&pending_req, &pending).is_err());
}

#[tokio::test]
async fn test_sandbox_failure_turns_allow_into_deny() {
    let config = KernelConfig {
        sandbox: SandboxFloor {
            allowed_paths: vec!["/srv/**".to_string()],
            ..Default::default()
        },
        ..Default::default()
    };
    let k = kernel_with(config, Some(policies(vec![file_ops()])));
    let req = ToolRequest::new("file_ops", Operation::Read, &ctx()).with_target_path("/workspace/a");
    let request_id = req.request_id().to_string();

    let outcome = k
        .manager
        .evaluate_and_execute(req, &ctx(), |_| async { Ok::<_, String>(()) })
        .await;
    let Outcome::Blocked { decision } = outcome else {
        panic!("sandbox failure must block");
    };
    assert_eq!(decision.kind(), DecisionKind::Deny);
    assert!(decision.reason().starts_with("sandbox preparation failed"));

    let kinds: Vec<_> = events_for(&k, &request_id).await.into_iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![AuditEventKind::Decision, AuditEventKind::SandboxFailure]);
    assert_eq!(k.manager.get_status().sandbox_failures, 1);
}

#[tokio::test]
async fn test_status_and_maintenance() {
    let k = kernel(vec![terminal(5), file_ops()]);
    k.manager.evaluate(&terminal_request(), &ctx());
    k.manager
        .evaluate(&ToolRequest::new("nope", Operation::Read, &ctx()), &ctx());

    let status = k.manager.get_status();
    assert_eq!(status.evaluated, 2);
    assert_eq!(status.denied, 1);
    assert_eq!(status.confirmation_required, 1);
    assert_eq!(status.pending_confirmations, 1);
    assert_eq!(status.policy_count, 2);

    k.clock.advance(Duration::from_secs(10));
    let handle = k.manager.spawn_maintenance(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(k.manager.get_status().pending_confirmations, 0);
    handle.abort();

    let json = serde_json::to_value(k.manager.get_status()).unwrap();
    assert_eq!(json["confirmation_required"], 1);
}
