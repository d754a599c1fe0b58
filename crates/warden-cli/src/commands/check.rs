//! `warden check`: evaluate one request and print the decision.

use super::{open_kernel, CommandExit, EXIT_BLOCKED};
use crate::cli::RequestArgs;
use serde_json::Value;
use warden_core::{DecisionKind, KernelConfig, Operation, PolicyDecision};

pub async fn run(
    config: KernelConfig,
    args: &RequestArgs,
    operation: Operation,
    params: Vec<(String, Value)>,
) -> anyhow::Result<()> {
    let kernel = open_kernel(config)?;
    let decision = evaluate(&kernel.manager, args, operation, params);
    kernel.shutdown().await?;

    println!("{}", serde_json::to_string_pretty(&decision)?);
    match decision.kind() {
        DecisionKind::Allow | DecisionKind::RequireConfirmation => Ok(()),
        DecisionKind::Deny | DecisionKind::RateLimited => Err(CommandExit::new(EXIT_BLOCKED, "").into()),
    }
}

fn evaluate(
    manager: &warden_core::SafetyManager,
    args: &RequestArgs,
    operation: Operation,
    params: Vec<(String, Value)>,
) -> PolicyDecision {
    let context = args.context();
    let request = params
        .into_iter()
        .fold(args.request(operation, &context), |request, (key, value)| {
            request.with_parameter(key, value)
        });
    manager.evaluate(&request, &context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::*;
    use serde_json::json;
    use tempfile::TempDir;
    use warden_audit::{AuditEventKind, AuditFilter};

    #[tokio::test]
    async fn test_check_allows_and_audits_decision() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write_policy(
            &dir.path().join("policies"),
            "file_ops",
            json!({
                "tool_name": "file_ops",
                "allowed_paths": ["/workspace/**"],
                "allowed_operations": ["read"],
            }),
        );

        let kernel = open_kernel(config.clone()).unwrap();
        let decision = evaluate(
            &kernel.manager,
            &request_args("file_ops", Some("/workspace/notes.md")),
            Operation::Read,
            vec![("encoding".to_string(), json!("utf-8"))],
        );
        assert!(decision.is_allowed(), "{}", decision.reason());
        assert_eq!(decision.policy_name(), "file_ops");

        let denied = evaluate(
            &kernel.manager,
            &request_args("file_ops", Some("/etc/shadow")),
            Operation::Read,
            Vec::new(),
        );
        assert_eq!(denied.kind(), DecisionKind::Deny);
        assert!(denied.reason().contains("allowed_paths"));
        kernel.shutdown().await.unwrap();

        let (audit, _writer) = crate::commands::open_audit(&config).unwrap();
        let events = audit
            .search(&AuditFilter {
                kind: Some(AuditEventKind::Decision),
                ..Default::default()
            })
            .await
            .unwrap();
        let decisions: Vec<_> = events.iter().filter_map(|e| e.decision.as_deref()).collect();
        assert_eq!(decisions, vec!["allow", "deny"]);
    }

    #[tokio::test]
    async fn test_check_unknown_tool_exits_blocked() {
        let dir = TempDir::new().unwrap();
        let err = run(config_in(&dir), &request_args("ghost", None), Operation::Read, Vec::new())
            .await
            .unwrap_err();
        let exit = err.downcast_ref::<CommandExit>().unwrap();
        assert_eq!(exit.code, EXIT_BLOCKED);
    }
}
