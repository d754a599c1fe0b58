//! `warden exec`: evaluate, confirm and run a command inside its sandbox.

use super::{open_kernel, CommandExit, EXIT_BLOCKED, EXIT_NOT_CONFIRMED};
use crate::cli::RequestArgs;
use std::ffi::OsString;
use std::io::{BufRead, Write};
use warden_sandbox::{wrap_command, IsolationBackend, SandboxConfig};
use warden_core::{KernelConfig, Operation, Outcome, PolicyDecision, SafetyManager};

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    pub isolate: bool,
    pub yes: bool,
}

/// How an `exec` invocation ended.
#[derive(Debug)]
pub enum ExecReport {
    /// The command ran; `code` is its exit status.
    Completed { code: i32 },
    /// The kernel denied or rate limited the request.
    Blocked(PolicyDecision),
    /// The confirmation was rejected, or approved but not honoured.
    NotConfirmed { reason: String },
}

pub async fn run(
    config: KernelConfig,
    args: &RequestArgs,
    operation: Operation,
    command: Vec<String>,
    options: ExecOptions,
) -> anyhow::Result<()> {
    let kernel = open_kernel(config)?;
    let report = if options.yes {
        execute(&kernel.manager, args, operation, &command, options.isolate, |_| true).await
    } else {
        execute(&kernel.manager, args, operation, &command, options.isolate, ask_user).await
    };
    kernel.shutdown().await?;

    match report? {
        ExecReport::Completed { code: 0 } => Ok(()),
        ExecReport::Completed { code } => Err(CommandExit::new(code, "").into()),
        ExecReport::Blocked(decision) => Err(CommandExit::new(
            EXIT_BLOCKED,
            format!("{}: {}", decision.kind(), decision.reason()),
        )
        .into()),
        ExecReport::NotConfirmed { reason } => Err(CommandExit::new(EXIT_NOT_CONFIRMED, reason).into()),
    }
}

/// Drive one request through the kernel. A confirmation prompt is answered
/// by `approve`; an approved request is resubmitted once.
pub async fn execute<A>(
    manager: &SafetyManager,
    args: &RequestArgs,
    operation: Operation,
    command: &[String],
    isolate: bool,
    mut approve: A,
) -> anyhow::Result<ExecReport>
where
    A: FnMut(&str) -> bool,
{
    let context = args.context();
    let mut prompted = false;

    loop {
        let request = args
            .request(operation, &context)
            .with_parameter("command", command.to_vec());
        let outcome = manager
            .evaluate_and_execute(request, &context, |sandbox| {
                run_in_sandbox(sandbox, command.to_vec(), isolate)
            })
            .await;

        match outcome {
            Outcome::Executed { result, .. } => {
                let code = result?;
                return Ok(ExecReport::Completed { code });
            }
            Outcome::Blocked { decision } => return Ok(ExecReport::Blocked(decision)),
            Outcome::PendingConfirmation {
                decision,
                confirmation_id,
            } => {
                if prompted {
                    return Ok(ExecReport::NotConfirmed {
                        reason: format!("confirmation {confirmation_id} was not honoured"),
                    });
                }
                prompted = true;

                let prompt = decision.confirmation_prompt().unwrap_or(decision.reason());
                let approved = approve(prompt);
                if !manager.confirm(&confirmation_id, approved, &context.user_id) {
                    return Ok(ExecReport::NotConfirmed {
                        reason: format!("confirmation {confirmation_id} could not be resolved"),
                    });
                }
                if !approved {
                    return Ok(ExecReport::NotConfirmed {
                        reason: "rejected by user".to_string(),
                    });
                }
            }
        }
    }
}

async fn run_in_sandbox(sandbox: SandboxConfig, command: Vec<String>, isolate: bool) -> anyhow::Result<i32> {
    let argv: Vec<OsString> = command.into_iter().map(OsString::from).collect();
    let argv = if isolate {
        wrap_command(&sandbox, IsolationBackend::native()?, &argv)?
    } else {
        argv
    };
    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty command"))?;

    tokio::fs::create_dir_all(&sandbox.working_dir).await?;
    tracing::debug!(
        request_id = %sandbox.request_id,
        cwd = %sandbox.working_dir.display(),
        "Spawning {}",
        program.to_string_lossy()
    );
    let status = tokio::process::Command::new(program)
        .args(rest)
        .current_dir(&sandbox.working_dir)
        .env_clear()
        .envs(&sandbox.env)
        .kill_on_drop(true)
        .status()
        .await?;
    Ok(status.code().unwrap_or(-1))
}

fn ask_user(prompt: &str) -> bool {
    eprint!("{prompt} [y/N] ");
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
