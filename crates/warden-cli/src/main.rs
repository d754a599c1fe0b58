//! warden: tool-access safety kernel CLI
//!
//! Evaluates tool requests against the policy directory, runs commands inside
//! prepared sandboxes and queries the audit trail.

mod cli;
mod commands;

use clap::Parser;
use cli::{AuditAction, Cli, Commands, PolicyAction};
use tracing_subscriber::EnvFilter;
use warden_core::{ConfigStore, KernelConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("warden=debug,warden_core=debug,warden_audit=debug,warden_sandbox=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli);

    let result = match cli.command {
        Commands::Check {
            request,
            operation,
            params,
        } => commands::check::run(config, &request, operation, params).await,
        Commands::Exec {
            request,
            operation,
            isolate,
            yes,
            command,
        } => {
            let options = commands::exec::ExecOptions { isolate, yes };
            commands::exec::run(config, &request, operation, command, options).await
        }
        Commands::Policy { action } => match action {
            PolicyAction::Validate { dir } => {
                commands::policy::validate(&dir.unwrap_or_else(|| config.resolved_policy_dir()))
            }
            PolicyAction::Schema => commands::policy::schema(),
            PolicyAction::List => commands::policy::list(&config.resolved_policy_dir()),
        },
        Commands::Audit { action } => match action {
            AuditAction::Search {
                tool,
                request,
                decision,
                kind,
                since_secs,
                limit,
                json,
            } => {
                let query = commands::audit::SearchQuery {
                    tool,
                    request,
                    decision,
                    kind,
                    since_secs,
                    limit,
                    json,
                };
                commands::audit::search(config, query).await
            }
            AuditAction::Verify => commands::audit::verify(config).await,
        },
    };

    if let Err(err) = result {
        if let Some(exit) = err.downcast_ref::<commands::CommandExit>() {
            if !exit.message.is_empty() {
                eprintln!("{}", exit.message);
            }
            std::process::exit(exit.code);
        }
        return Err(err);
    }
    Ok(())
}

/// Config file, then environment, then command-line overrides.
fn load_config(cli: &Cli) -> KernelConfig {
    let store = match &cli.config {
        Some(path) => ConfigStore::at(path),
        None => ConfigStore::new(),
    };
    let mut config = store.load_with_env();
    if let Some(dir) = &cli.policy_dir {
        config.policy_dir = Some(dir.clone());
    }
    if let Some(dir) = &cli.audit_dir {
        config.audit.dir = Some(dir.clone());
    }
    config
}
