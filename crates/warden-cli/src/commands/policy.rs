//! `warden policy`: validate, describe and list policy documents.

use super::CommandExit;
use serde_json::Value;
use std::path::{Path, PathBuf};
use warden_core::{CompiledPolicy, Policy, PolicySnapshot};

/// Check every `*.json` document in `dir` against the policy schema and the
/// kernel's own loader, reporting each file.
pub fn validate(dir: &Path) -> anyhow::Result<()> {
    let files = policy_files(dir)?;
    if files.is_empty() {
        println!("No policy documents in {}", dir.display());
        return Ok(());
    }

    let validator = jsonschema::validator_for(&Policy::json_schema())
        .map_err(|e| anyhow::anyhow!("invalid policy schema: {e}"))?;

    let mut failures = 0usize;
    for file in &files {
        match validate_file(&validator, file) {
            Ok(tool) => println!("ok     {} ({tool})", file.display()),
            Err(reason) => {
                failures += 1;
                println!("error  {}: {reason}", file.display());
            }
        }
    }

    if failures == 0 {
        // Cross-file checks (duplicates) only surface when loading the set.
        if let Err(e) = PolicySnapshot::load_dir(dir) {
            return Err(CommandExit::new(1, e.to_string()).into());
        }
        println!("{} policy document(s) valid", files.len());
        Ok(())
    } else {
        Err(CommandExit::new(1, format!("{failures} of {} policy document(s) invalid", files.len())).into())
    }
}

fn validate_file(validator: &jsonschema::Validator, file: &Path) -> Result<String, String> {
    let raw = std::fs::read_to_string(file).map_err(|e| format!("failed to read: {e}"))?;
    let document: Value = serde_json::from_str(&raw).map_err(|e| format!("invalid JSON: {e}"))?;

    let mut errors = validator.iter_errors(&document).map(|e| e.to_string()).collect::<Vec<_>>();
    if !errors.is_empty() {
        errors.sort();
        return Err(format!("schema validation failed: {}", errors.join("; ")));
    }

    let policy: Policy = serde_json::from_value(document).map_err(|e| e.to_string())?;
    let stem = file.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    if stem != policy.tool_name {
        return Err(format!(
            "tool_name '{}' does not match file name '{stem}'",
            policy.tool_name
        ));
    }
    let compiled = CompiledPolicy::compile(policy, &file.display().to_string()).map_err(|e| e.to_string())?;
    Ok(compiled.name().to_string())
}

fn policy_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| CommandExit::new(1, format!("cannot read policy directory {}: {e}", dir.display())))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

pub fn schema() -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&Policy::json_schema())?);
    Ok(())
}

pub fn list(dir: &Path) -> anyhow::Result<()> {
    let snapshot = PolicySnapshot::load_dir(dir)?;
    if snapshot.is_empty() {
        println!("No policies in {}", dir.display());
        return Ok(());
    }
    for line in table(&snapshot) {
        println!("{line}");
    }
    Ok(())
}

fn table(snapshot: &PolicySnapshot) -> Vec<String> {
    let mut lines = vec![format!(
        "{:<20} {:<9} {:<28} {:<13} {}",
        "TOOL", "RISK", "OPERATIONS", "CONFIRMATION", "RATE LIMIT"
    )];
    for name in snapshot.tool_names() {
        let Some(compiled) = snapshot.get(name) else {
            continue;
        };
        let policy = compiled.policy();
        let operations = if policy.allowed_operations.is_empty() {
            "any".to_string()
        } else {
            policy
                .allowed_operations
                .iter()
                .map(|op| op.as_str())
                .collect::<Vec<_>>()
                .join(",")
        };
        let confirmation = if policy.requires_confirmation {
            "always".to_string()
        } else if policy.confirmation_operations.is_empty() {
            "risk-based".to_string()
        } else {
            policy
                .confirmation_operations
                .iter()
                .map(|op| op.as_str())
                .collect::<Vec<_>>()
                .join(",")
        };
        let rate = policy.rate_limit.as_ref().map_or_else(
            || "-".to_string(),
            |r| format!("{}/{}s {}", r.quota, r.window_secs, r.scope.as_str()),
        );
        lines.push(format!(
            "{:<20} {:<9} {:<28} {:<13} {}",
            policy.tool_name, policy.risk_level.as_str(), operations, confirmation, rate
        ));
    }
    lines
}
