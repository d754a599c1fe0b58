//! Risk levels and the dynamic signals that raise them.

use crate::request::{SecurityContext, ToolRequest};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use warden_sandbox::path_depth;

/// Ordered risk classification.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds for dynamic risk signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Target paths deeper than this raise risk to medium.
    pub max_path_depth: usize,
    /// Context risk score at or above this raises risk to high.
    pub context_risk_threshold: f64,
    /// Context risk score at or above this raises risk to critical.
    pub context_critical_threshold: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_path_depth: 12,
            context_risk_threshold: 0.7,
            context_critical_threshold: 0.9,
        }
    }
}

const SHELL_METACHARACTERS: &[&str] = &[";", "|", "&", "`", "$(", ">", "<", "\n"];

/// One reason the effective risk was raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskSignal {
    pub level: RiskLevel,
    pub reason: String,
}

/// Effective risk plus the signals behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub signals: Vec<RiskSignal>,
}

impl RiskAssessment {
    /// Human-readable rationale for confirmation prompts.
    pub fn rationale(&self, declared: RiskLevel) -> String {
        if self.signals.is_empty() {
            return format!("policy declares {declared} risk");
        }
        let reasons: Vec<_> = self.signals.iter().map(|s| s.reason.as_str()).collect();
        reasons.join("; ")
    }
}

/// Combine the policy's declared level with request and context signals.
pub fn assess(
    request: &ToolRequest,
    context: &SecurityContext,
    declared: RiskLevel,
    config: &RiskConfig,
) -> RiskAssessment {
    let mut signals = Vec::new();

    if let Some(path) = request.target_path() {
        let depth = path_depth(path);
        if depth > config.max_path_depth {
            signals.push(RiskSignal {
                level: RiskLevel::Medium,
                reason: format!("path depth {depth} exceeds {}", config.max_path_depth),
            });
        }
    }

    if let Some(param) = request
        .parameters()
        .iter()
        .find(|(_, value)| contains_shell_metacharacters(value))
        .map(|(key, _)| key)
    {
        signals.push(RiskSignal {
            level: RiskLevel::High,
            reason: format!("parameter '{param}' contains shell metacharacters"),
        });
    }

    if context.risk_score >= config.context_critical_threshold {
        signals.push(RiskSignal {
            level: RiskLevel::Critical,
            reason: format!("context risk score {:.2} is critical", context.risk_score),
        });
    } else if context.risk_score >= config.context_risk_threshold {
        signals.push(RiskSignal {
            level: RiskLevel::High,
            reason: format!("context risk score {:.2} is elevated", context.risk_score),
        });
    }

    let level = signals.iter().map(|s| s.level).fold(declared, RiskLevel::max);
    RiskAssessment { level, signals }
}

fn contains_shell_metacharacters(value: &Value) -> bool {
    match value {
        Value::String(s) => SHELL_METACHARACTERS.iter().any(|m| s.contains(m)),
        Value::Array(items) => items.iter().any(contains_shell_metacharacters),
        Value::Object(map) => map.values().any(contains_shell_metacharacters),
        _ => false,
    }
}
