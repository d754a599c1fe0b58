//! warden-core: policy evaluation, rate limiting, confirmations and the
//! `SafetyManager` facade that gates every tool side effect.

pub mod clock;
pub mod config;
pub mod confirmation;
pub mod decision;
pub mod engine;
pub mod error;
pub mod manager;
pub mod policy;
pub mod rate_limit;
pub mod request;
pub mod risk;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigStore, KernelConfig, RateLimitConfig};
pub use confirmation::{
    ConfirmationConfig, ConfirmationCoordinator, ConfirmationOutcome, ConfirmationState, ConfirmationView,
    ConfirmationTicket, PriorConfirmation, SweepReport,
};
pub use decision::{DecisionKind, PolicyDecision, DEFAULT_DENY_POLICY};
pub use engine::{EngineConfig, PolicyEngine};
pub use error::WardenError;
pub use manager::{KernelStatus, Outcome, SafetyManager, SafetyManagerBuilder};
pub use policy::{CompiledPolicy, LogLevel, Policy, RateLimitRule, RateScope};
pub use rate_limit::{RateCheck, RateLimitInfo, RateLimitOutcome, RateLimitPermit, RateLimiter};
pub use request::{Operation, SecurityContext, ToolRequest};
pub use risk::{assess, RiskAssessment, RiskConfig, RiskLevel, RiskSignal};
pub use store::{PolicySnapshot, PolicyStore};

pub use warden_audit as audit;
pub use warden_sandbox as sandbox;
