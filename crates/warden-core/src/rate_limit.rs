//! Sliding-window rate limiting with optional token-bucket burst.
//!
//! All scopes a request touches are checked and charged under one lock, so a
//! request either consumes budget everywhere or nowhere.

use crate::policy::{RateLimitRule, RateScope};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Snapshot of one counter, returned with limited and admitted decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub scope: RateScope,
    pub key: String,
    /// Quota per window.
    pub limit: u32,
    /// Window slots left after this request.
    pub remaining: u32,
    /// When the oldest charge leaves the window (unix ms).
    pub reset_at: u64,
    /// How long until a retry can succeed; 0 when admitted.
    pub retry_after_ms: u64,
}

/// One counter a request must pass.
#[derive(Debug, Clone, Copy)]
pub struct RateCheck<'a> {
    pub scope: RateScope,
    pub key: &'a str,
    pub rule: &'a RateLimitRule,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChargeKind {
    Window(u64),
    Burst,
}

#[derive(Debug)]
struct Charge {
    scope: RateScope,
    key: String,
    kind: ChargeKind,
}

/// Budget charged for one admitted request. Hand it back with
/// [`RateLimiter::release`] to refund it; dropping it keeps the charge.
#[derive(Debug, Default)]
#[must_use = "dropping a permit keeps the charge; pass it to release() to refund"]
pub struct RateLimitPermit {
    charges: Vec<Charge>,
}

impl RateLimitPermit {
    pub fn is_empty(&self) -> bool {
        self.charges.is_empty()
    }
}

/// Result of [`RateLimiter::acquire`].
#[derive(Debug)]
pub enum RateLimitOutcome {
    Admitted {
        permit: RateLimitPermit,
        /// Counter with the fewest slots left, if any check applied.
        info: Option<RateLimitInfo>,
    },
    /// The first breached counter, in check order.
    Limited(RateLimitInfo),
}

#[derive(Debug)]
struct Window {
    hits: VecDeque<u64>,
    tokens: f64,
    last_refill: u64,
    window_ms: u64,
    burst: f64,
}

impl Window {
    fn new(rule: &RateLimitRule, now: u64) -> Self {
        let burst = rule.burst.unwrap_or(0) as f64;
        Self {
            hits: VecDeque::new(),
            tokens: burst,
            last_refill: now,
            window_ms: rule.window_ms(),
            burst,
        }
    }

    /// Adopt the rule's current shape, then age the window to `now`.
    fn advance(&mut self, rule: &RateLimitRule, now: u64) {
        self.window_ms = rule.window_ms();
        self.burst = rule.burst.unwrap_or(0) as f64;
        self.age(now);
    }

    fn age(&mut self, now: u64) {
        let window = self.window_ms;
        while self.hits.front().is_some_and(|&t| t + window <= now) {
            self.hits.pop_front();
        }
        if now > self.last_refill && window > 0 {
            let elapsed = (now - self.last_refill) as f64;
            self.tokens += elapsed * self.burst / window as f64;
            self.last_refill = now;
        }
        self.tokens = self.tokens.min(self.burst);
    }

    fn used(&self) -> u32 {
        self.hits.len() as u32
    }

    fn is_idle(&self) -> bool {
        self.hits.is_empty() && self.tokens >= self.burst
    }

    fn info(&self, check: &RateCheck<'_>, now: u64, limited: bool) -> RateLimitInfo {
        let window = check.rule.window_ms();
        let reset_at = self.hits.front().map(|t| t + window).unwrap_or(now);
        let retry_after_ms = if limited {
            let slot = reset_at.saturating_sub(now);
            if self.burst > 0.0 {
                let token = ((1.0 - self.tokens).max(0.0) * window as f64 / self.burst).ceil() as u64;
                slot.min(token)
            } else {
                slot
            }
        } else {
            0
        };
        RateLimitInfo {
            scope: check.scope,
            key: check.key.to_string(),
            limit: check.rule.quota,
            remaining: check.rule.quota.saturating_sub(self.used()),
            reset_at,
            retry_after_ms,
        }
    }
}

/// Process-wide rate limiter.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<(RateScope, String), Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check every counter in order and charge all of them, or none.
    pub fn acquire(&self, checks: &[RateCheck<'_>], now: u64) -> RateLimitOutcome {
        let mut windows = self.lock();
        let mut plan = Vec::with_capacity(checks.len());

        for check in checks {
            let window = windows
                .entry((check.scope, check.key.to_string()))
                .or_insert_with(|| Window::new(check.rule, now));
            window.advance(check.rule, now);

            if window.used() < check.rule.quota {
                plan.push(ChargeKind::Window(now));
            } else if window.tokens >= 1.0 {
                plan.push(ChargeKind::Burst);
            } else {
                return RateLimitOutcome::Limited(window.info(check, now, true));
            }
        }

        let mut permit = RateLimitPermit::default();
        let mut tightest: Option<RateLimitInfo> = None;
        for (check, kind) in checks.iter().zip(plan) {
            let Some(window) = windows.get_mut(&(check.scope, check.key.to_string())) else {
                continue;
            };
            match kind {
                ChargeKind::Window(at) => window.hits.push_back(at),
                ChargeKind::Burst => window.tokens -= 1.0,
            }
            let info = window.info(check, now, false);
            if tightest.as_ref().map_or(true, |t| info.remaining < t.remaining) {
                tightest = Some(info);
            }
            permit.charges.push(Charge {
                scope: check.scope,
                key: check.key.to_string(),
                kind,
            });
        }

        RateLimitOutcome::Admitted { permit, info: tightest }
    }

    /// Refund every charge in `permit`.
    pub fn release(&self, permit: RateLimitPermit) {
        if permit.charges.is_empty() {
            return;
        }
        let mut windows = self.lock();
        for charge in permit.charges {
            let Some(window) = windows.get_mut(&(charge.scope, charge.key)) else {
                continue;
            };
            match charge.kind {
                ChargeKind::Window(at) => {
                    if let Some(pos) = window.hits.iter().rposition(|&t| t == at) {
                        window.hits.remove(pos);
                    }
                }
                ChargeKind::Burst => window.tokens = (window.tokens + 1.0).min(window.burst),
            }
        }
    }

    /// Current state of one counter without charging it.
    pub fn remaining(&self, check: &RateCheck<'_>, now: u64) -> RateLimitInfo {
        let mut windows = self.lock();
        match windows.get_mut(&(check.scope, check.key.to_string())) {
            Some(window) => {
                window.advance(check.rule, now);
                window.info(check, now, false)
            }
            None => Window::new(check.rule, now).info(check, now, false),
        }
    }

    /// Drop counters with nothing in their window and a full bucket.
    pub fn prune(&self, now: u64) -> usize {
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, window| {
            window.age(now);
            !window.is_idle()
        });
        before - windows.len()
    }

    /// Number of live counters.
    pub fn counter_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(RateScope, String), Window>> {
        self.windows.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
