//! Per-account circuit breaker (spec.md §3 "Circuit Breaker", §4.3).
//!
//! One breaker per account, lazily materialized in a single `RwLock`-guarded
//! map. Every transition, including the admin overrides and `try_auto_trip`,
//! happens under the map's write lock so the check-then-act pattern in
//! `try_auto_trip` can never race with a concurrent `record_success`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::account::AccountId;
use super::config::BreakerConfig;

/// Circuit breaker state (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct Breaker {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    half_opened_at: Option<Instant>,
}

impl Default for Breaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            opened_at: None,
            half_opened_at: None,
        }
    }
}

/// Per-account circuit breaker map, shared across the scheduler and the
/// Stream Engine's outcome reporting path.
pub struct HealthTracker {
    config: BreakerConfig,
    breakers: RwLock<HashMap<AccountId, Breaker>>,
}

impl HealthTracker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Whether the account currently admits traffic.
    ///
    /// Closed and HalfOpen both admit traffic. An Open breaker past its
    /// `open_duration` auto-transitions to HalfOpen as a side effect of this
    /// check, per spec.md §4.3's "Open, availability check, timeout elapsed
    /// → HalfOpen" transition.
    pub async fn is_available(&self, account_id: &str) -> bool {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(account_id.to_string()).or_default();
        match breaker.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = breaker.opened_at.unwrap_or_else(Instant::now);
                if opened_at.elapsed() >= self.config.open_duration {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.half_opened_at = Some(Instant::now());
                    breaker.success_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful request outcome.
    pub async fn record_success(&self, account_id: &str) {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(account_id.to_string()).or_default();
        match breaker.state {
            CircuitState::Closed => {
                breaker.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                breaker.success_count += 1;
                if breaker.success_count >= self.config.half_open_max_success {
                    *breaker = Breaker::default();
                }
            }
            CircuitState::Open => {
                // A success can't be observed while Open denies traffic, but
                // tolerate it defensively rather than panic.
            }
        }
    }

    /// Record a failed request outcome. Callers must have already filtered
    /// out non-breaking failures (spec.md §4.3) before calling this.
    pub async fn record_failure(&self, account_id: &str) {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(account_id.to_string()).or_default();
        let now = Instant::now();
        match breaker.state {
            CircuitState::Closed => {
                let within_window = breaker
                    .last_failure_at
                    .map(|t| now.duration_since(t) <= self.config.failure_window)
                    .unwrap_or(false);
                breaker.failure_count = if within_window {
                    breaker.failure_count + 1
                } else {
                    1
                };
                breaker.last_failure_at = Some(now);
                if breaker.failure_count >= self.config.failure_threshold {
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                breaker.state = CircuitState::Open;
                breaker.opened_at = Some(now);
                breaker.success_count = 0;
                breaker.last_failure_at = Some(now);
            }
            CircuitState::Open => {
                breaker.last_failure_at = Some(now);
            }
        }
    }

    /// Force the breaker Open regardless of current state. Idempotent.
    pub async fn manual_trip(&self, account_id: &str) {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(account_id.to_string()).or_default();
        breaker.state = CircuitState::Open;
        breaker.opened_at = Some(Instant::now());
        breaker.success_count = 0;
    }

    /// Force the breaker Closed with all counters zeroed. Idempotent.
    pub async fn manual_reset(&self, account_id: &str) {
        let mut breakers = self.breakers.write().await;
        breakers.insert(account_id.to_string(), Breaker::default());
    }

    /// Trip the breaker from an externally computed error rate, but only if
    /// it is currently Closed and the sample meets the configured minimum —
    /// this is the only place an observed rate (rather than a single
    /// request's outcome) can open a breaker, and doing the check-then-act
    /// under the map's write lock closes the TOCTOU window where a rate
    /// computed against stale data could re-open a breaker that has already
    /// recovered into HalfOpen.
    pub async fn try_auto_trip(&self, account_id: &str, error_rate: f64, total_reqs: u64) -> bool {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(account_id.to_string()).or_default();
        if breaker.state != CircuitState::Closed {
            return false;
        }
        if total_reqs >= self.config.error_rate_min_reqs
            && error_rate >= self.config.error_rate_threshold
        {
            breaker.state = CircuitState::Open;
            breaker.opened_at = Some(Instant::now());
            true
        } else {
            false
        }
    }

    /// Current state, for diagnostics and tests. Does not perform the
    /// Open-to-HalfOpen timeout check that `is_available` does.
    pub async fn state(&self, account_id: &str) -> CircuitState {
        self.breakers
            .read()
            .await
            .get(account_id)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }
}
