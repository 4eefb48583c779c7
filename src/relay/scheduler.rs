//! Weighted round-robin scheduler (spec.md §4.4).
//!
//! Picks which credential to spend per request. Eligibility filtering reads
//! the Credential Store snapshot and consults the Health Tracker; weighted
//! selection (smooth weighted round-robin, nginx-style) then mutates shared
//! per-account weight state under the Credit Cache's selection lock, since
//! selection needs a consistent read of both the weights and the credit
//! readings they're derived from (spec.md §5).

use chrono::Utc;

use super::account::{Account, AccountId};
use super::credit_cache::{CreditCache, SmoothWeightState};
use super::error::{RelayError, RelayResult};
use super::health_tracker::HealthTracker;

/// Neutral weight assigned to an account with no credit-cache entry yet.
const NEUTRAL_WEIGHT: i64 = 50;

/// Picks the next account to spend per outgoing request.
pub struct Scheduler<'a> {
    health: &'a HealthTracker,
    credits: &'a CreditCache,
}

impl<'a> Scheduler<'a> {
    pub fn new(health: &'a HealthTracker, credits: &'a CreditCache) -> Self {
        Self { health, credits }
    }

    /// Select an account from `accounts` (spec.md §4.4's eligibility filter,
    /// applied in order, then smooth weighted round robin over the
    /// survivors). Returns [`RelayError::NoAvailableAccounts`] if nothing
    /// passes the filter.
    pub async fn select(&self, accounts: &[Account]) -> RelayResult<AccountId> {
        let now = Utc::now();
        let mut candidates: Vec<(&Account, i64)> = Vec::new();

        for account in accounts {
            if !account.has_valid_token(now) {
                continue;
            }
            if !self.health.is_available(&account.id).await {
                continue;
            }
            // `has_entry` tells "never recorded" apart from "recorded but
            // stale" — a stale entry still reflects the last known reading,
            // so a known-exhausted account must stay excluded rather than
            // silently re-qualifying at the neutral weight once it goes
            // stale (spec.md §4.4).
            let weight = if !self.credits.has_entry(&account.id).await {
                NEUTRAL_WEIGHT
            } else {
                let entry = self
                    .credits
                    .get(&account.id)
                    .await
                    .expect("has_entry just confirmed presence");
                if entry.remaining() <= 0.0 {
                    continue;
                }
                let raw = ((1.0 - entry.usage_ratio()) * 100.0).round() as i64;
                raw.max(1)
            };
            candidates.push((account, weight));
        }

        if candidates.is_empty() {
            return Err(RelayError::NoAvailableAccounts);
        }
        if candidates.len() == 1 {
            let id = candidates[0].0.id.clone();
            self.credits
                .with_selection_lock(|_weights, last_selected| {
                    *last_selected = Some(id.clone());
                })
                .await;
            return Ok(id);
        }

        let total_weight: i64 = candidates.iter().map(|(_, w)| w).sum();
        let winner_id = self
            .credits
            .with_selection_lock(|weights, last_selected| {
                let mut winner: Option<(AccountId, i64)> = None;
                for (account, weight) in &candidates {
                    let state = weights.entry(account.id.clone()).or_insert(SmoothWeightState {
                        current_weight: 0,
                    });
                    state.current_weight += weight;
                    if winner
                        .as_ref()
                        .map(|(_, current)| state.current_weight > *current)
                        .unwrap_or(true)
                    {
                        winner = Some((account.id.clone(), state.current_weight));
                    }
                }
                let (winner_id, _) = winner.expect("candidates is non-empty");
                if let Some(state) = weights.get_mut(&winner_id) {
                    state.current_weight -= total_weight;
                }
                *last_selected = Some(winner_id.clone());
                winner_id
            })
            .await;

        Ok(winner_id)
    }
}
