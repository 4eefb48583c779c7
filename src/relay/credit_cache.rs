//! Per-account credit cache (spec.md §3 "Credit Cache").
//!
//! Tracks the vendor's metered usage per account so the Scheduler can weight
//! selections by remaining quota. Updated by the maintainer loop and by
//! post-request accounting in the Stream Engine; read by the Scheduler.
//! Shares a single `RwLock` with the Scheduler's smooth-weight state because
//! selection needs a consistent read of both (spec.md §5).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::account::AccountId;

/// A single account's cached credit reading.
#[derive(Debug, Clone, Copy)]
pub struct CreditEntry {
    pub used: f64,
    pub total: f64,
    pub last_refreshed: Instant,
}

impl CreditEntry {
    pub fn remaining(&self) -> f64 {
        (self.total - self.used).max(0.0)
    }

    pub fn usage_ratio(&self) -> f64 {
        if self.total <= 0.0 {
            0.0
        } else {
            (self.used / self.total).clamp(0.0, 1.0)
        }
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.last_refreshed.elapsed() > ttl
    }
}

/// Smooth-weight state the Scheduler mutates between selections (spec.md §3
/// "Smooth-weight State"), stored alongside credit entries so both can be
/// read and mutated under one lock during selection.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmoothWeightState {
    pub current_weight: i64,
}

#[derive(Default)]
struct Inner {
    credits: HashMap<AccountId, CreditEntry>,
    weights: HashMap<AccountId, SmoothWeightState>,
    last_selected: Option<AccountId>,
}

/// Shared, lock-protected credit + smooth-weight state for every account.
pub struct CreditCache {
    ttl: Duration,
    inner: RwLock<Inner>,
}

impl CreditCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Write a fresh credit reading for `account_id`, overwriting any prior entry.
    pub async fn record(&self, account_id: &str, used: f64, total: f64) {
        let mut inner = self.inner.write().await;
        inner.credits.insert(
            account_id.to_string(),
            CreditEntry {
                used,
                total,
                last_refreshed: Instant::now(),
            },
        );
    }

    /// Add `delta` credits consumed by a just-completed request (metering
    /// events accumulate across a single streamed response).
    pub async fn add_usage(&self, account_id: &str, delta: f64) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.credits.get_mut(account_id) {
            entry.used += delta;
        }
    }

    /// Current entry for `account_id`, if one has ever been recorded and it
    /// is not stale.
    pub async fn get_fresh(&self, account_id: &str) -> Option<CreditEntry> {
        let inner = self.inner.read().await;
        inner.credits.get(account_id).copied().filter(|e| !e.is_stale(self.ttl))
    }

    /// Current entry for `account_id` regardless of staleness, if one has
    /// ever been recorded. Used where "no info yet" and "known-exhausted but
    /// unrefreshed" must be told apart (the Scheduler's eligibility filter).
    pub async fn get(&self, account_id: &str) -> Option<CreditEntry> {
        self.inner.read().await.credits.get(account_id).copied()
    }

    /// Whether any entry (stale or not) exists for this account.
    pub async fn has_entry(&self, account_id: &str) -> bool {
        self.inner.read().await.credits.contains_key(account_id)
    }

    /// Run `f` with mutable access to every candidate's smooth weight and the
    /// last-selected slot, under a single write-lock critical section. This
    /// is the scheduler's sole entry point into shared mutable state.
    pub async fn with_selection_lock<R>(
        &self,
        f: impl FnOnce(&mut HashMap<AccountId, SmoothWeightState>, &mut Option<AccountId>) -> R,
    ) -> R {
        let mut inner = self.inner.write().await;
        let Inner {
            weights,
            last_selected,
            ..
        } = &mut *inner;
        f(weights, last_selected)
    }

    /// The account id chosen by the most recent scheduler selection, if any.
    pub async fn last_selected(&self) -> Option<AccountId> {
        self.inner.read().await.last_selected.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_floors_at_zero() {
        let entry = CreditEntry {
            used: 150.0,
            total: 100.0,
            last_refreshed: Instant::now(),
        };
        assert_eq!(entry.remaining(), 0.0);
    }

    #[test]
    fn usage_ratio_handles_zero_total() {
        let entry = CreditEntry {
            used: 0.0,
            total: 0.0,
            last_refreshed: Instant::now(),
        };
        assert_eq!(entry.usage_ratio(), 0.0);
    }

    #[tokio::test]
    async fn stale_entries_are_hidden_from_get_fresh() {
        let cache = CreditCache::new(Duration::from_millis(0));
        cache.record("a", 10.0, 100.0).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get_fresh("a").await.is_none());
        assert!(cache.has_entry("a").await);
    }

    #[tokio::test]
    async fn add_usage_accumulates() {
        let cache = CreditCache::new(Duration::from_secs(600));
        cache.record("a", 10.0, 100.0).await;
        cache.add_usage("a", 5.0).await;
        let entry = cache.get_fresh("a").await.unwrap();
        assert_eq!(entry.used, 15.0);
    }
}
