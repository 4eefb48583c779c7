//! Background maintainer loop (spec.md §4.2 "Maintainer loop", §5).
//!
//! A single task with an explicit start/stop pair, not tied to process
//! lifetime. Every tick it walks the Credential Store snapshot and, per
//! account, refreshes the token if it is inside the refresh window and
//! best-effort refreshes the credit cache regardless.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::config::RelayConfig;
use super::credential_store::CredentialStore;
use super::credit_cache::CreditCache;
use super::oidc_agent::OidcAgent;

/// Owns the background maintainer task. `start` is idempotent; a second call
/// while already running is a no-op.
pub struct Maintainer {
    store: Arc<CredentialStore>,
    credits: Arc<CreditCache>,
    agent: Arc<OidcAgent>,
    config: RelayConfig,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Maintainer {
    pub fn new(
        store: Arc<CredentialStore>,
        credits: Arc<CreditCache>,
        agent: Arc<OidcAgent>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            credits,
            agent,
            config,
            handle: Mutex::new(None),
        }
    }

    /// Start the background tick loop. Idempotent: a running maintainer is
    /// left untouched.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            this.run().await;
        }));
    }

    /// Stop the tick loop. Idempotent: stopping an already-stopped maintainer
    /// is a no-op.
    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.maintainer_period);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One maintainer pass, exposed directly for tests so they don't have to
    /// wait on a real timer.
    pub async fn tick(&self) {
        let accounts = match self.store.list().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!("maintainer: failed to list accounts: {e}");
                return;
            }
        };

        for account in accounts {
            if let Some(expires_at) = account.expires_at {
                let until_expiry = expires_at - chrono::Utc::now();
                let window = chrono::Duration::from_std(self.config.refresh_window)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                if until_expiry < window {
                    self.refresh_account(&account.id).await;
                }
            }

            self.refresh_credits(&account.id).await;
        }
    }

    async fn refresh_account(&self, account_id: &str) {
        let account = match self.store.list().await {
            Ok(accounts) => accounts.into_iter().find(|a| a.id == account_id),
            Err(_) => None,
        };
        let Some(account) = account else { return };

        match self.agent.refresh(&account).await {
            Ok((access_token, refresh_token, expires_at)) => {
                let result = self
                    .store
                    .update(account_id, |a| {
                        a.access_token = Some(access_token);
                        a.refresh_token = Some(refresh_token);
                        a.expires_at = Some(expires_at);
                    })
                    .await;
                if let Err(e) = result {
                    warn!("maintainer: failed to persist refreshed tokens for {account_id}: {e}");
                } else {
                    debug!("maintainer: refreshed tokens for {account_id}");
                }
            }
            Err(e) => warn!("maintainer: refresh failed for {account_id}: {e}"),
        }
    }

    async fn refresh_credits(&self, account_id: &str) {
        let account = match self.store.list().await {
            Ok(accounts) => accounts.into_iter().find(|a| a.id == account_id),
            Err(_) => None,
        };
        let Some(account) = account else { return };
        let Some(access_token) = account.access_token.clone() else {
            return;
        };

        match self
            .agent
            .get_usage_limits(&access_token, account.profile_arn.as_deref())
            .await
        {
            Ok((_, Some(credit))) => {
                self.credits.record(account_id, credit.used, credit.total).await;
            }
            Ok((_, None)) => {}
            Err(e) => debug!("maintainer: credit refresh failed for {account_id}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::account::Account;
    use chrono::Utc;
    use tempfile::tempdir;

    fn expiring_soon_account(id: &str) -> Account {
        Account {
            id: id.to_string(),
            access_token: Some("tok".to_string()),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(Utc::now() + chrono::Duration::seconds(10)),
            client_id: Some("cid".to_string()),
            client_secret: Some("secret".to_string()),
            profile_arn: None,
            identity: None,
            region: "us-east-1".to_string(),
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path().join("accounts.json")));
        let credits = Arc::new(CreditCache::new(std::time::Duration::from_secs(600)));
        let agent = Arc::new(OidcAgent::new("us-east-1"));
        let maintainer = Arc::new(Maintainer::new(store, credits, agent, RelayConfig::default()));

        maintainer.start().await;
        maintainer.start().await; // must not spawn a second task
        assert!(maintainer.handle.lock().await.is_some());
        maintainer.stop().await;
        assert!(maintainer.handle.lock().await.is_none());
    }

    #[tokio::test]
    async fn tick_skips_accounts_without_expiry_refresh_attempt() {
        // An account with a far-future expiry should not trigger a refresh
        // attempt (and thus no network call, which would fail in tests).
        let dir = tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path().join("accounts.json")));
        let mut account = expiring_soon_account("a");
        account.expires_at = Some(Utc::now() + chrono::Duration::hours(10));
        store.add(account).await.unwrap();

        let credits = Arc::new(CreditCache::new(std::time::Duration::from_secs(600)));
        let agent = Arc::new(OidcAgent::new("us-east-1"));
        let maintainer = Maintainer::new(store.clone(), credits, agent, RelayConfig::default());

        // Credit refresh will fail (no real network) but must not panic.
        maintainer.tick().await;
        let accounts = store.list().await.unwrap();
        assert_eq!(accounts[0].access_token.as_deref(), Some("tok"));
    }
}
