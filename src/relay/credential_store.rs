//! Durable set of accounts (spec.md §3 "Credential Store", §4.1).
//!
//! Cache-first: reads consult an in-memory snapshot; writes go through the
//! cache then flush to disk under a file-level exclusive lock. Two disjoint
//! locks are used — a `RwLock` around the in-memory snapshot ("cache lock")
//! and a `Mutex` around disk I/O ("file lock") — and the discipline is: the
//! file lock is always acquired *before* the cache lock is taken for a
//! write, and never the reverse, so a reader blocked on the cache lock never
//! waits on a writer that is itself blocked on the file lock.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use super::account::{Account, AccountId};
use super::error::{RelayError, RelayResult};

#[derive(Debug, Serialize, Deserialize, Default)]
struct StoreDocument {
    accounts: Vec<Account>,
}

/// Cache-first, single-writer store for the account pool.
///
/// Lazily initialized on first access. Mutating admin operations
/// (`add`/`remove`) always [`reload_from_disk`](CredentialStore::reload_from_disk)
/// first, so a concurrently edited file is never clobbered by a stale
/// in-memory view.
pub struct CredentialStore {
    path: PathBuf,
    cache: RwLock<Option<Vec<Account>>>,
    file_lock: Mutex<()>,
}

impl CredentialStore {
    /// Create a store backed by the JSON document at `path`. Nothing is read
    /// from disk until the first operation.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(None),
            file_lock: Mutex::new(()),
        }
    }

    /// Snapshot of all accounts, populating the cache from disk on first call.
    pub async fn list(&self) -> RelayResult<Vec<Account>> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            return Ok(cached.clone());
        }
        let loaded = self.read_from_disk().await?;
        *self.cache.write().await = Some(loaded.clone());
        Ok(loaded)
    }

    /// Force-invalidate the cache and re-read from disk. Used before any
    /// `add`/`remove` to defeat stale-cache races with an external editor.
    pub async fn reload_from_disk(&self) -> RelayResult<Vec<Account>> {
        let loaded = self.read_from_disk().await?;
        *self.cache.write().await = Some(loaded.clone());
        Ok(loaded)
    }

    /// Append a new account. Fails if `account.id` already exists.
    pub async fn add(&self, account: Account) -> RelayResult<()> {
        let _file_guard = self.file_lock.lock().await;
        let mut accounts = self.read_from_disk().await?;
        if accounts.iter().any(|a| a.id == account.id) {
            return Err(RelayError::StoreWrite(format!(
                "account {} already exists",
                account.id
            )));
        }
        accounts.push(account);
        self.write_to_disk(&accounts).await?;
        *self.cache.write().await = Some(accounts);
        Ok(())
    }

    /// Remove an account by id. No-op if the id is not present.
    pub async fn remove(&self, id: &str) -> RelayResult<()> {
        let _file_guard = self.file_lock.lock().await;
        let mut accounts = self.read_from_disk().await?;
        accounts.retain(|a| a.id != id);
        self.write_to_disk(&accounts).await?;
        *self.cache.write().await = Some(accounts);
        Ok(())
    }

    /// Atomically apply `mutator` to the account with the given id and
    /// persist the result. Returns [`RelayError::UnknownAccount`] if absent.
    pub async fn update<F>(&self, id: &str, mutator: F) -> RelayResult<Account>
    where
        F: FnOnce(&mut Account),
    {
        let _file_guard = self.file_lock.lock().await;
        let mut accounts = self.read_from_disk().await?;
        let account = accounts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| RelayError::UnknownAccount(id.to_string()))?;
        mutator(account);
        let updated = account.clone();
        self.write_to_disk(&accounts).await?;
        *self.cache.write().await = Some(accounts);
        Ok(updated)
    }

    async fn read_from_disk(&self) -> RelayResult<Vec<Account>> {
        match fs::read(&self.path).await {
            Ok(bytes) => {
                let doc: StoreDocument = serde_json::from_slice(&bytes).map_err(|e| {
                    RelayError::StoreCorrupt(format!("{}: {e}", self.path.display()))
                })?;
                Ok(doc.accounts)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(RelayError::StoreWrite(e.to_string())),
        }
    }

    async fn write_to_disk(&self, accounts: &[Account]) -> RelayResult<()> {
        let doc = StoreDocument {
            accounts: accounts.to_vec(),
        };
        let serialized = serde_json::to_vec_pretty(&doc)
            .map_err(|e| RelayError::StoreWrite(e.to_string()))?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &serialized)
            .await
            .map_err(|e| RelayError::StoreWrite(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            fs::set_permissions(&tmp_path, perms)
                .await
                .map_err(|e| RelayError::StoreWrite(e.to_string()))?;
        }

        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| RelayError::StoreWrite(e.to_string()))?;
        Ok(())
    }
}

/// Convenience wrapper so the store can be shared across scheduler, maintainer,
/// and the chat entry point without each caller threading an `Arc` by hand.
pub type SharedCredentialStore = Arc<CredentialStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample_account(id: &str) -> Account {
        Account {
            id: id.to_string(),
            access_token: Some("tok".to_string()),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(Utc::now()),
            client_id: Some("client".to_string()),
            client_secret: Some("secret".to_string()),
            profile_arn: None,
            identity: None,
            region: "us-east-1".to_string(),
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty_list() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("accounts.json"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_then_list_round_trips() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("accounts.json"));
        store.add(sample_account("aaaa111122223333")).await.unwrap();
        let accounts = store.list().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, "aaaa111122223333");
    }

    #[tokio::test]
    async fn add_rejects_duplicate_id() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("accounts.json"));
        store.add(sample_account("dup")).await.unwrap();
        let err = store.add(sample_account("dup")).await.unwrap_err();
        assert!(matches!(err, RelayError::StoreWrite(_)));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("accounts.json"));
        store.add(sample_account("x")).await.unwrap();
        store.remove("x").await.unwrap();
        store.remove("x").await.unwrap(); // no-op, must not error
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_mutates_and_persists() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("accounts.json"));
        store.add(sample_account("x")).await.unwrap();
        store
            .update("x", |a| a.access_token = Some("new-token".to_string()))
            .await
            .unwrap();
        let accounts = store.list().await.unwrap();
        assert_eq!(accounts[0].access_token.as_deref(), Some("new-token"));
    }

    #[tokio::test]
    async fn update_unknown_account_errors() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("accounts.json"));
        let err = store.update("nope", |_| {}).await.unwrap_err();
        assert!(matches!(err, RelayError::UnknownAccount(_)));
    }

    #[tokio::test]
    async fn reload_from_disk_sees_external_edits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let store = CredentialStore::new(&path);
        store.add(sample_account("x")).await.unwrap();

        // Simulate an external editor appending a second account directly to disk.
        let mut doc: StoreDocument =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        doc.accounts.push(sample_account("y"));
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let reloaded = store.reload_from_disk().await.unwrap();
        assert_eq!(reloaded.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_file_is_fatal_not_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        std::fs::write(&path, b"not json").unwrap();
        let store = CredentialStore::new(path);
        let err = store.list().await.unwrap_err();
        assert!(matches!(err, RelayError::StoreCorrupt(_)));
    }
}
