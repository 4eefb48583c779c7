//! Account identity and mutable authentication state (spec.md §3 "Account").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 16-hex-digit account identifier derived from a session hash.
///
/// Unique within the [`CredentialStore`](crate::relay::CredentialStore).
pub type AccountId = String;

/// User identity discovered from `GetUsageLimits` once a credential is live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    pub email: Option<String>,
}

/// A single pooled credential.
///
/// Invariants (spec.md §3):
/// - `id` is unique within the store.
/// - if `refresh_token` is `Some`, `client_id`/`client_secret` must also be `Some`.
/// - `expires_at` is an absolute instant, never a duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// 16-hex-digit identity, stable for the account's lifetime.
    pub id: AccountId,
    /// Current bearer access token, if one has ever been issued.
    pub access_token: Option<String>,
    /// Refresh token used to mint new access tokens. Present only alongside
    /// `client_id`/`client_secret`.
    pub refresh_token: Option<String>,
    /// Absolute instant the current `access_token` expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// OIDC client id registered for this account, used to refresh.
    pub client_id: Option<String>,
    /// OIDC client secret registered for this account, used to refresh.
    pub client_secret: Option<String>,
    /// Opaque vendor ARN required alongside the access token to query quota.
    pub profile_arn: Option<String>,
    /// User identity discovered via `GetUsageLimits`.
    pub identity: Option<UserIdentity>,
    /// Vendor region this account authenticates against.
    pub region: String,
    /// When this account was first added to the store.
    pub created_at: DateTime<Utc>,
    /// When this account was last selected by the scheduler.
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Account {
    /// True once the account carries an access token that has not expired.
    ///
    /// An account with no recorded expiry is treated as expired — the
    /// scheduler's eligibility filter (spec.md §4.4) requires "token present
    /// and not expired," and a token with unknown expiry cannot be trusted.
    pub fn has_valid_token(&self, now: DateTime<Utc>) -> bool {
        match (&self.access_token, self.expires_at) {
            (Some(_), Some(expiry)) => expiry > now,
            _ => false,
        }
    }

    /// Host for the vendor's data plane (`generateAssistantResponse`, usage limits).
    pub fn data_plane_host(&self) -> String {
        format!("q.{}.amazonaws.com", self.region)
    }

    /// Host for the vendor's OIDC auth plane (register / device / token).
    pub fn auth_plane_host(&self) -> String {
        format!("oidc.{}.amazonaws.com", self.region)
    }

    /// Host for the vendor's metadata plane (`ListAvailableProfiles`).
    pub fn metadata_plane_host(&self) -> String {
        format!("codewhisperer.{}.amazonaws.com", self.region)
    }
}
