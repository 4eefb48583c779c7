//! Device-authorization login, refresh, and profile/quota discovery
//! (spec.md §4.2).
//!
//! Talks to the vendor's OIDC auth plane and metadata plane. Login is a
//! three-step dance driven by an operator-facing [`LoginSession`]; refresh is
//! a single account-scoped token exchange retried once on transport failure.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::sync::RwLock;

use super::account::{Account, UserIdentity};
use super::error::{RelayError, RelayResult};
use super::http_pool::get_or_create_client;

const MODEL_CATALOG_TTL: Duration = Duration::from_secs(60 * 60);

/// Built-in catalog returned when `ListAvailableModels` is unreachable.
const FALLBACK_MODEL_CATALOG: &[&str] = &["claude-sonnet-4", "claude-haiku-4", "amazon-nova-pro"];

const CLIENT_NAME: &str = "kiro-relay";
const CLIENT_TYPE: &str = "public";
const OIDC_SCOPES: &[&str] = &["codewhisperer:completions", "codewhisperer:analysis"];
const REFRESH_RETRY_PAUSE: Duration = Duration::from_secs(3);

/// Handle to an in-progress device-authorization login, returned to the
/// operator so they can visit `verification_uri` and then drive
/// [`OidcAgent::poll_for_token`] in a loop.
#[derive(Debug, Clone)]
pub struct LoginSession {
    pub region: String,
    pub client_id: String,
    pub client_secret: String,
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub polling_interval: Duration,
    pub expires_at: DateTime<Utc>,
    start_url: String,
}

/// Outcome of one [`OidcAgent::poll_for_token`] call.
pub enum PollOutcome {
    /// `authorization_pending` or `slow_down`; keep polling.
    Pending,
    /// Device code expired or the operator denied the request.
    Terminal(String),
    /// Tokens issued; account has been appended to the store by the caller.
    Success(Account),
}

#[derive(Serialize)]
struct RegisterClientRequest<'a> {
    #[serde(rename = "clientName")]
    client_name: &'a str,
    #[serde(rename = "clientType")]
    client_type: &'a str,
    scopes: &'a [&'a str],
}

#[derive(Deserialize)]
struct RegisterClientResponse {
    #[serde(rename = "clientId")]
    client_id: String,
    #[serde(rename = "clientSecret")]
    client_secret: String,
}

#[derive(Serialize)]
struct DeviceAuthorizationRequest<'a> {
    #[serde(rename = "clientId")]
    client_id: &'a str,
    #[serde(rename = "clientSecret")]
    client_secret: &'a str,
    #[serde(rename = "startUrl")]
    start_url: &'a str,
}

#[derive(Deserialize)]
struct DeviceAuthorizationResponse {
    #[serde(rename = "deviceCode")]
    device_code: String,
    #[serde(rename = "userCode")]
    user_code: String,
    #[serde(rename = "verificationUri")]
    verification_uri: String,
    #[serde(rename = "verificationUriComplete")]
    verification_uri_complete: String,
    #[serde(rename = "expiresIn")]
    expires_in: i64,
    #[serde(rename = "interval")]
    interval: Option<u64>,
}

#[derive(Serialize)]
#[serde(tag = "grantType")]
enum TokenRequest<'a> {
    #[serde(rename = "urn:ietf:params:oauth:grant-type:device_code")]
    Device {
        #[serde(rename = "clientId")]
        client_id: &'a str,
        #[serde(rename = "clientSecret")]
        client_secret: &'a str,
        #[serde(rename = "deviceCode")]
        device_code: &'a str,
    },
    #[serde(rename = "refresh_token")]
    Refresh {
        #[serde(rename = "clientId")]
        client_id: &'a str,
        #[serde(rename = "clientSecret")]
        client_secret: &'a str,
        #[serde(rename = "refreshToken")]
        refresh_token: &'a str,
    },
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken")]
    refresh_token: String,
    #[serde(rename = "expiresIn")]
    expires_in: i64,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
}

#[derive(Deserialize)]
struct ListProfilesResponse {
    profiles: Vec<ProfileEntry>,
}

#[derive(Deserialize)]
struct ProfileEntry {
    arn: String,
}

#[derive(Deserialize)]
struct UsageLimitsResponse {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    email: Option<String>,
    #[serde(default)]
    usage: Vec<UsageBreakdownEntry>,
}

#[derive(Deserialize)]
struct UsageBreakdownEntry {
    #[serde(rename = "resourceType")]
    resource_type: String,
    #[serde(rename = "currentUsage")]
    current_usage: f64,
    #[serde(rename = "usageLimit")]
    usage_limit: f64,
}

/// Result of a successful quota refresh, ready to feed into the credit cache.
pub struct QuotaReading {
    pub used: f64,
    pub total: f64,
}

#[derive(Deserialize)]
struct ListModelsResponse {
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    #[serde(rename = "modelId")]
    model_id: String,
}

struct ModelCatalogCache {
    models: Vec<String>,
    fetched_at: Instant,
}

/// Device-flow login, token refresh, and profile/quota discovery against one region.
pub struct OidcAgent {
    region: String,
    model_catalog: RwLock<Option<ModelCatalogCache>>,
    /// Overrides the auth-plane base URL; only ever set by tests so they can
    /// point the agent at a local `wiremock` server instead of the real
    /// vendor host.
    auth_plane_override: Option<String>,
}

impl OidcAgent {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            model_catalog: RwLock::new(None),
            auth_plane_override: None,
        }
    }

    #[cfg(test)]
    fn with_auth_plane_override(region: impl Into<String>, base: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            model_catalog: RwLock::new(None),
            auth_plane_override: Some(base.into()),
        }
    }

    fn auth_plane_url(&self, path: &str) -> String {
        match &self.auth_plane_override {
            Some(base) => format!("{base}{path}"),
            None => format!("https://oidc.{}.amazonaws.com{path}", self.region),
        }
    }

    fn data_plane_url(&self, path: &str) -> String {
        format!("https://q.{}.amazonaws.com{path}", self.region)
    }

    fn metadata_plane_url(&self, path: &str) -> String {
        format!("https://codewhisperer.{}.amazonaws.com{path}", self.region)
    }

    /// Step 1 + 2: register a client and request device authorization for
    /// `start_url`, returning the [`LoginSession`] the operator drives.
    pub async fn begin_login(&self, start_url: &str) -> RelayResult<LoginSession> {
        let base = self.auth_plane_url("");
        let client = get_or_create_client(&base);

        let register: RegisterClientResponse = client
            .post(self.auth_plane_url("/client/register"))
            .json(&RegisterClientRequest {
                client_name: CLIENT_NAME,
                client_type: CLIENT_TYPE,
                scopes: OIDC_SCOPES,
            })
            .send()
            .await?
            .json()
            .await?;

        let device: DeviceAuthorizationResponse = client
            .post(self.auth_plane_url("/device_authorization"))
            .json(&DeviceAuthorizationRequest {
                client_id: &register.client_id,
                client_secret: &register.client_secret,
                start_url,
            })
            .send()
            .await?
            .json()
            .await?;

        Ok(LoginSession {
            region: self.region.clone(),
            client_id: register.client_id,
            client_secret: register.client_secret,
            device_code: device.device_code,
            user_code: device.user_code,
            verification_uri: device.verification_uri,
            verification_uri_complete: device.verification_uri_complete,
            polling_interval: Duration::from_secs(device.interval.unwrap_or(5)),
            expires_at: Utc::now() + chrono::Duration::seconds(device.expires_in),
            start_url: start_url.trim().to_string(),
        })
    }

    /// Step 3: one poll iteration. The operator is expected to sleep
    /// `session.polling_interval` between calls while this returns
    /// [`PollOutcome::Pending`].
    pub async fn poll_for_token(&self, session: &LoginSession) -> RelayResult<PollOutcome> {
        let client = get_or_create_client(&self.auth_plane_url(""));
        let response = client
            .post(self.auth_plane_url("/token"))
            .json(&TokenRequest::Device {
                client_id: &session.client_id,
                client_secret: &session.client_secret,
                device_code: &session.device_code,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or_default();
            return Ok(match error.as_str() {
                "authorization_pending" | "slow_down" => PollOutcome::Pending,
                "expired_token" | "access_denied" => PollOutcome::Terminal(error),
                _ => {
                    return Err(RelayError::UpstreamHttp {
                        status: status.as_u16(),
                        body,
                    })
                }
            });
        }

        let tokens: TokenResponse = response.json().await?;
        let account = self.finalize_login(session, tokens).await?;
        Ok(PollOutcome::Success(account))
    }

    async fn finalize_login(
        &self,
        session: &LoginSession,
        tokens: TokenResponse,
    ) -> RelayResult<Account> {
        let id = account_id_for_start_url(&session.start_url);
        let expires_at = Utc::now() + chrono::Duration::seconds(tokens.expires_in);

        let profile_arn = self
            .list_available_profiles(&tokens.access_token)
            .await
            .ok();
        let identity_and_usage = self
            .get_usage_limits(&tokens.access_token, profile_arn.as_deref())
            .await
            .ok();

        Ok(Account {
            id,
            access_token: Some(tokens.access_token),
            refresh_token: Some(tokens.refresh_token),
            expires_at: Some(expires_at),
            client_id: Some(session.client_id.clone()),
            client_secret: Some(session.client_secret.clone()),
            profile_arn,
            identity: identity_and_usage.map(|(identity, _)| identity),
            region: self.region.clone(),
            created_at: Utc::now(),
            last_used_at: None,
        })
    }

    /// Exchange `account`'s refresh token for a fresh access/refresh token
    /// pair. Retries once after a 3-second pause on transport failure
    /// (spec.md §4.2, Scenario F); a non-2xx HTTP response is reported
    /// immediately without retry since it indicates a dead credential, not a
    /// transient network blip.
    pub async fn refresh(&self, account: &Account) -> RelayResult<(String, String, DateTime<Utc>)> {
        let (client_id, client_secret, refresh_token) = match (
            &account.client_id,
            &account.client_secret,
            &account.refresh_token,
        ) {
            (Some(id), Some(secret), Some(refresh)) => (id, secret, refresh),
            _ => {
                return Err(RelayError::OidcTerminal(
                    "account has no refresh credentials".to_string(),
                ))
            }
        };

        match self.do_refresh(client_id, client_secret, refresh_token).await {
            Ok(result) => Ok(result),
            Err(RelayError::Transport(_)) => {
                tokio::time::sleep(REFRESH_RETRY_PAUSE).await;
                self.do_refresh(client_id, client_secret, refresh_token).await
            }
            Err(other) => Err(other),
        }
    }

    async fn do_refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> RelayResult<(String, String, DateTime<Utc>)> {
        let client = get_or_create_client(&self.auth_plane_url(""));
        let response = client
            .post(self.auth_plane_url("/token"))
            .json(&TokenRequest::Refresh {
                client_id,
                client_secret,
                refresh_token,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::UpstreamHttp {
                status: status.as_u16(),
                body,
            });
        }

        let tokens: TokenResponse = response.json().await?;
        let expires_at = Utc::now() + chrono::Duration::seconds(tokens.expires_in);
        Ok((tokens.access_token, tokens.refresh_token, expires_at))
    }

    /// `ListAvailableProfiles` — first profile's ARN wins.
    pub async fn list_available_profiles(&self, access_token: &str) -> RelayResult<String> {
        let client = get_or_create_client(&self.metadata_plane_url(""));
        let response = client
            .post(self.metadata_plane_url("/ListAvailableProfiles"))
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RelayError::UpstreamHttp {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let parsed: ListProfilesResponse = response.json().await?;
        parsed
            .profiles
            .into_iter()
            .next()
            .map(|p| p.arn)
            .ok_or_else(|| RelayError::OidcTerminal("no profiles available".to_string()))
    }

    /// `GetUsageLimits` — resolves identity plus the `CREDIT` resource
    /// breakdown the maintainer feeds into the credit cache.
    pub async fn get_usage_limits(
        &self,
        access_token: &str,
        profile_arn: Option<&str>,
    ) -> RelayResult<(UserIdentity, Option<QuotaReading>)> {
        let client = get_or_create_client(&self.data_plane_url(""));
        let mut request = client
            .get(self.data_plane_url("/getUsageLimits"))
            .bearer_auth(access_token)
            .query(&[("origin", "AI_EDITOR"), ("isEmailRequired", "true")]);
        if let Some(arn) = profile_arn {
            request = request.query(&[("profileArn", arn)]);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RelayError::UpstreamHttp {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let parsed: UsageLimitsResponse = response.json().await?;
        let identity = UserIdentity {
            user_id: parsed.user_id.unwrap_or_default(),
            email: parsed.email,
        };
        let credit = parsed
            .usage
            .into_iter()
            .find(|entry| entry.resource_type == "CREDIT")
            .map(|entry| QuotaReading {
                used: entry.current_usage,
                total: entry.usage_limit,
            });
        Ok((identity, credit))
    }

    /// `ListAvailableModels`, cached for an hour; falls back to a built-in
    /// static catalog if the call fails rather than surfacing an error, since
    /// model discovery is advisory and should never block `Chat`.
    pub async fn list_available_models(&self, access_token: &str) -> Vec<String> {
        if let Some(cache) = self.model_catalog.read().await.as_ref() {
            if cache.fetched_at.elapsed() < MODEL_CATALOG_TTL {
                return cache.models.clone();
            }
        }

        match self.fetch_available_models(access_token).await {
            Ok(models) => {
                *self.model_catalog.write().await = Some(ModelCatalogCache {
                    models: models.clone(),
                    fetched_at: Instant::now(),
                });
                models
            }
            Err(_) => FALLBACK_MODEL_CATALOG
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    async fn fetch_available_models(&self, access_token: &str) -> RelayResult<Vec<String>> {
        let client = get_or_create_client(&self.data_plane_url(""));
        let response = client
            .post(self.data_plane_url("/ListAvailableModels"))
            .bearer_auth(access_token)
            .query(&[("origin", "AI_EDITOR")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RelayError::UpstreamHttp {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let parsed: ListModelsResponse = response.json().await?;
        Ok(parsed.models.into_iter().map(|m| m.model_id).collect())
    }
}

/// SHA-1 of `{"startUrl":"<trimmed>"}`, matching the vendor IDE's own
/// account-id derivation so human operators share the same store.
fn account_id_for_start_url(start_url: &str) -> String {
    let literal = format!(r#"{{"startUrl":"{}"}}"#, start_url.trim());
    let digest = Sha1::digest(literal.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_id_is_deterministic_and_hex16() {
        let a = account_id_for_start_url("https://example.awsapps.com/start");
        let b = account_id_for_start_url("  https://example.awsapps.com/start  ");
        assert_eq!(a, b, "leading/trailing whitespace must be trimmed first");
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_start_urls_hash_differently() {
        let a = account_id_for_start_url("https://a.awsapps.com/start");
        let b = account_id_for_start_url("https://b.awsapps.com/start");
        assert_ne!(a, b);
    }

    #[test]
    fn region_scoped_hosts() {
        let agent = OidcAgent::new("eu-west-1");
        assert_eq!(
            agent.auth_plane_url("/token"),
            "https://oidc.eu-west-1.amazonaws.com/token"
        );
        assert_eq!(
            agent.data_plane_url("/getUsageLimits"),
            "https://q.eu-west-1.amazonaws.com/getUsageLimits"
        );
        assert_eq!(
            agent.metadata_plane_url("/ListAvailableProfiles"),
            "https://codewhisperer.eu-west-1.amazonaws.com/ListAvailableProfiles"
        );
    }

    #[tokio::test]
    async fn do_refresh_succeeds_against_mock_token_endpoint() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessToken": "new-access",
                "refreshToken": "new-refresh",
                "expiresIn": 3600,
            })))
            .mount(&mock_server)
            .await;

        let agent = OidcAgent::with_auth_plane_override("us-east-1", mock_server.uri());
        let (access, refresh, _expires_at) =
            agent.do_refresh("client", "secret", "old-refresh").await.unwrap();
        assert_eq!(access, "new-access");
        assert_eq!(refresh, "new-refresh");
    }

    // Scenario F (spec.md §8): a failed refresh is retried once after a
    // 3-second pause, and a subsequent success is returned to the caller.
    // wiremock mocks HTTP responses, not raw connection resets, so the
    // transport-failure leg is driven by a bare TCP listener that drops the
    // first connection outright (a real transport error) and answers the
    // second with a valid token response.
    #[tokio::test]
    async fn refresh_retries_once_after_transport_failure_then_succeeds() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            // First connection: accept, then drop without reading, so the
            // kernel resets it under the client.
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);

            // Second connection: answer with a valid token response.
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let body = serde_json::json!({
                "accessToken": "new-access",
                "refreshToken": "new-refresh",
                "expiresIn": 3600,
            })
            .to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });

        let agent = OidcAgent::with_auth_plane_override("us-east-1", format!("http://{addr}"));
        let account = Account {
            id: "a".to_string(),
            access_token: Some("tok".to_string()),
            refresh_token: Some("old-refresh".to_string()),
            expires_at: None,
            client_id: Some("client".to_string()),
            client_secret: Some("secret".to_string()),
            profile_arn: None,
            identity: None,
            region: "us-east-1".to_string(),
            created_at: Utc::now(),
            last_used_at: None,
        };

        let started = Instant::now();
        let (access, refresh, _expires_at) = agent.refresh(&account).await.unwrap();
        assert_eq!(access, "new-access");
        assert_eq!(refresh, "new-refresh");
        assert!(
            started.elapsed() >= REFRESH_RETRY_PAUSE,
            "must wait out the retry pause before the retry succeeds"
        );
    }
}
