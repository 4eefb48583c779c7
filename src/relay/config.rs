//! Configuration for the relay core.
//!
//! Provides the [`RelayConfig`] struct for configuring the Credential Store
//! path, the vendor region, the maintainer tick period, and the Health
//! Tracker / Credit Cache defaults. Users construct this manually — no TOML,
//! YAML, or other config-file parsing dependency is introduced.
//!
//! # Example
//!
//! ```rust
//! use kiro_relay::RelayConfig;
//!
//! // Defaults match the vendor's own `us-east-1` region and 5 minute tick.
//! let config = RelayConfig::default();
//!
//! // Or override individual fields.
//! let config = RelayConfig {
//!     region: "eu-central-1".to_string(),
//!     ..RelayConfig::default()
//! };
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Global configuration for the relay core.
///
/// This struct is intentionally minimal and users construct it however they
/// want. No file-format parsing dependencies are introduced.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Vendor region. Used to build `q.<region>.amazonaws.com`,
    /// `oidc.<region>.amazonaws.com`, and `codewhisperer.<region>.amazonaws.com`.
    pub region: String,
    /// Path to the single JSON document backing the [`CredentialStore`](crate::relay::CredentialStore).
    pub store_path: PathBuf,
    /// How often the background maintainer wakes up to refresh tokens and
    /// credit caches.
    pub maintainer_period: Duration,
    /// Circuit breaker configuration shared by every account's breaker.
    pub breaker: BreakerConfig,
    /// How long a cached credit-usage reading is considered fresh.
    pub credit_cache_ttl: Duration,
    /// Window inside which the maintainer pre-emptively refreshes a token
    /// before it expires.
    pub refresh_window: Duration,
}

impl Default for RelayConfig {
    /// Defaults: `us-east-1`, `./kiro-accounts.json`, a 5 minute maintainer
    /// tick, the Health Tracker defaults from §4.3, and a 10 minute credit
    /// cache staleness bound.
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            store_path: PathBuf::from("kiro-accounts.json"),
            maintainer_period: Duration::from_secs(5 * 60),
            breaker: BreakerConfig::default(),
            credit_cache_ttl: Duration::from_secs(10 * 60),
            refresh_window: Duration::from_secs(60 * 60),
        }
    }
}

/// Per-breaker configuration (spec.md §4.3 defaults).
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures (within `failure_window`) before tripping Open.
    pub failure_threshold: u32,
    /// Window inside which failures accumulate toward `failure_threshold`.
    pub failure_window: Duration,
    /// How long a breaker stays Open before admitting a HalfOpen probe.
    pub open_duration: Duration,
    /// Consecutive HalfOpen successes required to close the breaker.
    pub half_open_max_success: u32,
    /// Minimum sample size before `TryAutoTrip` will consider an error rate.
    pub error_rate_min_reqs: u64,
    /// Error rate (0.0..=1.0) at or above which `TryAutoTrip` trips the breaker.
    pub error_rate_threshold: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(5 * 60),
            open_duration: Duration::from_secs(5 * 60),
            half_open_max_success: 2,
            error_rate_min_reqs: 20,
            error_rate_threshold: 0.5,
        }
    }
}
