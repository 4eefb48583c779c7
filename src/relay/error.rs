//! Error taxonomy for the relay core.
//!
//! Mirrors the table in spec.md §7: every fallible operation in this crate
//! returns one of these variants, and each carries enough context for a
//! caller to decide whether to retry across a different account.
//!
//! Following the teacher crate's own convention (see
//! `resource_protocol::ResourceError` in the corpus this crate grew from),
//! this is a hand-rolled `Display` + `std::error::Error` enum rather than a
//! `thiserror`-derived one — no new error-derive dependency is introduced.

use std::fmt;

/// Crate-wide result alias.
pub type RelayResult<T> = Result<T, RelayError>;

/// Every error the relay core can surface.
#[derive(Debug)]
pub enum RelayError {
    /// The caller's context was cancelled or its deadline elapsed.
    Cancelled,
    /// The scheduler found no account passing the eligibility filter.
    NoAvailableAccounts,
    /// An OIDC device-authorization poll is still pending
    /// (`authorization_pending` or `slow_down`). Not a terminal error —
    /// callers should keep polling.
    OidcPending,
    /// The device code expired or the operator denied the request.
    OidcTerminal(String),
    /// The upstream HTTP response was a non-2xx status.
    UpstreamHttp { status: u16, body: String },
    /// The event stream itself carried a `:message-type == error` frame
    /// (as distinct from a non-2xx HTTP status on the initial response).
    /// Classified the same way as `UpstreamHttp` — the vendor can report
    /// the same transient/client-caused conditions through either channel.
    UpstreamStream { message: String },
    /// A network-level transport failure talking to the vendor.
    Transport(String),
    /// Prelude or message CRC did not match the computed checksum.
    FrameCrcMismatch,
    /// The frame prelude or header section was truncated or malformed.
    FrameMalformed(String),
    /// The account id requested does not exist in the Credential Store.
    UnknownAccount(String),
    /// A Credential Store disk write failed.
    StoreWrite(String),
    /// The on-disk document failed to parse as the expected schema.
    StoreCorrupt(String),
    /// A tool-use input buffer could not be parsed or repaired.
    ToolInputUnrecoverable { tool_use_id: String },
}

impl RelayError {
    /// Classification from spec.md §4.3 / §7: does this outcome count
    /// against the account's circuit breaker?
    ///
    /// `Cancelled`, OIDC transients, and decode-local errors that don't
    /// implicate the credential are non-breaking; everything that reflects
    /// a bad upstream response for this account breaks the breaker.
    pub fn breaks_breaker(&self) -> bool {
        match self {
            RelayError::Cancelled => false,
            RelayError::NoAvailableAccounts => false,
            RelayError::OidcPending => false,
            RelayError::OidcTerminal(_) => false,
            RelayError::UpstreamHttp { status, body } => !is_non_breaking_upstream(*status, body),
            RelayError::UpstreamStream { message } => !is_non_breaking_message(message),
            RelayError::Transport(_) => true,
            RelayError::FrameCrcMismatch => true,
            RelayError::FrameMalformed(_) => true,
            RelayError::UnknownAccount(_) => false,
            RelayError::StoreWrite(_) => false,
            RelayError::StoreCorrupt(_) => false,
            RelayError::ToolInputUnrecoverable { .. } => false,
        }
    }
}

/// Vendor messages that are transient/client-caused rather than credential
/// failures (spec.md §4.3's "Error classification" list). Applies whether
/// the message arrived as an HTTP body or as an in-stream error frame —
/// the vendor can report the same condition through either channel.
fn is_non_breaking_message(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("model temporarily unavailable")
        || lower.contains("insufficient capacity")
        || lower.contains("service temporarily unavailable")
        || lower.contains("unexpected error")
        || lower.contains("input is too long")
        || lower.contains("invalid model")
        || lower.contains("malformed")
}

fn is_non_breaking_upstream(status: u16, body: &str) -> bool {
    status == 502 || is_non_breaking_message(body)
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Cancelled => write!(f, "request cancelled"),
            RelayError::NoAvailableAccounts => write!(f, "no available accounts"),
            RelayError::OidcPending => write!(f, "device authorization still pending"),
            RelayError::OidcTerminal(msg) => write!(f, "device authorization failed: {msg}"),
            RelayError::UpstreamHttp { status, body } => {
                write!(f, "upstream returned HTTP {status}: {body}")
            }
            RelayError::UpstreamStream { message } => {
                write!(f, "upstream event stream reported an error: {message}")
            }
            RelayError::Transport(msg) => write!(f, "transport error: {msg}"),
            RelayError::FrameCrcMismatch => write!(f, "event-stream frame CRC mismatch"),
            RelayError::FrameMalformed(msg) => write!(f, "malformed event-stream frame: {msg}"),
            RelayError::UnknownAccount(id) => write!(f, "unknown account: {id}"),
            RelayError::StoreWrite(msg) => write!(f, "credential store write failed: {msg}"),
            RelayError::StoreCorrupt(msg) => write!(f, "credential store is corrupt: {msg}"),
            RelayError::ToolInputUnrecoverable { tool_use_id } => {
                write!(f, "tool input for {tool_use_id} was truncated and could not be repaired")
            }
        }
    }
}

impl std::error::Error for RelayError {}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}
