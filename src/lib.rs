// src/lib.rs

//! Core of a reverse-engineered gateway in front of a vendor IDE chat API.
//!
//! This crate owns the southbound half of the gateway: a pool of end-user
//! credentials, the OIDC device-flow machinery that keeps them live, a
//! weighted scheduler that spends the pool's quota evenly, a per-credential
//! circuit breaker, and the binary event-stream engine that drives the
//! actual upstream chat request. Northbound dialect adapters (OpenAI,
//! Claude-messages, vendor-native), the admin HTTP surface, and the embedded
//! UI are not part of this crate — they are expected to call
//! [`chat`](crate::chat) and nothing else.

pub mod relay;

pub use relay::account::{Account, AccountId};
pub use relay::chat::{chat, ChatRequest, Usage};
pub use relay::config::RelayConfig;
pub use relay::error::{RelayError, RelayResult};
