// src/relay/mod.rs

pub mod account;
pub mod chat;
pub mod config;
pub mod credential_store;
pub mod credit_cache;
pub mod error;
pub mod health_tracker;
pub mod http_pool;
pub mod maintainer;
pub mod oidc_agent;
pub mod scheduler;
pub mod stream;

pub use account::{Account, AccountId};
pub use credential_store::CredentialStore;
pub use credit_cache::CreditCache;
pub use health_tracker::HealthTracker;
pub use scheduler::Scheduler;
