//! Castvault - custody and lifecycle of third-party OAuth credentials
//!
//! This library encrypts OAuth tokens at rest, refreshes them in the
//! background before they expire, escalates accounts that keep failing to a
//! "needs re-authorization" state, and caches per-agent views of which
//! connected accounts are enabled.

pub mod cache;
pub mod cipher;
pub mod config;
pub mod db;
pub mod error;
pub mod leader;
pub mod logging;
pub mod provider;
pub mod scheduler;
pub mod service;
pub mod types;

// Re-export commonly used types
pub use cache::{EnabledAccountsCache, InvalidationEvent, InvalidationReason};
pub use cipher::{EnvelopeCipher, EnvelopeVersion};
pub use config::Config;
pub use db::{CredentialStore, Database, ToggleState};
pub use error::{CastvaultError, Result};
pub use scheduler::{CycleReport, ForceRefreshReport, HealthStatus, RefreshScheduler, TokenHealth};
pub use service::CredentialService;
pub use types::{AccountSummary, CredentialRecord};
