//! Core types for Castvault

use serde::{Deserialize, Serialize};

/// One connected external account (a YouTube channel, a TikTok account, ...)
///
/// Token fields hold envelopes produced by [`crate::cipher::EnvelopeCipher`],
/// never plaintext. `Debug` redacts them anyway.
#[derive(Clone, sqlx::FromRow)]
pub struct CredentialRecord {
    /// Account or channel identifier on the platform
    pub id: String,
    pub user_id: String,
    /// Lowercase platform name ("youtube", "tiktok", "twitter", ...)
    pub platform: String,
    pub display_name: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds
    pub token_expires_at: i64,
    pub needs_reauth: bool,
    pub refresh_failure_count: i64,
    pub last_refresh_at: Option<i64>,
    pub last_error: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("platform", &self.platform)
            .field("display_name", &self.display_name)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("token_expires_at", &self.token_expires_at)
            .field("needs_reauth", &self.needs_reauth)
            .field("refresh_failure_count", &self.refresh_failure_count)
            .field("last_refresh_at", &self.last_refresh_at)
            .field("last_error", &self.last_error)
            .field("is_active", &self.is_active)
            .finish()
    }
}

impl CredentialRecord {
    /// Seconds until the access token expires (negative once expired)
    pub fn seconds_until_expiry(&self, now: i64) -> i64 {
        self.token_expires_at - now
    }

    pub fn summary(&self) -> AccountSummary {
        AccountSummary {
            account_id: self.id.clone(),
            platform: self.platform.clone(),
            display_name: self.display_name.clone(),
            needs_reauth: self.needs_reauth,
        }
    }
}

/// Tokens produced by a completed OAuth exchange, already encrypted
#[derive(Clone)]
pub struct NewConnection {
    pub id: String,
    pub user_id: String,
    pub platform: String,
    pub display_name: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_at: i64,
}

/// What a cached enabled-accounts view holds per account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountSummary {
    pub account_id: String,
    pub platform: String,
    pub display_name: String,
    pub needs_reauth: bool,
}

/// Envelope pair of one record, as read for migration
#[derive(Clone, sqlx::FromRow)]
pub struct TokenEnvelopes {
    pub id: String,
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
}
