//! Diagnostic health buckets for stored tokens

use serde::{Deserialize, Serialize};

use crate::types::CredentialRecord;

/// Minutes-until-expiry at or below which a token counts as expiring soon
const EXPIRING_SOON_MINUTES: i64 = 5;
/// Upper bound of the refresh window bucket
const REFRESH_WINDOW_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    NeedsReauth,
    Expired,
    ExpiringSoon,
    RefreshWindow,
    Healthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NeedsReauth => "needs_reauth",
            Self::Expired => "expired",
            Self::ExpiringSoon => "expiring_soon",
            Self::RefreshWindow => "refresh_window",
            Self::Healthy => "healthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Bucket a token by whole minutes until expiry (rounded down)
///
/// `needs_reauth` wins over any expiry.
pub fn classify_health(needs_reauth: bool, expires_at: i64, now: i64) -> (HealthStatus, i64) {
    let minutes = (expires_at - now).div_euclid(60);

    let status = if needs_reauth {
        HealthStatus::NeedsReauth
    } else if minutes <= 0 {
        HealthStatus::Expired
    } else if minutes <= EXPIRING_SOON_MINUTES {
        HealthStatus::ExpiringSoon
    } else if minutes <= REFRESH_WINDOW_MINUTES {
        HealthStatus::RefreshWindow
    } else {
        HealthStatus::Healthy
    };

    (status, minutes)
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenHealth {
    pub account_id: String,
    pub platform: String,
    pub display_name: String,
    pub status: HealthStatus,
    pub minutes_until_expiry: i64,
    pub failure_count: i64,
    pub last_refresh_at: Option<i64>,
    pub last_error: Option<String>,
}

impl TokenHealth {
    pub fn of(record: &CredentialRecord, now: i64) -> Self {
        let (status, minutes_until_expiry) =
            classify_health(record.needs_reauth, record.token_expires_at, now);

        Self {
            account_id: record.id.clone(),
            platform: record.platform.clone(),
            display_name: record.display_name.clone(),
            status,
            minutes_until_expiry,
            failure_count: record.refresh_failure_count,
            last_refresh_at: record.last_refresh_at,
            last_error: record.last_error.clone(),
        }
    }
}
