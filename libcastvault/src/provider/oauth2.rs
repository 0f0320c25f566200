//! Generic OAuth 2.0 `refresh_token` grant client (RFC 6749 section 6)

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use super::{OAuthProvider, TokenGrant};
use crate::config::ProviderConfig;
use crate::error::{ConfigError, RefreshError, Result};

/// Lifetime assumed when a token response omits `expires_in`
const DEFAULT_EXPIRES_IN: i64 = 3600;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

pub struct OAuth2RefreshClient {
    platform: String,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
    http: reqwest::Client,
}

impl OAuth2RefreshClient {
    pub fn new(
        platform: &str,
        token_url: &str,
        client_id: &str,
        client_secret: SecretString,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue(format!("HTTP client for {}: {}", platform, e)))?;

        Ok(Self {
            platform: platform.to_lowercase(),
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
            client_secret,
            http,
        })
    }

    /// Build from config, reading the client secret from its environment variable
    pub fn from_config(platform: &str, config: &ProviderConfig, request_timeout: Duration) -> Result<Self> {
        let secret = std::env::var(&config.client_secret_env)
            .ok()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ConfigError::MissingField(config.client_secret_env.clone()))?;

        Self::new(
            platform,
            &config.token_url,
            &config.client_id,
            SecretString::from(secret),
            request_timeout,
        )
    }
}

#[async_trait]
impl OAuthProvider for OAuth2RefreshClient {
    fn name(&self) -> &str {
        &self.platform
    }

    async fn refresh(&self, refresh_token: &SecretString) -> std::result::Result<TokenGrant, RefreshError> {
        let response = self
            .http
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.expose_secret()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RefreshError::Transient(format!("{} token endpoint timed out", self.platform))
                } else {
                    RefreshError::Transient(format!("{} token endpoint unreachable: {}", self.platform, e))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RefreshError::Transient(format!("failed to read token response: {}", e)))?;

        if !status.is_success() {
            return Err(classify_failure(status, &body));
        }

        parse_grant(&body)
    }
}

/// Map a non-success token endpoint response to a refresh error
///
/// Only 400 and 401 mean the grant itself was refused; rate limits and server
/// errors are retried on a later cycle.
pub(crate) fn classify_failure(status: StatusCode, body: &str) -> RefreshError {
    let detail = serde_json::from_str::<ErrorResponse>(body)
        .map(|e| match e.error_description {
            Some(description) => format!("{}: {}", e.error, description),
            None => e.error,
        })
        .unwrap_or_else(|_| format!("HTTP {}", status.as_u16()));

    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RefreshError::Provider(detail)
        }
        _ => RefreshError::Transient(format!("HTTP {}: {}", status.as_u16(), detail)),
    }
}

pub(crate) fn parse_grant(body: &str) -> std::result::Result<TokenGrant, RefreshError> {
    let parsed: TokenResponse = serde_json::from_str(body)
        .map_err(|e| RefreshError::Provider(format!("malformed token response: {}", e)))?;

    if parsed.access_token.is_empty() {
        return Err(RefreshError::Provider("token response has an empty access_token".to_string()));
    }

    Ok(TokenGrant {
        access_token: SecretString::from(parsed.access_token),
        refresh_token: parsed
            .refresh_token
            .filter(|token| !token.is_empty())
            .map(SecretString::from),
        expires_in: parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
    })
}
