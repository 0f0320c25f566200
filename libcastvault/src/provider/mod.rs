//! OAuth providers that exchange a refresh token for a new access token
//!
//! The refresh scheduler talks to providers only through [`OAuthProvider`].
//! Platform-specific authorization flows live outside this crate; the only
//! operation needed here is the `refresh_token` grant.

use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::RefreshError;

pub mod oauth2;

// Mock provider is available for all builds (not just tests) to support integration tests
pub mod mock;

pub use oauth2::OAuth2RefreshClient;

/// Tokens returned by a successful refresh
pub struct TokenGrant {
    pub access_token: SecretString,
    /// Present only when the provider rotated the refresh token
    pub refresh_token: Option<SecretString>,
    /// Lifetime of the new access token in seconds
    pub expires_in: i64,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Platform name this provider serves
    fn name(&self) -> &str;

    /// Exchange a refresh token for a new grant
    ///
    /// Fails with `RefreshError::Provider` when the grant is rejected and
    /// `RefreshError::Transient` for network, timeout or server errors.
    async fn refresh(&self, refresh_token: &SecretString) -> std::result::Result<TokenGrant, RefreshError>;
}

/// Providers keyed by platform name
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn OAuthProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an OAuth 2.0 client for every configured platform
    pub fn from_config(
        providers: &HashMap<String, ProviderConfig>,
        request_timeout: Duration,
    ) -> crate::error::Result<Self> {
        let mut registry = Self::new();
        for (platform, config) in providers {
            let client = OAuth2RefreshClient::from_config(platform, config, request_timeout)?;
            registry.register(Arc::new(client));
        }
        Ok(registry)
    }

    /// Register a provider under its own name, replacing any previous one
    pub fn register(&mut self, provider: Arc<dyn OAuthProvider>) {
        self.providers.insert(provider.name().to_lowercase(), provider);
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn OAuthProvider>> {
        self.providers.get(&platform.to_lowercase()).cloned()
    }

    pub fn platforms(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
