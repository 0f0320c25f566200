//! Mock OAuth provider for testing
//!
//! Scripted responses are consumed in order; once the script runs out the
//! fallback response repeats. Every call is counted and the refresh tokens it
//! received are recorded so tests can assert what the scheduler sent.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{OAuthProvider, TokenGrant};
use crate::error::RefreshError;

/// One scripted provider answer
#[derive(Debug, Clone)]
pub enum MockResponse {
    Grant {
        access_token: String,
        refresh_token: Option<String>,
        expires_in: i64,
    },
    Fail(RefreshError),
}

impl MockResponse {
    pub fn grant(access_token: &str, expires_in: i64) -> Self {
        Self::Grant {
            access_token: access_token.to_string(),
            refresh_token: None,
            expires_in,
        }
    }

    pub fn rotated(access_token: &str, refresh_token: &str, expires_in: i64) -> Self {
        Self::Grant {
            access_token: access_token.to_string(),
            refresh_token: Some(refresh_token.to_string()),
            expires_in,
        }
    }

    pub fn provider_error(message: &str) -> Self {
        Self::Fail(RefreshError::Provider(message.to_string()))
    }

    pub fn transient_error(message: &str) -> Self {
        Self::Fail(RefreshError::Transient(message.to_string()))
    }
}

#[derive(Clone)]
pub struct MockProvider {
    name: String,
    script: Arc<Mutex<VecDeque<MockResponse>>>,
    fallback: MockResponse,
    delay: Duration,
    call_count: Arc<Mutex<usize>>,
    seen_refresh_tokens: Arc<Mutex<Vec<String>>>,
}

impl MockProvider {
    pub fn new(name: &str, fallback: MockResponse) -> Self {
        Self {
            name: name.to_string(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback,
            delay: Duration::from_millis(0),
            call_count: Arc::new(Mutex::new(0)),
            seen_refresh_tokens: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always grants a one-hour token
    pub fn success(name: &str) -> Self {
        Self::new(name, MockResponse::grant("mock-access-token", 3600))
    }

    /// Always rejects the grant
    pub fn provider_failure(name: &str, error: &str) -> Self {
        Self::new(name, MockResponse::provider_error(error))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue a response ahead of the fallback
    pub fn push(&self, response: MockResponse) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    pub fn seen_refresh_tokens(&self) -> Vec<String> {
        self.seen_refresh_tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl OAuthProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenGrant, RefreshError> {
        let response = {
            *self.call_count.lock().unwrap() += 1;
            self.seen_refresh_tokens
                .lock()
                .unwrap()
                .push(refresh_token.expose_secret().to_string());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match response {
            MockResponse::Grant {
                access_token,
                refresh_token,
                expires_in,
            } => Ok(TokenGrant {
                access_token: SecretString::from(access_token),
                refresh_token: refresh_token.map(SecretString::from),
                expires_in,
            }),
            MockResponse::Fail(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_fallback() {
        let provider = MockProvider::success("youtube");
        provider.push(MockResponse::transient_error("connection reset"));

        let token = SecretString::from("1//refresh".to_string());
        assert!(matches!(
            provider.refresh(&token).await,
            Err(RefreshError::Transient(_))
        ));

        let grant = provider.refresh(&token).await.unwrap();
        assert_eq!(grant.access_token.expose_secret(), "mock-access-token");
        assert_eq!(provider.call_count(), 2);
        assert_eq!(provider.seen_refresh_tokens(), vec!["1//refresh", "1//refresh"]);
    }
}
