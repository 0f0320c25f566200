//! Cached "enabled accounts per agent" views with explicit invalidation
//!
//! Entries are a disposable projection of the credential store and the
//! per-agent toggle table. They expire after a TTL and are deleted outright
//! when an account is connected, disconnected or toggled, so the next reader
//! recomputes. Every invalidation is also published on
//! [`INVALIDATION_CHANNEL`] so other subscribers (websocket push, peer
//! processes sharing the backend) can react.
//!
//! The cache is an optimization only. Backend failures are logged and the
//! view is computed directly from the store; they never reach the caller.
//!
//! # Keys
//!
//! `enabled_accounts:{user}:{agent}` for an agent view and
//! `enabled_accounts:{user}:*` for the aggregate of all connected accounts.
//! `%`, `:` and `*` in identifiers are percent-escaped so a user-level prefix
//! delete can never match another user's entries.
//!
//! # Generations
//!
//! Each user has an invalidation generation in the backend. Invalidation
//! bumps it before deleting, and a recomputed view is only stored if the
//! generation it was computed under is still current. A read that raced an
//! invalidation returns its result but never caches it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::db::{CredentialStore, ToggleState};
use crate::error::{CacheError, Result};
use crate::types::AccountSummary;

pub const INVALIDATION_CHANNEL: &str = "castvault:cache:invalidations";

const KEY_PREFIX: &str = "enabled_accounts";
const ALL_AGENTS: &str = "*";

type CacheResult<T> = std::result::Result<T, CacheError>;

#[derive(Default)]
struct Entries {
    values: HashMap<String, (String, Instant)>,
    generations: HashMap<String, u64>,
}

impl Entries {
    fn purge_expired(&mut self, now: Instant) {
        self.values.retain(|_, (_, expires_at)| now < *expires_at);
    }
}

/// Keyed store with TTL, prefix scan and publish/subscribe
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()>;

    /// Returns how many of the keys existed
    async fn delete(&self, keys: &[String]) -> CacheResult<usize>;

    async fn keys_with_prefix(&self, prefix: &str) -> CacheResult<Vec<String>>;

    /// Current generation of `scope`, zero if never bumped
    async fn generation(&self, scope: &str) -> CacheResult<u64>;

    /// Increment the generation of `scope` and return the new value
    async fn bump_generation(&self, scope: &str) -> CacheResult<u64>;

    /// Set `key` only if `scope` is still at generation `expected`
    ///
    /// The check and the write must be atomic with respect to
    /// [`bump_generation`](Self::bump_generation). Returns whether the entry
    /// was written.
    async fn set_if_generation(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
        scope: &str,
        expected: u64,
    ) -> CacheResult<bool>;

    /// Returns the number of subscribers that received the message
    async fn publish(&self, channel: &str, message: String) -> CacheResult<usize>;

    async fn subscribe(&self, channel: &str) -> CacheResult<broadcast::Receiver<String>>;
}

/// In-process backend
///
/// Expiry uses `tokio::time::Instant`, so paused-clock tests can step past a
/// TTL. Expired entries are purged on every write and scan, so users that are
/// never read again do not pin memory. Channels are `tokio::sync::broadcast`;
/// with no subscribers a publish is dropped.
pub struct MemoryCacheBackend {
    entries: Mutex<Entries>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    channel_capacity: usize,
}

impl MemoryCacheBackend {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            channels: Mutex::new(HashMap::new()),
            channel_capacity: channel_capacity.max(1),
        }
    }

    fn sender(&self, channel: &str) -> CacheResult<broadcast::Sender<String>> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| CacheError::Backend("channel registry poisoned".to_string()))?;
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0);
        Ok(sender.clone())
    }

    fn lock_entries(&self) -> CacheResult<std::sync::MutexGuard<'_, Entries>> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Backend("cache entries poisoned".to_string()))
    }

    /// Number of stored entries, expired or not
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.values.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut entries = self.lock_entries()?;
        match entries.values.get(key) {
            Some((value, expires_at)) if Instant::now() < *expires_at => Ok(Some(value.clone())),
            Some(_) => {
                entries.values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        let now = Instant::now();
        let mut entries = self.lock_entries()?;
        entries.purge_expired(now);
        entries.values.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> CacheResult<usize> {
        let mut entries = self.lock_entries()?;
        Ok(keys.iter().filter(|key| entries.values.remove(*key).is_some()).count())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> CacheResult<Vec<String>> {
        let mut entries = self.lock_entries()?;
        entries.purge_expired(Instant::now());
        let mut keys: Vec<_> = entries
            .values
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn generation(&self, scope: &str) -> CacheResult<u64> {
        let entries = self.lock_entries()?;
        Ok(entries.generations.get(scope).copied().unwrap_or(0))
    }

    async fn bump_generation(&self, scope: &str) -> CacheResult<u64> {
        let mut entries = self.lock_entries()?;
        let generation = entries.generations.entry(scope.to_string()).or_insert(0);
        *generation += 1;
        Ok(*generation)
    }

    async fn set_if_generation(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
        scope: &str,
        expected: u64,
    ) -> CacheResult<bool> {
        let now = Instant::now();
        let mut entries = self.lock_entries()?;
        if entries.generations.get(scope).copied().unwrap_or(0) != expected {
            return Ok(false);
        }
        entries.purge_expired(now);
        entries.values.insert(key.to_string(), (value, now + ttl));
        Ok(true)
    }

    async fn publish(&self, channel: &str, message: String) -> CacheResult<usize> {
        // send fails only when nobody is listening
        Ok(self.sender(channel)?.send(message).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> CacheResult<broadcast::Receiver<String>> {
        Ok(self.sender(channel)?.subscribe())
    }
}

/// Why cache entries were dropped
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    AccountConnected,
    AccountDisconnected,
    ToggleChange,
    ReauthRequired,
    TokenRefreshed,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AccountConnected => "account_connected",
            Self::AccountDisconnected => "account_disconnected",
            Self::ToggleChange => "toggle_change",
            Self::ReauthRequired => "reauth_required",
            Self::TokenRefreshed => "token_refreshed",
        };
        f.write_str(name)
    }
}

/// Published on [`INVALIDATION_CHANNEL`] as JSON
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvalidationEvent {
    pub user_id: String,
    /// `None` for a user-wide invalidation
    pub agent_id: Option<String>,
    pub reason: InvalidationReason,
    pub timestamp: i64,
}

/// Typed view of the invalidation channel
pub struct InvalidationSubscription {
    receiver: broadcast::Receiver<String>,
}

impl InvalidationSubscription {
    /// Next event, or `None` once the channel is closed
    ///
    /// Messages that are not invalidation events are skipped; a lagging
    /// subscriber resumes at the oldest retained message.
    pub async fn recv(&mut self) -> Option<InvalidationEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => match serde_json::from_str(&message) {
                    Ok(event) => return Some(event),
                    Err(e) => tracing::debug!("Ignoring malformed invalidation message: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Invalidation subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

fn escape_segment(segment: &str) -> String {
    let mut escaped = String::with_capacity(segment.len());
    for c in segment.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            '*' => escaped.push_str("%2A"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn user_prefix(user_id: &str) -> String {
    format!("{}:{}:", KEY_PREFIX, escape_segment(user_id))
}

fn agent_key(user_id: &str, agent_id: &str) -> String {
    format!("{}{}", user_prefix(user_id), escape_segment(agent_id))
}

fn aggregate_key(user_id: &str) -> String {
    format!("{}{}", user_prefix(user_id), ALL_AGENTS)
}

/// Which view a key holds
#[derive(Clone, Copy)]
enum View<'a> {
    Agent(&'a str),
    AllConnected,
}

/// Read-through cache of enabled-account lists
pub struct EnabledAccountsCache {
    backend: Arc<dyn CacheBackend>,
    store: Arc<dyn CredentialStore>,
    toggles: Arc<dyn ToggleState>,
    ttl: Duration,
}

impl EnabledAccountsCache {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        store: Arc<dyn CredentialStore>,
        toggles: Arc<dyn ToggleState>,
        ttl: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            toggles,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Active accounts of `user_id` that `agent_id` has enabled
    pub async fn get_enabled(&self, user_id: &str, agent_id: &str) -> Result<Vec<AccountSummary>> {
        self.read_through(user_id, View::Agent(agent_id)).await
    }

    /// All active accounts of `user_id`, regardless of toggles
    pub async fn get_connected(&self, user_id: &str) -> Result<Vec<AccountSummary>> {
        self.read_through(user_id, View::AllConnected).await
    }

    /// Drop every entry of a user, including all agent views
    pub async fn invalidate_user(&self, user_id: &str, reason: InvalidationReason) -> usize {
        self.bump_generation(user_id).await;
        let deleted = match self.backend.keys_with_prefix(&user_prefix(user_id)).await {
            Ok(keys) if keys.is_empty() => 0,
            Ok(keys) => self.backend.delete(&keys).await.unwrap_or_else(|e| {
                tracing::warn!(user_id, "Cache delete failed: {}", e);
                0
            }),
            Err(e) => {
                tracing::warn!(user_id, "Cache scan failed: {}", e);
                0
            }
        };

        tracing::debug!(user_id, %reason, deleted, "Invalidated user cache entries");
        self.publish(user_id, None, reason).await;
        deleted
    }

    /// Drop one agent's view of a user
    pub async fn invalidate_agent(&self, user_id: &str, agent_id: &str, reason: InvalidationReason) -> usize {
        self.bump_generation(user_id).await;
        let deleted = self
            .backend
            .delete(&[agent_key(user_id, agent_id)])
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(user_id, agent_id, "Cache delete failed: {}", e);
                0
            });

        tracing::debug!(user_id, agent_id, %reason, deleted, "Invalidated agent cache entry");
        self.publish(user_id, Some(agent_id), reason).await;
        deleted
    }

    /// Populate the aggregate view and the given agents' views
    ///
    /// Returns the number of entries written.
    pub async fn warm(&self, user_id: &str, agent_ids: &[String]) -> Result<usize> {
        let generation = self.current_generation(user_id).await;
        let accounts = self.store.list_user_accounts(user_id).await?;
        let mut written = 0;

        let all: Vec<_> = accounts.iter().map(|record| record.summary()).collect();
        if self
            .store_view(user_id, &aggregate_key(user_id), &all, generation)
            .await
        {
            written += 1;
        }

        for agent_id in agent_ids {
            let enabled = self.filter_enabled(user_id, agent_id, &all).await?;
            if self
                .store_view(user_id, &agent_key(user_id, agent_id), &enabled, generation)
                .await
            {
                written += 1;
            }
        }

        tracing::debug!(user_id, written, "Warmed cache");
        Ok(written)
    }

    pub async fn subscribe(&self) -> Result<InvalidationSubscription> {
        let receiver = self.backend.subscribe(INVALIDATION_CHANNEL).await?;
        Ok(InvalidationSubscription { receiver })
    }

    async fn read_through(&self, user_id: &str, view: View<'_>) -> Result<Vec<AccountSummary>> {
        let key = match view {
            View::Agent(agent_id) => agent_key(user_id, agent_id),
            View::AllConnected => aggregate_key(user_id),
        };

        match self.backend.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_str(&cached) {
                Ok(accounts) => return Ok(accounts),
                Err(e) => tracing::warn!(key = %key, "Discarding undecodable cache entry: {}", e),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %key, "Cache read failed, computing directly: {}", e),
        }

        let generation = self.current_generation(user_id).await;
        let accounts = self.compute(user_id, view).await?;
        self.store_view(user_id, &key, &accounts, generation).await;
        Ok(accounts)
    }

    /// `None` when the backend cannot say, in which case nothing is stored
    async fn current_generation(&self, user_id: &str) -> Option<u64> {
        match self.backend.generation(&user_prefix(user_id)).await {
            Ok(generation) => Some(generation),
            Err(e) => {
                tracing::warn!(user_id, "Cache generation read failed: {}", e);
                None
            }
        }
    }

    async fn bump_generation(&self, user_id: &str) {
        if let Err(e) = self.backend.bump_generation(&user_prefix(user_id)).await {
            tracing::warn!(user_id, "Cache generation bump failed: {}", e);
        }
    }

    async fn compute(&self, user_id: &str, view: View<'_>) -> Result<Vec<AccountSummary>> {
        let all: Vec<_> = self
            .store
            .list_user_accounts(user_id)
            .await?
            .iter()
            .map(|record| record.summary())
            .collect();

        match view {
            View::AllConnected => Ok(all),
            View::Agent(agent_id) => self.filter_enabled(user_id, agent_id, &all).await,
        }
    }

    async fn filter_enabled(
        &self,
        user_id: &str,
        agent_id: &str,
        accounts: &[AccountSummary],
    ) -> Result<Vec<AccountSummary>> {
        let mut enabled = Vec::new();
        for account in accounts {
            if self
                .toggles
                .is_enabled(agent_id, user_id, &account.account_id)
                .await?
            {
                enabled.push(account.clone());
            }
        }
        Ok(enabled)
    }

    /// Best effort; returns whether the entry was written
    ///
    /// Skipped when the user was invalidated after `generation` was read.
    async fn store_view(
        &self,
        user_id: &str,
        key: &str,
        accounts: &[AccountSummary],
        generation: Option<u64>,
    ) -> bool {
        let Some(generation) = generation else {
            return false;
        };
        let encoded = match serde_json::to_string(accounts) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(key, "Failed to encode cache entry: {}", e);
                return false;
            }
        };

        match self
            .backend
            .set_if_generation(key, encoded, self.ttl, &user_prefix(user_id), generation)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                tracing::debug!(key, "Invalidated during recompute, not caching");
                false
            }
            Err(e) => {
                tracing::warn!(key, "Cache write failed: {}", e);
                false
            }
        }
    }

    async fn publish(&self, user_id: &str, agent_id: Option<&str>, reason: InvalidationReason) {
        let event = InvalidationEvent {
            user_id: user_id.to_string(),
            agent_id: agent_id.map(str::to_string),
            reason,
            timestamp: chrono::Utc::now().timestamp(),
        };

        let message = match serde_json::to_string(&event) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Failed to encode invalidation event: {}", e);
                return;
            }
        };

        if let Err(e) = self.backend.publish(INVALIDATION_CHANNEL, message).await {
            tracing::warn!(user_id, "Failed to publish invalidation: {}", e);
        }
    }
}
