//! Service facade for Castvault
//!
//! `CredentialService` owns the shared resources (database, cipher, provider
//! registry, cache) and is the entry point for the mutation paths that must
//! keep the cache honest: connecting, disconnecting and toggling accounts
//! always invalidate the affected entries.
//!
//! # Example
//!
//! ```no_run
//! use libcastvault::service::{ConnectRequest, CredentialService};
//! use libcastvault::Config;
//! use secrecy::SecretString;
//!
//! # async fn example() -> libcastvault::Result<()> {
//! let service = CredentialService::from_config(Config::load()?, None).await?;
//!
//! service
//!     .connect_account(ConnectRequest {
//!         user_id: "user-1".to_string(),
//!         account_id: "UC123".to_string(),
//!         platform: "youtube".to_string(),
//!         display_name: "My Channel".to_string(),
//!         access_token: SecretString::from("ya29...".to_string()),
//!         refresh_token: Some(SecretString::from("1//...".to_string())),
//!         expires_in: 3599,
//!     })
//!     .await?;
//!
//! let enabled = service.enabled_accounts("user-1", "agent-7").await?;
//! # Ok(())
//! # }
//! ```

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::sync::Arc;

use crate::cache::{EnabledAccountsCache, InvalidationReason, MemoryCacheBackend};
use crate::cipher::{envelope_version, EnvelopeCipher, EnvelopeVersion};
use crate::config::Config;
use crate::db::{CredentialStore, Database, ToggleState};
use crate::error::{CastvaultError, Result};
use crate::leader::{self, LeaderElection};
use crate::provider::ProviderRegistry;
use crate::scheduler::{ForceRefreshReport, RefreshScheduler, SchedulerSettings, TokenHealth};
use crate::types::{AccountSummary, NewConnection, TokenEnvelopes};

/// Plaintext result of a completed OAuth exchange
pub struct ConnectRequest {
    pub user_id: String,
    pub account_id: String,
    pub platform: String,
    pub display_name: String,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    /// Seconds until the access token expires
    pub expires_in: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub migrated: usize,
    /// Already version 1
    pub skipped: usize,
    /// Unreadable; flagged for review
    pub failed: usize,
    /// Changed by another writer during migration; rerun to pick them up
    pub conflicted: usize,
}

pub struct CredentialService {
    db: Database,
    cipher: Arc<EnvelopeCipher>,
    cache: Arc<EnabledAccountsCache>,
    scheduler: Arc<RefreshScheduler>,
}

impl CredentialService {
    /// Build every component from configuration and the environment
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when key material or a provider client secret is
    /// missing or malformed, and `DbError` when the database cannot be opened.
    pub async fn from_config(config: Config, worker_index: Option<u32>) -> Result<Self> {
        config.refresh.validate()?;

        let cipher = Arc::new(EnvelopeCipher::from_env(&config.crypto)?);
        let db = Database::new(&config.database.path).await?;
        let providers = ProviderRegistry::from_config(&config.providers, config.refresh.request_timeout())?;
        let leader = leader::from_config(&config.refresh.leader, &db, worker_index);

        tracing::info!(
            providers = ?providers.platforms(),
            legacy_key = cipher.has_legacy_key(),
            "Credential service initialised"
        );

        Ok(Self::new(db, cipher, providers, leader, &config))
    }

    /// Wire already-built components
    pub fn new(
        db: Database,
        cipher: Arc<EnvelopeCipher>,
        providers: ProviderRegistry,
        leader: Arc<dyn LeaderElection>,
        config: &Config,
    ) -> Self {
        let store: Arc<Database> = Arc::new(db.clone());
        let backend = Arc::new(MemoryCacheBackend::new(config.cache.channel_capacity));
        let cache = Arc::new(EnabledAccountsCache::new(
            backend,
            store.clone(),
            store.clone(),
            config.cache.ttl(),
        ));

        let scheduler = Arc::new(
            RefreshScheduler::new(
                store,
                cipher.clone(),
                providers,
                leader,
                SchedulerSettings::from(&config.refresh),
            )
            .with_cache(cache.clone()),
        );

        Self {
            db,
            cipher,
            cache,
            scheduler,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn cipher(&self) -> &Arc<EnvelopeCipher> {
        &self.cipher
    }

    pub fn cache(&self) -> &Arc<EnabledAccountsCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<RefreshScheduler> {
        &self.scheduler
    }

    /// Store the tokens of a completed OAuth exchange
    ///
    /// Reconnecting an account clears `needs_reauth` and its failure counter.
    pub async fn connect_account(&self, request: ConnectRequest) -> Result<()> {
        for (field, value) in [
            ("user_id", &request.user_id),
            ("account_id", &request.account_id),
            ("platform", &request.platform),
        ] {
            if value.trim().is_empty() {
                return Err(CastvaultError::InvalidInput(format!("{} must not be empty", field)));
            }
        }

        let now = chrono::Utc::now().timestamp();
        let access_token = self.cipher.encrypt(request.access_token.expose_secret())?;
        let refresh_token = request
            .refresh_token
            .as_ref()
            .map(|token| self.cipher.encrypt(token.expose_secret()))
            .transpose()?;

        let connection = NewConnection {
            id: request.account_id,
            user_id: request.user_id,
            platform: request.platform.to_lowercase(),
            display_name: request.display_name,
            access_token,
            refresh_token,
            token_expires_at: now + request.expires_in,
        };
        self.db.upsert_connection(&connection, now).await?;

        tracing::info!(
            user_id = %connection.user_id,
            account_id = %connection.id,
            platform = %connection.platform,
            has_refresh_token = connection.refresh_token.is_some(),
            "Account connected"
        );

        self.cache
            .invalidate_user(&connection.user_id, InvalidationReason::AccountConnected)
            .await;
        Ok(())
    }

    /// Soft-delete a connected account
    pub async fn disconnect_account(&self, user_id: &str, account_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        if !self.db.deactivate(user_id, account_id, now).await? {
            return Err(CastvaultError::NotFound(account_id.to_string()));
        }

        tracing::info!(user_id, account_id, "Account disconnected");
        self.cache
            .invalidate_user(user_id, InvalidationReason::AccountDisconnected)
            .await;
        Ok(())
    }

    /// Enable or disable an account for one agent
    pub async fn set_agent_toggle(
        &self,
        user_id: &str,
        agent_id: &str,
        account_id: &str,
        enabled: bool,
    ) -> Result<()> {
        match self.db.get(user_id, account_id).await? {
            Some(record) if record.is_active => {}
            _ => return Err(CastvaultError::NotFound(account_id.to_string())),
        }

        let now = chrono::Utc::now().timestamp();
        self.db
            .set_enabled(agent_id, user_id, account_id, enabled, now)
            .await?;

        tracing::debug!(user_id, agent_id, account_id, enabled, "Agent toggle changed");
        self.cache
            .invalidate_agent(user_id, agent_id, InvalidationReason::ToggleChange)
            .await;
        Ok(())
    }

    pub async fn enabled_accounts(&self, user_id: &str, agent_id: &str) -> Result<Vec<AccountSummary>> {
        self.cache.get_enabled(user_id, agent_id).await
    }

    pub async fn connected_accounts(&self, user_id: &str) -> Result<Vec<AccountSummary>> {
        self.cache.get_connected(user_id).await
    }

    /// Decrypted access token for publishing on behalf of the user
    ///
    /// # Errors
    ///
    /// - `NotFound` for unknown or disconnected accounts
    /// - `NeedsReauth` when the account must go through OAuth again
    /// - `Cipher` when the stored envelope is unreadable; the record is
    ///   flagged for review before the error is returned
    pub async fn access_token(&self, user_id: &str, account_id: &str) -> Result<SecretString> {
        let record = match self.db.get(user_id, account_id).await? {
            Some(record) if record.is_active => record,
            _ => return Err(CastvaultError::NotFound(account_id.to_string())),
        };

        if record.needs_reauth {
            return Err(CastvaultError::NeedsReauth(account_id.to_string()));
        }

        match self.cipher.decrypt(&record.access_token) {
            Ok(token) => Ok(token),
            Err(e) if e.is_unreadable_record() => {
                tracing::error!(user_id, account_id, "Stored access token unreadable: {}", e);
                let now = chrono::Utc::now().timestamp();
                let reason = format!("access token unreadable: {}", e);
                self.db
                    .flag_for_review(user_id, account_id, None, &reason, now)
                    .await?;
                self.cache
                    .invalidate_user(user_id, InvalidationReason::ReauthRequired)
                    .await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn token_health(&self, user_id: &str) -> Result<Vec<TokenHealth>> {
        let now = chrono::Utc::now().timestamp();
        self.scheduler.get_user_token_health(user_id, now).await
    }

    pub async fn force_refresh_user(&self, user_id: &str) -> Result<ForceRefreshReport> {
        let now = chrono::Utc::now().timestamp();
        self.scheduler.force_refresh_user(user_id, now).await
    }

    /// Re-encrypt every legacy envelope in the store under the current scheme
    ///
    /// Safe to rerun: version 1 envelopes are left alone and every write is a
    /// compare-and-swap on the envelope that was read.
    ///
    /// # Errors
    ///
    /// Fails with `ConfigError::LegacyKeyMissing` as soon as a legacy envelope
    /// is met without a configured legacy key.
    pub async fn migrate_legacy_records(&self) -> Result<MigrationReport> {
        let rows = self.db.list_token_envelopes().await?;
        let mut report = MigrationReport::default();
        tracing::info!(records = rows.len(), "Scanning credential envelopes for legacy format");

        for row in rows {
            match self.migrate_row(&row).await {
                Ok(RowMigration::Current) => report.skipped += 1,
                Ok(RowMigration::Migrated) => report.migrated += 1,
                Ok(RowMigration::Conflict) => report.conflicted += 1,
                Err(e) if e.is_unreadable_record() => {
                    tracing::error!(
                        user_id = %row.user_id,
                        account_id = %row.id,
                        "Envelope unreadable during migration: {}",
                        e
                    );
                    let now = chrono::Utc::now().timestamp();
                    let reason = format!("migration failed: {}", e);
                    self.db
                        .flag_for_review(&row.user_id, &row.id, None, &reason, now)
                        .await?;
                    report.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            migrated = report.migrated,
            skipped = report.skipped,
            failed = report.failed,
            conflicted = report.conflicted,
            "Legacy envelope migration finished"
        );
        Ok(report)
    }

    async fn migrate_row(&self, row: &TokenEnvelopes) -> Result<RowMigration> {
        let access_is_legacy = envelope_version(&row.access_token)? == EnvelopeVersion::Legacy;
        let refresh_is_legacy = match row.refresh_token.as_deref() {
            Some(envelope) => envelope_version(envelope)? == EnvelopeVersion::Legacy,
            None => false,
        };

        if !access_is_legacy && !refresh_is_legacy {
            return Ok(RowMigration::Current);
        }

        let access_token = self.cipher.migrate_legacy(&row.access_token)?;
        let refresh_token = row
            .refresh_token
            .as_deref()
            .map(|envelope| self.cipher.migrate_legacy(envelope))
            .transpose()?;

        let swapped = self
            .db
            .replace_token_envelopes(
                &row.user_id,
                &row.id,
                &row.access_token,
                &access_token,
                refresh_token.as_deref(),
            )
            .await?;

        if swapped {
            tracing::debug!(user_id = %row.user_id, account_id = %row.id, "Migrated legacy envelopes");
            Ok(RowMigration::Migrated)
        } else {
            tracing::warn!(
                user_id = %row.user_id,
                account_id = %row.id,
                "Record changed during migration, leaving it for the next run"
            );
            Ok(RowMigration::Conflict)
        }
    }

    /// Populate the cache for users active since `since` (unix seconds)
    ///
    /// Returns the number of cache entries written. Per-user failures are
    /// logged and do not stop the warm-up.
    pub async fn warm_recent_users(&self, since: i64) -> Result<usize> {
        let users = self.db.recently_active_users(since).await?;
        let mut written = 0;

        for user_id in &users {
            let agents = match self.db.agents_for_user(user_id).await {
                Ok(agents) => agents,
                Err(e) => {
                    tracing::warn!(user_id = %user_id, "Skipping cache warm-up: {}", e);
                    continue;
                }
            };
            match self.cache.warm(user_id, &agents).await {
                Ok(count) => written += count,
                Err(e) => tracing::warn!(user_id = %user_id, "Cache warm-up failed: {}", e),
            }
        }

        tracing::info!(users = users.len(), entries = written, "Cache warmed");
        Ok(written)
    }
}

enum RowMigration {
    Current,
    Migrated,
    Conflict,
}
