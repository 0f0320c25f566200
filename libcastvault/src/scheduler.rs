//! Background refresh of OAuth access tokens
//!
//! Each cycle selects active records whose access token expires within the
//! lookahead window and refreshes them with bounded concurrency. Per record:
//!
//! ```text
//! HEALTHY -> EXPIRING_SOON -> REFRESH_IN_FLIGHT -> HEALTHY
//!                  ^                  |
//!                  +---- failure -----+--> NEEDS_REAUTH (counter >= threshold)
//! ```
//!
//! `REFRESH_IN_FLIGHT` is a row lease taken with a conditional update, so two
//! workers never refresh the same record at once. Failed records are retried
//! on the next cycle; the interval is the backoff. A record that reaches
//! `needs_reauth` is left alone until a fresh OAuth exchange clears it.

mod health;

use futures::stream::{self, StreamExt};
use secrecy::ExposeSecret;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::{EnabledAccountsCache, InvalidationReason};
use crate::cipher::EnvelopeCipher;
use crate::config::RefreshConfig;
use crate::db::{CredentialStore, RefreshClaim};
use crate::error::{RefreshError, Result};
use crate::leader::LeaderElection;
use crate::provider::ProviderRegistry;
use crate::types::CredentialRecord;

pub use health::{classify_health, HealthStatus, TokenHealth};

/// Tunables of the refresh loop, resolved from `[refresh]` config
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub lookahead_secs: i64,
    pub failure_threshold: u32,
    pub error_cooldown: Duration,
    pub request_timeout: Duration,
    pub max_concurrency: usize,
    pub lease_secs: i64,
}

impl From<&RefreshConfig> for SchedulerSettings {
    fn from(config: &RefreshConfig) -> Self {
        Self {
            interval: config.interval(),
            lookahead_secs: config.lookahead_secs as i64,
            failure_threshold: config.failure_threshold,
            error_cooldown: config.error_cooldown(),
            request_timeout: config.request_timeout(),
            max_concurrency: config.max_concurrency.max(1),
            lease_secs: config.lease_secs as i64,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&RefreshConfig::default())
    }
}

/// Tally of one scheduler cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Records selected by the expiry query
    pub candidates: usize,
    pub refreshed: usize,
    pub failed: usize,
    /// Failures that pushed a record to `needs_reauth`
    pub escalated: usize,
    /// Unreadable envelopes or missing refresh tokens
    pub flagged: usize,
    /// No provider registered for the platform
    pub skipped: usize,
    /// Row lease held by another worker
    pub busy: usize,
    /// Reconnected, disconnected or re-claimed while the refresh was in
    /// flight; the attempt's result was discarded
    pub superseded: usize,
    /// Store or key errors that left the record untouched
    pub errors: usize,
}

impl CycleReport {
    /// Records for which the provider was actually called
    pub fn attempted(&self) -> usize {
        self.refreshed + self.failed
    }

    fn tally(&mut self, outcome: &Result<RefreshOutcome>) {
        match outcome {
            Ok(RefreshOutcome::Refreshed) => self.refreshed += 1,
            Ok(RefreshOutcome::Failed { escalated, .. }) => {
                self.failed += 1;
                if *escalated {
                    self.escalated += 1;
                }
            }
            Ok(RefreshOutcome::Flagged(_)) => self.flagged += 1,
            Ok(RefreshOutcome::Skipped(_)) => self.skipped += 1,
            Ok(RefreshOutcome::Busy) => self.busy += 1,
            Ok(RefreshOutcome::Superseded) => self.superseded += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Result of a single record's refresh attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    Failed {
        error: RefreshError,
        failure_count: i64,
        escalated: bool,
    },
    Flagged(String),
    Skipped(String),
    Busy,
    /// The row lease was lost before the result could be stored
    Superseded,
}

/// One line of a force-refresh report
#[derive(Debug, Clone, Serialize)]
pub struct RefreshDetail {
    pub account_id: String,
    pub platform: String,
    pub success: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ForceRefreshReport {
    pub success_count: usize,
    pub failed_count: usize,
    pub details: Vec<RefreshDetail>,
}

/// Which records an attempt may claim
#[derive(Clone, Copy)]
enum AttemptMode {
    /// Background cycle: only records still due, never flagged ones
    Scheduled { cutoff: i64 },
    /// Admin recovery: any active record
    Forced,
}

struct MonitorTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct RefreshScheduler {
    store: Arc<dyn CredentialStore>,
    cipher: Arc<EnvelopeCipher>,
    providers: ProviderRegistry,
    leader: Arc<dyn LeaderElection>,
    settings: SchedulerSettings,
    cache: Option<Arc<EnabledAccountsCache>>,
    running: AtomicBool,
    task: Mutex<Option<MonitorTask>>,
}

impl RefreshScheduler {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cipher: Arc<EnvelopeCipher>,
        providers: ProviderRegistry,
        leader: Arc<dyn LeaderElection>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            cipher,
            providers,
            leader,
            settings,
            cache: None,
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Invalidate this cache when a record enters or leaves `needs_reauth`
    pub fn with_cache(mut self, cache: Arc<EnabledAccountsCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the background loop
    ///
    /// Returns false, without spawning anything, when the loop is already
    /// running.
    pub fn start_monitoring(self: &Arc<Self>) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Refresh scheduler already running");
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            scheduler.run_loop(shutdown_rx).await;
        });

        let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *task = Some(MonitorTask { shutdown, handle });
        true
    }

    /// Signal the loop to stop and wait for the in-progress cycle to finish
    pub async fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.handle.await {
                tracing::error!("Refresh scheduler task ended abnormally: {}", e);
            }
            if let Err(e) = self.leader.resign().await {
                tracing::warn!("Failed to resign leadership: {}", e);
            }
            tracing::info!("Refresh scheduler stopped");
        }

        self.running.store(false, Ordering::SeqCst);
    }

    async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.settings.interval.as_secs(),
            lookahead_secs = self.settings.lookahead_secs,
            threshold = self.settings.failure_threshold,
            "Refresh scheduler started ({})",
            self.leader.describe()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = chrono::Utc::now().timestamp();
            let delay = match self.tick(now).await {
                Ok(Some(report)) => {
                    if report.candidates > 0 {
                        tracing::info!(
                            candidates = report.candidates,
                            refreshed = report.refreshed,
                            failed = report.failed,
                            escalated = report.escalated,
                            flagged = report.flagged,
                            "Refresh cycle complete"
                        );
                    } else {
                        tracing::debug!("Refresh cycle complete: nothing due");
                    }
                    self.settings.interval
                }
                Ok(None) => {
                    tracing::debug!("Not the refresh leader, skipping cycle");
                    self.settings.interval
                }
                Err(e) => {
                    tracing::error!(
                        cooldown_secs = self.settings.error_cooldown.as_secs(),
                        "Refresh cycle failed: {}",
                        e
                    );
                    self.settings.error_cooldown
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    /// Run one cycle if this process is the leader
    pub async fn tick(&self, now: i64) -> Result<Option<CycleReport>> {
        if !self.leader.is_leader(now).await? {
            return Ok(None);
        }
        self.run_cycle_at(now).await.map(Some)
    }

    /// Refresh every record due at `now`, regardless of leadership
    pub async fn run_cycle_at(&self, now: i64) -> Result<CycleReport> {
        let cutoff = now + self.settings.lookahead_secs;
        let candidates = self.store.list_refresh_candidates(cutoff).await?;

        let mut report = CycleReport {
            candidates: candidates.len(),
            ..CycleReport::default()
        };

        let outcomes: Vec<Result<RefreshOutcome>> = stream::iter(candidates)
            .map(|record| self.attempt(record, now, AttemptMode::Scheduled { cutoff }))
            .buffer_unordered(self.settings.max_concurrency)
            .collect()
            .await;

        for outcome in &outcomes {
            report.tally(outcome);
        }
        Ok(report)
    }

    /// Refresh every active record of a user, flagged ones included
    pub async fn force_refresh_user(&self, user_id: &str, now: i64) -> Result<ForceRefreshReport> {
        let records = self.store.list_user_accounts(user_id).await?;
        tracing::info!(user_id, accounts = records.len(), "Force-refreshing user tokens");

        let details: Vec<RefreshDetail> = stream::iter(records)
            .map(|record| async move {
                let account_id = record.id.clone();
                let platform = record.platform.clone();
                let (success, message) = match self.attempt(record, now, AttemptMode::Forced).await {
                    Ok(RefreshOutcome::Refreshed) => (true, None),
                    Ok(RefreshOutcome::Failed { error, .. }) => (false, Some(error.to_string())),
                    Ok(RefreshOutcome::Flagged(reason)) => (false, Some(reason)),
                    Ok(RefreshOutcome::Skipped(reason)) => (false, Some(reason)),
                    Ok(RefreshOutcome::Busy) => (false, Some("refresh already in progress".to_string())),
                    Ok(RefreshOutcome::Superseded) => {
                        (false, Some("record changed during refresh, result discarded".to_string()))
                    }
                    Err(e) => (false, Some(e.to_string())),
                };
                RefreshDetail {
                    account_id,
                    platform,
                    success,
                    message,
                }
            })
            .buffer_unordered(self.settings.max_concurrency)
            .collect()
            .await;

        let mut report = ForceRefreshReport::default();
        for detail in details {
            if detail.success {
                report.success_count += 1;
            } else {
                report.failed_count += 1;
            }
            report.details.push(detail);
        }
        report.details.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(report)
    }

    /// Health of every active record of a user; never mutates state
    pub async fn get_user_token_health(&self, user_id: &str, now: i64) -> Result<Vec<TokenHealth>> {
        let records = self.store.list_user_accounts(user_id).await?;
        Ok(records.iter().map(|record| TokenHealth::of(record, now)).collect())
    }

    async fn attempt(&self, record: CredentialRecord, now: i64, mode: AttemptMode) -> Result<RefreshOutcome> {
        let Some(provider) = self.providers.get(&record.platform) else {
            tracing::debug!(
                account_id = %record.id,
                platform = %record.platform,
                "No OAuth provider registered, skipping"
            );
            return Ok(RefreshOutcome::Skipped(format!(
                "no OAuth provider for platform '{}'",
                record.platform
            )));
        };

        let claim = RefreshClaim {
            claim_id: uuid::Uuid::new_v4().to_string(),
            now,
            lease_until: now + self.settings.lease_secs,
            due_before: match mode {
                AttemptMode::Scheduled { cutoff } => Some(cutoff),
                AttemptMode::Forced => None,
            },
            allow_reauth: matches!(mode, AttemptMode::Forced),
        };

        let Some(record) = self.store.claim_refresh(&record.user_id, &record.id, &claim).await? else {
            tracing::debug!(account_id = %record.id, "Record claimed elsewhere or no longer due");
            return Ok(RefreshOutcome::Busy);
        };

        let Some(envelope) = record.refresh_token.as_deref() else {
            return self.flag(&record, &claim, "no refresh token stored", now).await;
        };

        let refresh_token = match self.cipher.decrypt(envelope) {
            Ok(token) => token,
            Err(e) if e.is_unreadable_record() => {
                return self
                    .flag(&record, &claim, &format!("refresh token unreadable: {}", e), now)
                    .await;
            }
            Err(e) => {
                tracing::error!(account_id = %record.id, "Cannot decrypt refresh token: {}", e);
                self.store
                    .release_claim(&record.user_id, &record.id, &claim.claim_id)
                    .await?;
                return Err(e);
            }
        };

        let result = match tokio::time::timeout(self.settings.request_timeout, provider.refresh(&refresh_token)).await {
            Ok(result) => result,
            Err(_) => Err(RefreshError::Transient(format!(
                "refresh timed out after {}s",
                self.settings.request_timeout.as_secs()
            ))),
        };

        match result {
            Ok(grant) => {
                let sealed = self.cipher.encrypt(grant.access_token.expose_secret()).and_then(|access| {
                    let refresh = grant
                        .refresh_token
                        .as_ref()
                        .map(|token| self.cipher.encrypt(token.expose_secret()))
                        .transpose()?;
                    Ok((access, refresh))
                });
                let (access, refresh) = match sealed {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        self.store
                            .release_claim(&record.user_id, &record.id, &claim.claim_id)
                            .await?;
                        return Err(e);
                    }
                };

                let stored = self
                    .store
                    .record_refresh_success(
                        &record.user_id,
                        &record.id,
                        &claim.claim_id,
                        &access,
                        refresh.as_deref(),
                        now + grant.expires_in,
                        now,
                    )
                    .await?;
                if !stored {
                    return Ok(self.superseded(&record));
                }

                tracing::info!(
                    account_id = %record.id,
                    platform = %record.platform,
                    expires_in = grant.expires_in,
                    rotated = refresh.is_some(),
                    "Refreshed access token"
                );

                if record.needs_reauth {
                    self.invalidate(&record.user_id, InvalidationReason::TokenRefreshed).await;
                }
                Ok(RefreshOutcome::Refreshed)
            }
            Err(error) => {
                let Some(outcome) = self
                    .store
                    .record_refresh_failure(
                        &record.user_id,
                        &record.id,
                        &claim.claim_id,
                        &error.to_string(),
                        self.settings.failure_threshold,
                        now,
                    )
                    .await?
                else {
                    return Ok(self.superseded(&record));
                };

                let escalated = outcome.needs_reauth && !record.needs_reauth;
                if escalated {
                    tracing::error!(
                        account_id = %record.id,
                        user_id = %record.user_id,
                        platform = %record.platform,
                        failures = outcome.failure_count,
                        "Token refresh failed repeatedly, account needs re-authorization: {}",
                        error
                    );
                    self.invalidate(&record.user_id, InvalidationReason::ReauthRequired).await;
                } else {
                    tracing::warn!(
                        account_id = %record.id,
                        platform = %record.platform,
                        failures = outcome.failure_count,
                        threshold = self.settings.failure_threshold,
                        "Token refresh failed: {}",
                        error
                    );
                }

                Ok(RefreshOutcome::Failed {
                    error,
                    failure_count: outcome.failure_count,
                    escalated,
                })
            }
        }
    }

    async fn flag(
        &self,
        record: &CredentialRecord,
        claim: &RefreshClaim,
        reason: &str,
        now: i64,
    ) -> Result<RefreshOutcome> {
        let flagged = self
            .store
            .flag_for_review(&record.user_id, &record.id, Some(&claim.claim_id), reason, now)
            .await?;
        if !flagged {
            return Ok(self.superseded(record));
        }

        tracing::error!(
            account_id = %record.id,
            user_id = %record.user_id,
            platform = %record.platform,
            "Flagged record for review: {}",
            reason
        );
        if !record.needs_reauth {
            self.invalidate(&record.user_id, InvalidationReason::ReauthRequired).await;
        }
        Ok(RefreshOutcome::Flagged(reason.to_string()))
    }

    fn superseded(&self, record: &CredentialRecord) -> RefreshOutcome {
        tracing::warn!(
            account_id = %record.id,
            platform = %record.platform,
            "Record changed while its refresh was in flight, discarding the result"
        );
        RefreshOutcome::Superseded
    }

    async fn invalidate(&self, user_id: &str, reason: InvalidationReason) {
        if let Some(cache) = &self.cache {
            cache.invalidate_user(user_id, reason).await;
        }
    }
}
