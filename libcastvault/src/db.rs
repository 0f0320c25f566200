//! Database operations for Castvault
//!
//! The credential table is the single source of truth. Every write is scoped
//! to one row with `WHERE id = ? AND user_id = ?`, and state transitions that
//! race with other workers are expressed as conditional updates.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use std::path::Path;

use crate::error::{DbError, Result};
use crate::types::{CredentialRecord, NewConnection, TokenEnvelopes};

const RECORD_COLUMNS: &str = "id, user_id, platform, display_name, access_token, refresh_token, \
     token_expires_at, needs_reauth, refresh_failure_count, last_refresh_at, last_error, \
     is_active, created_at, updated_at";

/// Parameters of a row lease taken before refreshing a record
///
/// `claim_id` must be unique per attempt. Every write that concludes the
/// attempt carries it, and lands only while the row still holds that claim.
#[derive(Debug, Clone)]
pub struct RefreshClaim {
    pub claim_id: String,
    pub now: i64,
    /// The lease is held until this instant unless released earlier
    pub lease_until: i64,
    /// Only claim if the token still expires at or before this instant
    pub due_before: Option<i64>,
    /// Claim records already flagged `needs_reauth` (force refresh)
    pub allow_reauth: bool,
}

/// Outcome of a recorded refresh failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub failure_count: i64,
    pub needs_reauth: bool,
}

/// Persistence for connected-account credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, user_id: &str, id: &str) -> Result<Option<CredentialRecord>>;

    /// Active, non-flagged records whose token expires at or before `cutoff`
    async fn list_refresh_candidates(&self, cutoff: i64) -> Result<Vec<CredentialRecord>>;

    /// Active records of one user, ordered by platform then display name
    async fn list_user_accounts(&self, user_id: &str) -> Result<Vec<CredentialRecord>>;

    /// Store the result of a completed OAuth exchange
    ///
    /// A reconnect clears `needs_reauth`, resets the failure counter and
    /// reactivates a soft-deleted record.
    async fn upsert_connection(&self, connection: &NewConnection, now: i64) -> Result<()>;

    /// Soft delete; returns false when no active record matched
    async fn deactivate(&self, user_id: &str, id: &str, now: i64) -> Result<bool>;

    /// Take the row lease for a refresh attempt
    ///
    /// Returns the fresh record when the lease was taken, `None` when another
    /// worker holds it or the record no longer qualifies.
    async fn claim_refresh(
        &self,
        user_id: &str,
        id: &str,
        claim: &RefreshClaim,
    ) -> Result<Option<CredentialRecord>>;

    /// Drop the lease if `claim_id` still holds it
    async fn release_claim(&self, user_id: &str, id: &str, claim_id: &str) -> Result<()>;

    /// Store refreshed envelopes; a `None` refresh token keeps the current one
    ///
    /// Returns false, writing nothing, when `claim_id` no longer holds the
    /// row: a reconnect, disconnect or lease takeover happened meanwhile.
    #[allow(clippy::too_many_arguments)]
    async fn record_refresh_success(
        &self,
        user_id: &str,
        id: &str,
        claim_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: i64,
        now: i64,
    ) -> Result<bool>;

    /// Increment the failure counter and escalate once it reaches `threshold`
    ///
    /// `None` when `claim_id` no longer holds the row.
    async fn record_refresh_failure(
        &self,
        user_id: &str,
        id: &str,
        claim_id: &str,
        error: &str,
        threshold: u32,
        now: i64,
    ) -> Result<Option<FailureOutcome>>;

    /// Mark a record unreadable or unrefreshable for manual review
    ///
    /// With a `claim_id` the flag lands only while that claim holds the row.
    /// Returns whether a row was flagged.
    async fn flag_for_review(
        &self,
        user_id: &str,
        id: &str,
        claim_id: Option<&str>,
        reason: &str,
        now: i64,
    ) -> Result<bool>;

    async fn list_token_envelopes(&self) -> Result<Vec<TokenEnvelopes>>;

    /// Swap envelopes only if the access envelope is still `expected_access`
    async fn replace_token_envelopes(
        &self,
        user_id: &str,
        id: &str,
        expected_access: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<bool>;

    /// Users whose credentials or toggles changed at or after `since`
    async fn recently_active_users(&self, since: i64) -> Result<Vec<String>>;
}

/// Per-agent enable flags for connected accounts
#[async_trait]
pub trait ToggleState: Send + Sync {
    /// Absent rows mean disabled
    async fn is_enabled(&self, agent_id: &str, user_id: &str, resource_id: &str) -> Result<bool>;

    async fn set_enabled(
        &self,
        agent_id: &str,
        user_id: &str,
        resource_id: &str,
        enabled: bool,
        now: i64,
    ) -> Result<()>;

    async fn agents_for_user(&self, user_id: &str) -> Result<Vec<String>>;
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // mode=rwc creates the file on first open
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        tracing::debug!("Opened credential database at {}", expanded_path);

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Acquire or renew a named lease
    ///
    /// Succeeds when the lease is free, expired, or already held by `holder`.
    pub async fn try_acquire_lease(&self, name: &str, holder: &str, now: i64, ttl_secs: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO scheduler_leases (name, holder, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE scheduler_leases.holder = excluded.holder
               OR scheduler_leases.expires_at <= ?4
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(now + ttl_secs)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Give up a lease held by `holder`; no-op if someone else holds it
    pub async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM scheduler_leases WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for Database {
    async fn get(&self, user_id: &str, id: &str) -> Result<Option<CredentialRecord>> {
        let record = sqlx::query_as::<_, CredentialRecord>(&format!(
            "SELECT {} FROM credentials WHERE id = ? AND user_id = ?",
            RECORD_COLUMNS
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(record)
    }

    async fn list_refresh_candidates(&self, cutoff: i64) -> Result<Vec<CredentialRecord>> {
        let records = sqlx::query_as::<_, CredentialRecord>(&format!(
            r#"
            SELECT {} FROM credentials
            WHERE is_active = 1 AND needs_reauth = 0 AND token_expires_at <= ?
            ORDER BY token_expires_at ASC
            "#,
            RECORD_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(records)
    }

    async fn list_user_accounts(&self, user_id: &str) -> Result<Vec<CredentialRecord>> {
        let records = sqlx::query_as::<_, CredentialRecord>(&format!(
            r#"
            SELECT {} FROM credentials
            WHERE user_id = ? AND is_active = 1
            ORDER BY platform ASC, display_name ASC, id ASC
            "#,
            RECORD_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(records)
    }

    async fn upsert_connection(&self, connection: &NewConnection, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (
                id, user_id, platform, display_name, access_token, refresh_token,
                token_expires_at, needs_reauth, refresh_failure_count, is_active,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, 1, ?8, ?8)
            ON CONFLICT(user_id, id) DO UPDATE SET
                platform = excluded.platform,
                display_name = excluded.display_name,
                access_token = excluded.access_token,
                refresh_token = COALESCE(excluded.refresh_token, credentials.refresh_token),
                token_expires_at = excluded.token_expires_at,
                needs_reauth = 0,
                refresh_failure_count = 0,
                last_error = NULL,
                is_active = 1,
                refresh_lease_until = NULL,
                refresh_claim_id = NULL,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&connection.id)
        .bind(&connection.user_id)
        .bind(&connection.platform)
        .bind(&connection.display_name)
        .bind(&connection.access_token)
        .bind(&connection.refresh_token)
        .bind(connection.token_expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn deactivate(&self, user_id: &str, id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET is_active = 0, refresh_lease_until = NULL, refresh_claim_id = NULL, updated_at = ?
            WHERE id = ? AND user_id = ? AND is_active = 1
            "#,
        )
        .bind(now)
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_refresh(
        &self,
        user_id: &str,
        id: &str,
        claim: &RefreshClaim,
    ) -> Result<Option<CredentialRecord>> {
        let record = sqlx::query_as::<_, CredentialRecord>(&format!(
            r#"
            UPDATE credentials
            SET refresh_lease_until = ?1, refresh_claim_id = ?7
            WHERE id = ?2 AND user_id = ?3
              AND is_active = 1
              AND (refresh_lease_until IS NULL OR refresh_lease_until <= ?4)
              AND (needs_reauth = 0 OR ?5 = 1)
              AND (?6 IS NULL OR token_expires_at <= ?6)
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(claim.lease_until)
        .bind(id)
        .bind(user_id)
        .bind(claim.now)
        .bind(claim.allow_reauth)
        .bind(claim.due_before)
        .bind(&claim.claim_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(record)
    }

    async fn release_claim(&self, user_id: &str, id: &str, claim_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE credentials
            SET refresh_lease_until = NULL, refresh_claim_id = NULL
            WHERE id = ? AND user_id = ? AND refresh_claim_id = ?
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(claim_id)
        .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    async fn record_refresh_success(
        &self,
        user_id: &str,
        id: &str,
        claim_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: i64,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET access_token = ?,
                refresh_token = COALESCE(?, refresh_token),
                token_expires_at = ?,
                refresh_failure_count = 0,
                needs_reauth = 0,
                last_refresh_at = ?,
                last_error = NULL,
                refresh_lease_until = NULL,
                refresh_claim_id = NULL,
                updated_at = ?
            WHERE id = ? AND user_id = ? AND refresh_claim_id = ?
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(user_id)
        .bind(claim_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_refresh_failure(
        &self,
        user_id: &str,
        id: &str,
        claim_id: &str,
        error: &str,
        threshold: u32,
        now: i64,
    ) -> Result<Option<FailureOutcome>> {
        use sqlx::Row;

        let row = sqlx::query(
            r#"
            UPDATE credentials
            SET refresh_failure_count = refresh_failure_count + 1,
                needs_reauth = CASE
                    WHEN refresh_failure_count + 1 >= ?1 THEN 1
                    ELSE needs_reauth
                END,
                last_error = ?2,
                refresh_lease_until = NULL,
                refresh_claim_id = NULL,
                updated_at = ?3
            WHERE id = ?4 AND user_id = ?5 AND refresh_claim_id = ?6
            RETURNING refresh_failure_count, needs_reauth
            "#,
        )
        .bind(threshold as i64)
        .bind(error)
        .bind(now)
        .bind(id)
        .bind(user_id)
        .bind(claim_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|row| FailureOutcome {
            failure_count: row.get("refresh_failure_count"),
            needs_reauth: row.get("needs_reauth"),
        }))
    }

    async fn flag_for_review(
        &self,
        user_id: &str,
        id: &str,
        claim_id: Option<&str>,
        reason: &str,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET needs_reauth = 1,
                last_error = ?1,
                refresh_lease_until = NULL,
                refresh_claim_id = NULL,
                updated_at = ?2
            WHERE id = ?3 AND user_id = ?4
              AND (?5 IS NULL OR refresh_claim_id = ?5)
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(id)
        .bind(user_id)
        .bind(claim_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_token_envelopes(&self) -> Result<Vec<TokenEnvelopes>> {
        let rows = sqlx::query_as::<_, TokenEnvelopes>(
            "SELECT id, user_id, access_token, refresh_token FROM credentials ORDER BY user_id, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows)
    }

    async fn replace_token_envelopes(
        &self,
        user_id: &str,
        id: &str,
        expected_access: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET access_token = ?, refresh_token = ?
            WHERE id = ? AND user_id = ? AND access_token = ?
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(id)
        .bind(user_id)
        .bind(expected_access)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn recently_active_users(&self, since: i64) -> Result<Vec<String>> {
        let users: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT user_id FROM credentials WHERE is_active = 1 AND updated_at >= ?1
            UNION
            SELECT user_id FROM agent_account_toggles WHERE updated_at >= ?1
            ORDER BY user_id
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(users.into_iter().map(|(user,)| user).collect())
    }
}

#[async_trait]
impl ToggleState for Database {
    async fn is_enabled(&self, agent_id: &str, user_id: &str, resource_id: &str) -> Result<bool> {
        let enabled: Option<(bool,)> = sqlx::query_as(
            r#"
            SELECT enabled FROM agent_account_toggles
            WHERE user_id = ? AND agent_id = ? AND account_id = ?
            "#,
        )
        .bind(user_id)
        .bind(agent_id)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(enabled.map(|(flag,)| flag).unwrap_or(false))
    }

    async fn set_enabled(
        &self,
        agent_id: &str,
        user_id: &str,
        resource_id: &str,
        enabled: bool,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_account_toggles (user_id, agent_id, account_id, enabled, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id, agent_id, account_id) DO UPDATE SET
                enabled = excluded.enabled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(agent_id)
        .bind(resource_id)
        .bind(enabled)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn agents_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        let agents: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT agent_id FROM agent_account_toggles WHERE user_id = ? ORDER BY agent_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(agents.into_iter().map(|(agent,)| agent).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CastvaultError;
    use tempfile::TempDir;

    const NOW: i64 = 1_700_000_000;

    async fn setup_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        (db, temp_dir)
    }

    fn connection(user: &str, id: &str, expires_at: i64) -> NewConnection {
        NewConnection {
            id: id.to_string(),
            user_id: user.to_string(),
            platform: "youtube".to_string(),
            display_name: format!("Channel {}", id),
            access_token: format!("env-access-{}", id),
            refresh_token: Some(format!("env-refresh-{}", id)),
            token_expires_at: expires_at,
        }
    }

    fn claim(now: i64) -> RefreshClaim {
        claim_as("claim-1", now)
    }

    fn claim_as(claim_id: &str, now: i64) -> RefreshClaim {
        RefreshClaim {
            claim_id: claim_id.to_string(),
            now,
            lease_until: now + 120,
            due_before: None,
            allow_reauth: false,
        }
    }

    /// Claim the row, flagged or not, and record one failed refresh
    async fn fail_once(db: &Database, id: &str, error: &str, now: i64) -> FailureOutcome {
        let claim = RefreshClaim {
            allow_reauth: true,
            ..claim(now)
        };
        db.claim_refresh("u1", id, &claim).await.unwrap().unwrap();
        db.record_refresh_failure("u1", id, &claim.claim_id, error, 3, now)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_database_initialization_with_invalid_path() {
        #[cfg(unix)]
        let invalid_path = "/tmp/test\0invalid.db";

        #[cfg(windows)]
        let invalid_path = "C:\\invalid<>path\\test.db";

        let result = Database::new(invalid_path).await;
        assert!(matches!(result, Err(CastvaultError::Database(_))));
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let (db, _temp) = setup_test_db().await;
        db.upsert_connection(&connection("u1", "chan-1", NOW + 3600), NOW)
            .await
            .unwrap();

        let record = db.get("u1", "chan-1").await.unwrap().unwrap();
        assert_eq!(record.platform, "youtube");
        assert_eq!(record.token_expires_at, NOW + 3600);
        assert!(record.is_active);
        assert!(!record.needs_reauth);
        assert_eq!(record.refresh_failure_count, 0);

        // Scoped by user
        assert!(db.get("u2", "chan-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconnect_clears_reauth_and_reactivates() {
        let (db, _temp) = setup_test_db().await;
        db.upsert_connection(&connection("u1", "chan-1", NOW), NOW).await.unwrap();

        for _ in 0..3 {
            fail_once(&db, "chan-1", "invalid_grant", NOW).await;
        }
        db.deactivate("u1", "chan-1", NOW).await.unwrap();

        let mut fresh = connection("u1", "chan-1", NOW + 3600);
        fresh.refresh_token = None;
        db.upsert_connection(&fresh, NOW + 10).await.unwrap();

        let record = db.get("u1", "chan-1").await.unwrap().unwrap();
        assert!(record.is_active);
        assert!(!record.needs_reauth);
        assert_eq!(record.refresh_failure_count, 0);
        assert!(record.last_error.is_none());
        // Missing refresh token in the new grant keeps the stored one
        assert_eq!(record.refresh_token.as_deref(), Some("env-refresh-chan-1"));
    }

    #[tokio::test]
    async fn test_refresh_candidates_filter() {
        let (db, _temp) = setup_test_db().await;
        db.upsert_connection(&connection("u1", "due", NOW + 480), NOW).await.unwrap();
        db.upsert_connection(&connection("u1", "later", NOW + 7200), NOW).await.unwrap();
        db.upsert_connection(&connection("u1", "flagged", NOW + 60), NOW).await.unwrap();
        db.upsert_connection(&connection("u2", "gone", NOW + 60), NOW).await.unwrap();

        db.flag_for_review("u1", "flagged", None, "MAC mismatch", NOW).await.unwrap();
        db.deactivate("u2", "gone", NOW).await.unwrap();

        let candidates = db.list_refresh_candidates(NOW + 600).await.unwrap();
        let ids: Vec<_> = candidates.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["due"]);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_released() {
        let (db, _temp) = setup_test_db().await;
        db.upsert_connection(&connection("u1", "chan-1", NOW), NOW).await.unwrap();

        assert!(db.claim_refresh("u1", "chan-1", &claim(NOW)).await.unwrap().is_some());
        assert!(db
            .claim_refresh("u1", "chan-1", &claim_as("claim-2", NOW + 1))
            .await
            .unwrap()
            .is_none());

        // Expired lease can be taken over
        assert!(db
            .claim_refresh("u1", "chan-1", &claim_as("claim-2", NOW + 121))
            .await
            .unwrap()
            .is_some());

        // The superseded claim can no longer release it
        db.release_claim("u1", "chan-1", "claim-1").await.unwrap();
        assert!(db
            .claim_refresh("u1", "chan-1", &claim_as("claim-3", NOW + 122))
            .await
            .unwrap()
            .is_none());

        db.release_claim("u1", "chan-1", "claim-2").await.unwrap();
        assert!(db
            .claim_refresh("u1", "chan-1", &claim_as("claim-3", NOW + 122))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_claim_respects_reauth_and_due_before() {
        let (db, _temp) = setup_test_db().await;
        db.upsert_connection(&connection("u1", "chan-1", NOW + 3600), NOW).await.unwrap();

        let not_due = RefreshClaim {
            due_before: Some(NOW + 600),
            ..claim(NOW)
        };
        assert!(db.claim_refresh("u1", "chan-1", &not_due).await.unwrap().is_none());

        db.flag_for_review("u1", "chan-1", None, "format", NOW).await.unwrap();
        assert!(db.claim_refresh("u1", "chan-1", &claim(NOW)).await.unwrap().is_none());

        let forced = RefreshClaim {
            allow_reauth: true,
            ..claim(NOW)
        };
        assert!(db.claim_refresh("u1", "chan-1", &forced).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failure_escalates_at_threshold() {
        let (db, _temp) = setup_test_db().await;
        db.upsert_connection(&connection("u1", "chan-1", NOW), NOW).await.unwrap();

        let first = fail_once(&db, "chan-1", "timeout", NOW).await;
        assert_eq!(first, FailureOutcome { failure_count: 1, needs_reauth: false });

        fail_once(&db, "chan-1", "timeout", NOW).await;
        let third = fail_once(&db, "chan-1", "invalid_grant", NOW).await;
        assert_eq!(third, FailureOutcome { failure_count: 3, needs_reauth: true });

        let record = db.get("u1", "chan-1").await.unwrap().unwrap();
        assert_eq!(record.last_error.as_deref(), Some("invalid_grant"));
        assert_eq!(record.access_token, "env-access-chan-1");
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let (db, _temp) = setup_test_db().await;
        db.upsert_connection(&connection("u1", "chan-1", NOW), NOW).await.unwrap();
        fail_once(&db, "chan-1", "timeout", NOW).await;
        fail_once(&db, "chan-1", "timeout", NOW).await;

        db.claim_refresh("u1", "chan-1", &claim(NOW)).await.unwrap().unwrap();
        let stored = db
            .record_refresh_success("u1", "chan-1", "claim-1", "new-access", None, NOW + 3600, NOW)
            .await
            .unwrap();
        assert!(stored);

        let record = db.get("u1", "chan-1").await.unwrap().unwrap();
        assert_eq!(record.refresh_failure_count, 0);
        assert!(!record.needs_reauth);
        assert_eq!(record.access_token, "new-access");
        assert_eq!(record.refresh_token.as_deref(), Some("env-refresh-chan-1"));
        assert_eq!(record.last_refresh_at, Some(NOW));
    }

    #[tokio::test]
    async fn test_reconnect_voids_in_flight_claim() {
        let (db, _temp) = setup_test_db().await;
        db.upsert_connection(&connection("u1", "chan-1", NOW), NOW).await.unwrap();
        db.claim_refresh("u1", "chan-1", &claim(NOW)).await.unwrap().unwrap();

        let mut fresh = connection("u1", "chan-1", NOW + 7200);
        fresh.access_token = "env-fresh-oauth".to_string();
        db.upsert_connection(&fresh, NOW + 1).await.unwrap();

        let stored = db
            .record_refresh_success("u1", "chan-1", "claim-1", "env-stale-grant", None, NOW + 3600, NOW + 2)
            .await
            .unwrap();
        assert!(!stored);
        let failure = db
            .record_refresh_failure("u1", "chan-1", "claim-1", "timeout", 3, NOW + 2)
            .await
            .unwrap();
        assert!(failure.is_none());
        let flagged = db
            .flag_for_review("u1", "chan-1", Some("claim-1"), "unreadable", NOW + 2)
            .await
            .unwrap();
        assert!(!flagged);

        let record = db.get("u1", "chan-1").await.unwrap().unwrap();
        assert_eq!(record.access_token, "env-fresh-oauth");
        assert_eq!(record.token_expires_at, NOW + 7200);
        assert_eq!(record.refresh_failure_count, 0);
        assert!(!record.needs_reauth);
    }

    #[tokio::test]
    async fn test_taken_over_claim_cannot_write() {
        let (db, _temp) = setup_test_db().await;
        db.upsert_connection(&connection("u1", "chan-1", NOW), NOW).await.unwrap();
        db.claim_refresh("u1", "chan-1", &claim(NOW)).await.unwrap().unwrap();
        db.claim_refresh("u1", "chan-1", &claim_as("claim-2", NOW + 121))
            .await
            .unwrap()
            .unwrap();

        let stale = db
            .record_refresh_success("u1", "chan-1", "claim-1", "env-late", None, NOW + 3600, NOW + 122)
            .await
            .unwrap();
        assert!(!stale);

        let current = db
            .record_refresh_success("u1", "chan-1", "claim-2", "env-current", None, NOW + 3600, NOW + 122)
            .await
            .unwrap();
        assert!(current);
        assert_eq!(db.get("u1", "chan-1").await.unwrap().unwrap().access_token, "env-current");
    }

    #[tokio::test]
    async fn test_unclaimed_flag_always_lands() {
        let (db, _temp) = setup_test_db().await;
        db.upsert_connection(&connection("u1", "chan-1", NOW), NOW).await.unwrap();

        assert!(db.flag_for_review("u1", "chan-1", None, "MAC mismatch", NOW).await.unwrap());
        assert!(!db.flag_for_review("u2", "chan-1", None, "MAC mismatch", NOW).await.unwrap());
        assert!(db.get("u1", "chan-1").await.unwrap().unwrap().needs_reauth);
    }

    #[tokio::test]
    async fn test_replace_envelopes_is_compare_and_swap() {
        let (db, _temp) = setup_test_db().await;
        db.upsert_connection(&connection("u1", "chan-1", NOW), NOW).await.unwrap();

        let swapped = db
            .replace_token_envelopes("u1", "chan-1", "stale", "v1-access", None)
            .await
            .unwrap();
        assert!(!swapped);

        let swapped = db
            .replace_token_envelopes("u1", "chan-1", "env-access-chan-1", "v1-access", Some("v1-refresh"))
            .await
            .unwrap();
        assert!(swapped);

        let record = db.get("u1", "chan-1").await.unwrap().unwrap();
        assert_eq!(record.access_token, "v1-access");
        assert_eq!(record.refresh_token.as_deref(), Some("v1-refresh"));
    }

    #[tokio::test]
    async fn test_user_accounts_ordering() {
        let (db, _temp) = setup_test_db().await;
        let mut tiktok = connection("u1", "tt", NOW);
        tiktok.platform = "tiktok".to_string();
        db.upsert_connection(&tiktok, NOW).await.unwrap();
        db.upsert_connection(&connection("u1", "yt-b", NOW), NOW).await.unwrap();
        db.upsert_connection(&connection("u1", "yt-a", NOW), NOW).await.unwrap();

        let ids: Vec<_> = db
            .list_user_accounts("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["tt", "yt-a", "yt-b"]);
    }

    #[tokio::test]
    async fn test_toggles_default_disabled() {
        let (db, _temp) = setup_test_db().await;

        assert!(!db.is_enabled("agent1", "u1", "chan-1").await.unwrap());

        db.set_enabled("agent1", "u1", "chan-1", true, NOW).await.unwrap();
        db.set_enabled("agent2", "u1", "chan-1", false, NOW).await.unwrap();

        assert!(db.is_enabled("agent1", "u1", "chan-1").await.unwrap());
        assert!(!db.is_enabled("agent2", "u1", "chan-1").await.unwrap());
        assert!(!db.is_enabled("agent1", "u2", "chan-1").await.unwrap());
        assert_eq!(db.agents_for_user("u1").await.unwrap(), vec!["agent1", "agent2"]);
    }

    #[tokio::test]
    async fn test_recently_active_users() {
        let (db, _temp) = setup_test_db().await;
        db.upsert_connection(&connection("old", "a", NOW), NOW - 10_000).await.unwrap();
        db.upsert_connection(&connection("fresh", "b", NOW), NOW).await.unwrap();
        db.set_enabled("agent1", "toggler", "x", true, NOW).await.unwrap();

        let users = db.recently_active_users(NOW - 60).await.unwrap();
        assert_eq!(users, vec!["fresh", "toggler"]);
    }

    #[tokio::test]
    async fn test_lease_acquire_renew_takeover() {
        let (db, _temp) = setup_test_db().await;

        assert!(db.try_acquire_lease("refresh", "a", NOW, 90).await.unwrap());
        assert!(!db.try_acquire_lease("refresh", "b", NOW + 10, 90).await.unwrap());
        assert!(db.try_acquire_lease("refresh", "a", NOW + 30, 90).await.unwrap());
        // a's renewed lease runs to NOW + 120
        assert!(!db.try_acquire_lease("refresh", "b", NOW + 119, 90).await.unwrap());
        assert!(db.try_acquire_lease("refresh", "b", NOW + 120, 90).await.unwrap());

        db.release_lease("refresh", "a").await.unwrap();
        assert!(!db.try_acquire_lease("refresh", "a", NOW + 121, 90).await.unwrap());
        db.release_lease("refresh", "b").await.unwrap();
        assert!(db.try_acquire_lease("refresh", "a", NOW + 122, 90).await.unwrap());
    }
}
