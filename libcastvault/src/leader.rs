//! Deciding which process runs the refresh scheduler
//!
//! Exactly one refresher should be active per credential database. Two
//! strategies are provided: a static designated worker index, and a TTL
//! lease row that any process can take over once the holder stops renewing.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{LeaderConfig, LeaderMode};
use crate::db::Database;
use crate::error::Result;

/// Lease row name used by the refresh scheduler
pub const REFRESH_LEASE: &str = "token-refresh";

#[async_trait]
pub trait LeaderElection: Send + Sync {
    /// Whether this process should run the current cycle
    ///
    /// Called at the top of every cycle; lease-based implementations renew
    /// their lease here.
    async fn is_leader(&self, now: i64) -> Result<bool>;

    /// Give up leadership on shutdown
    async fn resign(&self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String;
}

/// Leader iff this process's worker index is the designated one
#[derive(Debug, Clone)]
pub struct StaticWorker {
    worker_index: Option<u32>,
    designated: u32,
}

impl StaticWorker {
    pub fn new(worker_index: Option<u32>, designated: u32) -> Self {
        Self {
            worker_index,
            designated,
        }
    }

    /// A single-process deployment: always leader
    pub fn always() -> Self {
        Self::new(Some(1), 1)
    }
}

#[async_trait]
impl LeaderElection for StaticWorker {
    async fn is_leader(&self, _now: i64) -> Result<bool> {
        Ok(self.worker_index == Some(self.designated))
    }

    fn describe(&self) -> String {
        match self.worker_index {
            Some(index) => format!("static worker {} (designated {})", index, self.designated),
            None => format!("static worker unset (designated {})", self.designated),
        }
    }
}

/// TTL lease held in the `scheduler_leases` table
pub struct LeaseElection {
    db: Database,
    name: String,
    holder: String,
    ttl_secs: i64,
}

impl LeaseElection {
    pub fn new(db: Database, name: &str, ttl_secs: u64) -> Self {
        Self {
            db,
            name: name.to_string(),
            holder: uuid::Uuid::new_v4().to_string(),
            ttl_secs: ttl_secs as i64,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

#[async_trait]
impl LeaderElection for LeaseElection {
    async fn is_leader(&self, now: i64) -> Result<bool> {
        let acquired = self
            .db
            .try_acquire_lease(&self.name, &self.holder, now, self.ttl_secs)
            .await?;
        if !acquired {
            tracing::debug!(lease = %self.name, "Lease held by another process");
        }
        Ok(acquired)
    }

    async fn resign(&self) -> Result<()> {
        self.db.release_lease(&self.name, &self.holder).await?;
        tracing::info!(lease = %self.name, holder = %self.holder, "Released scheduler lease");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("lease '{}' as {}", self.name, self.holder)
    }
}

/// Build the election strategy selected in config
pub fn from_config(
    config: &LeaderConfig,
    db: &Database,
    worker_index: Option<u32>,
) -> Arc<dyn LeaderElection> {
    match config.mode {
        LeaderMode::Static => Arc::new(StaticWorker::new(worker_index, config.designated_worker)),
        LeaderMode::Lease => Arc::new(LeaseElection::new(db.clone(), REFRESH_LEASE, config.lease_ttl_secs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NOW: i64 = 1_700_000_000;

    #[tokio::test]
    async fn test_static_worker() {
        assert!(StaticWorker::new(Some(1), 1).is_leader(NOW).await.unwrap());
        assert!(!StaticWorker::new(Some(2), 1).is_leader(NOW).await.unwrap());
        assert!(!StaticWorker::new(None, 1).is_leader(NOW).await.unwrap());
        assert!(StaticWorker::always().is_leader(NOW).await.unwrap());
    }

    #[tokio::test]
    async fn test_only_one_lease_holder() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(temp_dir.path().join("leader.db").to_str().unwrap())
            .await
            .unwrap();

        let first = LeaseElection::new(db.clone(), REFRESH_LEASE, 90);
        let second = LeaseElection::new(db.clone(), REFRESH_LEASE, 90);

        assert!(first.is_leader(NOW).await.unwrap());
        assert!(!second.is_leader(NOW + 1).await.unwrap());
        assert!(first.is_leader(NOW + 60).await.unwrap());

        // First stops renewing; second takes over after expiry
        assert!(second.is_leader(NOW + 150).await.unwrap());
        assert!(!first.is_leader(NOW + 151).await.unwrap());

        second.resign().await.unwrap();
        assert!(first.is_leader(NOW + 152).await.unwrap());
    }

    #[tokio::test]
    async fn test_from_config_selects_mode() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(temp_dir.path().join("leader.db").to_str().unwrap())
            .await
            .unwrap();

        let config = LeaderConfig::default();
        let election = from_config(&config, &db, Some(3));
        assert!(!election.is_leader(NOW).await.unwrap());
        assert!(election.describe().contains("static worker 3"));

        let config = LeaderConfig {
            mode: LeaderMode::Lease,
            ..LeaderConfig::default()
        };
        let election = from_config(&config, &db, None);
        assert!(election.is_leader(NOW).await.unwrap());
    }
}
