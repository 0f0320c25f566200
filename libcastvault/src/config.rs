//! Configuration management for Castvault

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, Result};

pub const CONFIG_ENV: &str = "CASTVAULT_CONFIG";
pub const WORKER_INDEX_ENV: &str = "CASTVAULT_WORKER_INDEX";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// OAuth token endpoints keyed by platform name ("youtube", "tiktok", ...)
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Names of the environment variables holding key material
///
/// Keys themselves never live in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    #[serde(default = "default_master_key_env")]
    pub master_key_env: String,
    #[serde(default = "default_legacy_key_env")]
    pub legacy_key_env: String,
}

fn default_master_key_env() -> String {
    "CASTVAULT_MASTER_KEY".to_string()
}

fn default_legacy_key_env() -> String {
    "CASTVAULT_LEGACY_KEY".to_string()
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            master_key_env: default_master_key_env(),
            legacy_key_env: default_legacy_key_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Seconds between scheduler cycles
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Tokens expiring within this many seconds are refreshed
    #[serde(default = "default_lookahead_secs")]
    pub lookahead_secs: u64,
    /// Consecutive failures before an account needs re-authorization
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Sleep after a cycle that failed as a whole
    #[serde(default = "default_error_cooldown_secs")]
    pub error_cooldown_secs: u64,
    /// Timeout for a single provider call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Refresh attempts in flight per cycle
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// How long a claimed row stays locked if the claimer dies mid-refresh
    ///
    /// Must exceed `request_timeout_secs`, or a slow provider call outlives
    /// its own claim.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default)]
    pub leader: LeaderConfig,
}

fn default_interval_secs() -> u64 {
    300
}

fn default_lookahead_secs() -> u64 {
    600
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_error_cooldown_secs() -> u64 {
    900
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    8
}

fn default_lease_secs() -> u64 {
    120
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            lookahead_secs: default_lookahead_secs(),
            failure_threshold: default_failure_threshold(),
            error_cooldown_secs: default_error_cooldown_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_concurrency: default_max_concurrency(),
            lease_secs: default_lease_secs(),
            leader: LeaderConfig::default(),
        }
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Check values that would make the scheduler misbehave silently
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(invalid("refresh.failure_threshold must be at least 1"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("refresh.max_concurrency must be at least 1"));
        }
        if self.interval_secs == 0 {
            return Err(invalid("refresh.interval_secs must be at least 1"));
        }
        if self.lease_secs <= self.request_timeout_secs {
            return Err(invalid(format!(
                "refresh.lease_secs ({}) must exceed refresh.request_timeout_secs ({})",
                self.lease_secs, self.request_timeout_secs
            )));
        }
        // The lease is renewed once per cycle
        if self.leader.mode == LeaderMode::Lease && self.leader.lease_ttl_secs <= self.interval_secs {
            return Err(invalid(format!(
                "refresh.leader.lease_ttl_secs ({}) must exceed refresh.interval_secs ({})",
                self.leader.lease_ttl_secs, self.interval_secs
            )));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> crate::error::CastvaultError {
    ConfigError::InvalidValue(message.into()).into()
}

/// How the refresh daemon decides whether it is the one that runs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LeaderMode {
    /// Worker index from the environment must match `designated_worker`
    #[default]
    Static,
    /// TTL lease row in the database
    Lease,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderConfig {
    #[serde(default)]
    pub mode: LeaderMode,
    #[serde(default = "default_designated_worker")]
    pub designated_worker: u32,
    /// Renewed at the start of every cycle, so it must outlast the interval
    /// between cycles
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

fn default_designated_worker() -> u32 {
    1
}

/// Two and a half default intervals, leaving room for a slow cycle
fn default_lease_ttl_secs() -> u64 {
    750
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            mode: LeaderMode::Static,
            designated_worker: default_designated_worker(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// OAuth 2.0 token endpoint for one platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub token_url: String,
    pub client_id: String,
    /// Environment variable holding the client secret
    pub client_secret_env: String,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.refresh.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/castvault/credentials.db".to_string(),
            },
            crypto: CryptoConfig::default(),
            refresh: RefreshConfig::default(),
            cache: CacheConfig::default(),
            providers: HashMap::new(),
        }
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("castvault").join("config.toml"))
}

/// Worker index of this process, if the deployment sets one
pub fn worker_index_from_env() -> Option<u32> {
    std::env::var(WORKER_INDEX_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}
