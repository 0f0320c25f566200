//! Error types for Castvault

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CastvaultError>;

#[derive(Error, Debug)]
pub enum CastvaultError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Envelope error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Token refresh error: {0}")]
    Refresh(#[from] RefreshError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Account not found: {0}")]
    NotFound(String),

    #[error("Account {0} needs re-authorization")]
    NeedsReauth(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CastvaultError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CastvaultError::InvalidInput(_) => 3,
            CastvaultError::NeedsReauth(_) => 2,
            CastvaultError::Config(_)
            | CastvaultError::Database(_)
            | CastvaultError::Cipher(_)
            | CastvaultError::Refresh(_)
            | CastvaultError::Cache(_)
            | CastvaultError::NotFound(_)
            | CastvaultError::Io(_)
            | CastvaultError::Serialization(_) => 1,
        }
    }

    /// True for envelope failures that mean the stored record itself is unreadable
    pub fn is_unreadable_record(&self) -> bool {
        matches!(self, CastvaultError::Cipher(_))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Legacy envelope found but no legacy key is configured")]
    LegacyKeyMissing,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Failures reading an encrypted envelope
///
/// Neither variant is ever swallowed: both mean the stored record cannot be
/// read and must be looked at by a human or re-authorized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Unreadable envelope format: {0}")]
    Format(String),

    #[error("Envelope integrity check failed: {0}")]
    Integrity(String),
}

/// Failures reported while refreshing a token against an OAuth provider
///
/// Both variants drive the failure counter identically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Provider rejected refresh: {0}")]
    Provider(String),

    #[error("Transient refresh failure: {0}")]
    Transient(String),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Backend(String),

    #[error("Cache payload could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = CastvaultError::InvalidInput("empty user id".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_needs_reauth() {
        let error = CastvaultError::NeedsReauth("yt-channel-1".to_string());
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_everything_else() {
        let errors = vec![
            CastvaultError::Config(ConfigError::LegacyKeyMissing),
            CastvaultError::Cipher(CipherError::Integrity("mac".to_string())),
            CastvaultError::Refresh(RefreshError::Provider("invalid_grant".to_string())),
            CastvaultError::Cache(CacheError::Backend("down".to_string())),
            CastvaultError::NotFound("acct".to_string()),
            CastvaultError::Io(std::io::Error::other("signal registration refused")),
        ];

        for error in errors {
            assert_eq!(error.exit_code(), 1, "unexpected exit code for {:?}", error);
        }
    }

    #[test]
    fn test_runtime_failures_are_not_invalid_input() {
        let serialize: CastvaultError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(serialize.to_string().starts_with("Serialization error:"));
        assert_eq!(serialize.exit_code(), 1);

        let signal: CastvaultError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "sigaction").into();
        assert_eq!(signal.to_string(), "IO error: sigaction");
        assert_eq!(signal.exit_code(), 1);
    }

    #[test]
    fn test_error_message_formatting_integrity() {
        let error: CastvaultError = CipherError::Integrity("MAC mismatch".to_string()).into();
        assert_eq!(
            error.to_string(),
            "Envelope error: Envelope integrity check failed: MAC mismatch"
        );
    }

    #[test]
    fn test_error_message_formatting_refresh() {
        let error: CastvaultError = RefreshError::Transient("timed out after 30s".to_string()).into();
        assert_eq!(
            error.to_string(),
            "Token refresh error: Transient refresh failure: timed out after 30s"
        );
    }

    #[test]
    fn test_config_error_invalid_key_formatting() {
        let error = ConfigError::InvalidKey("master key must be 32 bytes, got 16".to_string());
        let message = format!("{}", error);
        assert!(message.contains("Invalid key material"));
        assert!(message.contains("32 bytes"));
    }

    #[test]
    fn test_unreadable_record_detection() {
        let format: CastvaultError = CipherError::Format("unknown version 0x07".to_string()).into();
        let provider: CastvaultError = RefreshError::Provider("revoked".to_string()).into();

        assert!(format.is_unreadable_record());
        assert!(!provider.is_unreadable_record());
    }

    #[test]
    fn test_refresh_error_clone() {
        // Scheduler fans errors out to both the store and the report
        let original = RefreshError::Provider("invalid_grant".to_string());
        let cloned = original.clone();
        assert_eq!(original, cloned);
    }
}
