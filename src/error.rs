use thiserror::Error;

use crate::audit::actions::FailureCause;

impl From<serde_json::Error> for ProtectedLogError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for ProtectedLogError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(format!("Database error: {}", err))
    }
}

impl From<std::io::Error> for ProtectedLogError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<config::ConfigError> for ProtectedLogError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ProtectedLogError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Signing token unavailable: {0}")]
    TokenUnavailable(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Integrity anomaly {cause}: {detail}")]
    Integrity { cause: FailureCause, detail: String },

    #[error("Operation rejected: {0}")]
    Misuse(String),
}

impl ProtectedLogError {
    pub fn integrity(cause: FailureCause, detail: impl Into<String>) -> Self {
        Self::Integrity {
            cause,
            detail: detail.into(),
        }
    }

    pub fn misuse(msg: impl Into<String>) -> Self {
        Self::Misuse(msg.into())
    }

    /// True for failures that left no state behind and may simply be retried.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Io(_) | Self::TokenUnavailable(_) | Self::Crypto(_)
        )
    }
}

pub type Result<T, E = ProtectedLogError> = std::result::Result<T, E>;
