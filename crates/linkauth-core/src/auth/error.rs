use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised while persisting or loading account credentials.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid account identifier '{0}'")]
    InvalidAccountId(String),
}

/// Errors surfaced by authentication flows, strategies, and credential management.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization canceled")]
    Canceled,
    #[error("session expired: {0}")]
    SessionExpired(String),
    #[error("{0}")]
    Failed(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("unknown authentication error")]
    Unknown,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: StatusCode, body: String },
    #[error("misconfigured authentication: {0}")]
    Misconfigured(String),
}

impl AuthError {
    /// The account needs a fresh interactive login before further calls can succeed.
    pub fn requires_login(&self) -> bool {
        matches!(self, AuthError::SessionExpired(_))
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Connection(err.to_string())
    }
}

impl From<ConfigError> for AuthError {
    fn from(err: ConfigError) -> Self {
        AuthError::Storage(StorageError::Config(err))
    }
}
