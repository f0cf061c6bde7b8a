//! Error types for the key store.

use lockbox_crypto::KeyError;
use thiserror::Error;

/// All errors that can occur in key store operations.
///
/// Wrong passwords, unknown recovery codes and revoked devices all surface
/// as [`VaultError::InvalidCredentials`] so callers can't tell which check
/// failed.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("user already exists: {0}")]
    UserExists(String),

    #[error("item key not found: {0}")]
    ItemNotFound(String),

    #[error("item key already exists: {0}")]
    ItemExists(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("invalid password or code")]
    InvalidCredentials,

    #[error("password too short (min {0} characters)")]
    PasswordTooShort(usize),

    #[error("recovery codes not configured")]
    RecoveryNotConfigured,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type VaultResult<T> = Result<T, VaultError>;
