//! Error types for the key engine.

use crate::key::KeyVersion;
use thiserror::Error;

/// Result type for key engine operations.
pub type KeyResult<T> = Result<T, KeyError>;

/// Errors raised by the key hierarchy.
///
/// `DecryptionFailed` carries no detail: a wrong key, a flipped
/// ciphertext bit and a forged tag all look the same to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("key rotation aborted at entry {index}")]
    RotationFailed { index: usize },

    #[error("not found")]
    NotFound,

    #[error("key version mismatch: material wrapped under v{wrapped}, key is v{kek}")]
    KeyVersionMismatch { wrapped: KeyVersion, kek: KeyVersion },

    #[error("invalid key version: current v{current}, proposed v{proposed}")]
    InvalidKeyVersion {
        current: KeyVersion,
        proposed: KeyVersion,
    },

    #[error("malformed blob: {0}")]
    MalformedBlob(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("invalid recovery code format")]
    InvalidRecoveryCode,

    #[error("self-test failed: {0}")]
    SelfTestFailed(String),

    #[error("crypto-erasure incomplete: {0} not reported as erased")]
    ErasureIncomplete(String),
}

impl KeyError {
    /// Whether this error is an authentication-relevant signal for alerting:
    /// a failed cryptographic check, or a lookup for key material that
    /// does not exist.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            KeyError::DecryptionFailed | KeyError::RotationFailed { .. } | KeyError::NotFound
        )
    }
}
