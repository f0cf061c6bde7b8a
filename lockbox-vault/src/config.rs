//! Key store configuration.

use crate::error::{VaultError, VaultResult};
use lockbox_crypto::{DEFAULT_RECOVERY_CODE_COUNT, KdfParams};
use serde::{Deserialize, Serialize};

/// Settings for a [`KeyVault`](crate::KeyVault).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Argon2id cost for new accounts, password changes and recovery codes.
    /// Existing accounts keep the parameters they were created with until
    /// their next password change.
    pub kdf: KdfParams,
    /// Codes issued per recovery batch.
    pub recovery_code_count: usize,
    /// Minimum password length in characters.
    pub min_password_len: usize,
    /// Accept KDF parameters below the production floor. Tests only.
    pub allow_weak_kdf: bool,
    /// DuckDB `memory_limit` for file-backed stores.
    pub memory_limit: String,
    /// DuckDB worker threads for file-backed stores.
    pub threads: u32,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            recovery_code_count: DEFAULT_RECOVERY_CODE_COUNT,
            min_password_len: 8,
            allow_weak_kdf: false,
            memory_limit: "64MB".to_string(),
            threads: 1,
        }
    }
}

impl VaultConfig {
    /// Cheap KDF settings for tests.
    pub fn for_tests() -> Self {
        Self {
            kdf: KdfParams::insecure_for_tests(),
            allow_weak_kdf: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> VaultResult<()> {
        if !self.allow_weak_kdf {
            self.kdf
                .validate_production()
                .map_err(|e| VaultError::Config(e.to_string()))?;
        }
        if self.recovery_code_count == 0 {
            return Err(VaultError::Config(
                "recovery_code_count must be at least 1".into(),
            ));
        }
        if self.min_password_len == 0 {
            return Err(VaultError::Config("min_password_len must be at least 1".into()));
        }
        if self.threads == 0 {
            return Err(VaultError::Config("threads must be at least 1".into()));
        }
        let limit_ok = self
            .memory_limit
            .strip_suffix("MB")
            .or_else(|| self.memory_limit.strip_suffix("GB"))
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
        if !limit_ok {
            return Err(VaultError::Config(format!(
                "memory_limit must look like 64MB or 1GB, got {:?}",
                self.memory_limit
            )));
        }
        Ok(())
    }

    pub(crate) fn check_password(&self, password: &str) -> VaultResult<()> {
        if password.chars().count() < self.min_password_len {
            return Err(VaultError::PasswordTooShort(self.min_password_len));
        }
        Ok(())
    }
}
