//! Crypto-erasure.
//!
//! A user's data is gone once nothing can rebuild their KEK or open a DEK:
//! the account salt and key version, every wrapped DEK, every device grant,
//! every recovery slot and the recovery escrow. Ciphertext rows may still
//! exist afterwards; they are unreadable.
//!
//! This module defines what has to be destroyed. Deleting the rows is the
//! store's job, through [`KeyMaterialStore`].

use crate::error::KeyError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// A class of stored key material belonging to one user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialKind {
    /// Salt, key version and password verifier.
    AccountSalt,
    WrappedDataKeys,
    DeviceGrants,
    RecoverySlots,
    RecoveryEscrow,
}

impl MaterialKind {
    /// Everything that must go for an erasure to be complete.
    pub const ALL: &'static [MaterialKind] = &[
        MaterialKind::AccountSalt,
        MaterialKind::WrappedDataKeys,
        MaterialKind::DeviceGrants,
        MaterialKind::RecoverySlots,
        MaterialKind::RecoveryEscrow,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MaterialKind::AccountSalt => "account_salt",
            MaterialKind::WrappedDataKeys => "wrapped_data_keys",
            MaterialKind::DeviceGrants => "device_grants",
            MaterialKind::RecoverySlots => "recovery_slots",
            MaterialKind::RecoveryEscrow => "recovery_escrow",
        }
    }
}

/// What a store removed, per kind. A kind with zero rows is still present.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureReport {
    pub user_id: String,
    pub removed: BTreeMap<MaterialKind, u64>,
}

impl ErasureReport {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            removed: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, kind: MaterialKind, count: u64) {
        *self.removed.entry(kind).or_default() += count;
    }

    /// Total rows removed across all kinds.
    pub fn total(&self) -> u64 {
        self.removed.values().sum()
    }

    /// The first required kind the store didn't report, if any.
    pub fn missing(&self) -> Option<MaterialKind> {
        MaterialKind::ALL
            .iter()
            .copied()
            .find(|kind| !self.removed.contains_key(kind))
    }

    pub fn covers_all(&self) -> bool {
        self.missing().is_none()
    }
}

/// Storage that can destroy a user's key material.
///
/// Implementations should remove all requested kinds atomically and report
/// each one, including kinds for which nothing was stored.
pub trait KeyMaterialStore {
    type Error: From<KeyError>;

    fn erase_material(
        &self,
        user_id: &str,
        kinds: &[MaterialKind],
    ) -> Result<ErasureReport, Self::Error>;
}

/// Crypto-erases one user.
///
/// Fails with [`KeyError::ErasureIncomplete`] if the store didn't account for
/// every kind of material.
pub fn crypto_erase<S>(store: &S, user_id: &str) -> Result<ErasureReport, S::Error>
where
    S: KeyMaterialStore + ?Sized,
{
    let report = store.erase_material(user_id, MaterialKind::ALL)?;
    if let Some(kind) = report.missing() {
        warn!(user_id, kind = kind.as_str(), "erasure report is incomplete");
        return Err(KeyError::ErasureIncomplete(kind.as_str().to_string()).into());
    }

    info!(user_id, removed = report.total(), "crypto-erased key material");
    Ok(report)
}
