//! Crypto-erasure of a whole user.

use super::accounts::load_account;
use super::{KeyVault, in_transaction};
use crate::error::{VaultError, VaultResult};
use duckdb::params;
use lockbox_crypto::{ErasureReport, KeyMaterialStore, MaterialKind};

fn delete_sql(kind: MaterialKind) -> &'static str {
    match kind {
        MaterialKind::AccountSalt => "DELETE FROM lockbox_accounts WHERE user_id = ?",
        MaterialKind::WrappedDataKeys => "DELETE FROM lockbox_item_keys WHERE user_id = ?",
        MaterialKind::DeviceGrants => "DELETE FROM lockbox_devices WHERE user_id = ?",
        MaterialKind::RecoverySlots => "DELETE FROM lockbox_recovery_slots WHERE user_id = ?",
        MaterialKind::RecoveryEscrow => "DELETE FROM lockbox_recovery_escrow WHERE user_id = ?",
    }
}

impl KeyMaterialStore for KeyVault {
    type Error = VaultError;

    fn erase_material(&self, user_id: &str, kinds: &[MaterialKind]) -> VaultResult<ErasureReport> {
        self.with_user_lock(user_id, || {
            let conn = self.lock_conn();
            load_account(&conn, user_id)?;

            in_transaction(&conn, |tx| {
                let mut report = ErasureReport::new(user_id);
                for kind in kinds {
                    let removed = tx.execute(delete_sql(*kind), params![user_id])?;
                    report.record(*kind, removed as u64);
                }
                Ok(report)
            })
        })
    }
}

impl KeyVault {
    /// Destroys every piece of key material for `user_id`.
    ///
    /// Item ciphertext held elsewhere becomes permanently unreadable: no
    /// password, device key or recovery code can reach a DEK afterwards.
    pub fn crypto_erase(&self, user_id: &str) -> VaultResult<ErasureReport> {
        lockbox_crypto::crypto_erase(self, user_id)
    }
}
