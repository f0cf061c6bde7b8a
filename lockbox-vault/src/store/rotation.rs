//! Password change: KEK rotation persisted as one unit.

use super::accounts::{derive_and_verify, ensure_current, load_account};
use super::devices::load_grants;
use super::items::load_wrapped_deks;
use super::recovery::load_escrow;
use super::{KeyVault, in_transaction, now_millis, version_to_sql};
use crate::error::{VaultError, VaultResult};
use duckdb::params;
use lockbox_crypto::{
    Kek, RotationMode, WrappedKey, generate_wrapped_dek, reissue_device_grants,
    reseal_recovery_escrow, rotate_kek,
};
use tracing::info;

impl KeyVault {
    /// Changes a user's password and rotates their KEK to the next version.
    ///
    /// Every wrapped DEK, device grant and the recovery escrow move to the new
    /// KEK in one transaction. Item ciphertext is untouched.
    pub fn change_password(
        &self,
        user_id: &str,
        old_password: &str,
        new_password: &str,
    ) -> VaultResult<Kek> {
        self.config.check_password(new_password)?;

        self.with_user_lock(user_id, || {
            let account = {
                let conn = self.lock_conn();
                load_account(&conn, user_id)?
            };
            let old = derive_and_verify(&account, old_password)?;
            self.rotate_account(user_id, &old, new_password, None)
        })
    }

    /// Rotates from `old` to a KEK derived from `new_password`.
    ///
    /// `consume_slot` deletes a recovery slot in the same transaction. Caller
    /// must hold the user lock.
    pub(crate) fn rotate_account(
        &self,
        user_id: &str,
        old: &Kek,
        new_password: &str,
        consume_slot: Option<&str>,
    ) -> VaultResult<Kek> {
        let (items, grants, escrow) = {
            let conn = self.lock_conn();
            ensure_current(&conn, user_id, old)?;
            (
                load_wrapped_deks(&conn, user_id)?,
                load_grants(&conn, user_id)?,
                load_escrow(&conn, user_id)?,
            )
        };

        // Argon2id and re-wrapping run without the connection held.
        let wrapped: Vec<WrappedKey> = items.iter().map(|(_, w)| w.clone()).collect();
        let outcome = rotate_kek(
            old,
            RotationMode::PasswordChange {
                new_secret: new_password,
                params: &self.config.kdf,
            },
            &wrapped,
        )?;
        let new = outcome.kek;
        let salt = outcome
            .salt
            .ok_or_else(|| VaultError::Corrupt("password rotation produced no salt".into()))?;
        let reissued = reissue_device_grants(old, &new, &grants)?;
        let resealed = escrow
            .as_ref()
            .map(|e| reseal_recovery_escrow(e, old, &new))
            .transpose()?;
        let (_, verifier) = generate_wrapped_dek(&new)?;
        let kdf_json = serde_json::to_string(&self.config.kdf)?;
        let version = version_to_sql(new.version());

        let conn = self.lock_conn();
        in_transaction(&conn, |tx| {
            for ((item_id, _), rewrapped) in items.iter().zip(&outcome.wrapped) {
                tx.execute(
                    "UPDATE lockbox_item_keys SET wrapped_dek = ?, key_version = ?
                     WHERE user_id = ? AND item_id = ?",
                    params![rewrapped.to_bytes(), version, user_id, item_id],
                )?;
            }
            for grant in &reissued {
                tx.execute(
                    "UPDATE lockbox_devices SET grant_json = ?, key_version = ?
                     WHERE user_id = ? AND device_id = ?",
                    params![serde_json::to_string(grant)?, version, user_id, grant.device_id],
                )?;
            }
            if let Some(escrow) = &resealed {
                tx.execute(
                    "UPDATE lockbox_recovery_escrow SET escrow_json = ?, key_version = ? WHERE user_id = ?",
                    params![serde_json::to_string(escrow)?, version, user_id],
                )?;
            }
            if let Some(slot_id) = consume_slot {
                tx.execute(
                    "DELETE FROM lockbox_recovery_slots WHERE slot_id = ?",
                    params![slot_id],
                )?;
            }
            tx.execute(
                "UPDATE lockbox_accounts SET salt = ?, key_version = ?, kdf_json = ?, verifier = ?, rotated_at = ?
                 WHERE user_id = ?",
                params![
                    salt.as_bytes().to_vec(),
                    version,
                    kdf_json,
                    verifier.to_bytes(),
                    now_millis(),
                    user_id
                ],
            )?;
            Ok(())
        })?;

        info!(
            user_id,
            from = old.version().get(),
            to = new.version().get(),
            items = items.len(),
            devices = reissued.len(),
            "rotated key-encryption key"
        );
        Ok(new)
    }
}
