//! Recovery codes for a forgotten password.
//!
//! Slots are stored one row each under a random `slot_id`; using a code
//! deletes its row in the same transaction that installs the new password.

use super::accounts::{ensure_current, load_account};
use super::{KeyVault, in_transaction, now_millis, version_to_sql};
use crate::error::{VaultError, VaultResult};
use duckdb::{Connection, params};
use lockbox_crypto::{
    Kek, KeyError, RecoveryCode, RecoveryEscrow, RecoverySlot, create_recovery_kit, recover_kek,
};
use tracing::{info, warn};
use uuid::Uuid;

pub(crate) fn load_escrow(conn: &Connection, user_id: &str) -> VaultResult<Option<RecoveryEscrow>> {
    let result = conn.query_row(
        "SELECT escrow_json FROM lockbox_recovery_escrow WHERE user_id = ?",
        params![user_id],
        |row| row.get::<_, String>(0),
    );
    match result {
        Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn load_slots(conn: &Connection, user_id: &str) -> VaultResult<(Vec<String>, Vec<RecoverySlot>)> {
    let mut stmt = conn.prepare(
        "SELECT slot_id, slot_json FROM lockbox_recovery_slots WHERE user_id = ? ORDER BY position",
    )?;
    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut ids = Vec::with_capacity(rows.len());
    let mut slots = Vec::with_capacity(rows.len());
    for (id, json) in rows {
        ids.push(id);
        slots.push(serde_json::from_str(&json)?);
    }
    Ok((ids, slots))
}

impl KeyVault {
    /// Issues a fresh batch of recovery codes, replacing any earlier batch.
    ///
    /// The plaintext codes are returned once and never stored.
    pub fn setup_recovery(&self, user_id: &str, kek: &Kek) -> VaultResult<Vec<RecoveryCode>> {
        self.with_user_lock(user_id, || {
            {
                let conn = self.lock_conn();
                ensure_current(&conn, user_id, kek)?;
            }

            let kit = create_recovery_kit(kek, self.config.recovery_code_count, &self.config.kdf)?;
            let now = now_millis();

            let conn = self.lock_conn();
            in_transaction(&conn, |tx| {
                tx.execute(
                    "DELETE FROM lockbox_recovery_slots WHERE user_id = ?",
                    params![user_id],
                )?;
                for (position, slot) in kit.slots.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO lockbox_recovery_slots (slot_id, user_id, position, slot_json, created_at)
                         VALUES (?, ?, ?, ?, ?)",
                        params![
                            Uuid::new_v4().to_string(),
                            user_id,
                            position as i32,
                            serde_json::to_string(slot)?,
                            now
                        ],
                    )?;
                }
                tx.execute(
                    "INSERT OR REPLACE INTO lockbox_recovery_escrow (user_id, escrow_json, key_version)
                     VALUES (?, ?, ?)",
                    params![
                        user_id,
                        serde_json::to_string(&kit.escrow)?,
                        version_to_sql(kit.escrow.key_version())
                    ],
                )?;
                Ok(())
            })?;

            info!(user_id, count = kit.slots.len(), "issued recovery codes");
            Ok(kit.codes)
        })
    }

    /// Unused codes left for the user.
    pub fn remaining_recovery_codes(&self, user_id: &str) -> VaultResult<usize> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM lockbox_recovery_slots WHERE user_id = ?",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Resets a forgotten password with a recovery code.
    ///
    /// Recovers the KEK, rotates to a KEK derived from `new_password` and
    /// consumes the code, all or nothing. Malformed, unknown and already
    /// used codes all yield [`VaultError::InvalidCredentials`].
    pub fn recover_with_code(
        &self,
        user_id: &str,
        code: &str,
        new_password: &str,
    ) -> VaultResult<Kek> {
        self.config.check_password(new_password)?;
        let code = RecoveryCode::parse(code).map_err(|_| VaultError::InvalidCredentials)?;

        self.with_user_lock(user_id, || {
            let (ids, slots, escrow) = {
                let conn = self.lock_conn();
                load_account(&conn, user_id)?;
                let escrow = load_escrow(&conn, user_id)?.ok_or(VaultError::RecoveryNotConfigured)?;
                let (ids, slots) = load_slots(&conn, user_id)?;
                (ids, slots, escrow)
            };

            let (index, kek) = recover_kek(&code, &slots, &escrow).map_err(|e| match e {
                KeyError::NotFound => VaultError::InvalidCredentials,
                other => other.into(),
            })?;
            let slot_id = ids.get(index).ok_or(VaultError::InvalidCredentials)?;

            warn!(
                user_id,
                remaining = slots.len() - 1,
                "recovery code used to reset password"
            );
            self.rotate_account(user_id, &kek, new_password, Some(slot_id))
        })
    }
}
