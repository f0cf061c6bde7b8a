//! Wrapped DEK records, one per item.

use super::accounts::ensure_current;
use super::{KeyVault, now_millis, version_from_sql, version_to_sql};
use crate::error::{VaultError, VaultResult};
use duckdb::{Connection, params};
use lockbox_crypto::{Dek, Kek, WrappedKey, generate_wrapped_dek, unwrap_dek};
use tracing::debug;

pub(crate) fn load_wrapped_deks(
    conn: &Connection,
    user_id: &str,
) -> VaultResult<Vec<(String, WrappedKey)>> {
    let mut stmt = conn.prepare(
        "SELECT item_id, wrapped_dek, key_version FROM lockbox_item_keys
         WHERE user_id = ? ORDER BY item_id",
    )?;
    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(item_id, bytes, version)| {
            let wrapped = WrappedKey::from_bytes(version_from_sql(version)?, &bytes)?;
            Ok((item_id, wrapped))
        })
        .collect()
}

impl KeyVault {
    /// Creates the DEK for a new item and stores its wrapped form.
    ///
    /// Returns the plaintext DEK for encrypting the item; drop it afterwards.
    pub fn create_item_key(&self, user_id: &str, item_id: &str, kek: &Kek) -> VaultResult<Dek> {
        self.with_user_lock(user_id, || {
            let conn = self.lock_conn();
            ensure_current(&conn, user_id, kek)?;

            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM lockbox_item_keys WHERE user_id = ? AND item_id = ?",
                params![user_id, item_id],
                |row| row.get(0),
            )?;
            if exists > 0 {
                return Err(VaultError::ItemExists(item_id.to_string()));
            }

            let (dek, wrapped) = generate_wrapped_dek(kek)?;
            conn.execute(
                "INSERT INTO lockbox_item_keys (user_id, item_id, wrapped_dek, key_version, created_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    user_id,
                    item_id,
                    wrapped.to_bytes(),
                    version_to_sql(wrapped.key_version),
                    now_millis()
                ],
            )?;

            debug!(user_id, item_id, "created item key");
            Ok(dek)
        })
    }

    /// Unwraps an item's DEK.
    pub fn open_item_key(&self, user_id: &str, item_id: &str, kek: &Kek) -> VaultResult<Dek> {
        let wrapped = {
            let conn = self.lock_conn();
            let result = conn.query_row(
                "SELECT wrapped_dek, key_version FROM lockbox_item_keys WHERE user_id = ? AND item_id = ?",
                params![user_id, item_id],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
            );
            match result {
                Ok((bytes, version)) => WrappedKey::from_bytes(version_from_sql(version)?, &bytes)?,
                Err(duckdb::Error::QueryReturnedNoRows) => {
                    return Err(VaultError::ItemNotFound(item_id.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        };
        Ok(unwrap_dek(&wrapped, kek)?)
    }

    /// Deletes one item's wrapped DEK, which crypto-erases that item alone.
    pub fn delete_item_key(&self, user_id: &str, item_id: &str) -> VaultResult<()> {
        self.with_user_lock(user_id, || {
            let conn = self.lock_conn();
            let affected = conn.execute(
                "DELETE FROM lockbox_item_keys WHERE user_id = ? AND item_id = ?",
                params![user_id, item_id],
            )?;
            if affected == 0 {
                return Err(VaultError::ItemNotFound(item_id.to_string()));
            }
            debug!(user_id, item_id, "deleted item key");
            Ok(())
        })
    }

    pub fn list_item_ids(&self, user_id: &str) -> VaultResult<Vec<String>> {
        let conn = self.lock_conn();
        let mut stmt =
            conn.prepare("SELECT item_id FROM lockbox_item_keys WHERE user_id = ? ORDER BY item_id")?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}
