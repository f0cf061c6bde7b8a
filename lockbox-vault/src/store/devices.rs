//! Device grants: enrolment, password-less unlock and revocation.

use super::accounts::ensure_current;
use super::{KeyVault, now_millis, version_from_sql, version_to_sql};
use crate::error::{VaultError, VaultResult};
use duckdb::{Connection, params};
use lockbox_crypto::{DeviceGrant, DeviceKey, Kek, KeyVersion, enroll_device, open_device_grant};
use serde::Serialize;
use tracing::{debug, info};

/// Device metadata for listing. Carries no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub key_version: KeyVersion,
    pub enrolled_at: i64,
}

pub(crate) fn load_grants(conn: &Connection, user_id: &str) -> VaultResult<Vec<DeviceGrant>> {
    let mut stmt = conn.prepare(
        "SELECT grant_json FROM lockbox_devices WHERE user_id = ? ORDER BY device_id",
    )?;
    let rows = stmt
        .query_map(params![user_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    rows.iter()
        .map(|json| serde_json::from_str(json).map_err(VaultError::from))
        .collect()
}

fn load_grant(conn: &Connection, user_id: &str, device_id: &str) -> VaultResult<Option<DeviceGrant>> {
    let result = conn.query_row(
        "SELECT grant_json FROM lockbox_devices WHERE user_id = ? AND device_id = ?",
        params![user_id, device_id],
        |row| row.get::<_, String>(0),
    );
    match result {
        Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl KeyVault {
    /// Enrols a device from a trusted session.
    ///
    /// The returned device key must be kept on the device. Enrolling an
    /// existing `device_id` again replaces its grant, so the old device key
    /// stops working.
    pub fn enroll_device(&self, user_id: &str, device_id: &str, kek: &Kek) -> VaultResult<DeviceKey> {
        self.with_user_lock(user_id, || {
            let conn = self.lock_conn();
            ensure_current(&conn, user_id, kek)?;

            let (device_key, grant) = enroll_device(device_id, kek)?;
            conn.execute(
                "INSERT OR REPLACE INTO lockbox_devices (user_id, device_id, grant_json, key_version, enrolled_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    user_id,
                    device_id,
                    serde_json::to_string(&grant)?,
                    version_to_sql(grant.key_version()),
                    now_millis()
                ],
            )?;

            info!(user_id, device_id, "enrolled device");
            Ok(device_key)
        })
    }

    /// Obtains the current KEK on an enrolled device without the password.
    ///
    /// A revoked or unknown device gets [`VaultError::InvalidCredentials`].
    pub fn unlock_with_device(
        &self,
        user_id: &str,
        device_id: &str,
        device_key: &DeviceKey,
    ) -> VaultResult<Kek> {
        let conn = self.lock_conn();
        let grant = load_grant(&conn, user_id, device_id)?.ok_or(VaultError::InvalidCredentials)?;
        let kek = open_device_grant(&grant, device_key).map_err(|_| VaultError::InvalidCredentials)?;
        ensure_current(&conn, user_id, &kek)?;
        debug!(user_id, device_id, "unlocked with device");
        Ok(kek)
    }

    /// Deletes a device's grant. The device can't obtain this or any later KEK.
    pub fn revoke_device(&self, user_id: &str, device_id: &str) -> VaultResult<()> {
        self.with_user_lock(user_id, || {
            let conn = self.lock_conn();
            let affected = conn.execute(
                "DELETE FROM lockbox_devices WHERE user_id = ? AND device_id = ?",
                params![user_id, device_id],
            )?;
            if affected == 0 {
                return Err(VaultError::DeviceNotFound(device_id.to_string()));
            }
            info!(user_id, device_id, "revoked device");
            Ok(())
        })
    }

    pub fn list_devices(&self, user_id: &str) -> VaultResult<Vec<DeviceInfo>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT device_id, key_version, enrolled_at FROM lockbox_devices
             WHERE user_id = ? ORDER BY enrolled_at, device_id",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(device_id, version, enrolled_at)| {
                Ok(DeviceInfo {
                    device_id,
                    key_version: version_from_sql(version)?,
                    enrolled_at,
                })
            })
            .collect()
    }
}
