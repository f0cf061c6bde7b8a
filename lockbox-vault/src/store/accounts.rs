//! Account registration and password login.

use super::{KeyVault, now_millis, version_from_sql, version_to_sql};
use crate::error::{VaultError, VaultResult};
use duckdb::{Connection, params};
use lockbox_crypto::{
    KdfParams, Kek, KeyError, KeyVersion, Salt, WrappedKey, derive_kek, generate_wrapped_dek,
    verify_kek,
};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Stored per-user KEK inputs.
#[derive(Debug, Clone)]
pub(crate) struct Account {
    pub salt: Salt,
    pub version: KeyVersion,
    pub kdf: KdfParams,
    pub verifier: WrappedKey,
}

pub(crate) fn load_account(conn: &Connection, user_id: &str) -> VaultResult<Account> {
    let result = conn.query_row(
        "SELECT salt, key_version, kdf_json, verifier FROM lockbox_accounts WHERE user_id = ?",
        params![user_id],
        |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        },
    );

    let (salt, version, kdf_json, verifier) = match result {
        Ok(row) => row,
        Err(duckdb::Error::QueryReturnedNoRows) => {
            return Err(VaultError::UserNotFound(user_id.to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    let version = version_from_sql(version)?;
    Ok(Account {
        salt: Salt::from_slice(&salt)?,
        version,
        kdf: serde_json::from_str(&kdf_json)?,
        verifier: WrappedKey::from_bytes(version, &verifier)?,
    })
}

/// Re-derives the KEK and checks it against the account verifier.
pub(crate) fn derive_and_verify(account: &Account, password: &str) -> VaultResult<Kek> {
    let (kek, _) = derive_kek(password, Some(&account.salt), account.version, &account.kdf)?;
    if !verify_kek(&kek, &account.verifier) {
        return Err(VaultError::InvalidCredentials);
    }
    Ok(kek)
}

/// Confirms `kek` is the user's current KEK before anything is wrapped under it.
pub(crate) fn ensure_current(conn: &Connection, user_id: &str, kek: &Kek) -> VaultResult<Account> {
    let account = load_account(conn, user_id)?;
    if kek.version() != account.version {
        return Err(KeyError::KeyVersionMismatch {
            wrapped: account.version,
            kek: kek.version(),
        }
        .into());
    }
    if !verify_kek(kek, &account.verifier) {
        return Err(VaultError::InvalidCredentials);
    }
    Ok(account)
}

impl KeyVault {
    /// Creates an account and returns its first KEK.
    pub fn register(&self, user_id: &str, password: &str) -> VaultResult<Kek> {
        self.config.check_password(password)?;

        self.with_user_lock(user_id, || {
            if self.user_exists(user_id)? {
                return Err(VaultError::UserExists(user_id.to_string()));
            }

            let (kek, salt) = derive_kek(password, None, KeyVersion::INITIAL, &self.config.kdf)?;
            let (_, verifier) = generate_wrapped_dek(&kek)?;
            let kdf_json = serde_json::to_string(&self.config.kdf)?;
            let now = now_millis();

            let conn = self.lock_conn();
            conn.execute(
                "INSERT INTO lockbox_accounts (user_id, salt, key_version, kdf_json, verifier, created_at, rotated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    user_id,
                    salt.as_bytes().to_vec(),
                    version_to_sql(kek.version()),
                    kdf_json,
                    verifier.to_bytes(),
                    now,
                    now
                ],
            )?;

            info!(user_id, "registered account");
            Ok(kek)
        })
    }

    /// Password login.
    pub fn unlock(&self, user_id: &str, password: &str) -> VaultResult<Kek> {
        let account = {
            let conn = self.lock_conn();
            load_account(&conn, user_id)?
        };
        let kek = derive_and_verify(&account, password)?;
        debug!(user_id, version = kek.version().get(), "unlocked with password");
        Ok(kek)
    }

    /// [`unlock`](Self::unlock) on the blocking pool, for async callers.
    pub async fn unlock_async(&self, user_id: &str, password: &str) -> VaultResult<Kek> {
        let vault = self.clone();
        let user_id = user_id.to_string();
        let password = Zeroizing::new(password.to_string());
        tokio::task::spawn_blocking(move || vault.unlock(&user_id, &password)).await?
    }

    pub fn user_exists(&self, user_id: &str) -> VaultResult<bool> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM lockbox_accounts WHERE user_id = ?",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// The user's current KEK generation.
    pub fn key_version(&self, user_id: &str) -> VaultResult<KeyVersion> {
        let conn = self.lock_conn();
        Ok(load_account(&conn, user_id)?.version)
    }
}
