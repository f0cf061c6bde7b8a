//! Thread-safe key store backed by DuckDB.
//!
//! Two levels of locking:
//! - a per-user mutex held across every read-compute-write on that user's
//!   key material, so Argon2id can run without holding the connection while
//!   a concurrent rotation still can't interleave;
//! - the connection mutex, held only for the SQL itself.
//!
//! The per-user lock is always taken first.

mod accounts;
mod devices;
mod erasure;
mod items;
mod recovery;
mod rotation;

pub use devices::DeviceInfo;

use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};
use crate::schema::initialize_schema;
use chrono::Utc;
use duckdb::Connection;
use lockbox_crypto::{KeyVersion, kdf_self_test};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Key-record store for many users sharing one database.
#[derive(Clone)]
pub struct KeyVault {
    conn: Arc<Mutex<Connection>>,
    config: Arc<VaultConfig>,
    user_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl KeyVault {
    /// Open (or create) a key store at the given path.
    pub fn open(path: &Path, config: VaultConfig) -> VaultResult<Self> {
        config.validate()?;
        let conn = Connection::open(path)?;
        // Cap memory/threads; DuckDB defaults to ~80% RAM per connection.
        conn.execute_batch(&format!(
            "PRAGMA memory_limit='{}'; PRAGMA threads={};",
            config.memory_limit, config.threads
        ))?;
        Self::from_connection(conn, config)
    }

    /// Open an in-memory key store (for testing).
    pub fn open_in_memory(config: VaultConfig) -> VaultResult<Self> {
        config.validate()?;
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, config)
    }

    fn from_connection(conn: Connection, config: VaultConfig) -> VaultResult<Self> {
        kdf_self_test(&config.kdf)?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config: Arc::new(config),
            user_locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Acquire the connection lock, recovering from poison.
    pub(crate) fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("recovering from poisoned connection mutex");
            poisoned.into_inner()
        })
    }

    /// Runs `f` while holding `user_id`'s lock.
    ///
    /// The map entry lives only while some caller holds a clone of it, so
    /// unknown ids don't accumulate and every concurrent caller for one user
    /// shares the same mutex.
    pub(crate) fn with_user_lock<T>(
        &self,
        user_id: &str,
        f: impl FnOnce() -> VaultResult<T>,
    ) -> VaultResult<T> {
        let lock = {
            let mut locks = self.lock_user_map();
            locks.entry(user_id.to_string()).or_default().clone()
        };
        let result = {
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f()
        };

        let mut locks = self.lock_user_map();
        // Map plus this caller; clones only come out of the map under its lock.
        if Arc::strong_count(&lock) == 2
            && locks.get(user_id).is_some_and(|held| Arc::ptr_eq(held, &lock))
        {
            locks.remove(user_id);
        }
        result
    }

    fn lock_user_map(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.user_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs `f` inside `BEGIN TRANSACTION` / `COMMIT`, rolling back on error.
pub(crate) fn in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> VaultResult<T>,
) -> VaultResult<T> {
    conn.execute_batch("BEGIN TRANSACTION")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

pub(crate) fn version_to_sql(version: KeyVersion) -> i64 {
    i64::from(version.get())
}

pub(crate) fn version_from_sql(raw: i64) -> VaultResult<KeyVersion> {
    u32::try_from(raw)
        .map(KeyVersion::new)
        .map_err(|_| VaultError::Corrupt(format!("key version {raw} out of range")))
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
