//! DDL for the key store.
//!
//! Only key material lives here. Item ciphertext is stored elsewhere and
//! referenced by `item_id`.

use crate::error::VaultResult;
use duckdb::Connection;

/// One row per user: the inputs to re-derive the KEK and a verifier for it.
const ACCOUNTS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS lockbox_accounts (
    user_id VARCHAR PRIMARY KEY,
    salt BLOB NOT NULL,
    key_version BIGINT NOT NULL,
    kdf_json TEXT NOT NULL,
    verifier BLOB NOT NULL,
    created_at BIGINT NOT NULL,
    rotated_at BIGINT NOT NULL
);
"#;

/// Wrapped DEKs in their stable `nonce || ciphertext || tag` layout.
const ITEM_KEYS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS lockbox_item_keys (
    user_id VARCHAR NOT NULL,
    item_id VARCHAR NOT NULL,
    wrapped_dek BLOB NOT NULL,
    key_version BIGINT NOT NULL,
    created_at BIGINT NOT NULL,
    PRIMARY KEY (user_id, item_id)
);
"#;

const DEVICES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS lockbox_devices (
    user_id VARCHAR NOT NULL,
    device_id VARCHAR NOT NULL,
    grant_json TEXT NOT NULL,
    key_version BIGINT NOT NULL,
    enrolled_at BIGINT NOT NULL,
    PRIMARY KEY (user_id, device_id)
);
"#;

const RECOVERY_SLOTS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS lockbox_recovery_slots (
    slot_id VARCHAR PRIMARY KEY,
    user_id VARCHAR NOT NULL,
    position INTEGER NOT NULL,
    slot_json TEXT NOT NULL,
    created_at BIGINT NOT NULL
);
"#;

const RECOVERY_ESCROW_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS lockbox_recovery_escrow (
    user_id VARCHAR PRIMARY KEY,
    escrow_json TEXT NOT NULL,
    key_version BIGINT NOT NULL
);
"#;

pub(crate) fn initialize_schema(conn: &Connection) -> VaultResult<()> {
    conn.execute_batch(ACCOUNTS_DDL)?;
    conn.execute_batch(ITEM_KEYS_DDL)?;
    conn.execute_batch(DEVICES_DDL)?;
    conn.execute_batch(RECOVERY_SLOTS_DDL)?;
    conn.execute_batch(RECOVERY_ESCROW_DDL)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_name LIKE 'lockbox_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }
}
