//! DuckDB key-record store for Lockbox.
//!
//! Persists what the key hierarchy needs between sessions: per-user salt,
//! key version and KDF parameters, wrapped DEKs, device grants, recovery
//! slots and the recovery escrow. Plaintext keys never reach the database.
//!
//! Multi-step flows (password change, recovery, erasure) are written in a
//! single transaction and serialized per user, so a reader never sees some
//! items under the old KEK and some under the new one.

mod config;
mod error;
mod schema;
mod store;

pub use config::VaultConfig;
pub use error::{VaultError, VaultResult};
pub use store::{DeviceInfo, KeyVault};

