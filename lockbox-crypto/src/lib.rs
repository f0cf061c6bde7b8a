//! Key hierarchy and envelope encryption for Lockbox.
//!
//! Provides the cryptographic core using:
//! - Argon2id for key derivation from passwords and recovery codes
//! - ChaCha20-Poly1305 for authenticated encryption
//! - Key material that is zeroized on drop
//!
//! # Architecture
//!
//! Keys form a two-tier hierarchy:
//!
//! 1. **KEK**: Derived from the user's password with Argon2id and a per-user
//!    salt. Never stored; it is re-derived at login, or unwrapped from a
//!    device grant or the recovery escrow.
//!
//! 2. **DEK**: A random key per item. Only its KEK-wrapped form is stored,
//!    next to the item ciphertext.
//!
//! This allows:
//! - Rotating the KEK by re-wrapping DEKs, without touching item ciphertext
//! - Adding devices and recovery codes that each unlock the same KEK
//! - Crypto-erasure: destroying the salt and wrapped keys makes every
//!   ciphertext of the user unreadable
//!
//! Everything here is pure computation over explicit inputs. Persistence,
//! transactions and per-user serialization belong to the caller.

mod cipher;
pub mod device;
pub mod envelope;
pub mod erasure;
mod error;
pub mod item;
mod key;
pub mod recovery;
pub mod rotation;

pub use cipher::{
    EncryptedBlob, NONCE_SIZE, TAG_SIZE, decrypt, decrypt_with_aad, encrypt, encrypt_with_aad,
};
pub use device::{
    DeviceGrant, enroll_device, open_device_grant, reissue_device_grants,
    unwrap_device_key_with_kek, unwrap_kek_with_device_key, wrap_device_key_with_kek,
    wrap_kek_with_device_key,
};
pub use envelope::{WrappedKey, generate_wrapped_dek, unwrap_dek, verify_kek, wrap_dek};
pub use erasure::{ErasureReport, KeyMaterialStore, MaterialKind, crypto_erase};
pub use error::{KeyError, KeyResult};
pub use item::{EncryptedItem, decrypt_payload, encrypt_payload, open_item, seal_item};
pub use key::{
    Dek, DeviceKey, KEY_SIZE, KdfParams, Kek, KeyVersion, RecoveryKey, SALT_SIZE, Salt,
    SymmetricKey, derive_kek, derive_key_bytes, kdf_self_test,
};
pub use recovery::{
    DEFAULT_RECOVERY_CODE_COUNT, RecoveryCode, RecoveryCodeHash, RecoveryEscrow, RecoveryKit,
    RecoverySlot, create_recovery_kit, generate_recovery_codes, hash_recovery_code,
    recover_kek, reseal_recovery_escrow, verify_against_set, verify_recovery_code,
};
pub use rotation::{RotationMode, RotationOutcome, rotate, rotate_kek};
