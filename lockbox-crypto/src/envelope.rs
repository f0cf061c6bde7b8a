//! Envelope encryption: per-item DEKs wrapped by the user's KEK.
//!
//! Wrapping is a thin application of the AEAD cipher with the KEK as key and
//! the 32-byte DEK as plaintext. The purpose of the wrap and the KEK version are
//! bound as associated data, so a wrapped DEK can't be replayed as a device
//! grant and a relabelled version fails authentication.

use crate::cipher::{EncryptedBlob, decrypt_with_aad, encrypt_with_aad};
use crate::error::{KeyError, KeyResult};
use crate::key::{Dek, Kek, KeyVersion, SymmetricKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// What a wrapped key is, and therefore which associated data it carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WrapPurpose {
    /// DEK under KEK.
    DataKey,
    /// KEK under a device key.
    DeviceKek,
    /// Device key under KEK.
    DeviceKey,
    /// KEK under the recovery key.
    RecoveryKek,
    /// Recovery key under KEK.
    RecoveryKey,
    /// Recovery key under a code-derived key.
    RecoverySlot,
}

impl WrapPurpose {
    fn label(self) -> &'static [u8] {
        match self {
            WrapPurpose::DataKey => b"lockbox:dek:v1",
            WrapPurpose::DeviceKek => b"lockbox:device-kek:v1",
            WrapPurpose::DeviceKey => b"lockbox:device-key:v1",
            WrapPurpose::RecoveryKek => b"lockbox:recovery-kek:v1",
            WrapPurpose::RecoveryKey => b"lockbox:recovery-key:v1",
            WrapPurpose::RecoverySlot => b"lockbox:recovery-slot:v1",
        }
    }

    fn associated_data(self, version: KeyVersion) -> Vec<u8> {
        let label = self.label();
        let mut aad = Vec::with_capacity(label.len() + 4);
        aad.extend_from_slice(label);
        aad.extend_from_slice(&version.to_be_bytes());
        aad
    }
}

/// A key wrapped under another key, tagged with the KEK generation it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub key_version: KeyVersion,
    pub blob: EncryptedBlob,
}

impl WrappedKey {
    /// The stable at-rest layout: `nonce || ciphertext || tag`.
    ///
    /// The version travels next to the bytes (e.g. a `key_version` column),
    /// not inside them.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.blob.to_bytes()
    }

    pub fn from_bytes(key_version: KeyVersion, bytes: &[u8]) -> KeyResult<Self> {
        Ok(Self {
            key_version,
            blob: EncryptedBlob::from_bytes(bytes)?,
        })
    }
}

pub(crate) fn wrap_key(
    key: &SymmetricKey,
    wrapping_key: &SymmetricKey,
    version: KeyVersion,
    purpose: WrapPurpose,
) -> KeyResult<WrappedKey> {
    let blob = encrypt_with_aad(
        wrapping_key.as_bytes(),
        key.as_bytes(),
        &purpose.associated_data(version),
    )?;
    Ok(WrappedKey {
        key_version: version,
        blob,
    })
}

pub(crate) fn unwrap_key(
    wrapped: &WrappedKey,
    wrapping_key: &SymmetricKey,
    purpose: WrapPurpose,
) -> KeyResult<SymmetricKey> {
    let plaintext = Zeroizing::new(decrypt_with_aad(
        wrapping_key.as_bytes(),
        &wrapped.blob,
        &purpose.associated_data(wrapped.key_version),
    )?);
    SymmetricKey::from_slice(&plaintext)
}

/// Fails fast when material from one KEK generation meets a KEK of another.
pub(crate) fn check_version(wrapped: &WrappedKey, kek: &Kek) -> KeyResult<()> {
    if wrapped.key_version != kek.version() {
        return Err(KeyError::KeyVersionMismatch {
            wrapped: wrapped.key_version,
            kek: kek.version(),
        });
    }
    Ok(())
}

/// Creates a fresh DEK and its wrapped form in one step.
///
/// The plaintext DEK is meant to encrypt one item and then be dropped; only
/// the wrapped form is persisted.
pub fn generate_wrapped_dek(kek: &Kek) -> KeyResult<(Dek, WrappedKey)> {
    let dek = Dek::generate();
    let wrapped = wrap_dek(&dek, kek)?;
    Ok((dek, wrapped))
}

/// Wraps a DEK under a KEK.
pub fn wrap_dek(dek: &Dek, kek: &Kek) -> KeyResult<WrappedKey> {
    wrap_key(dek.key(), kek.key(), kek.version(), WrapPurpose::DataKey)
}

/// Unwraps a DEK. The KEK must be the generation the DEK was wrapped under.
pub fn unwrap_dek(wrapped: &WrappedKey, kek: &Kek) -> KeyResult<Dek> {
    check_version(wrapped, kek)?;
    unwrap_key(wrapped, kek.key(), WrapPurpose::DataKey).map(Dek::from_key)
}

/// Checks a freshly derived KEK against a known wrapped key.
///
/// This is how a wrong password is detected: no secrets are compared, the
/// KEK either opens the sample or it doesn't.
pub fn verify_kek(kek: &Kek, sample: &WrappedKey) -> bool {
    unwrap_dek(sample, kek).is_ok()
}
