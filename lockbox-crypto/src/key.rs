//! Key material types and password-based key derivation (Argon2id).

use crate::cipher::{decrypt, encrypt};
use crate::error::{KeyError, KeyResult};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Size of every symmetric key in the hierarchy (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of a KDF salt (128 bits).
pub const SALT_SIZE: usize = 16;

/// A 256-bit symmetric key, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Generates a fresh random key from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Builds a key from a slice, rejecting anything that isn't exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> KeyResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(KeyError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}

/// Monotonic generation counter of a user's KEK.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyVersion(u32);

impl KeyVersion {
    pub const INITIAL: KeyVersion = KeyVersion(1);

    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// The version that follows this one.
    pub fn next(self) -> KeyResult<Self> {
        self.0
            .checked_add(1)
            .map(Self)
            .ok_or(KeyError::InvalidKeyVersion {
                current: self,
                proposed: self,
            })
    }

    pub(crate) fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key-encryption key: the root key of one user at one [`KeyVersion`].
///
/// Never persisted in plaintext. Either re-derived from the user's secret on
/// every login or unwrapped from a device grant / recovery escrow.
#[derive(Clone, Debug)]
pub struct Kek {
    key: SymmetricKey,
    version: KeyVersion,
}

impl Kek {
    pub fn new(key: SymmetricKey, version: KeyVersion) -> Self {
        Self { key, version }
    }

    /// A fresh random KEK, used by password-less rotation.
    pub fn generate(version: KeyVersion) -> Self {
        Self::new(SymmetricKey::generate(), version)
    }

    pub fn version(&self) -> KeyVersion {
        self.version
    }

    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        self.key.as_bytes()
    }
}

macro_rules! key_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug)]
        pub struct $name(SymmetricKey);

        impl $name {
            pub fn generate() -> Self {
                Self(SymmetricKey::generate())
            }

            pub fn from_key(key: SymmetricKey) -> Self {
                Self(key)
            }

            pub fn key(&self) -> &SymmetricKey {
                &self.0
            }

            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                self.0.as_bytes()
            }
        }
    };
}

key_newtype!(
    /// Data-encryption key for exactly one stored item. Only the wrapped form
    /// is ever persisted.
    Dek
);

key_newtype!(
    /// Per-device secret used to receive the KEK without re-entering the password.
    DeviceKey
);

key_newtype!(
    /// Per-user key that every recovery code unlocks; it in turn unwraps the KEK.
    RecoveryKey
);

/// Argon2id salt, unique per user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    pub fn random() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parses a stored salt value.
    pub fn from_slice(bytes: &[u8]) -> KeyResult<Self> {
        if bytes.len() != SALT_SIZE {
            return Err(KeyError::MalformedBlob(format!(
                "salt must be {SALT_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; SALT_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }
}

/// Argon2id cost parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism (lanes).
    pub parallelism: u32,
}

const MIN_MEMORY_KIB: u32 = 64 * 1024;
const MIN_ITERATIONS: u32 = 3;
const MIN_PARALLELISM: u32 = 4;

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: MIN_MEMORY_KIB,
            iterations: MIN_ITERATIONS,
            parallelism: MIN_PARALLELISM,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for unit and integration tests. Never use for real secrets.
    pub fn insecure_for_tests() -> Self {
        Self {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    /// Rejects parameters below the production floor (64 MiB, 3 passes, 4 lanes).
    pub fn validate_production(&self) -> KeyResult<()> {
        if self.memory_kib < MIN_MEMORY_KIB {
            return Err(KeyError::KeyDerivation(format!(
                "memory_kib {} is below minimum {MIN_MEMORY_KIB}",
                self.memory_kib
            )));
        }
        if self.iterations < MIN_ITERATIONS {
            return Err(KeyError::KeyDerivation(format!(
                "iterations {} is below minimum {MIN_ITERATIONS}",
                self.iterations
            )));
        }
        if self.parallelism < MIN_PARALLELISM {
            return Err(KeyError::KeyDerivation(format!(
                "parallelism {} is below minimum {MIN_PARALLELISM}",
                self.parallelism
            )));
        }
        Ok(())
    }

    pub(crate) fn hasher(&self) -> KeyResult<Argon2<'static>> {
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| KeyError::KeyDerivation(format!("invalid Argon2 parameters: {e}")))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Runs Argon2id over `secret` and `salt`, producing a 256-bit key.
///
/// Each call allocates its own working memory, so concurrent derivations
/// never share buffers.
pub fn derive_key_bytes(secret: &[u8], salt: &[u8], params: &KdfParams) -> KeyResult<SymmetricKey> {
    let argon2 = params.hasher()?;
    let mut out = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(secret, salt, &mut *out)
        .map_err(|e| KeyError::KeyDerivation(format!("Argon2id failed: {e}")))?;
    Ok(SymmetricKey::from_bytes(*out))
}

/// Derives a user's KEK from their secret.
///
/// With `salt == None` a fresh random salt is generated (registration); with a
/// stored salt the derivation is deterministic (login). The salt is returned
/// either way so the caller can persist it.
pub fn derive_kek(
    secret: &str,
    salt: Option<&Salt>,
    version: KeyVersion,
    params: &KdfParams,
) -> KeyResult<(Kek, Salt)> {
    let salt = salt.copied().unwrap_or_else(Salt::random);
    let key = derive_key_bytes(secret.as_bytes(), salt.as_bytes(), params)?;
    Ok((Kek::new(key, version), salt))
}

/// Sanity check of the KDF and cipher on this platform.
///
/// Confirms derivation is deterministic, salt-sensitive, and that a derived
/// key round-trips (and rejects tampering with) an AEAD probe.
pub fn kdf_self_test(params: &KdfParams) -> KeyResult<()> {
    const PROBE_SECRET: &[u8] = b"lockbox-kdf-self-test";
    const PROBE_PLAINTEXT: &[u8] = b"lockbox-aead-probe";
    let salt_a = [0x5au8; SALT_SIZE];
    let salt_b = [0xa5u8; SALT_SIZE];

    let first = derive_key_bytes(PROBE_SECRET, &salt_a, params)?;
    let second = derive_key_bytes(PROBE_SECRET, &salt_a, params)?;
    if first.as_bytes() != second.as_bytes() {
        return Err(KeyError::SelfTestFailed("derivation is not deterministic".into()));
    }

    let other = derive_key_bytes(PROBE_SECRET, &salt_b, params)?;
    if first.as_bytes() == other.as_bytes() {
        return Err(KeyError::SelfTestFailed("salt has no effect on derivation".into()));
    }

    let mut blob = encrypt(first.as_bytes(), PROBE_PLAINTEXT)?;
    let opened = decrypt(first.as_bytes(), &blob)?;
    if opened != PROBE_PLAINTEXT {
        return Err(KeyError::SelfTestFailed("AEAD probe did not round-trip".into()));
    }

    blob.tag[0] ^= 0x01;
    if decrypt(first.as_bytes(), &blob).is_ok() {
        return Err(KeyError::SelfTestFailed("AEAD accepted a forged tag".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic_for_same_salt() {
        let params = KdfParams::insecure_for_tests();
        let (k1, salt) = derive_kek("pw", None, KeyVersion::INITIAL, &params).unwrap();
        let (k2, salt2) = derive_kek("pw", Some(&salt), KeyVersion::INITIAL, &params).unwrap();
        assert_eq!(salt, salt2);
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn different_salt_or_secret_changes_key() {
        let params = KdfParams::insecure_for_tests();
        let salt_a = Salt::from_bytes([1; SALT_SIZE]);
        let salt_b = Salt::from_bytes([2; SALT_SIZE]);
        let (a, _) = derive_kek("pw", Some(&salt_a), KeyVersion::INITIAL, &params).unwrap();
        let (b, _) = derive_kek("pw", Some(&salt_b), KeyVersion::INITIAL, &params).unwrap();
        let (c, _) = derive_kek("pw2", Some(&salt_a), KeyVersion::INITIAL, &params).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn fresh_salts_are_random() {
        assert_ne!(Salt::random(), Salt::random());
    }

    #[test]
    fn symmetric_key_rejects_wrong_length() {
        let err = SymmetricKey::from_slice(&[0u8; 16]).unwrap_err();
        assert_eq!(
            err,
            KeyError::InvalidKeyLength {
                expected: 32,
                actual: 16
            }
        );
    }

    #[test]
    fn debug_output_redacts_key_bytes() {
        let key = SymmetricKey::from_bytes([0xAB; KEY_SIZE]);
        let dbg = format!("{:?}", Kek::new(key, KeyVersion::INITIAL));
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("171"));
    }

    #[test]
    fn default_params_meet_production_floor() {
        KdfParams::default().validate_production().unwrap();
        assert!(KdfParams::insecure_for_tests().validate_production().is_err());
    }

    #[test]
    fn key_version_increments() {
        assert_eq!(KeyVersion::INITIAL.next().unwrap(), KeyVersion::new(2));
        assert!(KeyVersion::new(u32::MAX).next().is_err());
    }

    #[test]
    fn self_test_passes() {
        kdf_self_test(&KdfParams::insecure_for_tests()).unwrap();
    }

    #[test]
    fn salt_from_slice_checks_length() {
        assert!(Salt::from_slice(&[0u8; 15]).is_err());
        assert!(Salt::from_slice(&[0u8; SALT_SIZE]).is_ok());
    }
}
