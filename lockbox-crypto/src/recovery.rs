//! One-time recovery codes.
//!
//! Codes are 8 characters from an alphabet without look-alikes (`0/O`,
//! `1/I/L`). Only Argon2id PHC hashes are stored; the plaintext is shown once.
//!
//! Each code also opens a per-user recovery key through its own slot, and the
//! recovery key opens the KEK through the escrow. The escrow additionally keeps
//! the recovery key wrapped under the KEK, so a rotation can reseal it for the
//! new KEK without knowing any code.

use crate::envelope::{WrapPurpose, WrappedKey, check_version, unwrap_key, wrap_key};
use crate::error::{KeyError, KeyResult};
use crate::key::{KdfParams, Kek, KeyVersion, RecoveryKey, Salt, SymmetricKey, derive_key_bytes};
use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Characters a code may contain.
pub const RECOVERY_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Characters per code.
pub const RECOVERY_CODE_LEN: usize = 8;

/// Codes issued per batch unless configured otherwise.
pub const DEFAULT_RECOVERY_CODE_COUNT: usize = 10;

// Slot wraps belong to the code, not to a KEK generation, and are never rotated.
const SLOT_VERSION: KeyVersion = KeyVersion::INITIAL;

/// A plaintext recovery code. Wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryCode(String);

impl RecoveryCode {
    /// Parses user input, ignoring case, dashes and whitespace.
    pub fn parse(input: &str) -> KeyResult<Self> {
        let normalised: String = input
            .chars()
            .filter(|c| *c != '-' && !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        let valid = normalised.len() == RECOVERY_CODE_LEN
            && normalised.bytes().all(|b| RECOVERY_ALPHABET.contains(&b));
        if !valid {
            return Err(KeyError::InvalidRecoveryCode);
        }
        Ok(Self(normalised))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Display form, e.g. `ABCD-EFGH`.
    pub fn formatted(&self) -> String {
        let (head, tail) = self.0.split_at(RECOVERY_CODE_LEN / 2);
        format!("{head}-{tail}")
    }
}

impl fmt::Debug for RecoveryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryCode([REDACTED])")
    }
}

/// Argon2id PHC string of a recovery code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecoveryCodeHash(String);

impl RecoveryCodeHash {
    pub fn from_phc(phc: impl Into<String>) -> Self {
        Self(phc.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Generates `count` distinct codes, each character uniform over the alphabet.
pub fn generate_recovery_codes(count: usize) -> Vec<RecoveryCode> {
    let mut rng = rand::rng();
    let mut seen = HashSet::with_capacity(count);
    let mut codes = Vec::with_capacity(count);

    while codes.len() < count {
        let code: String = (0..RECOVERY_CODE_LEN)
            .map(|_| RECOVERY_ALPHABET[rng.random_range(0..RECOVERY_ALPHABET.len())] as char)
            .collect();
        if seen.insert(code.clone()) {
            codes.push(RecoveryCode(code));
        }
    }
    seen.into_iter().for_each(|mut code: String| code.zeroize());
    codes
}

/// Hashes a code with the same Argon2id parameters as password derivation.
pub fn hash_recovery_code(code: &RecoveryCode, params: &KdfParams) -> KeyResult<RecoveryCodeHash> {
    let argon2 = params.hasher()?;
    let salt = Salt::random();
    let salt_string = SaltString::encode_b64(salt.as_bytes())
        .map_err(|e| KeyError::KeyDerivation(format!("salt encoding failed: {e}")))?;
    let hash = argon2
        .hash_password(code.as_str().as_bytes(), &salt_string)
        .map_err(|e| KeyError::KeyDerivation(format!("recovery code hashing failed: {e}")))?;
    Ok(RecoveryCodeHash(hash.to_string()))
}

/// Checks one code against one stored hash. The parameters come from the hash itself.
pub fn verify_recovery_code(code: &RecoveryCode, hash: &RecoveryCodeHash) -> bool {
    let Ok(parsed) = PasswordHash::new(hash.as_str()) else {
        return false;
    };
    Argon2::default()
        .verify_password(code.as_str().as_bytes(), &parsed)
        .is_ok()
}

/// Finds the first hash matching `code`.
///
/// Every hash is verified even after a match, so timing doesn't reveal the
/// matching position. Cost is one Argon2id evaluation per stored hash.
pub fn verify_against_set(code: &RecoveryCode, hashes: &[RecoveryCodeHash]) -> KeyResult<usize> {
    first_match(code, hashes.iter()).ok_or(KeyError::NotFound)
}

fn first_match<'a>(
    code: &RecoveryCode,
    hashes: impl Iterator<Item = &'a RecoveryCodeHash>,
) -> Option<usize> {
    let mut matched = None;
    for (index, hash) in hashes.enumerate() {
        let ok = verify_recovery_code(code, hash);
        if ok && matched.is_none() {
            matched = Some(index);
        }
    }
    matched
}

/// Stored per code: its hash and the recovery key wrapped under a code-derived key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySlot {
    pub code_hash: RecoveryCodeHash,
    pub salt: Salt,
    pub kdf: KdfParams,
    pub wrapped_recovery_key: WrappedKey,
}

/// Stored once per user: the KEK under the recovery key and vice versa.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryEscrow {
    pub wrapped_kek: WrappedKey,
    pub wrapped_recovery_key: WrappedKey,
}

impl RecoveryEscrow {
    fn seal(recovery_key: &RecoveryKey, kek: &Kek) -> KeyResult<Self> {
        Ok(Self {
            wrapped_kek: wrap_key(
                kek.key(),
                recovery_key.key(),
                kek.version(),
                WrapPurpose::RecoveryKek,
            )?,
            wrapped_recovery_key: wrap_key(
                recovery_key.key(),
                kek.key(),
                kek.version(),
                WrapPurpose::RecoveryKey,
            )?,
        })
    }

    pub fn key_version(&self) -> KeyVersion {
        self.wrapped_kek.key_version
    }
}

/// A freshly generated batch: plaintext codes for the user, slots and escrow for storage.
#[derive(Debug)]
pub struct RecoveryKit {
    pub codes: Vec<RecoveryCode>,
    pub slots: Vec<RecoverySlot>,
    pub escrow: RecoveryEscrow,
}

fn slot_key(code: &RecoveryCode, salt: &Salt, params: &KdfParams) -> KeyResult<SymmetricKey> {
    derive_key_bytes(code.as_str().as_bytes(), salt.as_bytes(), params)
}

fn seal_slot(
    code: &RecoveryCode,
    recovery_key: &RecoveryKey,
    params: &KdfParams,
) -> KeyResult<RecoverySlot> {
    let code_hash = hash_recovery_code(code, params)?;
    let salt = Salt::random();
    let key = slot_key(code, &salt, params)?;
    let wrapped_recovery_key = wrap_key(
        recovery_key.key(),
        &key,
        SLOT_VERSION,
        WrapPurpose::RecoverySlot,
    )?;
    Ok(RecoverySlot {
        code_hash,
        salt,
        kdf: *params,
        wrapped_recovery_key,
    })
}

/// Generates a new batch of codes tied to `kek`.
pub fn create_recovery_kit(kek: &Kek, count: usize, params: &KdfParams) -> KeyResult<RecoveryKit> {
    let recovery_key = RecoveryKey::generate();
    let codes = generate_recovery_codes(count);
    let slots = codes
        .iter()
        .map(|code| seal_slot(code, &recovery_key, params))
        .collect::<KeyResult<Vec<_>>>()?;
    let escrow = RecoveryEscrow::seal(&recovery_key, kek)?;

    debug!(count, version = kek.version().get(), "created recovery kit");
    Ok(RecoveryKit {
        codes,
        slots,
        escrow,
    })
}

/// Turns a recovery code into the current KEK.
///
/// Returns the index of the slot that matched so the caller can consume it.
/// A code that matches no slot yields [`KeyError::NotFound`].
pub fn recover_kek(
    code: &RecoveryCode,
    slots: &[RecoverySlot],
    escrow: &RecoveryEscrow,
) -> KeyResult<(usize, Kek)> {
    let index = first_match(code, slots.iter().map(|s| &s.code_hash)).ok_or(KeyError::NotFound)?;
    let slot = slots.get(index).ok_or(KeyError::NotFound)?;

    let key = slot_key(code, &slot.salt, &slot.kdf)?;
    let recovery_key = unwrap_key(&slot.wrapped_recovery_key, &key, WrapPurpose::RecoverySlot)?;
    let kek_key = unwrap_key(&escrow.wrapped_kek, &recovery_key, WrapPurpose::RecoveryKek)?;

    Ok((index, Kek::new(kek_key, escrow.key_version())))
}

/// Reseals the escrow for a rotated KEK. Existing codes stay valid.
pub fn reseal_recovery_escrow(
    escrow: &RecoveryEscrow,
    old: &Kek,
    new: &Kek,
) -> KeyResult<RecoveryEscrow> {
    check_version(&escrow.wrapped_recovery_key, old)?;
    let recovery_key = unwrap_key(&escrow.wrapped_recovery_key, old.key(), WrapPurpose::RecoveryKey)?;
    RecoveryEscrow::seal(&RecoveryKey::from_key(recovery_key), new)
}
