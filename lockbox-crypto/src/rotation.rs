//! KEK rotation: re-wrap DEKs under a new KEK without touching item ciphertext.
//!
//! Cost is one unwrap + one wrap per item regardless of payload size. This
//! module is pure: persisting the result together with the new key version as
//! one unit, and serializing rotations per user, is the caller's job.

use crate::envelope::{WrappedKey, unwrap_dek, wrap_dek};
use crate::error::{KeyError, KeyResult};
use crate::key::{KdfParams, Kek, Salt, derive_kek};
use tracing::debug;

/// How the next KEK is produced.
#[derive(Clone, Copy, Debug)]
pub enum RotationMode<'a> {
    /// Derive the new KEK from a new password with a fresh salt.
    PasswordChange {
        new_secret: &'a str,
        params: &'a KdfParams,
    },
    /// Generate a random KEK, e.g. after the wrapped-KEK path was exposed.
    Random,
}

/// Result of [`rotate_kek`].
#[derive(Debug)]
pub struct RotationOutcome {
    pub kek: Kek,
    /// The new salt for password-change rotation; `None` for a random KEK.
    pub salt: Option<Salt>,
    /// Re-wrapped DEKs, in input order.
    pub wrapped: Vec<WrappedKey>,
}

/// Re-wraps every DEK from `old` to `new`.
///
/// Any entry that fails to unwrap aborts the whole batch with
/// [`KeyError::RotationFailed`]; nothing is skipped, since a skipped item
/// would be orphaned under a KEK nobody can derive anymore.
pub fn rotate(old: &Kek, new: &Kek, wrapped: &[WrappedKey]) -> KeyResult<Vec<WrappedKey>> {
    if new.version() <= old.version() {
        return Err(KeyError::InvalidKeyVersion {
            current: old.version(),
            proposed: new.version(),
        });
    }

    let rewrapped = wrapped
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let dek = unwrap_dek(entry, old).map_err(|_| KeyError::RotationFailed { index })?;
            wrap_dek(&dek, new).map_err(|_| KeyError::RotationFailed { index })
        })
        .collect::<KeyResult<Vec<_>>>()?;

    debug!(
        from = old.version().get(),
        to = new.version().get(),
        count = rewrapped.len(),
        "re-wrapped data keys"
    );
    Ok(rewrapped)
}

/// Produces the next-generation KEK and re-wraps `wrapped` under it.
pub fn rotate_kek(
    old: &Kek,
    mode: RotationMode<'_>,
    wrapped: &[WrappedKey],
) -> KeyResult<RotationOutcome> {
    let version = old.version().next()?;
    let (kek, salt) = match mode {
        RotationMode::PasswordChange { new_secret, params } => {
            let (kek, salt) = derive_kek(new_secret, None, version, params)?;
            (kek, Some(salt))
        }
        RotationMode::Random => (Kek::generate(version), None),
    };

    let wrapped = rotate(old, &kek, wrapped)?;
    Ok(RotationOutcome { kek, salt, wrapped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::generate_wrapped_dek;
    use crate::key::KeyVersion;

    #[test]
    fn rejects_non_increasing_version() {
        let old = Kek::generate(KeyVersion::new(2));
        let new = Kek::generate(KeyVersion::new(2));
        assert_eq!(
            rotate(&old, &new, &[]).unwrap_err(),
            KeyError::InvalidKeyVersion {
                current: KeyVersion::new(2),
                proposed: KeyVersion::new(2),
            }
        );
    }

    #[test]
    fn reports_index_of_first_bad_entry() {
        let old = Kek::generate(KeyVersion::INITIAL);
        let stranger = Kek::generate(KeyVersion::INITIAL);
        let (_, good) = generate_wrapped_dek(&old).unwrap();
        let (_, bad) = generate_wrapped_dek(&stranger).unwrap();
        let new = Kek::generate(KeyVersion::new(2));

        let err = rotate(&old, &new, &[good.clone(), good, bad]).unwrap_err();
        assert_eq!(err, KeyError::RotationFailed { index: 2 });
    }

    #[test]
    fn random_mode_bumps_version_without_salt() {
        let old = Kek::generate(KeyVersion::INITIAL);
        let (_, w) = generate_wrapped_dek(&old).unwrap();
        let outcome = rotate_kek(&old, RotationMode::Random, &[w]).unwrap();
        assert_eq!(outcome.kek.version(), KeyVersion::new(2));
        assert!(outcome.salt.is_none());
        assert_eq!(outcome.wrapped[0].key_version, KeyVersion::new(2));
    }

    #[test]
    fn password_mode_returns_new_salt() {
        let params = KdfParams::insecure_for_tests();
        let old = Kek::generate(KeyVersion::INITIAL);
        let outcome = rotate_kek(
            &old,
            RotationMode::PasswordChange {
                new_secret: "n3w-password",
                params: &params,
            },
            &[],
        )
        .unwrap();
        let salt = outcome.salt.unwrap();
        let (again, _) = derive_kek("n3w-password", Some(&salt), KeyVersion::new(2), &params).unwrap();
        assert_eq!(again.as_bytes(), outcome.kek.as_bytes());
    }
}
