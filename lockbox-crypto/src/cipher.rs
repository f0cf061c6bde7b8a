//! ChaCha20-Poly1305 authenticated encryption.
//!
//! Every call draws a fresh 96-bit nonce from the CSPRNG; callers never supply
//! nonces. The stable storage layout is `nonce(12) || ciphertext || tag(16)`.

use crate::error::{KeyError, KeyResult};
use crate::key::KEY_SIZE;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroize;

/// Size of the ChaCha20-Poly1305 nonce (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of the Poly1305 authentication tag (128 bits).
pub const TAG_SIZE: usize = 16;

/// Output of one AEAD encryption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

impl EncryptedBlob {
    /// Serializes as `nonce || ciphertext || tag`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len() + TAG_SIZE);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Parses the `nonce || ciphertext || tag` layout.
    pub fn from_bytes(bytes: &[u8]) -> KeyResult<Self> {
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(KeyError::MalformedBlob(format!(
                "blob is {} bytes, shorter than nonce + tag",
                bytes.len()
            )));
        }
        let (nonce, rest) = bytes.split_at(NONCE_SIZE);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);

        let mut nonce_arr = [0u8; NONCE_SIZE];
        nonce_arr.copy_from_slice(nonce);
        let mut tag_arr = [0u8; TAG_SIZE];
        tag_arr.copy_from_slice(tag);

        Ok(Self {
            nonce: nonce_arr,
            ciphertext: ciphertext.to_vec(),
            tag: tag_arr,
        })
    }

    /// Total serialized length.
    pub fn len(&self) -> usize {
        NONCE_SIZE + self.ciphertext.len() + TAG_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> KeyResult<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| KeyError::MalformedBlob(format!("invalid base64: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for EncryptedBlob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for EncryptedBlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

fn cipher_for(key: &[u8]) -> KeyResult<ChaCha20Poly1305> {
    if key.len() != KEY_SIZE {
        return Err(KeyError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: key.len(),
        });
    }
    Ok(ChaCha20Poly1305::new(Key::from_slice(key)))
}

/// Encrypts `plaintext` under a 256-bit key.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> KeyResult<EncryptedBlob> {
    encrypt_with_aad(key, plaintext, &[])
}

/// Encrypts `plaintext`, authenticating `aad` alongside it.
pub fn encrypt_with_aad(key: &[u8], plaintext: &[u8], aad: &[u8]) -> KeyResult<EncryptedBlob> {
    let cipher = cipher_for(key)?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let mut buffer = plaintext.to_vec();
    let tag = match cipher.encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buffer) {
        Ok(tag) => tag,
        Err(e) => {
            buffer.zeroize();
            return Err(KeyError::Encryption(e.to_string()));
        }
    };

    let mut tag_arr = [0u8; TAG_SIZE];
    tag_arr.copy_from_slice(tag.as_slice());

    Ok(EncryptedBlob {
        nonce,
        ciphertext: buffer,
        tag: tag_arr,
    })
}

/// Decrypts a blob produced by [`encrypt`].
pub fn decrypt(key: &[u8], blob: &EncryptedBlob) -> KeyResult<Vec<u8>> {
    decrypt_with_aad(key, blob, &[])
}

/// Decrypts a blob produced by [`encrypt_with_aad`] with the same `aad`.
///
/// The tag is verified before any plaintext is released. Every failure
/// collapses into [`KeyError::DecryptionFailed`].
pub fn decrypt_with_aad(key: &[u8], blob: &EncryptedBlob, aad: &[u8]) -> KeyResult<Vec<u8>> {
    let cipher = cipher_for(key)?;

    let mut buffer = blob.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&blob.nonce),
            aad,
            &mut buffer,
            Tag::from_slice(&blob.tag),
        )
        .map_err(|_| KeyError::DecryptionFailed)?;

    Ok(buffer)
}
