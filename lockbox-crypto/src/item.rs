//! Item payload encryption with a per-item DEK.
//!
//! The item id is bound as associated data so a payload can't be moved onto
//! another item's row and still decrypt.

use crate::cipher::{EncryptedBlob, decrypt_with_aad, encrypt_with_aad};
use crate::envelope::{WrappedKey, generate_wrapped_dek, unwrap_dek};
use crate::error::KeyResult;
use crate::key::{Dek, Kek};
use serde::{Deserialize, Serialize};

/// Everything the storage layer keeps for one item: opaque payload and wrapped DEK.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedItem {
    pub item_id: String,
    pub wrapped_dek: WrappedKey,
    pub payload: EncryptedBlob,
}

/// Encrypts an item payload with its DEK.
pub fn encrypt_payload(item_id: &str, plaintext: &[u8], dek: &Dek) -> KeyResult<EncryptedBlob> {
    encrypt_with_aad(dek.as_bytes(), plaintext, item_id.as_bytes())
}

/// Decrypts an item payload with its DEK.
pub fn decrypt_payload(item_id: &str, payload: &EncryptedBlob, dek: &Dek) -> KeyResult<Vec<u8>> {
    decrypt_with_aad(dek.as_bytes(), payload, item_id.as_bytes())
}

/// Seals a new item: fresh DEK, encrypted payload, wrapped DEK.
///
/// The plaintext DEK is zeroized when this returns.
pub fn seal_item(item_id: &str, plaintext: &[u8], kek: &Kek) -> KeyResult<EncryptedItem> {
    let (dek, wrapped_dek) = generate_wrapped_dek(kek)?;
    let payload = encrypt_payload(item_id, plaintext, &dek)?;
    Ok(EncryptedItem {
        item_id: item_id.to_string(),
        wrapped_dek,
        payload,
    })
}

/// Opens an item sealed by [`seal_item`].
pub fn open_item(item: &EncryptedItem, kek: &Kek) -> KeyResult<Vec<u8>> {
    let dek = unwrap_dek(&item.wrapped_dek, kek)?;
    decrypt_payload(&item.item_id, &item.payload, &dek)
}
