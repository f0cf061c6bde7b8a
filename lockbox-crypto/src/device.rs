//! Multi-device KEK distribution.
//!
//! Canonical flow: at enrolment a trusted session generates a [`DeviceKey`]
//! that stays on the device. The server keeps a [`DeviceGrant`] holding the
//! device key wrapped under the KEK (so a rotating client can reach it) and
//! the KEK wrapped under the device key (so the device can open it each
//! session without the password). Revoking a device deletes its grant; the
//! next rotation then skips it, so it never sees a future KEK.

use crate::envelope::{WrapPurpose, WrappedKey, check_version, unwrap_key, wrap_key};
use crate::error::{KeyError, KeyResult};
use crate::key::{DeviceKey, Kek, KeyVersion};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Wraps the KEK for a device.
pub fn wrap_kek_with_device_key(kek: &Kek, device_key: &DeviceKey) -> KeyResult<WrappedKey> {
    wrap_key(kek.key(), device_key.key(), kek.version(), WrapPurpose::DeviceKek)
}

/// Opens a device-wrapped KEK. The KEK takes the version recorded on the wrap.
pub fn unwrap_kek_with_device_key(wrapped: &WrappedKey, device_key: &DeviceKey) -> KeyResult<Kek> {
    let key = unwrap_key(wrapped, device_key.key(), WrapPurpose::DeviceKek)?;
    Ok(Kek::new(key, wrapped.key_version))
}

/// Wraps a device key under the KEK for server-side storage.
pub fn wrap_device_key_with_kek(device_key: &DeviceKey, kek: &Kek) -> KeyResult<WrappedKey> {
    wrap_key(device_key.key(), kek.key(), kek.version(), WrapPurpose::DeviceKey)
}

/// Opens a KEK-wrapped device key.
pub fn unwrap_device_key_with_kek(wrapped: &WrappedKey, kek: &Kek) -> KeyResult<DeviceKey> {
    check_version(wrapped, kek)?;
    unwrap_key(wrapped, kek.key(), WrapPurpose::DeviceKey).map(DeviceKey::from_key)
}

/// Server-side record for one enrolled device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGrant {
    pub device_id: String,
    pub wrapped_device_key: WrappedKey,
    pub wrapped_kek: WrappedKey,
}

impl DeviceGrant {
    /// Builds the grant for an existing device key.
    pub fn issue(device_id: &str, device_key: &DeviceKey, kek: &Kek) -> KeyResult<Self> {
        Ok(Self {
            device_id: device_id.to_string(),
            wrapped_device_key: wrap_device_key_with_kek(device_key, kek)?,
            wrapped_kek: wrap_kek_with_device_key(kek, device_key)?,
        })
    }

    pub fn key_version(&self) -> KeyVersion {
        self.wrapped_kek.key_version
    }
}

/// Enrols a new device: returns the device-local key and the grant to store.
pub fn enroll_device(device_id: &str, kek: &Kek) -> KeyResult<(DeviceKey, DeviceGrant)> {
    let device_key = DeviceKey::generate();
    let grant = DeviceGrant::issue(device_id, &device_key, kek)?;
    debug!(device_id, version = kek.version().get(), "issued device grant");
    Ok((device_key, grant))
}

/// Opens the KEK from a grant on the device that holds `device_key`.
pub fn open_device_grant(grant: &DeviceGrant, device_key: &DeviceKey) -> KeyResult<Kek> {
    unwrap_kek_with_device_key(&grant.wrapped_kek, device_key)
}

/// Re-issues every surviving grant for the rotated KEK.
///
/// Fails with [`KeyError::RotationFailed`] on the first grant whose device
/// key doesn't open under `old`.
pub fn reissue_device_grants(
    old: &Kek,
    new: &Kek,
    grants: &[DeviceGrant],
) -> KeyResult<Vec<DeviceGrant>> {
    grants
        .iter()
        .enumerate()
        .map(|(index, grant)| {
            let device_key = unwrap_device_key_with_kek(&grant.wrapped_device_key, old)
                .map_err(|_| KeyError::RotationFailed { index })?;
            DeviceGrant::issue(&grant.device_id, &device_key, new)
                .map_err(|_| KeyError::RotationFailed { index })
        })
        .collect()
}
