use lockbox_crypto::{KeyError, KeyVersion, MaterialKind, decrypt_payload, encrypt_payload};
use lockbox_vault::{KeyVault, VaultConfig, VaultError};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use tracing_subscriber::EnvFilter;

const PASSWORD: &str = "Sup3r$ecret";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lockbox_vault=debug,lockbox_crypto=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn vault() -> KeyVault {
    init_tracing();
    KeyVault::open_in_memory(VaultConfig {
        recovery_code_count: 4,
        ..VaultConfig::for_tests()
    })
    .unwrap()
}

// ── Accounts ─────────────────────────────────────────────────────

#[test]
fn register_then_unlock_yields_same_kek() {
    let vault = vault();
    let kek = vault.register("alice", PASSWORD).unwrap();
    let again = vault.unlock("alice", PASSWORD).unwrap();
    assert_eq!(kek.as_bytes(), again.as_bytes());
    assert_eq!(vault.key_version("alice").unwrap(), KeyVersion::INITIAL);
}

#[test]
fn wrong_password_is_generic() {
    let vault = vault();
    vault.register("alice", PASSWORD).unwrap();
    assert!(matches!(
        vault.unlock("alice", "not the password"),
        Err(VaultError::InvalidCredentials)
    ));
}

#[test]
fn duplicate_and_weak_registrations_are_rejected() {
    let vault = vault();
    vault.register("alice", PASSWORD).unwrap();
    assert!(matches!(
        vault.register("alice", PASSWORD),
        Err(VaultError::UserExists(_))
    ));
    assert!(matches!(
        vault.register("bob", "short"),
        Err(VaultError::PasswordTooShort(8))
    ));
    assert!(!vault.user_exists("bob").unwrap());
}

#[test]
fn unknown_user() {
    let vault = vault();
    assert!(matches!(vault.unlock("nobody", PASSWORD), Err(VaultError::UserNotFound(_))));
}

#[test]
fn weak_kdf_rejected_without_opt_in() {
    let config = VaultConfig {
        allow_weak_kdf: false,
        ..VaultConfig::for_tests()
    };
    assert!(matches!(
        KeyVault::open_in_memory(config),
        Err(VaultError::Config(_))
    ));
}

#[tokio::test]
async fn unlock_async_matches_sync_unlock() {
    let vault = vault();
    let kek = vault.register("alice", PASSWORD).unwrap();
    let unlocked = vault.unlock_async("alice", PASSWORD).await.unwrap();
    assert_eq!(kek.as_bytes(), unlocked.as_bytes());
    assert!(matches!(
        vault.unlock_async("alice", "wrong password").await,
        Err(VaultError::InvalidCredentials)
    ));
}

// ── Item keys ────────────────────────────────────────────────────

#[test]
fn item_key_round_trip() {
    let vault = vault();
    let kek = vault.register("alice", PASSWORD).unwrap();

    let dek = vault.create_item_key("alice", "note-1", &kek).unwrap();
    let ciphertext = encrypt_payload("note-1", b"hello", &dek).unwrap();
    drop(dek);

    let kek = vault.unlock("alice", PASSWORD).unwrap();
    let dek = vault.open_item_key("alice", "note-1", &kek).unwrap();
    assert_eq!(decrypt_payload("note-1", &ciphertext, &dek).unwrap(), b"hello");
}

#[test]
fn item_key_lifecycle() {
    let vault = vault();
    let kek = vault.register("alice", PASSWORD).unwrap();
    vault.create_item_key("alice", "b", &kek).unwrap();
    vault.create_item_key("alice", "a", &kek).unwrap();

    assert!(matches!(
        vault.create_item_key("alice", "a", &kek),
        Err(VaultError::ItemExists(_))
    ));
    assert_eq!(vault.list_item_ids("alice").unwrap(), vec!["a", "b"]);

    vault.delete_item_key("alice", "a").unwrap();
    assert!(matches!(
        vault.open_item_key("alice", "a", &kek),
        Err(VaultError::ItemNotFound(_))
    ));
    assert!(matches!(
        vault.delete_item_key("alice", "a"),
        Err(VaultError::ItemNotFound(_))
    ));
}

#[test]
fn foreign_kek_cannot_create_or_open_items() {
    let vault = vault();
    let alice = vault.register("alice", PASSWORD).unwrap();
    let bob = vault.register("bob", "bob-password").unwrap();
    vault.create_item_key("alice", "x", &alice).unwrap();

    assert!(matches!(
        vault.create_item_key("alice", "y", &bob),
        Err(VaultError::InvalidCredentials)
    ));
    assert!(matches!(
        vault.open_item_key("alice", "x", &bob),
        Err(VaultError::Key(KeyError::DecryptionFailed))
    ));
}

// ── Password change ──────────────────────────────────────────────

#[test]
fn password_change_keeps_three_items_readable() {
    let vault = vault();
    let v1 = vault.register("alice", "old-password").unwrap();

    let mut payloads = HashMap::new();
    for id in ["a", "b", "c"] {
        let dek = vault.create_item_key("alice", id, &v1).unwrap();
        payloads.insert(id, encrypt_payload(id, id.as_bytes(), &dek).unwrap());
    }

    let v2 = vault.change_password("alice", "old-password", "new-password").unwrap();
    assert_eq!(v2.version(), KeyVersion::new(2));
    assert_eq!(vault.key_version("alice").unwrap(), KeyVersion::new(2));

    let unlocked = vault.unlock("alice", "new-password").unwrap();
    for (id, ciphertext) in &payloads {
        let dek = vault.open_item_key("alice", id, &unlocked).unwrap();
        assert_eq!(decrypt_payload(id, ciphertext, &dek).unwrap(), id.as_bytes());
        // The retired KEK no longer opens anything.
        assert!(vault.open_item_key("alice", id, &v1).is_err());
    }
    assert!(matches!(
        vault.unlock("alice", "old-password"),
        Err(VaultError::InvalidCredentials)
    ));
}

#[test]
fn password_change_needs_old_password() {
    let vault = vault();
    vault.register("alice", PASSWORD).unwrap();
    assert!(matches!(
        vault.change_password("alice", "guess-guess", "new-password"),
        Err(VaultError::InvalidCredentials)
    ));
    assert_eq!(vault.key_version("alice").unwrap(), KeyVersion::INITIAL);
}

#[test]
fn stale_kek_cannot_wrap_new_items() {
    let vault = vault();
    let v1 = vault.register("alice", PASSWORD).unwrap();
    vault.change_password("alice", PASSWORD, "new-password").unwrap();
    assert!(matches!(
        vault.create_item_key("alice", "late", &v1),
        Err(VaultError::Key(KeyError::KeyVersionMismatch { .. }))
    ));
}

#[test]
fn concurrent_item_creation_and_rotation_stay_consistent() {
    let vault = vault();
    let v1 = vault.register("alice", PASSWORD).unwrap();

    std::thread::scope(|s| {
        for worker in 0..4 {
            let vault = vault.clone();
            let kek = v1.clone();
            s.spawn(move || {
                for n in 0..5 {
                    // Items racing the rotation either land before it or are refused.
                    let _ = vault.create_item_key("alice", &format!("w{worker}-{n}"), &kek);
                }
            });
        }
        let vault = vault.clone();
        s.spawn(move || {
            vault.change_password("alice", PASSWORD, "new-password").unwrap();
        });
    });

    let kek = vault.unlock("alice", "new-password").unwrap();
    for id in vault.list_item_ids("alice").unwrap() {
        vault.open_item_key("alice", &id, &kek).unwrap();
    }
}

// ── Devices ──────────────────────────────────────────────────────

#[test]
fn device_unlocks_without_password_across_rotation() {
    let vault = vault();
    let kek = vault.register("alice", PASSWORD).unwrap();
    let phone = vault.enroll_device("alice", "phone", &kek).unwrap();

    let via_device = vault.unlock_with_device("alice", "phone", &phone).unwrap();
    assert_eq!(via_device.as_bytes(), kek.as_bytes());

    let v2 = vault.change_password("alice", PASSWORD, "new-password").unwrap();
    let via_device = vault.unlock_with_device("alice", "phone", &phone).unwrap();
    assert_eq!(via_device.as_bytes(), v2.as_bytes());
    assert_eq!(
        vault.list_devices("alice").unwrap()[0].key_version,
        KeyVersion::new(2)
    );
}

#[test]
fn revoked_device_is_locked_out() {
    let vault = vault();
    let kek = vault.register("alice", PASSWORD).unwrap();
    let phone = vault.enroll_device("alice", "phone", &kek).unwrap();
    let laptop = vault.enroll_device("alice", "laptop", &kek).unwrap();

    vault.revoke_device("alice", "phone").unwrap();
    assert!(matches!(
        vault.unlock_with_device("alice", "phone", &phone),
        Err(VaultError::InvalidCredentials)
    ));
    assert!(matches!(
        vault.revoke_device("alice", "phone"),
        Err(VaultError::DeviceNotFound(_))
    ));

    let ids: Vec<_> = vault
        .list_devices("alice")
        .unwrap()
        .into_iter()
        .map(|d| d.device_id)
        .collect();
    assert_eq!(ids, vec!["laptop"]);
    vault.unlock_with_device("alice", "laptop", &laptop).unwrap();
}

#[test]
fn wrong_device_key_is_generic_failure() {
    let vault = vault();
    let kek = vault.register("alice", PASSWORD).unwrap();
    vault.enroll_device("alice", "phone", &kek).unwrap();
    let laptop = vault.enroll_device("alice", "laptop", &kek).unwrap();
    assert!(matches!(
        vault.unlock_with_device("alice", "phone", &laptop),
        Err(VaultError::InvalidCredentials)
    ));
}

// ── Recovery ─────────────────────────────────────────────────────

#[test]
fn recovery_code_resets_password_once() {
    let vault = vault();
    let kek = vault.register("alice", PASSWORD).unwrap();
    let dek = vault.create_item_key("alice", "doc", &kek).unwrap();
    let ciphertext = encrypt_payload("doc", b"passport scan", &dek).unwrap();

    let codes = vault.setup_recovery("alice", &kek).unwrap();
    assert_eq!(codes.len(), 4);
    assert_eq!(vault.remaining_recovery_codes("alice").unwrap(), 4);

    let typed = codes[2].formatted().to_lowercase();
    let recovered = vault.recover_with_code("alice", &typed, "brand-new-password").unwrap();
    assert_eq!(recovered.version(), KeyVersion::new(2));
    assert_eq!(vault.remaining_recovery_codes("alice").unwrap(), 3);

    let kek = vault.unlock("alice", "brand-new-password").unwrap();
    let dek = vault.open_item_key("alice", "doc", &kek).unwrap();
    assert_eq!(decrypt_payload("doc", &ciphertext, &dek).unwrap(), b"passport scan");

    assert!(matches!(
        vault.recover_with_code("alice", &typed, "another-password"),
        Err(VaultError::InvalidCredentials)
    ));
}

#[test]
fn codes_survive_password_change() {
    let vault = vault();
    let kek = vault.register("alice", PASSWORD).unwrap();
    let codes = vault.setup_recovery("alice", &kek).unwrap();
    vault.change_password("alice", PASSWORD, "second-password").unwrap();

    let kek = vault
        .recover_with_code("alice", codes[0].as_str(), "third-password")
        .unwrap();
    assert_eq!(kek.version(), KeyVersion::new(3));
}

#[test]
fn malformed_and_unknown_codes_look_the_same() {
    let vault = vault();
    let kek = vault.register("alice", PASSWORD).unwrap();
    let codes = vault.setup_recovery("alice", &kek).unwrap();

    assert!(matches!(
        vault.recover_with_code("alice", "0000-0000", "new-password"),
        Err(VaultError::InvalidCredentials)
    ));
    let unused = ["ZZZZ-ZZZZ", "YYYY-YYYY"]
        .into_iter()
        .find(|c| codes.iter().all(|k| k.formatted() != *c))
        .unwrap();
    assert!(matches!(
        vault.recover_with_code("alice", unused, "new-password"),
        Err(VaultError::InvalidCredentials)
    ));
    assert_eq!(vault.remaining_recovery_codes("alice").unwrap(), 4);
}

#[test]
fn new_batch_replaces_old_codes() {
    let vault = vault();
    let kek = vault.register("alice", PASSWORD).unwrap();
    let first = vault.setup_recovery("alice", &kek).unwrap();
    let second = vault.setup_recovery("alice", &kek).unwrap();
    assert_eq!(vault.remaining_recovery_codes("alice").unwrap(), 4);

    if !second.contains(&first[0]) {
        assert!(matches!(
            vault.recover_with_code("alice", first[0].as_str(), "new-password"),
            Err(VaultError::InvalidCredentials)
        ));
    }
}

#[test]
fn recovery_requires_setup() {
    let vault = vault();
    vault.register("alice", PASSWORD).unwrap();
    assert!(matches!(
        vault.recover_with_code("alice", "ABCD-EFGH", "new-password"),
        Err(VaultError::RecoveryNotConfigured)
    ));
}

// ── Crypto-erasure ───────────────────────────────────────────────

#[test]
fn erased_user_is_unreachable_by_every_path() {
    let vault = vault();
    let kek = vault.register("alice", PASSWORD).unwrap();
    for id in ["a", "b", "c"] {
        vault.create_item_key("alice", id, &kek).unwrap();
    }
    let phone = vault.enroll_device("alice", "phone", &kek).unwrap();
    let codes = vault.setup_recovery("alice", &kek).unwrap();
    vault.register("bob", "bob-password").unwrap();

    let report = vault.crypto_erase("alice").unwrap();
    assert!(report.covers_all());
    assert_eq!(report.removed[&MaterialKind::AccountSalt], 1);
    assert_eq!(report.removed[&MaterialKind::WrappedDataKeys], 3);
    assert_eq!(report.removed[&MaterialKind::DeviceGrants], 1);
    assert_eq!(report.removed[&MaterialKind::RecoverySlots], 4);
    assert_eq!(report.removed[&MaterialKind::RecoveryEscrow], 1);

    assert!(matches!(vault.unlock("alice", PASSWORD), Err(VaultError::UserNotFound(_))));
    assert!(matches!(
        vault.unlock_with_device("alice", "phone", &phone),
        Err(VaultError::InvalidCredentials)
    ));
    assert!(matches!(
        vault.recover_with_code("alice", codes[0].as_str(), "new-password"),
        Err(VaultError::UserNotFound(_))
    ));
    assert!(vault.open_item_key("alice", "a", &kek).is_err());
    assert!(vault.list_item_ids("alice").unwrap().is_empty());

    // Other users are untouched.
    vault.unlock("bob", "bob-password").unwrap();
}

#[test]
fn erasing_unknown_user_fails() {
    let vault = vault();
    assert!(matches!(vault.crypto_erase("ghost"), Err(VaultError::UserNotFound(_))));
}

// ── Persistence ──────────────────────────────────────────────────

#[test]
fn file_backed_store_survives_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.duckdb");

    let ciphertext = {
        let vault = KeyVault::open(&path, VaultConfig::for_tests()).unwrap();
        let kek = vault.register("alice", PASSWORD).unwrap();
        let dek = vault.create_item_key("alice", "note", &kek).unwrap();
        vault.change_password("alice", PASSWORD, "after-rotation").unwrap();
        encrypt_payload("note", b"persisted", &dek).unwrap()
    };

    let vault = KeyVault::open(&path, VaultConfig::for_tests()).unwrap();
    let kek = vault.unlock("alice", "after-rotation").unwrap();
    assert_eq!(kek.version(), KeyVersion::new(2));
    let dek = vault.open_item_key("alice", "note", &kek).unwrap();
    assert_eq!(decrypt_payload("note", &ciphertext, &dek).unwrap(), b"persisted");
}
