//! Whole-pipeline tests: open/save round trips, tamper sensitivity and
//! the credential failure paths for both container families.

use kdbx_core::format::kdb::header::HEADER_LEN;
use kdbx_core::format::kdbx::header::read_header;
use kdbx_core::{
    CipherId, CompositeKey, Database, DuplicateIdPolicy, Entry, EntryBuilder, Error, FileVersion,
    Group, KdfParams, OpenOptions, Settings,
};

/// Cheap KDF so the tests stay fast
fn fast_aes_kdf() -> KdfParams {
    let mut params = KdfParams::default_aes();
    if let KdfParams::Aes { rounds, .. } = &mut params {
        *rounds = 64;
    }
    params
}

fn fast_argon2(variant_id: bool) -> KdfParams {
    let mut params = KdfParams::default_argon2();
    if let KdfParams::Argon2 {
        memory,
        iterations,
        parallelism,
        variant,
        ..
    } = &mut params
    {
        *memory = 1024 * 1024;
        *iterations = 1;
        *parallelism = 1;
        if variant_id {
            *variant = kdbx_core::crypto::kdf::Argon2Variant::Argon2id;
        }
    }
    params
}

fn sample_database() -> Database {
    let mut db = Database::new("Example Vault");
    db.meta.database_description = "round-trip fixture".into();
    db.meta.default_username = "alice".into();

    let attachment = db.binaries.put(b"-----BEGIN KEY-----", false).unwrap();

    let work = db.add_group(Group::new("Work"));
    let mut servers = Group::new("Servers");
    servers.parent = Some(work);
    servers.tags = vec!["infra".into()];
    let servers = db.add_group(servers);

    let mut mail = EntryBuilder::new("Mail")
        .username("alice@example.com")
        .password("correct horse battery staple")
        .url("https://mail.example.com")
        .notes("IMAP on port 993")
        .field("Backup Codes", "1234 5678")
        .protected_field("PIN", "0000")
        .tag("email")
        .parent(work)
        .build();
    mail.push_history();
    mail.set_password("correct horse battery staple 2");
    db.add_entry(mail);

    let ssh = EntryBuilder::new("SSH")
        .username("root")
        .password("hunter2")
        .attachment("id_ed25519", attachment)
        .parent(servers)
        .build();
    db.add_entry(ssh);

    db
}

fn assert_trees_equal(original: &Database, reopened: &Database) {
    assert_eq!(original.meta, reopened.meta);
    assert_eq!(original.root_uuid(), reopened.root_uuid());
    assert_eq!(original.groups().count(), reopened.groups().count());
    assert_eq!(original.entries().count(), reopened.entries().count());

    for group in original.groups() {
        let other = reopened
            .group(&group.uuid)
            .unwrap_or_else(|| panic!("group {} lost in round trip", group.uuid));
        assert_eq!(group, other);
    }
    for entry in original.entries() {
        let other = reopened
            .entry(&entry.uuid)
            .unwrap_or_else(|| panic!("entry {} lost in round trip", entry.uuid));
        assert_eq!(entry, other);
        for (a, b) in entry.binaries.iter().zip(&other.binaries) {
            assert_eq!(
                original.binaries.get(a.binary).unwrap(),
                reopened.binaries.get(b.binary).unwrap()
            );
        }
    }
    assert_eq!(original.deleted_objects, reopened.deleted_objects);
}

#[test]
fn kdbx_round_trip_aes_argon2d() {
    let mut db = sample_database();
    db.settings.kdf = fast_argon2(false);
    db.set_key(CompositeKey::new().with_password("pw"));

    let bytes = db.save().unwrap();
    let reopened = Database::open(&bytes, CompositeKey::new().with_password("pw")).unwrap();
    assert_trees_equal(&db, &reopened);
}

#[test]
fn kdbx_round_trip_chacha20_aeskdf_uncompressed() {
    let mut db = sample_database();
    db.settings.cipher = CipherId::ChaCha20;
    db.settings.compression = false;
    db.settings.kdf = fast_aes_kdf();
    db.set_key(CompositeKey::new().with_password("pw"));

    let bytes = db.save().unwrap();
    let reopened = Database::open(&bytes, CompositeKey::new().with_password("pw")).unwrap();
    assert!(!reopened.settings.compression);
    assert_eq!(reopened.settings.cipher, CipherId::ChaCha20);
    assert_trees_equal(&db, &reopened);
}

#[test]
fn kdbx_round_trip_twofish_argon2id_with_keyfile() {
    let keyfile = [0x5Au8; 32];
    let key = || {
        CompositeKey::new()
            .with_password("pw")
            .with_keyfile(&keyfile)
            .unwrap()
    };

    let mut db = sample_database();
    db.settings.cipher = CipherId::Twofish;
    db.settings.kdf = fast_argon2(true);
    db.set_key(key());

    let bytes = db.save().unwrap();
    let reopened = Database::open(&bytes, key()).unwrap();
    assert_trees_equal(&db, &reopened);

    // Key file alone is not enough
    let partial = CompositeKey::new().with_password("pw");
    assert!(matches!(
        Database::open(&bytes, partial),
        Err(Error::InvalidCredentials)
    ));
}

#[test]
fn kdbx_wrong_password_is_invalid_credentials() {
    let mut db = sample_database();
    db.settings.kdf = fast_aes_kdf();
    db.set_key(CompositeKey::new().with_password("right"));
    let bytes = db.save().unwrap();

    assert!(matches!(
        Database::open(&bytes, CompositeKey::new().with_password("wrong")),
        Err(Error::InvalidCredentials)
    ));
}

#[test]
fn kdbx_hardware_factor_round_trip() {
    let respond = |challenge: Option<&[u8]>| -> kdbx_core::Result<Vec<u8>> {
        // Stand-in for a hardware token: response depends on the challenge
        let mut out = b"hw-response:".to_vec();
        out.extend_from_slice(challenge.unwrap_or_default());
        Ok(out)
    };

    let mut db = sample_database();
    db.settings.kdf = fast_aes_kdf();
    db.set_key(CompositeKey::new().with_hardware_key(respond));

    let bytes = db.save().unwrap();
    let reopened =
        Database::open(&bytes, CompositeKey::new().with_hardware_key(respond)).unwrap();
    assert_trees_equal(&db, &reopened);

    let other =
        |_: Option<&[u8]>| -> kdbx_core::Result<Vec<u8>> { Ok(b"different token".to_vec()) };
    assert!(matches!(
        Database::open(&bytes, CompositeKey::new().with_hardware_key(other)),
        Err(Error::InvalidCredentials)
    ));
}

#[test]
fn spec_scenario_v4_aeskdf_two_rounds() {
    // A V4 file, AES-256, AES-KDF with rounds=2, one group holding one
    // entry {Test, secret}
    let mut db = Database::new("Root");
    db.settings.cipher = CipherId::Aes256;
    db.settings.kdf = {
        let mut params = KdfParams::default_aes();
        if let KdfParams::Aes { rounds, .. } = &mut params {
            *rounds = 2;
        }
        params
    };
    db.add_entry(EntryBuilder::new("Test").password("secret").build());
    db.set_key(CompositeKey::new().with_password("open sesame"));
    let bytes = db.save().unwrap();

    let reopened =
        Database::open(&bytes, CompositeKey::new().with_password("open sesame")).unwrap();
    assert_eq!(reopened.entries().count(), 1);
    let entry = reopened.entries().next().unwrap();
    assert_eq!(entry.title(), Some("Test"));
    assert_eq!(entry.password(), Some("secret"));

    assert!(matches!(
        Database::open(&bytes, CompositeKey::new().with_password("not quite")),
        Err(Error::InvalidCredentials)
    ));
}

#[test]
fn kdbx_single_byte_tampering_fails_closed() {
    let mut db = sample_database();
    db.settings.kdf = fast_aes_kdf();
    db.set_key(CompositeKey::new().with_password("pw"));
    let bytes = db.save().unwrap();

    // Everything after the outer header: stored hash, stored HMAC, blocks
    let body_start = read_header(&bytes).unwrap().end;
    let key = || CompositeKey::new().with_password("pw");
    for offset in (body_start..bytes.len()).step_by(13) {
        let mut tampered = bytes.clone();
        tampered[offset] ^= 0x01;
        match Database::open(&tampered, key()) {
            Err(Error::InvalidCredentials) | Err(Error::Malformed(_)) => {}
            Err(other) => panic!("offset {offset}: unexpected error {other:?}"),
            Ok(_) => panic!("offset {offset}: tampered file opened successfully"),
        }
    }
}

#[test]
fn kdbx_version_3_is_rejected() {
    let mut db = sample_database();
    db.settings.kdf = fast_aes_kdf();
    db.set_key(CompositeKey::new().with_password("pw"));
    let mut bytes = db.save().unwrap();
    bytes[10] = 3; // major version

    assert!(matches!(
        Database::open(&bytes, CompositeKey::new().with_password("pw")),
        Err(Error::InvalidVersion(_))
    ));
}

#[test]
fn kdbx_minimum_version_tracks_features() {
    let mut db = Database::new("plain");
    db.settings.kdf = fast_aes_kdf();
    db.add_entry(Entry::new("e"));
    db.set_key(CompositeKey::new().with_password("pw"));
    db.save().unwrap();
    assert_eq!(db.settings.version, FileVersion::Kdbx { minor: 0 });

    // Group tags only exist in 4.1; saving must not downgrade them away
    let tagged = db.root_uuid();
    db.group_mut(&tagged).unwrap().tags = vec!["tagged".into()];
    db.save().unwrap();
    assert_eq!(db.settings.version, FileVersion::Kdbx { minor: 1 });
}

#[test]
fn kdbx_duplicate_policy_selected_at_load_time() {
    let mut db = sample_database();
    db.settings.kdf = fast_aes_kdf();
    db.set_key(CompositeKey::new().with_password("pw"));
    let bytes = db.save().unwrap();

    // A well-formed file opens under either policy
    for policy in [DuplicateIdPolicy::Reject, DuplicateIdPolicy::Renumber] {
        let options = OpenOptions::new().duplicate_id_policy(policy);
        let reopened = Database::open_with_options(
            &bytes,
            CompositeKey::new().with_password("pw"),
            options,
        )
        .unwrap();
        assert_eq!(reopened.entries().count(), db.entries().count());
    }
}

#[test]
fn kdbx_progress_phases_are_reported() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let mut db = sample_database();
    db.settings.kdf = fast_aes_kdf();
    db.set_key(CompositeKey::new().with_password("pw"));
    let bytes = db.save().unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let options = OpenOptions::new()
        .progress(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    Database::open_with_options(&bytes, CompositeKey::new().with_password("pw"), options)
        .unwrap();
    assert!(seen.load(Ordering::SeqCst) >= 4);
}

#[test]
fn kdbx_custom_icons_round_trip() {
    use kdbx_core::{CustomIcon, Uuid};

    let mut db = sample_database();
    db.settings.kdf = fast_aes_kdf();

    let icon_uuid = Uuid::new_v4();
    let icon_data = db.binaries.put(b"\x89PNG fake image", false).unwrap();
    db.meta.custom_icons.push(CustomIcon {
        uuid: icon_uuid,
        data: icon_data,
        name: Some("server".into()),
        last_modified: None,
    });
    let holder = db.add_entry(Entry::new("iconed"));
    db.entry_mut(&holder).unwrap().custom_icon = Some(icon_uuid);

    db.set_key(CompositeKey::new().with_password("pw"));
    let bytes = db.save().unwrap();
    // A named icon only exists in the 4.1 sub-version
    assert_eq!(db.settings.version, FileVersion::Kdbx { minor: 1 });

    let reopened = Database::open(&bytes, CompositeKey::new().with_password("pw")).unwrap();
    let icon = reopened.meta.custom_icon(&icon_uuid).expect("icon kept");
    assert_eq!(icon.name.as_deref(), Some("server"));
    assert_eq!(
        reopened.binaries.get(icon.data).unwrap(),
        b"\x89PNG fake image"
    );
    assert_eq!(
        reopened.entry(&holder).unwrap().custom_icon,
        Some(icon_uuid)
    );
    assert_trees_equal(&db, &reopened);
}

// --- legacy format ---------------------------------------------------

fn sample_legacy_database() -> Database {
    let mut db = Database::new("Legacy");
    db.settings = Settings::default_kdb();
    db.settings.kdf = fast_aes_kdf();

    let general = db.add_group(Group::new("General"));
    let mut email = Group::new("Email");
    email.parent = Some(general);
    let email = db.add_group(email);

    let attachment = db.binaries.put(b"attached bytes", false).unwrap();
    db.add_entry(
        EntryBuilder::new("Webmail")
            .username("bob")
            .password("legacy secret")
            .url("https://mail.example.org")
            .notes("two lines\nof notes")
            .attachment("note.txt", attachment)
            .parent(email)
            .build(),
    );
    db.add_entry(
        EntryBuilder::new("Router")
            .username("admin")
            .password("changeme")
            .parent(general)
            .build(),
    );
    db
}

fn assert_legacy_round_trip(db: &Database, reopened: &Database) {
    // Legacy round trips preserve the tree and the legacy field set
    assert_eq!(db.groups().count(), reopened.groups().count());
    assert_eq!(db.entries().count(), reopened.entries().count());

    for entry in db.entries() {
        let other = reopened
            .entry(&entry.uuid)
            .unwrap_or_else(|| panic!("entry {} lost in round trip", entry.uuid));
        assert_eq!(entry.title(), other.title());
        assert_eq!(entry.username(), other.username());
        assert_eq!(entry.password(), other.password());
        assert_eq!(entry.url(), other.url());
        assert_eq!(entry.notes(), other.notes());
        assert_eq!(entry.icon_id, other.icon_id);
        assert_eq!(entry.times.creation, other.times.creation);
        assert_eq!(entry.times.expires, other.times.expires);

        let original_parent = db.group(&entry.parent.unwrap()).unwrap();
        let reopened_parent = reopened.group(&other.parent.unwrap()).unwrap();
        assert_eq!(original_parent.name, reopened_parent.name);
        assert_eq!(original_parent.legacy_id, reopened_parent.legacy_id);

        for (a, b) in entry.binaries.iter().zip(&other.binaries) {
            assert_eq!(a.key, b.key);
            assert_eq!(
                db.binaries.get(a.binary).unwrap(),
                reopened.binaries.get(b.binary).unwrap()
            );
        }
    }
}

#[test]
fn kdb_round_trip_aes() {
    let mut db = sample_legacy_database();
    db.set_key(CompositeKey::new().with_password("pw"));
    let bytes = db.save().unwrap();

    let reopened = Database::open(&bytes, CompositeKey::new().with_password("pw")).unwrap();
    assert_eq!(reopened.settings.version, FileVersion::Kdb);
    assert_legacy_round_trip(&db, &reopened);
}

#[test]
fn kdb_round_trip_twofish() {
    let mut db = sample_legacy_database();
    db.settings.cipher = CipherId::Twofish;
    db.set_key(CompositeKey::new().with_password("pw"));
    let bytes = db.save().unwrap();

    let reopened = Database::open(&bytes, CompositeKey::new().with_password("pw")).unwrap();
    assert_eq!(reopened.settings.cipher, CipherId::Twofish);
    assert_legacy_round_trip(&db, &reopened);
}

#[test]
fn kdb_wrong_password_is_invalid_credentials() {
    let mut db = sample_legacy_database();
    db.set_key(CompositeKey::new().with_password("right"));
    let bytes = db.save().unwrap();

    assert!(matches!(
        Database::open(&bytes, CompositeKey::new().with_password("wrong")),
        Err(Error::InvalidCredentials)
    ));
}

#[test]
fn kdb_corrupted_content_hash_is_invalid_credentials() {
    let mut db = sample_legacy_database();
    db.set_key(CompositeKey::new().with_password("pw"));
    let mut bytes = db.save().unwrap();

    // The stored content hash lives at bytes 56..88; the ciphertext still
    // decrypts fine, so only the hash check can catch this
    bytes[60] ^= 0xFF;
    assert!(matches!(
        Database::open(&bytes, CompositeKey::new().with_password("pw")),
        Err(Error::InvalidCredentials)
    ));
}

#[test]
fn kdb_body_tampering_fails_closed() {
    let mut db = sample_legacy_database();
    db.set_key(CompositeKey::new().with_password("pw"));
    let bytes = db.save().unwrap();

    let key = || CompositeKey::new().with_password("pw");
    for offset in (HEADER_LEN..bytes.len()).step_by(7) {
        let mut tampered = bytes.clone();
        tampered[offset] ^= 0x01;
        match Database::open(&tampered, key()) {
            Err(Error::InvalidCredentials) | Err(Error::Malformed(_)) => {}
            Err(other) => panic!("offset {offset}: unexpected error {other:?}"),
            Ok(_) => panic!("offset {offset}: tampered file opened successfully"),
        }
    }
}

#[test]
fn kdb_rejects_entries_in_root() {
    let mut db = Database::new("Legacy");
    db.settings = Settings::default_kdb();
    db.settings.kdf = fast_aes_kdf();
    db.add_entry(Entry::new("homeless"));
    db.set_key(CompositeKey::new().with_password("pw"));

    assert!(matches!(db.save(), Err(Error::Malformed(_))));
}

#[test]
fn kdb_rejects_chacha20() {
    let mut db = sample_legacy_database();
    db.settings.cipher = CipherId::ChaCha20;
    db.set_key(CompositeKey::new().with_password("pw"));
    assert!(matches!(db.save(), Err(Error::InvalidAlgorithm)));
}

// --- shared behaviors ------------------------------------------------

#[test]
fn compression_toggle_preserves_payloads() {
    let mut db = sample_database();
    db.settings.kdf = fast_aes_kdf();
    let id = db.binaries.put(b"toggle me around".as_slice(), false).unwrap();
    let entry = EntryBuilder::new("holder").attachment("t", id).build();
    db.add_entry(entry);

    let before = db.binaries.get(id).unwrap();
    db.set_compression(true).unwrap();
    db.set_compression(false).unwrap();
    assert_eq!(db.binaries.get(id).unwrap(), before);
    assert!(!db.settings.compression);
}

#[test]
fn empty_composite_key_is_rejected() {
    let mut db = sample_database();
    db.settings.kdf = fast_aes_kdf();
    db.set_key(CompositeKey::new());
    assert!(matches!(db.save(), Err(Error::EmptyCredential)));
}

#[test]
fn garbage_input_is_invalid_signature() {
    let key = CompositeKey::new().with_password("pw");
    assert!(matches!(
        Database::open(b"definitely not a database", key),
        Err(Error::InvalidSignature)
    ));
}

#[test]
fn master_seed_is_rerandomized_on_every_save() {
    let mut db = sample_database();
    db.settings.kdf = fast_aes_kdf();
    db.set_key(CompositeKey::new().with_password("pw"));

    let first = db.save().unwrap();
    let second = db.save().unwrap();
    let seed_a = read_header(&first).unwrap().master_seed;
    let seed_b = read_header(&second).unwrap().master_seed;
    assert_ne!(seed_a, seed_b);

    // Both files still open with the same key
    Database::open(&first, CompositeKey::new().with_password("pw")).unwrap();
    Database::open(&second, CompositeKey::new().with_password("pw")).unwrap();
}
