//! KDBX 4 open/save pipeline
//!
//! Open: outer header → key schedule → header hash + HMAC verification →
//! HMAC block stream → body cipher → optional gzip → inner header → XML
//! tree. Save runs the same pipeline backwards with fresh randomness for
//! every seed.

pub mod header;
pub mod hmac_stream;

use std::collections::HashMap;

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::crypto::inner_stream::{InnerStream, INNER_STREAM_CHACHA20};
use crate::db::binary_pool::BinaryId;
use crate::db::database::{Database, FileVersion, OpenOptions, Phase, Settings};
use crate::db::entry::Entry;
use crate::error::{Error, Result};
use crate::format::compression;
use crate::keys::{self, CompositeKey, PasswordEncoding};
use crate::xml::{parse, write};

/// Decrypt and materialize a KDBX 4 container
pub(crate) fn open(
    data: &[u8],
    key: &CompositeKey,
    options: &mut OpenOptions,
) -> Result<Database> {
    let hdr = header::read_header(data)?;

    options.report(Phase::TransformKey);
    let raw_key = key.raw_key(PasswordEncoding::Utf8, Some(&hdr.master_seed))?;
    let transformed = hdr.kdf.derive(&raw_key)?;
    let final_key = keys::final_key(&hdr.master_seed, &transformed);
    let hmac_key = keys::hmac_key(&hdr.master_seed, &transformed);

    options.report(Phase::Verify);
    let trailer_end = hdr.end + 64;
    if data.len() < trailer_end {
        return Err(Error::Malformed("file truncated after header".into()));
    }
    let stored_hash = &data[hdr.end..hdr.end + 32];
    if stored_hash != Sha256::digest(&hdr.raw).as_slice() {
        // A corrupted header and a wrong key are deliberately
        // indistinguishable here.
        return Err(Error::InvalidCredentials);
    }
    let stored_mac = &data[hdr.end + 32..trailer_end];
    if stored_mac != hmac_stream::header_mac(&hdr.raw, &hmac_key).as_slice() {
        return Err(Error::InvalidCredentials);
    }

    options.report(Phase::Decrypt);
    let ciphertext = hmac_stream::read_blocks(&data[trailer_end..], &hmac_key)?;
    let decrypted = hdr.cipher.decrypt(&ciphertext, &final_key, &hdr.encryption_iv)?;
    let plaintext = if hdr.compression {
        compression::decompress(&decrypted)
            .map_err(|_| Error::Malformed("body decompression failed".into()))?
    } else {
        decrypted
    };

    let inner = header::read_inner_header(&plaintext)?;
    let mut stream = InnerStream::new(inner.stream_id, &inner.stream_key)?;

    let mut db = Database::bare(Settings {
        version: FileVersion::Kdbx {
            minor: hdr.minor_version,
        },
        cipher: hdr.cipher,
        compression: hdr.compression,
        kdf: hdr.kdf.clone(),
        public_custom_data: hdr.public_custom_data.clone(),
    });

    let mut binary_ids = Vec::with_capacity(inner.binaries.len());
    for (protected, payload) in &inner.binaries {
        binary_ids.push(db.binaries.put(payload, *protected)?);
    }

    options.report(Phase::Parse);
    parse::parse_document(
        &plaintext[inner.end..],
        &mut stream,
        &mut db,
        options.duplicate_id_policy,
        &binary_ids,
    )?;
    Ok(db)
}

/// Serialize and encrypt a KDBX 4 container
pub(crate) fn save(
    db: &mut Database,
    key: &CompositeKey,
    progress: &mut dyn FnMut(Phase),
) -> Result<Vec<u8>> {
    db.sweep_binaries();

    let minor = required_minor(db);
    db.settings.version = FileVersion::Kdbx { minor };

    // Fresh randomness for every derivation input on every save
    let mut rng = rand::thread_rng();
    let mut master_seed = vec![0u8; 32];
    rng.fill_bytes(&mut master_seed);
    let mut encryption_iv = vec![0u8; db.settings.cipher.iv_len()];
    rng.fill_bytes(&mut encryption_iv);
    let mut stream_key = vec![0u8; 64];
    rng.fill_bytes(&mut stream_key);
    db.settings.kdf.reseed();

    progress(Phase::Serialize);
    let attachment_order = attachment_wire_order(db);
    let binary_index: HashMap<BinaryId, usize> = attachment_order
        .iter()
        .enumerate()
        .map(|(index, id)| (*id, index))
        .collect();

    let mut stream = InnerStream::new(INNER_STREAM_CHACHA20, &stream_key)?;
    let xml = write::write_document(db, &mut stream, &binary_index)?;

    let mut binaries = Vec::with_capacity(attachment_order.len());
    for id in &attachment_order {
        let protected = db
            .binaries
            .payload(*id)
            .map(|p| p.is_protected())
            .unwrap_or(false);
        binaries.push((protected, db.binaries.get(*id)?));
    }
    let mut plaintext =
        header::write_inner_header(INNER_STREAM_CHACHA20, &stream_key, &binaries);
    plaintext.extend_from_slice(&xml);

    if db.settings.compression {
        plaintext = compression::compress(&plaintext)?;
    }

    progress(Phase::TransformKey);
    let raw_key = key.raw_key(PasswordEncoding::Utf8, Some(&master_seed))?;
    let transformed = db.settings.kdf.derive(&raw_key)?;
    let final_key = keys::final_key(&master_seed, &transformed);
    let hmac_key = keys::hmac_key(&master_seed, &transformed);

    progress(Phase::Encrypt);
    let ciphertext = db
        .settings
        .cipher
        .encrypt(&plaintext, &final_key, &encryption_iv)?;

    progress(Phase::Write);
    let header_bytes = header::write_header(
        minor,
        db.settings.cipher,
        db.settings.compression,
        &master_seed,
        &encryption_iv,
        &db.settings.kdf,
        db.settings.public_custom_data.as_ref(),
    );
    let mut out = header_bytes.clone();
    out.extend_from_slice(&Sha256::digest(&header_bytes));
    out.extend_from_slice(&hmac_stream::header_mac(&header_bytes, &hmac_key));
    out.extend_from_slice(&hmac_stream::write_blocks(&ciphertext, &hmac_key));
    Ok(out)
}

/// The lowest minor version the data allows. Group tags, timestamped
/// custom data, named or stamped icons and disabled quality checks only
/// exist in 4.1.
fn required_minor(db: &Database) -> u16 {
    let entry_needs_41 = |entry: &Entry| {
        !entry.quality_check
            || entry.custom_data.has_timestamps()
            || entry.history.iter().any(|snapshot| {
                !snapshot.quality_check || snapshot.custom_data.has_timestamps()
            })
    };

    let groups_need_41 = db
        .groups()
        .any(|group| !group.tags.is_empty() || group.custom_data.has_timestamps());
    let entries_need_41 = db.entries().any(entry_needs_41);
    let icons_need_41 = db
        .meta
        .custom_icons
        .iter()
        .any(|icon| icon.name.is_some() || icon.last_modified.is_some());
    let meta_needs_41 =
        db.meta.settings_changed.is_some() || db.meta.custom_data.has_timestamps();

    if groups_need_41 || entries_need_41 || icons_need_41 || meta_needs_41 {
        1
    } else {
        0
    }
}

/// Attachment payloads in deterministic wire order (ascending pool id),
/// excluding payloads only referenced by icons
fn attachment_wire_order(db: &Database) -> Vec<BinaryId> {
    let mut referenced = std::collections::HashSet::new();
    for entry in db.entries() {
        collect_attachments(entry, &mut referenced);
    }
    db.binaries
        .ids()
        .filter(|id| referenced.contains(id))
        .collect()
}

fn collect_attachments(entry: &Entry, out: &mut std::collections::HashSet<BinaryId>) {
    for attachment in &entry.binaries {
        out.insert(attachment.binary);
    }
    for snapshot in &entry.history {
        collect_attachments(snapshot, out);
    }
}
