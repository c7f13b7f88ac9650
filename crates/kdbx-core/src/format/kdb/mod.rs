//! Legacy KDB open/save pipeline
//!
//! The body is decrypted in one pass (whole-buffer, all-or-nothing),
//! verified against the header's content hash, then read as fixed
//! `(u16 type, u32 size, value)` triples: first `group_count` group
//! records, then `entry_count` entry records, each closed by the 0xFFFF
//! sentinel. Groups arrive pre-order with a level field; entries
//! reference their group by 32-bit id. Unknown field types are skipped.

pub mod header;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::crypto::kdf::derive_aes_kdf;
use crate::crypto::{CipherId, KdfParams};
use crate::db::database::{Database, FileVersion, OpenOptions, Phase, Settings};
use crate::db::entry::{Attachment, Entry, FieldValue, FIELD_NOTES, FIELD_PASSWORD, FIELD_TITLE, FIELD_URL, FIELD_USERNAME};
use crate::db::group::Group;
use crate::db::protected::ProtectedString;
use crate::db::times::Times;
use crate::error::{Error, Result};
use crate::keys::{self, CompositeKey, PasswordEncoding};

const FIELD_END: u16 = 0xFFFF;
const FIELD_IGNORE: u16 = 0x0000;

const GROUP_FIELD_ID: u16 = 0x0001;
const GROUP_FIELD_NAME: u16 = 0x0002;
const GROUP_FIELD_CREATION: u16 = 0x0003;
const GROUP_FIELD_LAST_MOD: u16 = 0x0004;
const GROUP_FIELD_LAST_ACCESS: u16 = 0x0005;
const GROUP_FIELD_EXPIRE: u16 = 0x0006;
const GROUP_FIELD_ICON: u16 = 0x0007;
const GROUP_FIELD_LEVEL: u16 = 0x0008;
const GROUP_FIELD_FLAGS: u16 = 0x0009;

const ENTRY_FIELD_UUID: u16 = 0x0001;
const ENTRY_FIELD_GROUP_ID: u16 = 0x0002;
const ENTRY_FIELD_ICON: u16 = 0x0003;
const ENTRY_FIELD_TITLE: u16 = 0x0004;
const ENTRY_FIELD_URL: u16 = 0x0005;
const ENTRY_FIELD_USERNAME: u16 = 0x0006;
const ENTRY_FIELD_PASSWORD: u16 = 0x0007;
const ENTRY_FIELD_NOTES: u16 = 0x0008;
const ENTRY_FIELD_CREATION: u16 = 0x0009;
const ENTRY_FIELD_LAST_MOD: u16 = 0x000A;
const ENTRY_FIELD_LAST_ACCESS: u16 = 0x000B;
const ENTRY_FIELD_EXPIRE: u16 = 0x000C;
const ENTRY_FIELD_BINARY_DESC: u16 = 0x000D;
const ENTRY_FIELD_BINARY_DATA: u16 = 0x000E;

/// Decrypt and materialize a legacy container
pub(crate) fn open(
    data: &[u8],
    key: &CompositeKey,
    options: &mut OpenOptions,
) -> Result<Database> {
    let hdr = header::read_header(data)?;

    options.report(Phase::TransformKey);
    let raw_key = key.raw_key(PasswordEncoding::Latin1, Some(&hdr.master_seed))?;
    let transformed = derive_aes_kdf(&raw_key, &hdr.transform_seed, hdr.key_rounds as u64);
    let final_key = keys::final_key(&hdr.master_seed, &transformed);

    options.report(Phase::Decrypt);
    let plaintext = hdr
        .cipher
        .decrypt(&data[header::HEADER_LEN..], &final_key, &hdr.encryption_iv)?;

    options.report(Phase::Verify);
    if Sha256::digest(&plaintext).as_slice() != &hdr.content_hash[..] {
        return Err(Error::InvalidCredentials);
    }

    options.report(Phase::Parse);
    let mut db = Database::bare(Settings {
        version: FileVersion::Kdb,
        cipher: hdr.cipher,
        compression: false,
        kdf: KdfParams::Aes {
            rounds: hdr.key_rounds as u64,
            seed: hdr.transform_seed,
        },
        public_custom_data: None,
    });

    // The legacy format has no explicit root; level-0 groups hang off a
    // synthetic one.
    let root_uuid = db.index_group(Group::new("Root"), options.duplicate_id_policy)?;
    db.set_root(root_uuid);

    let mut pos = 0usize;
    let mut level_stack: Vec<Uuid> = Vec::new();
    for _ in 0..hdr.group_count {
        let (group, level) = read_group_record(&plaintext, &mut pos)?;
        let parent = if level == 0 {
            root_uuid
        } else {
            *level_stack
                .get(level as usize - 1)
                .ok_or_else(|| Error::Malformed("group level skips a generation".into()))?
        };
        let mut group = group;
        group.parent = Some(parent);
        let uuid = db.index_group(group, options.duplicate_id_policy)?;
        if let Some(parent) = db.group_mut(&parent) {
            parent.groups.push(uuid);
        }
        level_stack.truncate(level as usize);
        level_stack.push(uuid);
    }

    for _ in 0..hdr.entry_count {
        let (entry, group_id) = read_entry_record(&plaintext, &mut pos, &mut db)?;
        let parent = match group_id {
            Some(id) => db.group_by_legacy_id(id).ok_or_else(|| {
                Error::Malformed(format!("entry references unknown group {id}"))
            })?,
            None => return Err(Error::Malformed("entry record without a group id".into())),
        };
        let mut entry = entry;
        entry.parent = Some(parent);
        let uuid = db.index_entry(entry, options.duplicate_id_policy)?;
        if let Some(parent) = db.group_mut(&parent) {
            parent.entries.push(uuid);
        }
    }

    if pos != plaintext.len() {
        return Err(Error::Malformed("trailing bytes after the last record".into()));
    }
    Ok(db)
}

/// Serialize and encrypt a legacy container
pub(crate) fn save(
    db: &mut Database,
    key: &CompositeKey,
    progress: &mut dyn FnMut(Phase),
) -> Result<Vec<u8>> {
    // The legacy format can only carry what its fields define
    let cipher = db.settings.cipher;
    if !matches!(cipher, CipherId::Aes256 | CipherId::Twofish) {
        return Err(Error::InvalidAlgorithm);
    }
    if !db.root_group().entries.is_empty() {
        return Err(Error::Malformed(
            "the legacy format cannot store entries in the root group".into(),
        ));
    }

    db.sweep_binaries();
    db.assign_legacy_ids();
    db.settings.kdf.reseed();
    let (key_rounds, transform_seed) = match &db.settings.kdf {
        KdfParams::Aes { rounds, seed } => (*rounds, *seed),
        KdfParams::Argon2 { .. } => return Err(Error::InvalidAlgorithm),
    };
    let key_rounds = u32::try_from(key_rounds).map_err(|_| Error::InvalidAlgorithm)?;

    progress(Phase::Serialize);
    let mut body = Vec::new();
    let mut group_count = 0u32;
    let mut entry_count = 0u32;
    let root_uuid = db.root_uuid();
    write_group_subtree(db, root_uuid, 0, &mut body, &mut group_count)?;
    write_entries_preorder(db, root_uuid, &mut body, &mut entry_count)?;

    progress(Phase::TransformKey);
    let mut rng = rand::thread_rng();
    let mut master_seed = [0u8; 16];
    rng.fill_bytes(&mut master_seed);
    let mut encryption_iv = [0u8; 16];
    rng.fill_bytes(&mut encryption_iv);

    let raw_key = key.raw_key(PasswordEncoding::Latin1, Some(&master_seed))?;
    let transformed = derive_aes_kdf(&raw_key, &transform_seed, key_rounds as u64);
    let final_key = keys::final_key(&master_seed, &transformed);

    progress(Phase::Encrypt);
    let content_hash: [u8; 32] = Sha256::digest(&body).into();
    let ciphertext = cipher.encrypt(&body, &final_key, &encryption_iv)?;

    progress(Phase::Write);
    let header = header::KdbHeader {
        cipher,
        master_seed,
        encryption_iv,
        group_count,
        entry_count,
        content_hash,
        transform_seed,
        key_rounds,
    };
    let mut out = header::write_header(&header);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

// --- record reading --------------------------------------------------

fn read_group_record(data: &[u8], pos: &mut usize) -> Result<(Group, u16)> {
    let mut group = Group::new(String::new());
    let mut level = 0u16;
    loop {
        let (field_type, value) = read_field(data, pos)?;
        match field_type {
            FIELD_END => break,
            FIELD_IGNORE => {}
            GROUP_FIELD_ID => group.legacy_id = Some(read_u32(value)?),
            GROUP_FIELD_NAME => group.name = read_string(value),
            GROUP_FIELD_CREATION => group.times.creation = read_time(value)?,
            GROUP_FIELD_LAST_MOD => group.times.last_modification = read_time(value)?,
            GROUP_FIELD_LAST_ACCESS => group.times.last_access = read_time(value)?,
            GROUP_FIELD_EXPIRE => set_expiry(&mut group.times, value)?,
            GROUP_FIELD_ICON => group.icon_id = read_u32(value)?,
            GROUP_FIELD_LEVEL => level = read_u16(value)?,
            GROUP_FIELD_FLAGS => {}
            _ => {} // forward-compatible: unknown field types are skipped
        }
    }
    Ok((group, level))
}

fn read_entry_record(
    data: &[u8],
    pos: &mut usize,
    db: &mut Database,
) -> Result<(Entry, Option<u32>)> {
    let mut entry = Entry::empty();
    let mut group_id = None;
    let mut binary_desc = String::new();
    let mut binary_data: Option<Vec<u8>> = None;
    loop {
        let (field_type, value) = read_field(data, pos)?;
        match field_type {
            FIELD_END => break,
            FIELD_IGNORE => {}
            ENTRY_FIELD_UUID => {
                let raw: [u8; 16] = value
                    .try_into()
                    .map_err(|_| Error::Malformed("entry uuid must be 16 bytes".into()))?;
                entry.uuid = Uuid::from_bytes(raw);
            }
            ENTRY_FIELD_GROUP_ID => group_id = Some(read_u32(value)?),
            ENTRY_FIELD_ICON => entry.icon_id = read_u32(value)?,
            ENTRY_FIELD_TITLE => {
                entry.set_field(FIELD_TITLE, FieldValue::Plain(read_string(value)))
            }
            ENTRY_FIELD_URL => entry.set_field(FIELD_URL, FieldValue::Plain(read_string(value))),
            ENTRY_FIELD_USERNAME => {
                entry.set_field(FIELD_USERNAME, FieldValue::Plain(read_string(value)))
            }
            ENTRY_FIELD_PASSWORD => entry.set_field(
                FIELD_PASSWORD,
                FieldValue::Protected(ProtectedString::new(read_string(value))),
            ),
            ENTRY_FIELD_NOTES => {
                entry.set_field(FIELD_NOTES, FieldValue::Plain(read_string(value)))
            }
            ENTRY_FIELD_CREATION => entry.times.creation = read_time(value)?,
            ENTRY_FIELD_LAST_MOD => entry.times.last_modification = read_time(value)?,
            ENTRY_FIELD_LAST_ACCESS => entry.times.last_access = read_time(value)?,
            ENTRY_FIELD_EXPIRE => set_expiry(&mut entry.times, value)?,
            ENTRY_FIELD_BINARY_DESC => binary_desc = read_string(value),
            ENTRY_FIELD_BINARY_DATA => {
                if !value.is_empty() {
                    binary_data = Some(value.to_vec());
                }
            }
            _ => {} // forward-compatible: unknown field types are skipped
        }
    }
    if let Some(data) = binary_data {
        let id = db.binaries.put(&data, false)?;
        entry.binaries.push(Attachment {
            key: binary_desc,
            binary: id,
        });
    }
    Ok((entry, group_id))
}

fn read_field<'a>(data: &'a [u8], pos: &mut usize) -> Result<(u16, &'a [u8])> {
    if *pos + 6 > data.len() {
        return Err(Error::Malformed("truncated record".into()));
    }
    let field_type = LittleEndian::read_u16(&data[*pos..*pos + 2]);
    let size = LittleEndian::read_u32(&data[*pos + 2..*pos + 6]) as usize;
    *pos += 6;
    if *pos + size > data.len() {
        return Err(Error::Malformed("truncated record field".into()));
    }
    let value = &data[*pos..*pos + size];
    *pos += size;
    Ok((field_type, value))
}

fn read_u16(value: &[u8]) -> Result<u16> {
    if value.len() < 2 {
        return Err(Error::Malformed("field too short".into()));
    }
    Ok(LittleEndian::read_u16(value))
}

fn read_u32(value: &[u8]) -> Result<u32> {
    if value.len() < 4 {
        return Err(Error::Malformed("field too short".into()));
    }
    Ok(LittleEndian::read_u32(value))
}

/// Strings are stored null-terminated
fn read_string(value: &[u8]) -> String {
    let trimmed = value.strip_suffix(&[0]).unwrap_or(value);
    String::from_utf8_lossy(trimmed).into_owned()
}

fn set_expiry(times: &mut Times, value: &[u8]) -> Result<()> {
    let time = read_time(value)?;
    if time == never_expire() {
        times.expires = false;
        times.expiry = never_expire();
    } else {
        times.expires = true;
        times.expiry = time;
    }
    Ok(())
}

// --- record writing --------------------------------------------------

fn write_group_subtree(
    db: &Database,
    group_uuid: Uuid,
    level: u16,
    out: &mut Vec<u8>,
    count: &mut u32,
) -> Result<()> {
    let group = db
        .group(&group_uuid)
        .ok_or_else(|| Error::Malformed(format!("dangling group reference {group_uuid}")))?;

    // The synthetic root itself is not a record
    if group_uuid != db.root_uuid() {
        let id = group
            .legacy_id
            .ok_or_else(|| Error::Malformed("group without a legacy id".into()))?;
        write_field(out, GROUP_FIELD_ID, &id.to_le_bytes());
        write_string_field(out, GROUP_FIELD_NAME, &group.name);
        write_field(out, GROUP_FIELD_CREATION, &pack_time(group.times.creation));
        write_field(
            out,
            GROUP_FIELD_LAST_MOD,
            &pack_time(group.times.last_modification),
        );
        write_field(
            out,
            GROUP_FIELD_LAST_ACCESS,
            &pack_time(group.times.last_access),
        );
        write_field(out, GROUP_FIELD_EXPIRE, &pack_time(expiry_or_never(&group.times)));
        write_field(out, GROUP_FIELD_ICON, &group.icon_id.to_le_bytes());
        write_field(out, GROUP_FIELD_LEVEL, &(level - 1).to_le_bytes());
        write_field(out, GROUP_FIELD_FLAGS, &0u32.to_le_bytes());
        write_field(out, FIELD_END, &[]);
        *count += 1;
    }

    for child in &group.groups {
        write_group_subtree(db, *child, level + 1, out, count)?;
    }
    Ok(())
}

fn write_entries_preorder(
    db: &Database,
    group_uuid: Uuid,
    out: &mut Vec<u8>,
    count: &mut u32,
) -> Result<()> {
    let group = db
        .group(&group_uuid)
        .ok_or_else(|| Error::Malformed(format!("dangling group reference {group_uuid}")))?;
    let group_id = group.legacy_id;

    for entry_uuid in &group.entries {
        let entry = db
            .entry(entry_uuid)
            .ok_or_else(|| Error::Malformed(format!("dangling entry reference {entry_uuid}")))?;
        let group_id = group_id
            .ok_or_else(|| Error::Malformed("group without a legacy id".into()))?;

        write_field(out, ENTRY_FIELD_UUID, entry.uuid.as_bytes());
        write_field(out, ENTRY_FIELD_GROUP_ID, &group_id.to_le_bytes());
        write_field(out, ENTRY_FIELD_ICON, &entry.icon_id.to_le_bytes());
        write_string_field(out, ENTRY_FIELD_TITLE, entry.title().unwrap_or(""));
        write_string_field(out, ENTRY_FIELD_URL, entry.url().unwrap_or(""));
        write_string_field(out, ENTRY_FIELD_USERNAME, entry.username().unwrap_or(""));
        write_string_field(out, ENTRY_FIELD_PASSWORD, entry.password().unwrap_or(""));
        write_string_field(out, ENTRY_FIELD_NOTES, entry.notes().unwrap_or(""));
        write_field(out, ENTRY_FIELD_CREATION, &pack_time(entry.times.creation));
        write_field(
            out,
            ENTRY_FIELD_LAST_MOD,
            &pack_time(entry.times.last_modification),
        );
        write_field(
            out,
            ENTRY_FIELD_LAST_ACCESS,
            &pack_time(entry.times.last_access),
        );
        write_field(out, ENTRY_FIELD_EXPIRE, &pack_time(expiry_or_never(&entry.times)));
        if let Some(attachment) = entry.binaries.first() {
            write_string_field(out, ENTRY_FIELD_BINARY_DESC, &attachment.key);
            write_field(out, ENTRY_FIELD_BINARY_DATA, &db.binaries.get(attachment.binary)?);
        } else {
            write_string_field(out, ENTRY_FIELD_BINARY_DESC, "");
            write_field(out, ENTRY_FIELD_BINARY_DATA, &[]);
        }
        write_field(out, FIELD_END, &[]);
        *count += 1;
    }

    for child in &group.groups {
        write_entries_preorder(db, *child, out, count)?;
    }
    Ok(())
}

fn write_field(out: &mut Vec<u8>, field_type: u16, value: &[u8]) {
    out.extend_from_slice(&field_type.to_le_bytes());
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value);
}

fn write_string_field(out: &mut Vec<u8>, field_type: u16, value: &str) {
    let mut bytes = value.as_bytes().to_vec();
    bytes.push(0);
    write_field(out, field_type, &bytes);
}

// --- packed dates ----------------------------------------------------

/// The sentinel date meaning "never expires"
fn never_expire() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2999, 12, 28, 23, 59, 59)
        .single()
        .expect("sentinel date is valid")
}

fn expiry_or_never(times: &Times) -> DateTime<Utc> {
    if times.expires {
        times.expiry
    } else {
        never_expire()
    }
}

/// Pack a timestamp into the 5-byte wire encoding
fn pack_time(t: DateTime<Utc>) -> [u8; 5] {
    let (year, month, day) = (t.year() as u32, t.month(), t.day());
    let (hour, minute, second) = (t.hour(), t.minute(), t.second());
    [
        ((year >> 6) & 0x3F) as u8,
        (((year & 0x3F) << 2) | ((month >> 2) & 0x03)) as u8,
        (((month & 0x03) << 6) | ((day & 0x1F) << 1) | ((hour >> 4) & 0x01)) as u8,
        (((hour & 0x0F) << 4) | ((minute >> 2) & 0x0F)) as u8,
        (((minute & 0x03) << 6) | (second & 0x3F)) as u8,
    ]
}

/// Unpack the 5-byte wire encoding
fn read_time(value: &[u8]) -> Result<DateTime<Utc>> {
    if value.len() < 5 {
        return Err(Error::Malformed("packed date too short".into()));
    }
    let [b0, b1, b2, b3, b4] = [
        value[0] as u32,
        value[1] as u32,
        value[2] as u32,
        value[3] as u32,
        value[4] as u32,
    ];
    let year = (b0 << 6) | (b1 >> 2);
    let month = ((b1 & 0x03) << 2) | (b2 >> 6);
    let day = (b2 >> 1) & 0x1F;
    let hour = ((b2 & 0x01) << 4) | (b3 >> 4);
    let minute = ((b3 & 0x0F) << 2) | (b4 >> 6);
    let second = b4 & 0x3F;
    Utc.with_ymd_and_hms(year as i32, month, day, hour, minute, second)
        .single()
        .ok_or_else(|| Error::Malformed("invalid packed date".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_time_round_trip() {
        let t = Utc.with_ymd_and_hms(2024, 8, 4, 13, 37, 21).single().unwrap();
        assert_eq!(read_time(&pack_time(t)).unwrap(), t);
    }

    #[test]
    fn test_never_expire_sentinel() {
        let packed = pack_time(never_expire());
        assert_eq!(read_time(&packed).unwrap(), never_expire());
    }

    #[test]
    fn test_invalid_packed_date() {
        // Month 15 does not exist
        let bad = [0x1F, 0x63, 0xC0, 0x00, 0x00];
        assert!(read_time(&bad).is_err());
    }
}
