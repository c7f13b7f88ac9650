//! KDBX 4 outer and inner header codec
//!
//! The outer header is a TLV stream read before anything is trusted: its
//! raw bytes feed the header SHA-256 and, once the key schedule is known,
//! the header HMAC. The inner header lives at the start of the decrypted
//! plaintext and carries the inner stream parameters plus attachment
//! payloads.

use byteorder::{ByteOrder, LittleEndian};
use zeroize::Zeroizing;

use crate::crypto::{CipherId, KdfParams};
use crate::error::{Error, Result};
use crate::format::variant_dict::VariantDict;
use crate::format::{SIG1, SIG2_KDBX};

const FIELD_END: u8 = 0;
const FIELD_COMMENT: u8 = 1;
const FIELD_CIPHER_ID: u8 = 2;
const FIELD_COMPRESSION: u8 = 3;
const FIELD_MASTER_SEED: u8 = 4;
const FIELD_ENCRYPTION_IV: u8 = 7;
const FIELD_KDF_PARAMETERS: u8 = 11;
const FIELD_PUBLIC_CUSTOM_DATA: u8 = 12;

const INNER_FIELD_END: u8 = 0;
const INNER_FIELD_STREAM_ID: u8 = 1;
const INNER_FIELD_STREAM_KEY: u8 = 2;
const INNER_FIELD_BINARY: u8 = 3;

/// Flag bit on an inner-header binary: memory-protect the payload
const BINARY_FLAG_PROTECTED: u8 = 0x01;

pub const FILE_VERSION_MAJOR: u16 = 4;
/// Highest minor version this codec understands
pub const FILE_VERSION_MAX_MINOR: u16 = 1;

/// Parsed outer header
#[derive(Debug)]
pub struct KdbxHeader {
    pub minor_version: u16,
    pub cipher: CipherId,
    pub compression: bool,
    pub master_seed: Vec<u8>,
    pub encryption_iv: Vec<u8>,
    pub kdf: KdfParams,
    pub public_custom_data: Option<VariantDict>,
    /// Exact header bytes, the input of the header hash and HMAC
    pub raw: Vec<u8>,
    /// Offset of the first byte after the header
    pub end: usize,
}

/// Parse the outer header
pub fn read_header(data: &[u8]) -> Result<KdbxHeader> {
    if data.len() < 12 {
        return Err(Error::Malformed("file too short for a header".into()));
    }
    if LittleEndian::read_u32(&data[0..4]) != SIG1
        || LittleEndian::read_u32(&data[4..8]) != SIG2_KDBX
    {
        return Err(Error::InvalidSignature);
    }
    let version = LittleEndian::read_u32(&data[8..12]);
    let minor_version = (version & 0xFFFF) as u16;
    let major_version = (version >> 16) as u16;
    if major_version != FILE_VERSION_MAJOR || minor_version > FILE_VERSION_MAX_MINOR {
        return Err(Error::InvalidVersion(version));
    }

    let mut pos = 12;
    let mut cipher = None;
    let mut compression = false;
    let mut master_seed = None;
    let mut encryption_iv = None;
    let mut kdf = None;
    let mut public_custom_data = None;

    loop {
        if pos + 5 > data.len() {
            return Err(Error::Malformed("truncated header field".into()));
        }
        let field_id = data[pos];
        let field_len = LittleEndian::read_u32(&data[pos + 1..pos + 5]) as usize;
        pos += 5;
        if pos + field_len > data.len() {
            return Err(Error::Malformed("truncated header field".into()));
        }
        let value = &data[pos..pos + field_len];
        pos += field_len;

        match field_id {
            FIELD_END => break,
            FIELD_COMMENT => {}
            FIELD_CIPHER_ID => cipher = Some(CipherId::from_uuid(value)?),
            FIELD_COMPRESSION => {
                if value.len() < 4 {
                    return Err(Error::Malformed("compression flag too short".into()));
                }
                compression = LittleEndian::read_u32(value) == 1;
            }
            FIELD_MASTER_SEED => {
                if value.len() != 32 {
                    return Err(Error::Malformed("master seed must be 32 bytes".into()));
                }
                master_seed = Some(value.to_vec());
            }
            FIELD_ENCRYPTION_IV => encryption_iv = Some(value.to_vec()),
            FIELD_KDF_PARAMETERS => {
                kdf = Some(KdfParams::from_variant_dict(&VariantDict::parse(value)?)?)
            }
            FIELD_PUBLIC_CUSTOM_DATA => {
                public_custom_data = Some(VariantDict::parse(value)?)
            }
            other => {
                tracing::warn!(field = other, "skipping unknown header field");
            }
        }
    }

    let cipher =
        cipher.ok_or_else(|| Error::Malformed("header missing cipher id".into()))?;
    let encryption_iv =
        encryption_iv.ok_or_else(|| Error::Malformed("header missing encryption IV".into()))?;
    if encryption_iv.len() != cipher.iv_len() {
        return Err(Error::Malformed("encryption IV has wrong length".into()));
    }

    Ok(KdbxHeader {
        minor_version,
        cipher,
        compression,
        master_seed: master_seed
            .ok_or_else(|| Error::Malformed("header missing master seed".into()))?,
        encryption_iv,
        kdf: kdf.ok_or_else(|| Error::Malformed("header missing KDF parameters".into()))?,
        public_custom_data,
        raw: data[0..pos].to_vec(),
        end: pos,
    })
}

/// Serialize the outer header (exactly the bytes that get hashed and
/// MAC-ed)
pub fn write_header(
    minor_version: u16,
    cipher: CipherId,
    compression: bool,
    master_seed: &[u8],
    encryption_iv: &[u8],
    kdf: &KdfParams,
    public_custom_data: Option<&VariantDict>,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&SIG1.to_le_bytes());
    out.extend_from_slice(&SIG2_KDBX.to_le_bytes());
    let version = ((FILE_VERSION_MAJOR as u32) << 16) | minor_version as u32;
    out.extend_from_slice(&version.to_le_bytes());

    let field = |id: u8, value: &[u8], out: &mut Vec<u8>| {
        out.push(id);
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value);
    };

    field(FIELD_CIPHER_ID, &cipher.uuid(), &mut out);
    field(
        FIELD_COMPRESSION,
        &u32::from(compression).to_le_bytes(),
        &mut out,
    );
    field(FIELD_MASTER_SEED, master_seed, &mut out);
    field(FIELD_ENCRYPTION_IV, encryption_iv, &mut out);
    field(FIELD_KDF_PARAMETERS, &kdf.to_variant_dict().to_bytes(), &mut out);
    if let Some(data) = public_custom_data {
        field(FIELD_PUBLIC_CUSTOM_DATA, &data.to_bytes(), &mut out);
    }
    field(FIELD_END, b"\r\n\r\n", &mut out);
    out
}

/// Parsed inner header
pub struct InnerHeader {
    pub stream_id: u32,
    pub stream_key: Zeroizing<Vec<u8>>,
    /// (protected flag, payload) in wire order
    pub binaries: Vec<(bool, Vec<u8>)>,
    /// Offset of the XML document within the plaintext
    pub end: usize,
}

/// Parse the inner header from the decrypted plaintext
pub fn read_inner_header(plaintext: &[u8]) -> Result<InnerHeader> {
    let mut pos = 0;
    let mut stream_id = None;
    let mut stream_key = None;
    let mut binaries = Vec::new();

    loop {
        if pos + 5 > plaintext.len() {
            return Err(Error::Malformed("truncated inner header".into()));
        }
        let field_id = plaintext[pos];
        let field_len = LittleEndian::read_u32(&plaintext[pos + 1..pos + 5]) as usize;
        pos += 5;
        if pos + field_len > plaintext.len() {
            return Err(Error::Malformed("truncated inner header field".into()));
        }
        let value = &plaintext[pos..pos + field_len];
        pos += field_len;

        match field_id {
            INNER_FIELD_END => break,
            INNER_FIELD_STREAM_ID => {
                if value.len() < 4 {
                    return Err(Error::Malformed("inner stream id too short".into()));
                }
                stream_id = Some(LittleEndian::read_u32(value));
            }
            INNER_FIELD_STREAM_KEY => stream_key = Some(Zeroizing::new(value.to_vec())),
            INNER_FIELD_BINARY => {
                let (flags, payload) = value
                    .split_first()
                    .ok_or_else(|| Error::Malformed("empty inner binary field".into()))?;
                binaries.push((flags & BINARY_FLAG_PROTECTED != 0, payload.to_vec()));
            }
            other => {
                tracing::warn!(field = other, "skipping unknown inner header field");
            }
        }
    }

    Ok(InnerHeader {
        stream_id: stream_id
            .ok_or_else(|| Error::Malformed("inner header missing stream id".into()))?,
        stream_key: stream_key
            .ok_or_else(|| Error::Malformed("inner header missing stream key".into()))?,
        binaries,
        end: pos,
    })
}

/// Serialize the inner header
pub fn write_inner_header(
    stream_id: u32,
    stream_key: &[u8],
    binaries: &[(bool, Vec<u8>)],
) -> Vec<u8> {
    let mut out = Vec::new();
    let field = |id: u8, value: &[u8], out: &mut Vec<u8>| {
        out.push(id);
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value);
    };

    field(INNER_FIELD_STREAM_ID, &stream_id.to_le_bytes(), &mut out);
    field(INNER_FIELD_STREAM_KEY, stream_key, &mut out);
    for (protected, payload) in binaries {
        let mut value = Vec::with_capacity(payload.len() + 1);
        value.push(if *protected { BINARY_FLAG_PROTECTED } else { 0 });
        value.extend_from_slice(payload);
        field(INNER_FIELD_BINARY, &value, &mut out);
    }
    field(INNER_FIELD_END, &[], &mut out);
    out
}
