//! Legacy KDB fixed header
//!
//! The legacy container starts with a fixed 124-byte prefix: signatures,
//! cipher flag bits, a masked version word, seeds, the IV, node counts,
//! the SHA-256 of the decrypted body (verified after decryption, not
//! before), the transform seed and the key transform round count.

use byteorder::{ByteOrder, LittleEndian};

use crate::crypto::CipherId;
use crate::error::{Error, Result};
use crate::format::{SIG1, SIG2_KDB};

pub const HEADER_LEN: usize = 124;

/// Supported version word; only the upper bytes are significant
pub const FILE_VERSION: u32 = 0x0003_0004;
const FILE_VERSION_MASK: u32 = 0xFFFF_FF00;

const FLAG_SHA2: u32 = 1;
const FLAG_RIJNDAEL: u32 = 2;
const FLAG_ARCFOUR: u32 = 4;
const FLAG_TWOFISH: u32 = 8;

/// Parsed legacy header
#[derive(Debug, Clone)]
pub struct KdbHeader {
    pub cipher: CipherId,
    pub master_seed: [u8; 16],
    pub encryption_iv: [u8; 16],
    pub group_count: u32,
    pub entry_count: u32,
    /// SHA-256 of the decrypted body
    pub content_hash: [u8; 32],
    pub transform_seed: [u8; 32],
    pub key_rounds: u32,
}

/// Parse the fixed header prefix
pub fn read_header(data: &[u8]) -> Result<KdbHeader> {
    if data.len() < HEADER_LEN {
        return Err(Error::Malformed("file too short for a header".into()));
    }
    if LittleEndian::read_u32(&data[0..4]) != SIG1
        || LittleEndian::read_u32(&data[4..8]) != SIG2_KDB
    {
        return Err(Error::InvalidSignature);
    }

    let flags = LittleEndian::read_u32(&data[8..12]);
    let version = LittleEndian::read_u32(&data[12..16]);
    if version & FILE_VERSION_MASK != FILE_VERSION & FILE_VERSION_MASK {
        return Err(Error::InvalidVersion(version));
    }

    // Exactly one body cipher flag must be set
    let cipher = match (flags & FLAG_RIJNDAEL != 0, flags & FLAG_TWOFISH != 0) {
        (true, false) => CipherId::Aes256,
        (false, true) => CipherId::Twofish,
        _ => return Err(Error::InvalidAlgorithm),
    };
    if flags & FLAG_ARCFOUR != 0 {
        return Err(Error::InvalidAlgorithm);
    }

    let mut header = KdbHeader {
        cipher,
        master_seed: [0; 16],
        encryption_iv: [0; 16],
        group_count: LittleEndian::read_u32(&data[48..52]),
        entry_count: LittleEndian::read_u32(&data[52..56]),
        content_hash: [0; 32],
        transform_seed: [0; 32],
        key_rounds: LittleEndian::read_u32(&data[120..124]),
    };
    header.master_seed.copy_from_slice(&data[16..32]);
    header.encryption_iv.copy_from_slice(&data[32..48]);
    header.content_hash.copy_from_slice(&data[56..88]);
    header.transform_seed.copy_from_slice(&data[88..120]);
    Ok(header)
}

/// Serialize the fixed header prefix
pub fn write_header(header: &KdbHeader) -> Vec<u8> {
    let mut flags = FLAG_SHA2;
    flags |= match header.cipher {
        CipherId::Aes256 => FLAG_RIJNDAEL,
        CipherId::Twofish => FLAG_TWOFISH,
        CipherId::ChaCha20 => FLAG_RIJNDAEL, // rejected before reaching here
    };

    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(&SIG1.to_le_bytes());
    out.extend_from_slice(&SIG2_KDB.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&FILE_VERSION.to_le_bytes());
    out.extend_from_slice(&header.master_seed);
    out.extend_from_slice(&header.encryption_iv);
    out.extend_from_slice(&header.group_count.to_le_bytes());
    out.extend_from_slice(&header.entry_count.to_le_bytes());
    out.extend_from_slice(&header.content_hash);
    out.extend_from_slice(&header.transform_seed);
    out.extend_from_slice(&header.key_rounds.to_le_bytes());
    out
}
