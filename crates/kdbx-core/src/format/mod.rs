//! Container format codecs
//!
//! Both families share the first signature word; the second selects the
//! legacy or the KDBX family.

pub mod compression;
pub mod kdb;
pub mod kdbx;
pub mod variant_dict;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// First signature word shared by both families
pub const SIG1: u32 = 0x9AA2_D903;
/// Second signature word of the legacy format
pub const SIG2_KDB: u32 = 0xB54B_FB65;
/// Second signature word of the KDBX family
pub const SIG2_KDBX: u32 = 0xB54B_FB67;

/// Which codec a byte stream belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Kdb,
    Kdbx,
}

/// Sniff the container family from the signature words
pub fn detect(data: &[u8]) -> Result<FormatKind> {
    if data.len() < 8 {
        return Err(Error::InvalidSignature);
    }
    if LittleEndian::read_u32(&data[0..4]) != SIG1 {
        return Err(Error::InvalidSignature);
    }
    match LittleEndian::read_u32(&data[4..8]) {
        SIG2_KDB => Ok(FormatKind::Kdb),
        SIG2_KDBX => Ok(FormatKind::Kdbx),
        _ => Err(Error::InvalidSignature),
    }
}
