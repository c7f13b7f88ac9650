//! HMAC-authenticated block stream
//!
//! The KDBX 4 body is a sequence of blocks, each prefixed by a 32-byte
//! HMAC-SHA-256 and a length. Every block is keyed individually:
//! `block key = SHA-512(index ‖ base HMAC key)`, with the special index
//! u64::MAX reserved for the header MAC. A zero-length block terminates
//! the stream. Each block is authenticated before its payload is released
//! downstream, so truncation or tampering is caught without buffering the
//! whole file.

use byteorder::{ByteOrder, LittleEndian};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Maximum payload per block on the write path (1 MiB)
const BLOCK_SIZE: usize = 1024 * 1024;

/// Block index reserved for the header MAC
pub const HEADER_BLOCK_INDEX: u64 = u64::MAX;

/// Derive the per-block HMAC key for a block index
pub fn block_key(index: u64, base_key: &[u8; 64]) -> Zeroizing<[u8; 64]> {
    let mut hasher = Sha512::new();
    hasher.update(index.to_le_bytes());
    hasher.update(base_key);
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Compute the MAC over the raw header bytes (block index u64::MAX)
pub fn header_mac(header: &[u8], base_key: &[u8; 64]) -> [u8; 32] {
    let key = block_key(HEADER_BLOCK_INDEX, base_key);
    let mut mac = HmacSha256::new_from_slice(key.as_ref()).expect("HMAC accepts any key length");
    mac.update(header);
    mac.finalize().into_bytes().into()
}

fn data_mac(index: u64, data: &[u8], base_key: &[u8; 64]) -> [u8; 32] {
    let key = block_key(index, base_key);
    let mut mac = HmacSha256::new_from_slice(key.as_ref()).expect("HMAC accepts any key length");
    mac.update(&index.to_le_bytes());
    mac.update(&(data.len() as u32).to_le_bytes());
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Read and authenticate the whole block stream, returning the
/// concatenated payload. Each block is verified before its bytes are
/// appended to the output.
pub fn read_blocks(data: &[u8], base_key: &[u8; 64]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    let mut index = 0u64;
    loop {
        if pos + 36 > data.len() {
            return Err(Error::Malformed("truncated block header".into()));
        }
        let stored_mac = &data[pos..pos + 32];
        let len = LittleEndian::read_u32(&data[pos + 32..pos + 36]) as usize;
        pos += 36;
        if pos + len > data.len() {
            return Err(Error::Malformed("truncated block payload".into()));
        }
        let payload = &data[pos..pos + len];
        pos += len;

        let computed = data_mac(index, payload, base_key);
        if stored_mac != computed.as_slice() {
            return Err(Error::InvalidCredentials);
        }
        if len == 0 {
            break;
        }
        out.extend_from_slice(payload);
        index += 1;
    }
    Ok(out)
}

/// Write the payload as an authenticated block stream, closed by a
/// zero-length terminator block
pub fn write_blocks(payload: &[u8], base_key: &[u8; 64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 64);
    let mut index = 0u64;
    for chunk in payload.chunks(BLOCK_SIZE) {
        out.extend_from_slice(&data_mac(index, chunk, base_key));
        out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        out.extend_from_slice(chunk);
        index += 1;
    }
    out.extend_from_slice(&data_mac(index, &[], base_key));
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 64] = [0x55u8; 64];

    #[test]
    fn test_round_trip() {
        let payload = b"0123456789".repeat(1000);
        let stream = write_blocks(&payload, &KEY);
        assert_eq!(read_blocks(&stream, &KEY).unwrap(), payload);
    }

    #[test]
    fn test_empty_payload() {
        let stream = write_blocks(&[], &KEY);
        assert_eq!(read_blocks(&stream, &KEY).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_multi_block_payload() {
        let payload = vec![0xA7u8; BLOCK_SIZE + 1234];
        let stream = write_blocks(&payload, &KEY);
        assert_eq!(read_blocks(&stream, &KEY).unwrap(), payload);
    }

    #[test]
    fn test_any_flipped_byte_is_detected() {
        let payload = b"sensitive".repeat(100);
        let stream = write_blocks(&payload, &KEY);
        // MAC byte, length field and payload byte each fail closed
        for offset in [0, 33, 40] {
            let mut tampered = stream.clone();
            tampered[offset] ^= 0x01;
            let err = read_blocks(&tampered, &KEY).unwrap_err();
            assert!(matches!(
                err,
                Error::InvalidCredentials | Error::Malformed(_)
            ));
        }
    }

    #[test]
    fn test_truncation_is_detected() {
        let payload = b"sensitive".repeat(100);
        let stream = write_blocks(&payload, &KEY);
        let err = read_blocks(&stream[..stream.len() - 40], &KEY).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn test_wrong_key_is_invalid_credentials() {
        let stream = write_blocks(b"payload", &KEY);
        let err = read_blocks(&stream, &[0u8; 64]).unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }
}
