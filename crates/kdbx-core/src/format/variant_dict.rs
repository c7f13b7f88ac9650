//! Typed variant dictionary
//!
//! KDBX 4 headers carry KDF parameters (and public custom data) as a
//! little-endian dictionary of typed key/value pairs: a u16 format
//! version, then entries of `(u8 type, u32 key length, key, u32 value
//! length, value)` until a zero type byte terminates the stream.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Highest dictionary format version understood by this codec
const VD_VERSION: u16 = 0x0100;

const TYPE_END: u8 = 0x00;
const TYPE_U32: u8 = 0x04;
const TYPE_U64: u8 = 0x05;
const TYPE_BOOL: u8 = 0x08;
const TYPE_I32: u8 = 0x0C;
const TYPE_I64: u8 = 0x0D;
const TYPE_STRING: u8 = 0x18;
const TYPE_BYTES: u8 = 0x42;

/// A single typed dictionary value
#[derive(Debug, Clone, PartialEq)]
pub enum VariantValue {
    U32(u32),
    U64(u64),
    Bool(bool),
    I32(i32),
    I64(i64),
    String(String),
    Bytes(Vec<u8>),
}

impl VariantValue {
    fn type_id(&self) -> u8 {
        match self {
            VariantValue::U32(_) => TYPE_U32,
            VariantValue::U64(_) => TYPE_U64,
            VariantValue::Bool(_) => TYPE_BOOL,
            VariantValue::I32(_) => TYPE_I32,
            VariantValue::I64(_) => TYPE_I64,
            VariantValue::String(_) => TYPE_STRING,
            VariantValue::Bytes(_) => TYPE_BYTES,
        }
    }

    fn to_wire(&self) -> Vec<u8> {
        match self {
            VariantValue::U32(v) => v.to_le_bytes().to_vec(),
            VariantValue::U64(v) => v.to_le_bytes().to_vec(),
            VariantValue::Bool(v) => vec![u8::from(*v)],
            VariantValue::I32(v) => v.to_le_bytes().to_vec(),
            VariantValue::I64(v) => v.to_le_bytes().to_vec(),
            VariantValue::String(v) => v.as_bytes().to_vec(),
            VariantValue::Bytes(v) => v.clone(),
        }
    }
}

/// An ordered dictionary of typed values, preserving insertion order so
/// writes are deterministic
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariantDict {
    items: Vec<(String, VariantValue)>,
}

impl VariantDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Insert or replace a value
    pub fn insert(&mut self, key: impl Into<String>, value: VariantValue) {
        let key = key.into();
        if let Some(slot) = self.items.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.items.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&VariantValue> {
        self.items.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.get(key) {
            Some(VariantValue::U32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key) {
            Some(VariantValue::U64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get(key) {
            Some(VariantValue::Bytes(v)) => Some(v),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VariantValue)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Parse a dictionary from header field bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::Malformed("variant dictionary too short".into()));
        }
        let version = LittleEndian::read_u16(&data[0..2]);
        if (version & 0xFF00) > (VD_VERSION & 0xFF00) {
            return Err(Error::Malformed(format!(
                "unsupported variant dictionary version {version:#06x}"
            )));
        }

        let mut dict = VariantDict::new();
        let mut pos = 2;
        loop {
            let entry_type = *data
                .get(pos)
                .ok_or_else(|| Error::Malformed("variant dictionary missing terminator".into()))?;
            pos += 1;
            if entry_type == TYPE_END {
                break;
            }

            let key = read_chunk(data, &mut pos)?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|_| Error::Malformed("variant dictionary key is not UTF-8".into()))?;
            let value = read_chunk(data, &mut pos)?;

            let value = match entry_type {
                TYPE_U32 => VariantValue::U32(read_fixed::<4>(value).map(u32::from_le_bytes)?),
                TYPE_U64 => VariantValue::U64(read_fixed::<8>(value).map(u64::from_le_bytes)?),
                TYPE_BOOL => VariantValue::Bool(read_fixed::<1>(value)?[0] != 0),
                TYPE_I32 => VariantValue::I32(read_fixed::<4>(value).map(i32::from_le_bytes)?),
                TYPE_I64 => VariantValue::I64(read_fixed::<8>(value).map(i64::from_le_bytes)?),
                TYPE_STRING => VariantValue::String(
                    String::from_utf8(value.to_vec()).map_err(|_| {
                        Error::Malformed("variant dictionary string is not UTF-8".into())
                    })?,
                ),
                TYPE_BYTES => VariantValue::Bytes(value.to_vec()),
                other => {
                    return Err(Error::Malformed(format!(
                        "unknown variant dictionary value type {other:#04x}"
                    )))
                }
            };
            dict.items.push((key, value));
        }
        Ok(dict)
    }

    /// Serialize to header field bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&VD_VERSION.to_le_bytes());
        for (key, value) in &self.items {
            out.push(value.type_id());
            out.extend_from_slice(&(key.len() as u32).to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            let wire = value.to_wire();
            out.extend_from_slice(&(wire.len() as u32).to_le_bytes());
            out.extend_from_slice(&wire);
        }
        out.push(TYPE_END);
        out
    }
}

fn read_chunk<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    if *pos + 4 > data.len() {
        return Err(Error::Malformed("truncated variant dictionary".into()));
    }
    let len = LittleEndian::read_u32(&data[*pos..*pos + 4]) as usize;
    *pos += 4;
    if *pos + len > data.len() {
        return Err(Error::Malformed("truncated variant dictionary".into()));
    }
    let chunk = &data[*pos..*pos + len];
    *pos += len;
    Ok(chunk)
}

fn read_fixed<const N: usize>(value: &[u8]) -> Result<[u8; N]> {
    value
        .try_into()
        .map_err(|_| Error::Malformed("variant dictionary value has wrong length".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut dict = VariantDict::new();
        dict.insert("$UUID", VariantValue::Bytes(vec![1; 16]));
        dict.insert("R", VariantValue::U64(60_000));
        dict.insert("P", VariantValue::U32(2));
        dict.insert("V", VariantValue::I32(-7));
        dict.insert("N", VariantValue::I64(-9));
        dict.insert("B", VariantValue::Bool(true));
        dict.insert("S", VariantValue::String("salt".into()));

        let parsed = VariantDict::parse(&dict.to_bytes()).unwrap();
        assert_eq!(parsed, dict);
        assert_eq!(parsed.get_u64("R"), Some(60_000));
        assert_eq!(parsed.get_u32("P"), Some(2));
        assert_eq!(parsed.get_bytes("$UUID"), Some(&[1u8; 16][..]));
    }

    #[test]
    fn test_insert_replaces() {
        let mut dict = VariantDict::new();
        dict.insert("R", VariantValue::U64(1));
        dict.insert("R", VariantValue::U64(2));
        assert_eq!(dict.get_u64("R"), Some(2));
        assert_eq!(dict.iter().count(), 1);
    }

    #[test]
    fn test_truncated_dict() {
        let mut dict = VariantDict::new();
        dict.insert("R", VariantValue::U64(60_000));
        let bytes = dict.to_bytes();
        // Drop the terminator and half the last value
        let err = VariantDict::parse(&bytes[..bytes.len() - 5]).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn test_future_major_version_rejected() {
        let mut bytes = VariantDict::new().to_bytes();
        bytes[1] = 0x02;
        assert!(matches!(
            VariantDict::parse(&bytes),
            Err(Error::Malformed(_))
        ));
    }
}
