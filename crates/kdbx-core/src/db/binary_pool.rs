//! Id-keyed store for attachment and icon payloads
//!
//! Entries and custom icons never own payload bytes; they reference pool
//! ids. Payloads above a size threshold are spooled to a temp file scoped
//! to the pool's lifetime, smaller ones stay in memory. The pool does not
//! deduplicate by content: every `put` returns a fresh id even for
//! identical bytes. Unreferenced ids are removed by an explicit sweep.

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::db::protected::ProtectedBinary;
use crate::error::{Error, Result};
use crate::format::compression;

/// Payloads larger than this are spooled to disk (512 KiB)
pub const SPOOL_THRESHOLD: usize = 512 * 1024;

/// Key of a payload in the pool
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BinaryId(pub u32);

impl std::fmt::Display for BinaryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum Store {
    Memory(ProtectedBinary),
    Spooled(NamedTempFile),
}

/// A single stored payload. `compressed` describes the at-rest encoding
/// inside the pool, not the wire format.
pub struct BinaryPayload {
    store: Store,
    protected: bool,
    compressed: bool,
}

impl BinaryPayload {
    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    fn stored_bytes(&self) -> Result<Vec<u8>> {
        match &self.store {
            Store::Memory(bytes) => Ok(bytes.as_slice().to_vec()),
            Store::Spooled(file) => {
                let mut out = Vec::new();
                std::fs::File::open(file.path())?.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

impl std::fmt::Debug for BinaryPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let location = match &self.store {
            Store::Memory(b) => format!("memory, {} bytes", b.len()),
            Store::Spooled(_) => "spooled".to_string(),
        };
        write!(
            f,
            "BinaryPayload({location}, protected: {}, compressed: {})",
            self.protected, self.compressed
        )
    }
}

/// The pool itself. Keys are handed out monotonically and stay stable
/// while the database is open.
#[derive(Debug, Default)]
pub struct BinaryPool {
    next_id: u32,
    payloads: BTreeMap<BinaryId, BinaryPayload>,
}

impl BinaryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a payload and return its fresh id. Identical content gets a
    /// new id every time.
    pub fn put(&mut self, data: &[u8], protected: bool) -> Result<BinaryId> {
        self.put_encoded(data, protected, false)
    }

    /// Store a payload from a reader
    pub fn put_reader(&mut self, mut reader: impl Read, protected: bool) -> Result<BinaryId> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        self.put(&data, protected)
    }

    fn put_encoded(&mut self, data: &[u8], protected: bool, compressed: bool) -> Result<BinaryId> {
        let store = if data.len() > SPOOL_THRESHOLD {
            let mut file = NamedTempFile::new()?;
            file.write_all(data)?;
            file.flush()?;
            Store::Spooled(file)
        } else {
            Store::Memory(ProtectedBinary::new(data.to_vec()))
        };

        let id = BinaryId(self.next_id);
        self.next_id += 1;
        self.payloads.insert(
            id,
            BinaryPayload {
                store,
                protected,
                compressed,
            },
        );
        Ok(id)
    }

    /// Store a payload that is already gzip-compressed (legacy metadata
    /// binaries arrive this way)
    pub fn put_compressed(&mut self, data: &[u8], protected: bool) -> Result<BinaryId> {
        self.put_encoded(data, protected, true)
    }

    /// Fetch the logical (decompressed) payload bytes
    pub fn get(&self, id: BinaryId) -> Result<Vec<u8>> {
        let payload = self
            .payloads
            .get(&id)
            .ok_or_else(|| Error::Malformed(format!("unknown binary id {id}")))?;
        let stored = payload.stored_bytes()?;
        if payload.compressed {
            compression::decompress(&stored)
        } else {
            Ok(stored)
        }
    }

    pub fn payload(&self, id: BinaryId) -> Option<&BinaryPayload> {
        self.payloads.get(&id)
    }

    pub fn contains(&self, id: BinaryId) -> bool {
        self.payloads.contains_key(&id)
    }

    pub fn remove(&mut self, id: BinaryId) -> bool {
        self.payloads.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Ids in ascending order
    pub fn ids(&self) -> impl Iterator<Item = BinaryId> + '_ {
        self.payloads.keys().copied()
    }

    /// Re-encode one payload's at-rest storage
    pub fn set_compressed(&mut self, id: BinaryId, compressed: bool) -> Result<()> {
        let current = self
            .payloads
            .get(&id)
            .ok_or_else(|| Error::Malformed(format!("unknown binary id {id}")))?;
        if current.compressed == compressed {
            return Ok(());
        }
        let protected = current.protected;
        let logical = self.get(id)?;
        let encoded = if compressed {
            compression::compress(&logical)?
        } else {
            logical
        };

        self.payloads.remove(&id);
        let store = if encoded.len() > SPOOL_THRESHOLD {
            let mut file = NamedTempFile::new()?;
            file.write_all(&encoded)?;
            file.flush()?;
            Store::Spooled(file)
        } else {
            Store::Memory(ProtectedBinary::new(encoded))
        };
        self.payloads.insert(
            id,
            BinaryPayload {
                store,
                protected,
                compressed,
            },
        );
        Ok(())
    }

    /// Drop every id not in the referenced set; returns how many payloads
    /// were removed
    pub fn sweep(&mut self, referenced: &HashSet<BinaryId>) -> usize {
        let before = self.payloads.len();
        self.payloads.retain(|id, _| referenced.contains(id));
        before - self.payloads.len()
    }

    /// Drop everything, deleting spooled temp files
    pub fn clear(&mut self) {
        self.payloads.clear();
        self.next_id = 0;
    }
}
