//! kdbx-core - Engine for encrypted password-database containers
//!
//! Opens and persists the two historical KeePass container families: the
//! legacy KDB binary format and KDBX 4. The pipeline is header codec →
//! composite key + KDF → body cipher → integrity stream → compression →
//! streaming tree codec, and its inverse on save. Everything fails closed:
//! a wrong credential, a corrupted header or a tampered body never yields
//! a partially parsed tree.
//!
//! ```no_run
//! use kdbx_core::{CompositeKey, Database};
//!
//! # fn main() -> kdbx_core::Result<()> {
//! let bytes = std::fs::read("passwords.kdbx")?;
//! let key = CompositeKey::new().with_password("secret");
//! let db = Database::open(&bytes, key)?;
//! for entry in db.entries() {
//!     println!("{}", entry.title().unwrap_or("(untitled)"));
//! }
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod db;
mod error;
pub mod format;
pub mod keys;
mod xml;

pub use crypto::{CipherId, KdfParams};
pub use db::{
    Attachment, AutoType, AutoTypeAssociation, BinaryId, BinaryPool, CustomData, CustomDataItem,
    CustomIcon, Database, DatabaseMetadata, DeletedObject, DuplicateIdPolicy, Entry, EntryBuilder,
    FieldValue, FileVersion, Group, GroupTreeNode, MemoryProtection, Meta, OpenOptions, Phase,
    ProtectedBinary, ProtectedString, Settings, Times,
};
pub use error::{Error, Result};
pub use keys::{CompositeKey, PasswordEncoding};

// Re-export types that users might need
pub use uuid::Uuid;
