//! Error types for kdbx-core

use thiserror::Error;

/// Result type alias for kdbx-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while opening, manipulating or saving a database
#[derive(Error, Debug)]
pub enum Error {
    /// The file does not start with a known container signature
    #[error("invalid file signature")]
    InvalidSignature,

    /// The container signature is known but the format version is unsupported
    #[error("unsupported format version {0:#010x}")]
    InvalidVersion(u32),

    /// Unknown cipher, KDF or inner stream identifier
    #[error("unknown cipher or key derivation algorithm")]
    InvalidAlgorithm,

    /// Wrong password, key file or hardware factor.
    ///
    /// Header hash/HMAC mismatches, padding failures and content-hash
    /// mismatches all map here so a caller cannot tell a corrupted header
    /// apart from a wrong key.
    #[error("invalid credentials: incorrect password, key file or hardware key")]
    InvalidCredentials,

    /// Structurally inconsistent stream: truncated block, unbalanced
    /// context stack, unresolved reference
    #[error("malformed database stream: {0}")]
    Malformed(String),

    /// The memory-hard KDF could not reserve its work area. Kept separate
    /// from I/O errors so the caller can suggest lowering the memory cost.
    #[error("key derivation ran out of memory; lower the KDF memory parameter")]
    KdfMemoryExhausted,

    /// No credential factor was supplied at all
    #[error("empty credentials: at least one key factor is required")]
    EmptyCredential,

    /// A node id collided and the duplicate-id policy is `Reject`
    #[error("duplicate node id: {0}")]
    DuplicateId(String),

    /// Entry not found
    #[error("entry not found: {0}")]
    EntryNotFound(uuid::Uuid),

    /// Group not found
    #[error("group not found: {0}")]
    GroupNotFound(uuid::Uuid),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
