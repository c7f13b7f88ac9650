//! Streaming tree codec for the XML body
//!
//! The decrypted KDBX body is one XML document describing the whole
//! group/entry tree. Reading is a pull-parser state machine
//! ([`parse`]); writing emits the same document structure
//! ([`write`]). Protected values pass through the inner random stream
//! strictly in document order on both paths.

pub(crate) mod parse;
pub(crate) mod timestamp;
pub(crate) mod write;
