//! Cryptographic primitives shared by both container formats

pub mod cipher;
pub mod inner_stream;
pub mod kdf;

pub use cipher::CipherId;
pub use inner_stream::InnerStream;
pub use kdf::KdfParams;
