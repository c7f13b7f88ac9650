//! Inner random stream
//!
//! Protected field values inside the decrypted XML body are obfuscated
//! with a keyed stream cipher, independent of the outer body encryption.
//! The inner header selects the cipher by id and supplies the raw key; the
//! keystream runs positionally over every protected value in document
//! order, so values must be processed strictly in the order they appear.

use base64::Engine;
use chacha20::ChaCha20;
use cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa20;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};

/// Inner stream id: no obfuscation (not accepted by this engine)
pub const INNER_STREAM_NONE: u32 = 0;
/// Inner stream id: ArcFour (legacy, deliberately unsupported)
pub const INNER_STREAM_ARC4: u32 = 1;
/// Inner stream id: Salsa20 with the fixed KeePass nonce
pub const INNER_STREAM_SALSA20: u32 = 2;
/// Inner stream id: ChaCha20 keyed from SHA-512 of the stream key
pub const INNER_STREAM_CHACHA20: u32 = 3;

const SALSA20_NONCE: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

enum StreamVariant {
    Salsa20(Salsa20),
    ChaCha20(ChaCha20),
}

/// The keyed obfuscation stream for protected values
pub struct InnerStream {
    variant: StreamVariant,
}

impl InnerStream {
    /// Build the stream cipher for a header stream id and key
    pub fn new(stream_id: u32, key: &[u8]) -> Result<Self> {
        let variant = match stream_id {
            INNER_STREAM_SALSA20 => {
                let key = Sha256::digest(key);
                StreamVariant::Salsa20(Salsa20::new(&key, &SALSA20_NONCE.into()))
            }
            INNER_STREAM_CHACHA20 => {
                let hash = Sha512::digest(key);
                let key: [u8; 32] = hash[0..32]
                    .try_into()
                    .map_err(|_| Error::InvalidAlgorithm)?;
                let nonce: [u8; 12] = hash[32..44]
                    .try_into()
                    .map_err(|_| Error::InvalidAlgorithm)?;
                StreamVariant::ChaCha20(ChaCha20::new(&key.into(), &nonce.into()))
            }
            _ => return Err(Error::InvalidAlgorithm),
        };
        Ok(Self { variant })
    }

    /// Advance the keystream over a buffer in place
    pub fn apply(&mut self, data: &mut [u8]) {
        match &mut self.variant {
            StreamVariant::Salsa20(c) => c.apply_keystream(data),
            StreamVariant::ChaCha20(c) => c.apply_keystream(data),
        }
    }

    /// Decrypt one base64-encoded protected value
    pub fn decrypt_base64(&mut self, value: &str) -> Result<Vec<u8>> {
        let mut data = base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(|_| Error::Malformed("protected value is not valid base64".into()))?;
        self.apply(&mut data);
        Ok(data)
    }

    /// Encrypt a plaintext value and return it base64-encoded
    pub fn encrypt_to_base64(&mut self, plaintext: &[u8]) -> String {
        let mut data = plaintext.to_vec();
        self.apply(&mut data);
        base64::engine::general_purpose::STANDARD.encode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_in_document_order() {
        for id in [INNER_STREAM_SALSA20, INNER_STREAM_CHACHA20] {
            let key = [0x42u8; 64];
            let mut enc = InnerStream::new(id, &key).unwrap();
            let a = enc.encrypt_to_base64(b"first secret");
            let b = enc.encrypt_to_base64(b"second secret");

            let mut dec = InnerStream::new(id, &key).unwrap();
            assert_eq!(dec.decrypt_base64(&a).unwrap(), b"first secret");
            assert_eq!(dec.decrypt_base64(&b).unwrap(), b"second secret");
        }
    }

    #[test]
    fn test_out_of_order_decryption_garbles() {
        let key = [1u8; 64];
        let mut enc = InnerStream::new(INNER_STREAM_CHACHA20, &key).unwrap();
        let _first = enc.encrypt_to_base64(b"first");
        let second = enc.encrypt_to_base64(b"second");

        // Skipping the first value desynchronizes the keystream
        let mut dec = InnerStream::new(INNER_STREAM_CHACHA20, &key).unwrap();
        assert_ne!(dec.decrypt_base64(&second).unwrap(), b"second");
    }

    #[test]
    fn test_unsupported_ids() {
        for id in [INNER_STREAM_NONE, INNER_STREAM_ARC4, 99] {
            assert!(matches!(
                InnerStream::new(id, &[0u8; 32]),
                Err(Error::InvalidAlgorithm)
            ));
        }
    }

    #[test]
    fn test_bad_base64() {
        let mut s = InnerStream::new(INNER_STREAM_SALSA20, &[0u8; 32]).unwrap();
        assert!(matches!(
            s.decrypt_base64("@@not-base64@@"),
            Err(Error::Malformed(_))
        ));
    }
}
