//! Symmetric body ciphers
//!
//! Both container formats encrypt the database body with one of a small,
//! closed set of algorithms: AES-256-CBC, Twofish-CBC (both PKCS7 padded)
//! or the ChaCha20 stream cipher. The newer format selects the cipher by a
//! 16-byte UUID in the outer header; the legacy format uses header bit
//! flags.

use aes::Aes256;
use chacha20::ChaCha20;
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use twofish::Twofish;

use crate::error::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type TwofishCbcEnc = cbc::Encryptor<Twofish>;
type TwofishCbcDec = cbc::Decryptor<Twofish>;

/// Cipher UUID for AES-256-CBC (31c1f2e6-bf71-4350-be58-05216afc5aff)
pub const CIPHER_UUID_AES256: [u8; 16] = [
    0x31, 0xc1, 0xf2, 0xe6, 0xbf, 0x71, 0x43, 0x50, 0xbe, 0x58, 0x05, 0x21, 0x6a, 0xfc, 0x5a, 0xff,
];

/// Cipher UUID for Twofish-CBC (ad68f29f-576f-4bb9-a36a-d47af965346c)
pub const CIPHER_UUID_TWOFISH: [u8; 16] = [
    0xad, 0x68, 0xf2, 0x9f, 0x57, 0x6f, 0x4b, 0xb9, 0xa3, 0x6a, 0xd4, 0x7a, 0xf9, 0x65, 0x34, 0x6c,
];

/// Cipher UUID for ChaCha20 (d6038a2b-8b6f-4cb5-a524-339a31dbb59a)
pub const CIPHER_UUID_CHACHA20: [u8; 16] = [
    0xd6, 0x03, 0x8a, 0x2b, 0x8b, 0x6f, 0x4c, 0xb5, 0xa5, 0x24, 0x33, 0x9a, 0x31, 0xdb, 0xb5, 0x9a,
];

/// Body cipher selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CipherId {
    Aes256,
    Twofish,
    ChaCha20,
}

impl CipherId {
    /// Resolve a header cipher UUID
    pub fn from_uuid(uuid: &[u8]) -> Result<Self> {
        if uuid == CIPHER_UUID_AES256 {
            Ok(CipherId::Aes256)
        } else if uuid == CIPHER_UUID_TWOFISH {
            Ok(CipherId::Twofish)
        } else if uuid == CIPHER_UUID_CHACHA20 {
            Ok(CipherId::ChaCha20)
        } else {
            Err(Error::InvalidAlgorithm)
        }
    }

    /// The header UUID for this cipher
    pub fn uuid(self) -> [u8; 16] {
        match self {
            CipherId::Aes256 => CIPHER_UUID_AES256,
            CipherId::Twofish => CIPHER_UUID_TWOFISH,
            CipherId::ChaCha20 => CIPHER_UUID_CHACHA20,
        }
    }

    /// IV length the cipher expects: one CBC block, or the 12-byte
    /// ChaCha20 nonce
    pub fn iv_len(self) -> usize {
        match self {
            CipherId::Aes256 | CipherId::Twofish => 16,
            CipherId::ChaCha20 => 12,
        }
    }

    /// Encrypt a plaintext body
    pub fn encrypt(self, plaintext: &[u8], key: &[u8; 32], iv: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != self.iv_len() {
            return Err(Error::Malformed("encryption IV has wrong length".into()));
        }
        match self {
            CipherId::Aes256 => {
                let enc = Aes256CbcEnc::new_from_slices(key, iv)
                    .map_err(|_| Error::Malformed("cipher key has wrong length".into()))?;
                Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
            }
            CipherId::Twofish => {
                let enc = TwofishCbcEnc::new_from_slices(key, iv)
                    .map_err(|_| Error::Malformed("cipher key has wrong length".into()))?;
                Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
            }
            CipherId::ChaCha20 => {
                let mut out = plaintext.to_vec();
                apply_chacha20(&mut out, key, iv)?;
                Ok(out)
            }
        }
    }

    /// Decrypt a ciphertext body.
    ///
    /// A padding failure almost always means the derived key was wrong,
    /// so it maps to `InvalidCredentials` rather than a format error.
    pub fn decrypt(self, ciphertext: &[u8], key: &[u8; 32], iv: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != self.iv_len() {
            return Err(Error::Malformed("encryption IV has wrong length".into()));
        }
        match self {
            CipherId::Aes256 => {
                let dec = Aes256CbcDec::new_from_slices(key, iv)
                    .map_err(|_| Error::Malformed("cipher key has wrong length".into()))?;
                dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                    .map_err(|_| Error::InvalidCredentials)
            }
            CipherId::Twofish => {
                let dec = TwofishCbcDec::new_from_slices(key, iv)
                    .map_err(|_| Error::Malformed("cipher key has wrong length".into()))?;
                dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                    .map_err(|_| Error::InvalidCredentials)
            }
            CipherId::ChaCha20 => {
                let mut out = ciphertext.to_vec();
                apply_chacha20(&mut out, key, iv)?;
                Ok(out)
            }
        }
    }
}

fn apply_chacha20(data: &mut [u8], key: &[u8; 32], iv: &[u8]) -> Result<()> {
    let mut cipher = ChaCha20::new_from_slices(key, iv)
        .map_err(|_| Error::Malformed("cipher key has wrong length".into()))?;
    cipher.apply_keystream(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn test_uuid_round_trip() {
        for id in [CipherId::Aes256, CipherId::Twofish, CipherId::ChaCha20] {
            assert_eq!(CipherId::from_uuid(&id.uuid()).unwrap(), id);
        }
        assert!(matches!(
            CipherId::from_uuid(&[0u8; 16]),
            Err(Error::InvalidAlgorithm)
        ));
    }

    #[test]
    fn test_cbc_round_trip() {
        let iv = [3u8; 16];
        for id in [CipherId::Aes256, CipherId::Twofish] {
            let ct = id.encrypt(b"attack at dawn", &KEY, &iv).unwrap();
            assert_ne!(&ct[..], b"attack at dawn");
            assert_eq!(ct.len() % 16, 0);
            let pt = id.decrypt(&ct, &KEY, &iv).unwrap();
            assert_eq!(pt, b"attack at dawn");
        }
    }

    #[test]
    fn test_chacha20_round_trip() {
        let iv = [9u8; 12];
        let ct = CipherId::ChaCha20.encrypt(b"attack at dawn", &KEY, &iv).unwrap();
        assert_eq!(ct.len(), 14);
        let pt = CipherId::ChaCha20.decrypt(&ct, &KEY, &iv).unwrap();
        assert_eq!(pt, b"attack at dawn");
    }

    #[test]
    fn test_partial_block_is_rejected() {
        let iv = [3u8; 16];
        // 13 bytes is not a whole CBC block, so unpadding must fail
        let err = CipherId::Aes256.decrypt(&[0u8; 13], &KEY, &iv).unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }

    #[test]
    fn test_wrong_iv_length() {
        let err = CipherId::ChaCha20.encrypt(b"x", &KEY, &[0u8; 16]).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }
}
