//! Key derivation engine
//!
//! Stretches the 32-byte composite key into the 32-byte transformed key.
//! Two algorithm families are defined by the formats: the rounds-based
//! AES-KDF (the only choice for legacy files, optional for KDBX 4) and the
//! memory-hard Argon2 in its d and id variants (KDBX 4 only). KDBX 4
//! carries the parameter set in a variant dictionary keyed by the KDF UUID.

use aes::Aes256;
use argon2::{Algorithm, Argon2, Block, Params, Version};
use cipher::generic_array::GenericArray;
use cipher::{BlockEncrypt, KeyInit};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::format::variant_dict::{VariantDict, VariantValue};

/// KDF UUID for AES-KDF (c9d9f39a-628a-4460-bf74-0d08c18a4fea)
pub const KDF_UUID_AES: [u8; 16] = [
    0xc9, 0xd9, 0xf3, 0x9a, 0x62, 0x8a, 0x44, 0x60, 0xbf, 0x74, 0x0d, 0x08, 0xc1, 0x8a, 0x4f, 0xea,
];

/// KDF UUID for Argon2d (ef636ddf-8c29-444b-91f7-a9a403e30a0c)
pub const KDF_UUID_ARGON2D: [u8; 16] = [
    0xef, 0x63, 0x6d, 0xdf, 0x8c, 0x29, 0x44, 0x4b, 0x91, 0xf7, 0xa9, 0xa4, 0x03, 0xe3, 0x0a, 0x0c,
];

/// KDF UUID for Argon2id (9e298b19-56db-4773-b23d-fc3ec6f0a1e6)
pub const KDF_UUID_ARGON2ID: [u8; 16] = [
    0x9e, 0x29, 0x8b, 0x19, 0x56, 0xdb, 0x47, 0x73, 0xb2, 0x3d, 0xfc, 0x3e, 0xc6, 0xf0, 0xa1, 0xe6,
];

/// Argon2 sub-variant selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Argon2Variant {
    Argon2d,
    Argon2id,
}

/// A KDF algorithm together with its parameters
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum KdfParams {
    /// Rounds-based KDF: AES-256-ECB applied `rounds` times, keyed by the
    /// transform seed
    Aes { rounds: u64, seed: [u8; 32] },
    /// Memory-hard KDF. `memory` is in bytes, as stored on the wire.
    Argon2 {
        variant: Argon2Variant,
        salt: Vec<u8>,
        memory: u64,
        iterations: u64,
        parallelism: u32,
        version: u32,
    },
}

impl KdfParams {
    /// Default AES-KDF parameter set with a fresh random seed
    pub fn default_aes() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        KdfParams::Aes {
            rounds: 600_000,
            seed,
        }
    }

    /// Default Argon2d parameter set with a fresh random salt
    pub fn default_argon2() -> Self {
        let mut salt = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);
        KdfParams::Argon2 {
            variant: Argon2Variant::Argon2d,
            salt,
            memory: 64 * 1024 * 1024,
            iterations: 3,
            parallelism: 2,
            version: 0x13,
        }
    }

    /// Replace the salt/seed with fresh randomness. Called on every save so
    /// a re-encrypted file never reuses derivation inputs.
    pub fn reseed(&mut self) {
        match self {
            KdfParams::Aes { seed, .. } => rand::thread_rng().fill_bytes(seed),
            KdfParams::Argon2 { salt, .. } => {
                salt.resize(32, 0);
                rand::thread_rng().fill_bytes(salt);
            }
        }
    }

    /// Decode a KDBX 4 KDF parameter dictionary
    pub fn from_variant_dict(dict: &VariantDict) -> Result<Self> {
        let uuid = dict
            .get_bytes("$UUID")
            .ok_or_else(|| Error::Malformed("KDF parameters missing $UUID".into()))?;

        if uuid == KDF_UUID_AES {
            let rounds = dict
                .get_u64("R")
                .ok_or_else(|| Error::Malformed("AES-KDF parameters missing rounds".into()))?;
            let seed = dict
                .get_bytes("S")
                .and_then(|s| <[u8; 32]>::try_from(s).ok())
                .ok_or_else(|| Error::Malformed("AES-KDF parameters missing seed".into()))?;
            return Ok(KdfParams::Aes { rounds, seed });
        }

        let variant = if uuid == KDF_UUID_ARGON2D {
            Argon2Variant::Argon2d
        } else if uuid == KDF_UUID_ARGON2ID {
            Argon2Variant::Argon2id
        } else {
            return Err(Error::InvalidAlgorithm);
        };

        Ok(KdfParams::Argon2 {
            variant,
            salt: dict
                .get_bytes("S")
                .ok_or_else(|| Error::Malformed("Argon2 parameters missing salt".into()))?
                .to_vec(),
            memory: dict
                .get_u64("M")
                .ok_or_else(|| Error::Malformed("Argon2 parameters missing memory".into()))?,
            iterations: dict
                .get_u64("I")
                .ok_or_else(|| Error::Malformed("Argon2 parameters missing iterations".into()))?,
            parallelism: dict
                .get_u32("P")
                .ok_or_else(|| Error::Malformed("Argon2 parameters missing parallelism".into()))?,
            version: dict.get_u32("V").unwrap_or(0x13),
        })
    }

    /// Encode as a KDBX 4 KDF parameter dictionary
    pub fn to_variant_dict(&self) -> VariantDict {
        let mut dict = VariantDict::new();
        match self {
            KdfParams::Aes { rounds, seed } => {
                dict.insert("$UUID", VariantValue::Bytes(KDF_UUID_AES.to_vec()));
                dict.insert("R", VariantValue::U64(*rounds));
                dict.insert("S", VariantValue::Bytes(seed.to_vec()));
            }
            KdfParams::Argon2 {
                variant,
                salt,
                memory,
                iterations,
                parallelism,
                version,
            } => {
                let uuid = match variant {
                    Argon2Variant::Argon2d => KDF_UUID_ARGON2D,
                    Argon2Variant::Argon2id => KDF_UUID_ARGON2ID,
                };
                dict.insert("$UUID", VariantValue::Bytes(uuid.to_vec()));
                dict.insert("S", VariantValue::Bytes(salt.clone()));
                dict.insert("P", VariantValue::U32(*parallelism));
                dict.insert("M", VariantValue::U64(*memory));
                dict.insert("I", VariantValue::U64(*iterations));
                dict.insert("V", VariantValue::U32(*version));
            }
        }
        dict
    }

    /// Stretch the composite key into the 32-byte transformed key
    pub fn derive(&self, composite: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
        match self {
            KdfParams::Aes { rounds, seed } => Ok(derive_aes_kdf(composite, seed, *rounds)),
            KdfParams::Argon2 {
                variant,
                salt,
                memory,
                iterations,
                parallelism,
                version,
            } => derive_argon2(
                composite,
                *variant,
                salt,
                *memory,
                *iterations,
                *parallelism,
                *version,
            ),
        }
    }
}

/// AES-256-ECB over both halves of the key, `rounds` times, then SHA-256
pub fn derive_aes_kdf(composite: &[u8; 32], seed: &[u8; 32], rounds: u64) -> Zeroizing<[u8; 32]> {
    let cipher = Aes256::new(GenericArray::from_slice(seed));
    let mut buf = Zeroizing::new(*composite);
    for _ in 0..rounds {
        let (lo, hi) = buf.split_at_mut(16);
        cipher.encrypt_block(GenericArray::from_mut_slice(lo));
        cipher.encrypt_block(GenericArray::from_mut_slice(hi));
    }
    normalize_key(Sha256::digest(buf.as_ref()).as_slice())
}

fn derive_argon2(
    composite: &[u8; 32],
    variant: Argon2Variant,
    salt: &[u8],
    memory: u64,
    iterations: u64,
    parallelism: u32,
    version: u32,
) -> Result<Zeroizing<[u8; 32]>> {
    let algorithm = match variant {
        Argon2Variant::Argon2d => Algorithm::Argon2d,
        Argon2Variant::Argon2id => Algorithm::Argon2id,
    };
    let version = match version {
        0x10 => Version::V0x10,
        0x13 => Version::V0x13,
        _ => return Err(Error::InvalidAlgorithm),
    };
    let memory_kib = u32::try_from(memory / 1024).map_err(|_| Error::InvalidAlgorithm)?;
    let iterations = u32::try_from(iterations).map_err(|_| Error::InvalidAlgorithm)?;
    let params = Params::new(memory_kib, iterations, parallelism, Some(32))
        .map_err(|_| Error::InvalidAlgorithm)?;

    // The lane memory is reserved up front so an allocation failure is
    // reported as KdfMemoryExhausted instead of aborting or surfacing as a
    // generic error.
    let block_count = params.block_count();
    let mut blocks: Vec<Block> = Vec::new();
    blocks
        .try_reserve_exact(block_count)
        .map_err(|_| Error::KdfMemoryExhausted)?;
    blocks.resize(block_count, Block::default());

    let argon2 = Argon2::new(algorithm, version, params);
    let mut out = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into_with_memory(composite, salt, out.as_mut(), &mut blocks)
        .map_err(|_| Error::InvalidAlgorithm)?;
    Ok(out)
}

/// Force a key to exactly 32 bytes, re-hashing with SHA-256 when the raw
/// output has any other length
pub fn normalize_key(raw: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut out = Zeroizing::new([0u8; 32]);
    if raw.len() == 32 {
        out.copy_from_slice(raw);
    } else {
        out.copy_from_slice(Sha256::digest(raw).as_slice());
    }
    out
}
