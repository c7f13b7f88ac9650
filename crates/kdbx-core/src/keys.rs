//! Composite key builder and key schedule
//!
//! A master key is combined from up to three independent factors: a
//! password, a key file and a hardware challenge-response. The factors are
//! retained (pre-hash) so the master key can be rebuilt against a fresh
//! seed on save; a hardware factor is re-challenged every time.

use sha2::{Digest, Sha256, Sha512};
use xml::reader::{EventReader, XmlEvent};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// How the password string is turned into bytes before hashing. The legacy
/// format predates UTF-8 handling and uses ISO-8859-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordEncoding {
    Latin1,
    Utf8,
}

/// Challenge-response callback for a hardware factor. The challenge is the
/// file's master seed; the engine never talks to hardware itself.
pub type ChallengeFn = Box<dyn Fn(Option<&[u8]>) -> Result<Vec<u8>> + Send + Sync>;

/// A master key combined from up to three independent factors
#[derive(Default)]
pub struct CompositeKey {
    password: Option<Zeroizing<String>>,
    keyfile_key: Option<Zeroizing<Vec<u8>>>,
    hardware: Option<ChallengeFn>,
}

impl std::fmt::Debug for CompositeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeKey")
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("keyfile", &self.keyfile_key.as_ref().map(|_| "***"))
            .field("hardware", &self.hardware.is_some())
            .finish()
    }
}

impl CompositeKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a password factor
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    /// Add a key-file factor. The file content is sniffed and decoded
    /// immediately: KeePass XML key file, exact 32 raw bytes, 64 hex
    /// characters, or anything else hashed with SHA-256.
    pub fn with_keyfile(mut self, content: &[u8]) -> Result<Self> {
        self.keyfile_key = Some(decode_keyfile(content)?);
        Ok(self)
    }

    /// Add a hardware challenge-response factor
    pub fn with_hardware_key<F>(mut self, respond: F) -> Self
    where
        F: Fn(Option<&[u8]>) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.hardware = Some(Box::new(respond));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.password.is_none() && self.keyfile_key.is_none() && self.hardware.is_none()
    }

    pub fn has_hardware_key(&self) -> bool {
        self.hardware.is_some()
    }

    /// Combine the present factors into the raw 32-byte master key:
    /// SHA-256 over the concatenated factor digests in fixed order
    /// (password, key file, hardware). A hardware factor performs a fresh
    /// challenge-response round trip on every call.
    pub fn raw_key(
        &self,
        encoding: PasswordEncoding,
        challenge: Option<&[u8]>,
    ) -> Result<Zeroizing<[u8; 32]>> {
        if self.is_empty() {
            return Err(Error::EmptyCredential);
        }

        let mut hasher = Sha256::new();
        if let Some(password) = &self.password {
            let bytes = encode_password(password, encoding);
            hasher.update(Sha256::digest(&bytes));
        }
        if let Some(keyfile_key) = &self.keyfile_key {
            hasher.update(keyfile_key.as_slice());
        }
        if let Some(respond) = &self.hardware {
            let response = Zeroizing::new(respond(challenge)?);
            hasher.update(Sha256::digest(response.as_slice()));
        }

        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&hasher.finalize());
        Ok(out)
    }
}

fn encode_password(password: &str, encoding: PasswordEncoding) -> Zeroizing<Vec<u8>> {
    match encoding {
        PasswordEncoding::Utf8 => Zeroizing::new(password.as_bytes().to_vec()),
        PasswordEncoding::Latin1 => Zeroizing::new(
            password
                .chars()
                .map(|c| if (c as u32) < 256 { c as u8 } else { b'?' })
                .collect(),
        ),
    }
}

/// Decode key-file content into raw key bytes. Each sub-format decodes
/// independently; a structured key file that fails to decode is an error
/// rather than being silently hashed as opaque bytes.
fn decode_keyfile(content: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if looks_like_xml(content) {
        return decode_xml_keyfile(content);
    }
    if content.len() == 32 {
        return Ok(Zeroizing::new(content.to_vec()));
    }
    if content.len() == 64 {
        if let Ok(text) = std::str::from_utf8(content) {
            if let Ok(raw) = hex::decode(text) {
                return Ok(Zeroizing::new(raw));
            }
        }
    }
    Ok(Zeroizing::new(Sha256::digest(content).to_vec()))
}

fn looks_like_xml(content: &[u8]) -> bool {
    let head = content
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|i| &content[i..])
        .unwrap_or(content);
    head.starts_with(b"<?xml") || head.starts_with(b"<KeyFile")
}

/// Parse the KeePass XML key-file envelope:
/// `<KeyFile><Meta><Version>…</Version></Meta><Key><Data>…</Data></Key></KeyFile>`.
/// Version 1.x carries base64 data, version 2.0 hex with an optional
/// integrity hash attribute (first 4 bytes of SHA-256 of the key).
fn decode_xml_keyfile(content: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let malformed = |msg: &str| Error::Malformed(format!("key file: {msg}"));

    let mut version = String::new();
    let mut data_text = String::new();
    let mut data_hash: Option<String> = None;
    let mut path: Vec<String> = Vec::new();
    let mut saw_keyfile = false;

    let reader = EventReader::new(content);
    for event in reader {
        match event.map_err(|_| malformed("invalid XML"))? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                if path.is_empty() && name.local_name != "KeyFile" {
                    return Err(malformed("unexpected root element"));
                }
                if name.local_name == "KeyFile" {
                    saw_keyfile = true;
                }
                if name.local_name == "Data" {
                    for attr in &attributes {
                        if attr.name.local_name == "Hash" {
                            data_hash = Some(attr.value.clone());
                        }
                    }
                }
                path.push(name.local_name);
            }
            XmlEvent::EndElement { .. } => {
                path.pop();
            }
            XmlEvent::Characters(text) | XmlEvent::CData(text) => match path.last().map(String::as_str) {
                Some("Version") => version.push_str(text.trim()),
                Some("Data") => data_text.push_str(&text),
                _ => {}
            },
            _ => {}
        }
    }
    if !saw_keyfile || data_text.trim().is_empty() {
        return Err(malformed("missing key data"));
    }

    let compact: String = data_text.split_whitespace().collect();
    let raw = if version.starts_with("2.") {
        let raw = hex::decode(&compact).map_err(|_| malformed("version 2 data is not hex"))?;
        if let Some(hash) = data_hash {
            let expected = hex::encode_upper(&Sha256::digest(&raw)[..4]);
            if !hash.eq_ignore_ascii_case(&expected) {
                return Err(malformed("integrity hash mismatch"));
            }
        }
        raw
    } else {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(&compact)
            .map_err(|_| malformed("version 1 data is not base64"))?
    };
    Ok(Zeroizing::new(raw))
}

/// Final body-cipher key: SHA-256(master seed ‖ transformed key)
pub fn final_key(master_seed: &[u8], transformed: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(master_seed);
    hasher.update(transformed);
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Base HMAC key: SHA-512(master seed ‖ transformed key ‖ 0x01)
pub fn hmac_key(master_seed: &[u8], transformed: &[u8; 32]) -> Zeroizing<[u8; 64]> {
    let mut hasher = Sha512::new();
    hasher.update(master_seed);
    hasher.update(transformed);
    hasher.update([0x01]);
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&hasher.finalize());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[test]
    fn test_empty_credentials_rejected() {
        let key = CompositeKey::new();
        assert!(matches!(
            key.raw_key(PasswordEncoding::Utf8, None),
            Err(Error::EmptyCredential)
        ));
    }

    #[test]
    fn test_password_is_deterministic_per_encoding() {
        let key = CompositeKey::new().with_password("pässword");
        let utf8 = key.raw_key(PasswordEncoding::Utf8, None).unwrap();
        let latin1 = key.raw_key(PasswordEncoding::Latin1, None).unwrap();
        assert_ne!(utf8, latin1);
        assert_eq!(utf8, key.raw_key(PasswordEncoding::Utf8, None).unwrap());
    }

    #[test]
    fn test_factor_order_matters() {
        let pw_only = CompositeKey::new().with_password("a");
        let both = CompositeKey::new()
            .with_password("a")
            .with_keyfile(&[1u8; 32])
            .unwrap();
        assert_ne!(
            pw_only.raw_key(PasswordEncoding::Utf8, None).unwrap(),
            both.raw_key(PasswordEncoding::Utf8, None).unwrap()
        );
    }

    #[test]
    fn test_hardware_only_factor_is_permitted() {
        let key = CompositeKey::new().with_hardware_key(|challenge| {
            let mut response = b"hw:".to_vec();
            response.extend_from_slice(challenge.unwrap_or_default());
            Ok(response)
        });
        let a = key.raw_key(PasswordEncoding::Utf8, Some(b"seed-1")).unwrap();
        let b = key.raw_key(PasswordEncoding::Utf8, Some(b"seed-2")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_raw_32_byte_keyfile() {
        let key = CompositeKey::new().with_keyfile(&[7u8; 32]).unwrap();
        assert!(!key.is_empty());
    }

    #[test]
    fn test_hex_keyfile_matches_raw() {
        let raw = [0xABu8; 32];
        let hex_text = hex::encode(raw);
        let from_hex = CompositeKey::new().with_keyfile(hex_text.as_bytes()).unwrap();
        let from_raw = CompositeKey::new().with_keyfile(&raw).unwrap();
        assert_eq!(
            from_hex.raw_key(PasswordEncoding::Utf8, None).unwrap(),
            from_raw.raw_key(PasswordEncoding::Utf8, None).unwrap()
        );
    }

    #[test]
    fn test_xml_keyfile_v1() {
        let raw = [0x5Au8; 32];
        let xml = format!(
            "<?xml version=\"1.0\"?><KeyFile><Meta><Version>1.00</Version></Meta>\
             <Key><Data>{}</Data></Key></KeyFile>",
            base64::engine::general_purpose::STANDARD.encode(raw)
        );
        let from_xml = CompositeKey::new().with_keyfile(xml.as_bytes()).unwrap();
        let from_raw = CompositeKey::new().with_keyfile(&raw).unwrap();
        assert_eq!(
            from_xml.raw_key(PasswordEncoding::Utf8, None).unwrap(),
            from_raw.raw_key(PasswordEncoding::Utf8, None).unwrap()
        );
    }

    #[test]
    fn test_xml_keyfile_v2_hash_checked() {
        let raw = [0x11u8; 32];
        let hash = hex::encode_upper(&Sha256::digest(raw)[..4]);
        let good = format!(
            "<KeyFile><Meta><Version>2.0</Version></Meta>\
             <Key><Data Hash=\"{hash}\">{}</Data></Key></KeyFile>",
            hex::encode_upper(raw)
        );
        assert!(CompositeKey::new().with_keyfile(good.as_bytes()).is_ok());

        let bad = good.replace(&hash, "00000000");
        assert!(matches!(
            CompositeKey::new().with_keyfile(bad.as_bytes()),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_arbitrary_keyfile_is_hashed() {
        let content = b"some opaque key material, neither xml nor hex";
        let key = CompositeKey::new().with_keyfile(content).unwrap();
        let again = CompositeKey::new().with_keyfile(content).unwrap();
        assert_eq!(
            key.raw_key(PasswordEncoding::Utf8, None).unwrap(),
            again.raw_key(PasswordEncoding::Utf8, None).unwrap()
        );
    }

    #[test]
    fn test_key_schedule_shapes() {
        let transformed = [4u8; 32];
        assert_eq!(final_key(&[1u8; 32], &transformed).len(), 32);
        assert_eq!(hmac_key(&[1u8; 32], &transformed).len(), 64);
    }
}
