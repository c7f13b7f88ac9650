//! KDBX timestamp encoding
//!
//! KDBX 4 stores times as base64 of the little-endian second count since
//! 0001-01-01T00:00:00 UTC. Documents migrated from older generators may
//! still carry ISO-8601 text, which is accepted on read.

use base64::Engine;
use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::error::{Error, Result};

fn epoch() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("year 1 is representable")
        .and_utc()
}

/// Encode a timestamp as base64 seconds-since-year-1
pub fn encode(t: DateTime<Utc>) -> String {
    let seconds = t.signed_duration_since(epoch()).num_seconds();
    base64::engine::general_purpose::STANDARD.encode(seconds.to_le_bytes())
}

/// Decode either encoding
pub fn decode(text: &str) -> Result<DateTime<Utc>> {
    let text = text.trim();
    if text.contains(':') {
        return DateTime::parse_from_rfc3339(text)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| Error::Malformed(format!("invalid timestamp {text:?}")));
    }
    let raw = base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|_| Error::Malformed(format!("invalid timestamp {text:?}")))?;
    let raw: [u8; 8] = raw
        .try_into()
        .map_err(|_| Error::Malformed(format!("invalid timestamp {text:?}")))?;
    let seconds = i64::from_le_bytes(raw);
    Duration::try_seconds(seconds)
        .and_then(|delta| epoch().checked_add_signed(delta))
        .ok_or_else(|| Error::Malformed(format!("timestamp out of range: {seconds}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::times::truncate_to_seconds;

    #[test]
    fn test_round_trip() {
        let now = truncate_to_seconds(Utc::now());
        assert_eq!(decode(&encode(now)).unwrap(), now);
    }

    #[test]
    fn test_iso_8601_fallback() {
        let t = decode("2024-05-01T12:30:00Z").unwrap();
        assert_eq!(t.timestamp(), 1714566600);
        assert_eq!(decode(&encode(t)).unwrap(), t);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decode("???").is_err());
        assert!(decode("AAAA").is_err()); // too short for 8 bytes
    }
}
