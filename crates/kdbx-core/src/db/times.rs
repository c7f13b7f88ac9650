//! Node timestamps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The timestamp block every group and entry carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Times {
    pub creation: DateTime<Utc>,
    pub last_modification: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    /// Whether `expiry` is meaningful
    pub expires: bool,
    pub usage_count: u64,
    pub location_changed: DateTime<Utc>,
}

impl Times {
    pub fn now() -> Self {
        let now = truncate_to_seconds(Utc::now());
        Self {
            creation: now,
            last_modification: now,
            last_access: now,
            expiry: now,
            expires: false,
            usage_count: 0,
            location_changed: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires && self.expiry < Utc::now()
    }

    pub fn touch_modified(&mut self) {
        let now = truncate_to_seconds(Utc::now());
        self.last_modification = now;
        self.last_access = now;
    }

    pub fn touch_accessed(&mut self) {
        self.last_access = truncate_to_seconds(Utc::now());
        self.usage_count += 1;
    }

    pub fn touch_moved(&mut self) {
        self.location_changed = truncate_to_seconds(Utc::now());
    }
}

impl Default for Times {
    fn default() -> Self {
        Self::now()
    }
}

/// Both wire encodings carry whole seconds only; keeping sub-second
/// precision in memory would break round-trip equality.
pub fn truncate_to_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}
