//! Per-object custom data
//!
//! Plugins and the host application attach arbitrary string key/value
//! pairs to the database, to groups and to entries. Newer files may stamp
//! each item with a modification time; the presence of any such stamp
//! forces the newer file sub-version on save.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomDataItem {
    pub value: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Ordered string map; ordering keeps serialization deterministic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomData {
    items: BTreeMap<String, CustomDataItem>,
}

impl CustomData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.items.insert(
            key.into(),
            CustomDataItem {
                value: value.into(),
                last_modified: None,
            },
        );
    }

    pub fn set_item(&mut self, key: impl Into<String>, item: CustomDataItem) {
        self.items.insert(key.into(), item);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.items.get(key).map(|item| item.value.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<CustomDataItem> {
        self.items.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CustomDataItem)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when any item carries a modification stamp
    pub fn has_timestamps(&self) -> bool {
        self.items.values().any(|item| item.last_modified.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let mut data = CustomData::new();
        data.set("plugin/color", "#aabbcc");
        assert_eq!(data.get("plugin/color"), Some("#aabbcc"));
        assert!(!data.has_timestamps());
    }

    #[test]
    fn test_timestamps_detected() {
        let mut data = CustomData::new();
        data.set_item(
            "k",
            CustomDataItem {
                value: "v".into(),
                last_modified: Some(Utc::now()),
            },
        );
        assert!(data.has_timestamps());
    }
}
