//! Entry types and operations

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::binary_pool::BinaryId;
use crate::db::custom_data::CustomData;
use crate::db::protected::ProtectedString;
use crate::db::times::Times;

/// Well-known field keys shared by every entry
pub const FIELD_TITLE: &str = "Title";
pub const FIELD_USERNAME: &str = "UserName";
pub const FIELD_PASSWORD: &str = "Password";
pub const FIELD_URL: &str = "URL";
pub const FIELD_NOTES: &str = "Notes";

/// A field value, either plain text or an obfuscated protected value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Plain(String),
    Protected(ProtectedString),
}

impl FieldValue {
    /// The plaintext, regardless of protection
    pub fn value(&self) -> &str {
        match self {
            FieldValue::Plain(s) => s,
            FieldValue::Protected(s) => s.expose(),
        }
    }

    pub fn is_protected(&self) -> bool {
        matches!(self, FieldValue::Protected(_))
    }
}

/// A named attachment referencing a binary-pool payload. The entry never
/// owns the bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name shown to the user
    pub key: String,
    pub binary: BinaryId,
}

/// One auto-type window/sequence association
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoTypeAssociation {
    pub window: String,
    pub sequence: String,
}

/// Auto-type settings of an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoType {
    pub enabled: bool,
    pub obfuscation: u32,
    pub default_sequence: String,
    pub associations: Vec<AutoTypeAssociation>,
}

impl Default for AutoType {
    fn default() -> Self {
        Self {
            enabled: true,
            obfuscation: 0,
            default_sequence: String::new(),
            associations: Vec::new(),
        }
    }
}

/// A password entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique identifier for this entry
    pub uuid: Uuid,
    /// Icon index into the built-in icon set
    pub icon_id: u32,
    /// Custom icon reference, overriding `icon_id` when set
    pub custom_icon: Option<Uuid>,
    pub foreground_color: Option<String>,
    pub background_color: Option<String>,
    pub override_url: String,
    pub tags: Vec<String>,
    /// Whether password-quality estimation applies to this entry
    pub quality_check: bool,
    pub times: Times,
    /// All string fields, including the well-known ones
    fields: HashMap<String, FieldValue>,
    pub binaries: Vec<Attachment>,
    pub auto_type: AutoType,
    pub custom_data: CustomData,
    /// Prior snapshots of this entry, oldest first. Never indexed.
    pub history: Vec<Entry>,
    /// UUID of the parent group
    pub parent: Option<Uuid>,
}

impl Entry {
    /// Create a new entry with the given title
    pub fn new(title: impl Into<String>) -> Self {
        let mut entry = Self::empty();
        entry.set_field(FIELD_TITLE, FieldValue::Plain(title.into()));
        entry
    }

    /// An entry with no fields at all, used by the stream decoders so a
    /// record without a title does not grow a phantom one
    pub(crate) fn empty() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            icon_id: 0,
            custom_icon: None,
            foreground_color: None,
            background_color: None,
            override_url: String::new(),
            tags: Vec::new(),
            quality_check: true,
            times: Times::now(),
            fields: HashMap::new(),
            binaries: Vec::new(),
            auto_type: AutoType::default(),
            custom_data: CustomData::new(),
            history: Vec::new(),
            parent: None,
        }
    }

    /// Get a field's plaintext
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(FieldValue::value)
    }

    pub fn field_value(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Set or replace a field
    pub fn set_field(&mut self, key: impl Into<String>, value: FieldValue) {
        self.fields.insert(key.into(), value);
    }

    pub fn remove_field(&mut self, key: &str) -> Option<FieldValue> {
        self.fields.remove(key)
    }

    /// Iterate all fields in unspecified order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn title(&self) -> Option<&str> {
        self.field(FIELD_TITLE)
    }

    pub fn username(&self) -> Option<&str> {
        self.field(FIELD_USERNAME)
    }

    pub fn url(&self) -> Option<&str> {
        self.field(FIELD_URL)
    }

    pub fn notes(&self) -> Option<&str> {
        self.field(FIELD_NOTES)
    }

    /// The password plaintext, if set
    pub fn password(&self) -> Option<&str> {
        self.field(FIELD_PASSWORD)
    }

    /// Store the password as a protected field
    pub fn set_password(&mut self, password: impl Into<String>) {
        self.set_field(
            FIELD_PASSWORD,
            FieldValue::Protected(ProtectedString::new(password.into())),
        );
        self.times.touch_modified();
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.set_field(FIELD_TITLE, FieldValue::Plain(title.into()));
        self.times.touch_modified();
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.set_field(FIELD_USERNAME, FieldValue::Plain(username.into()));
        self.times.touch_modified();
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.set_field(FIELD_URL, FieldValue::Plain(url.into()));
        self.times.touch_modified();
    }

    pub fn set_notes(&mut self, notes: impl Into<String>) {
        self.set_field(FIELD_NOTES, FieldValue::Plain(notes.into()));
        self.times.touch_modified();
    }

    /// Append the current state to the history list. The snapshot itself
    /// carries no history and no parent link; it belongs to this entry.
    pub fn push_history(&mut self) {
        let mut snapshot = self.clone();
        snapshot.history.clear();
        snapshot.parent = None;
        self.history.push(snapshot);
    }

    pub fn is_expired(&self) -> bool {
        self.times.is_expired()
    }
}

/// Builder for creating entries
pub struct EntryBuilder {
    entry: Entry,
}

impl EntryBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            entry: Entry::new(title),
        }
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.entry
            .set_field(FIELD_USERNAME, FieldValue::Plain(username.into()));
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.entry.set_field(
            FIELD_PASSWORD,
            FieldValue::Protected(ProtectedString::new(password.into())),
        );
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.entry.set_field(FIELD_URL, FieldValue::Plain(url.into()));
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.entry
            .set_field(FIELD_NOTES, FieldValue::Plain(notes.into()));
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entry.set_field(key, FieldValue::Plain(value.into()));
        self
    }

    pub fn protected_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entry
            .set_field(key, FieldValue::Protected(ProtectedString::new(value.into())));
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.entry.tags.push(tag.into());
        self
    }

    pub fn attachment(mut self, key: impl Into<String>, binary: BinaryId) -> Self {
        self.entry.binaries.push(Attachment {
            key: key.into(),
            binary,
        });
        self
    }

    pub fn parent(mut self, group_uuid: Uuid) -> Self {
        self.entry.parent = Some(group_uuid);
        self
    }

    pub fn build(self) -> Entry {
        self.entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_creation() {
        let entry = Entry::new("Test Entry");
        assert_eq!(entry.title(), Some("Test Entry"));
        assert!(entry.password().is_none());
    }

    #[test]
    fn test_entry_builder() {
        let entry = EntryBuilder::new("GitHub")
            .username("user@example.com")
            .password("secret123")
            .url("https://github.com")
            .field("2FA", "enabled")
            .tag("work")
            .build();

        assert_eq!(entry.title(), Some("GitHub"));
        assert_eq!(entry.username(), Some("user@example.com"));
        assert_eq!(entry.password(), Some("secret123"));
        assert!(entry
            .field_value(FIELD_PASSWORD)
            .is_some_and(FieldValue::is_protected));
        assert_eq!(entry.field("2FA"), Some("enabled"));
        assert_eq!(entry.tags, vec!["work"]);
    }

    #[test]
    fn test_history_snapshot_carries_no_history() {
        let mut entry = Entry::new("v1");
        entry.push_history();
        entry.set_title("v2");
        entry.push_history();

        assert_eq!(entry.history.len(), 2);
        assert_eq!(entry.history[0].title(), Some("v1"));
        assert_eq!(entry.history[1].title(), Some("v2"));
        assert!(entry.history[1].history.is_empty());
    }
}
