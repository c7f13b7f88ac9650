//! Group types and operations

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::custom_data::CustomData;
use crate::db::times::Times;

/// A group (folder) containing entries and subgroups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Unique identifier for this group
    pub uuid: Uuid,
    /// Wire-level 32-bit id of the legacy format, preserved for
    /// round-trip; assigned on save when absent
    pub legacy_id: Option<u32>,
    /// Group name
    pub name: String,
    /// Notes for this group
    pub notes: String,
    /// Icon index into the built-in icon set
    pub icon_id: u32,
    /// Custom icon reference, overriding `icon_id` when set
    pub custom_icon: Option<Uuid>,
    pub times: Times,
    /// Whether this group is expanded in the UI
    pub is_expanded: bool,
    pub default_autotype_sequence: String,
    /// None inherits from the parent group
    pub enable_auto_type: Option<bool>,
    /// None inherits from the parent group
    pub enable_searching: Option<bool>,
    pub last_top_visible_entry: Option<Uuid>,
    pub tags: Vec<String>,
    pub custom_data: CustomData,
    /// UUID of the parent group (None for the root)
    pub parent: Option<Uuid>,
    /// UUIDs of child groups, in order
    pub groups: Vec<Uuid>,
    /// UUIDs of entries in this group, in order
    pub entries: Vec<Uuid>,
}

impl Group {
    /// Create a new group with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            legacy_id: None,
            name: name.into(),
            notes: String::new(),
            icon_id: 48,
            custom_icon: None,
            times: Times::now(),
            is_expanded: true,
            default_autotype_sequence: String::new(),
            enable_auto_type: None,
            enable_searching: None,
            last_top_visible_entry: None,
            tags: Vec::new(),
            custom_data: CustomData::new(),
            parent: None,
            groups: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Create a new group with a specific UUID (used when loading)
    pub fn with_uuid(uuid: Uuid, name: impl Into<String>) -> Self {
        let mut group = Self::new(name);
        group.uuid = uuid;
        group
    }

    /// Add a child group UUID
    pub fn add_child(&mut self, child_uuid: Uuid) {
        if !self.groups.contains(&child_uuid) {
            self.groups.push(child_uuid);
            self.times.touch_modified();
        }
    }

    /// Remove a child group UUID
    pub fn remove_child(&mut self, child_uuid: &Uuid) -> bool {
        if let Some(pos) = self.groups.iter().position(|u| u == child_uuid) {
            self.groups.remove(pos);
            self.times.touch_modified();
            true
        } else {
            false
        }
    }

    /// Add an entry UUID to this group
    pub fn add_entry(&mut self, entry_uuid: Uuid) {
        if !self.entries.contains(&entry_uuid) {
            self.entries.push(entry_uuid);
            self.times.touch_modified();
        }
    }

    /// Remove an entry UUID from this group
    pub fn remove_entry(&mut self, entry_uuid: &Uuid) -> bool {
        if let Some(pos) = self.entries.iter().position(|u| u == entry_uuid) {
            self.entries.remove(pos);
            self.times.touch_modified();
            true
        } else {
            false
        }
    }

    /// Check if this is a root group (no parent)
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}
