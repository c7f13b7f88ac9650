//! Database-level metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::binary_pool::BinaryId;
use crate::db::custom_data::CustomData;

/// A user-supplied icon. The image bytes live in the binary pool; the
/// icon only references them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomIcon {
    pub uuid: Uuid,
    pub data: BinaryId,
    /// Optional display name (newer sub-version only)
    pub name: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Which well-known fields the host application should treat as protected
/// when creating new entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryProtection {
    pub protect_title: bool,
    pub protect_username: bool,
    pub protect_password: bool,
    pub protect_url: bool,
    pub protect_notes: bool,
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self {
            protect_title: false,
            protect_username: false,
            protect_password: true,
            protect_url: false,
            protect_notes: false,
        }
    }
}

/// Database metadata block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub generator: String,
    pub database_name: String,
    pub database_name_changed: Option<DateTime<Utc>>,
    pub database_description: String,
    pub database_description_changed: Option<DateTime<Utc>>,
    pub default_username: String,
    pub default_username_changed: Option<DateTime<Utc>>,
    pub maintenance_history_days: u32,
    pub color: Option<String>,
    pub master_key_changed: Option<DateTime<Utc>>,
    pub master_key_change_rec: i64,
    pub master_key_change_force: i64,
    pub memory_protection: MemoryProtection,
    pub recycle_bin_enabled: bool,
    pub recycle_bin_uuid: Option<Uuid>,
    pub recycle_bin_changed: Option<DateTime<Utc>>,
    pub entry_templates_group: Option<Uuid>,
    pub entry_templates_group_changed: Option<DateTime<Utc>>,
    pub history_max_items: i32,
    pub history_max_size: i64,
    pub last_selected_group: Option<Uuid>,
    pub last_top_visible_group: Option<Uuid>,
    pub settings_changed: Option<DateTime<Utc>>,
    pub custom_icons: Vec<CustomIcon>,
    pub custom_data: CustomData,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            generator: "kdbx-core".to_string(),
            database_name: String::new(),
            database_name_changed: None,
            database_description: String::new(),
            database_description_changed: None,
            default_username: String::new(),
            default_username_changed: None,
            maintenance_history_days: 365,
            color: None,
            master_key_changed: None,
            master_key_change_rec: -1,
            master_key_change_force: -1,
            memory_protection: MemoryProtection::default(),
            recycle_bin_enabled: true,
            recycle_bin_uuid: None,
            recycle_bin_changed: None,
            entry_templates_group: None,
            entry_templates_group_changed: None,
            history_max_items: 10,
            history_max_size: 6 * 1024 * 1024,
            last_selected_group: None,
            last_top_visible_group: None,
            settings_changed: None,
            custom_icons: Vec::new(),
            custom_data: CustomData::new(),
        }
    }
}

impl Meta {
    pub fn custom_icon(&self, uuid: &Uuid) -> Option<&CustomIcon> {
        self.custom_icons.iter().find(|icon| icon.uuid == *uuid)
    }
}
