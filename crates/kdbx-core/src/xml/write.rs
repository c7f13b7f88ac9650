//! Event writer for the XML body
//!
//! The structural inverse of [`super::parse`]: the tree is emitted in the
//! fixed element order the format defines, with protected values freshly
//! encrypted through the inner random stream in document order.

use std::collections::HashMap;

use base64::Engine;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use xml::writer::{EmitterConfig, EventWriter, XmlEvent};

use crate::crypto::InnerStream;
use crate::db::binary_pool::BinaryId;
use crate::db::custom_data::CustomData;
use crate::db::database::Database;
use crate::db::entry::{Entry, FieldValue, FIELD_NOTES, FIELD_PASSWORD, FIELD_TITLE, FIELD_URL, FIELD_USERNAME};
use crate::db::times::Times;
use crate::error::{Error, Result};
use crate::xml::timestamp;

/// Serialize the tree into XML body bytes. `binary_index` maps pool ids
/// to the wire indexes used by the inner header.
pub(crate) fn write_document(
    db: &Database,
    stream: &mut InnerStream,
    binary_index: &HashMap<BinaryId, usize>,
) -> Result<Vec<u8>> {
    let mut sink = Vec::new();
    let mut writer = Writer {
        inner: EmitterConfig::new()
            .perform_indent(false)
            .write_document_declaration(true)
            .create_writer(&mut sink),
        stream,
        binary_index,
    };

    writer.start("KeePassFile")?;
    writer.write_meta(db)?;
    writer.start("Root")?;
    writer.write_group(db, db.root_uuid())?;
    writer.start("DeletedObjects")?;
    for deleted in &db.deleted_objects {
        writer.start("DeletedObject")?;
        writer.elem("UUID", &encode_uuid(Some(deleted.uuid)))?;
        writer.elem("DeletionTime", &timestamp::encode(deleted.deletion_time))?;
        writer.end()?; // DeletedObject
    }
    writer.end()?; // DeletedObjects
    writer.end()?; // Root
    writer.end()?; // KeePassFile

    Ok(sink)
}

struct Writer<'a, W: std::io::Write> {
    inner: EventWriter<W>,
    stream: &'a mut InnerStream,
    binary_index: &'a HashMap<BinaryId, usize>,
}

fn wio(err: xml::writer::Error) -> Error {
    Error::Io(std::io::Error::other(err.to_string()))
}

impl<W: std::io::Write> Writer<'_, W> {
    fn start(&mut self, name: &str) -> Result<()> {
        self.inner
            .write(XmlEvent::start_element(name))
            .map_err(wio)
    }

    fn end(&mut self) -> Result<()> {
        self.inner.write(XmlEvent::end_element()).map_err(wio)
    }

    fn elem(&mut self, name: &str, text: &str) -> Result<()> {
        self.start(name)?;
        if !text.is_empty() {
            self.inner.write(XmlEvent::characters(text)).map_err(wio)?;
        }
        self.end()
    }

    fn elem_time(&mut self, name: &str, time: Option<DateTime<Utc>>) -> Result<()> {
        match time {
            Some(time) => self.elem(name, &timestamp::encode(time)),
            None => Ok(()),
        }
    }

    fn write_meta(&mut self, db: &Database) -> Result<()> {
        let meta = &db.meta;
        self.start("Meta")?;
        self.elem("Generator", &meta.generator)?;
        self.elem("DatabaseName", &meta.database_name)?;
        self.elem_time("DatabaseNameChanged", meta.database_name_changed)?;
        self.elem("DatabaseDescription", &meta.database_description)?;
        self.elem_time("DatabaseDescriptionChanged", meta.database_description_changed)?;
        self.elem("DefaultUserName", &meta.default_username)?;
        self.elem_time("DefaultUserNameChanged", meta.default_username_changed)?;
        self.elem(
            "MaintenanceHistoryDays",
            &meta.maintenance_history_days.to_string(),
        )?;
        self.elem("Color", meta.color.as_deref().unwrap_or(""))?;
        self.elem_time("MasterKeyChanged", meta.master_key_changed)?;
        self.elem("MasterKeyChangeRec", &meta.master_key_change_rec.to_string())?;
        self.elem(
            "MasterKeyChangeForce",
            &meta.master_key_change_force.to_string(),
        )?;

        self.start("MemoryProtection")?;
        let mp = &meta.memory_protection;
        self.elem("ProtectTitle", bool_str(mp.protect_title))?;
        self.elem("ProtectUserName", bool_str(mp.protect_username))?;
        self.elem("ProtectPassword", bool_str(mp.protect_password))?;
        self.elem("ProtectURL", bool_str(mp.protect_url))?;
        self.elem("ProtectNotes", bool_str(mp.protect_notes))?;
        self.end()?;

        if !meta.custom_icons.is_empty() {
            self.start("CustomIcons")?;
            for icon in &meta.custom_icons {
                self.start("Icon")?;
                self.elem("UUID", &encode_uuid(Some(icon.uuid)))?;
                let data = db.binaries.get(icon.data)?;
                self.elem(
                    "Data",
                    &base64::engine::general_purpose::STANDARD.encode(data),
                )?;
                if let Some(name) = &icon.name {
                    self.elem("Name", name)?;
                }
                self.elem_time("LastModificationTime", icon.last_modified)?;
                self.end()?; // Icon
            }
            self.end()?; // CustomIcons
        }

        self.elem("RecycleBinEnabled", bool_str(meta.recycle_bin_enabled))?;
        self.elem("RecycleBinUUID", &encode_uuid(meta.recycle_bin_uuid))?;
        self.elem_time("RecycleBinChanged", meta.recycle_bin_changed)?;
        self.elem(
            "EntryTemplatesGroup",
            &encode_uuid(meta.entry_templates_group),
        )?;
        self.elem_time(
            "EntryTemplatesGroupChanged",
            meta.entry_templates_group_changed,
        )?;
        self.elem("HistoryMaxItems", &meta.history_max_items.to_string())?;
        self.elem("HistoryMaxSize", &meta.history_max_size.to_string())?;
        self.elem("LastSelectedGroup", &encode_uuid(meta.last_selected_group))?;
        self.elem(
            "LastTopVisibleGroup",
            &encode_uuid(meta.last_top_visible_group),
        )?;
        self.elem_time("SettingsChanged", meta.settings_changed)?;
        self.write_custom_data(&meta.custom_data)?;
        self.end() // Meta
    }

    fn write_custom_data(&mut self, data: &CustomData) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.start("CustomData")?;
        for (key, item) in data.iter() {
            self.start("Item")?;
            self.elem("Key", key)?;
            self.elem("Value", &item.value)?;
            self.elem_time("LastModificationTime", item.last_modified)?;
            self.end()?;
        }
        self.end()
    }

    fn write_group(&mut self, db: &Database, uuid: Uuid) -> Result<()> {
        let group = db
            .group(&uuid)
            .ok_or_else(|| Error::Malformed(format!("dangling group reference {uuid}")))?;

        self.start("Group")?;
        self.elem("UUID", &encode_uuid(Some(group.uuid)))?;
        self.elem("Name", &group.name)?;
        self.elem("Notes", &group.notes)?;
        self.elem("IconID", &group.icon_id.to_string())?;
        if group.custom_icon.is_some() {
            self.elem("CustomIconUUID", &encode_uuid(group.custom_icon))?;
        }
        self.write_times(&group.times)?;
        self.elem("IsExpanded", bool_str(group.is_expanded))?;
        self.elem("DefaultAutoTypeSequence", &group.default_autotype_sequence)?;
        self.elem("EnableAutoType", tri_state_str(group.enable_auto_type))?;
        self.elem("EnableSearching", tri_state_str(group.enable_searching))?;
        self.elem(
            "LastTopVisibleEntry",
            &encode_uuid(group.last_top_visible_entry),
        )?;
        if !group.tags.is_empty() {
            self.elem("Tags", &group.tags.join(";"))?;
        }
        self.write_custom_data(&group.custom_data)?;

        for entry_uuid in &group.entries {
            let entry = db.entry(entry_uuid).ok_or_else(|| {
                Error::Malformed(format!("dangling entry reference {entry_uuid}"))
            })?;
            self.write_entry(entry, true)?;
        }
        for child_uuid in &group.groups {
            self.write_group(db, *child_uuid)?;
        }

        self.end() // Group
    }

    fn write_entry(&mut self, entry: &Entry, with_history: bool) -> Result<()> {
        self.start("Entry")?;
        self.elem("UUID", &encode_uuid(Some(entry.uuid)))?;
        self.elem("IconID", &entry.icon_id.to_string())?;
        if entry.custom_icon.is_some() {
            self.elem("CustomIconUUID", &encode_uuid(entry.custom_icon))?;
        }
        self.elem(
            "ForegroundColor",
            entry.foreground_color.as_deref().unwrap_or(""),
        )?;
        self.elem(
            "BackgroundColor",
            entry.background_color.as_deref().unwrap_or(""),
        )?;
        self.elem("OverrideURL", &entry.override_url)?;
        if !entry.quality_check {
            self.elem("QualityCheck", "False")?;
        }
        self.elem("Tags", &entry.tags.join(";"))?;
        self.write_times(&entry.times)?;

        for (key, value) in ordered_fields(entry) {
            self.start("String")?;
            self.elem("Key", key)?;
            match value {
                FieldValue::Plain(text) => self.elem("Value", text)?,
                FieldValue::Protected(secret) => {
                    let ciphertext = self.stream.encrypt_to_base64(secret.expose().as_bytes());
                    self.inner
                        .write(XmlEvent::start_element("Value").attr("Protected", "True"))
                        .map_err(wio)?;
                    if !ciphertext.is_empty() {
                        self.inner
                            .write(XmlEvent::characters(&ciphertext))
                            .map_err(wio)?;
                    }
                    self.end()?;
                }
            }
            self.end()?; // String
        }

        for attachment in &entry.binaries {
            let wire_index = self.binary_index.get(&attachment.binary).ok_or_else(|| {
                Error::Malformed(format!(
                    "attachment references unknown binary {}",
                    attachment.binary
                ))
            })?;
            self.start("Binary")?;
            self.elem("Key", &attachment.key)?;
            self.inner
                .write(XmlEvent::start_element("Value").attr("Ref", &wire_index.to_string()))
                .map_err(wio)?;
            self.end()?; // Value
            self.end()?; // Binary
        }

        self.start("AutoType")?;
        self.elem("Enabled", bool_str(entry.auto_type.enabled))?;
        self.elem(
            "DataTransferObfuscation",
            &entry.auto_type.obfuscation.to_string(),
        )?;
        self.elem("DefaultSequence", &entry.auto_type.default_sequence)?;
        for association in &entry.auto_type.associations {
            self.start("Association")?;
            self.elem("Window", &association.window)?;
            self.elem("KeystrokeSequence", &association.sequence)?;
            self.end()?;
        }
        self.end()?; // AutoType

        self.write_custom_data(&entry.custom_data)?;

        if with_history {
            self.start("History")?;
            for snapshot in &entry.history {
                self.write_entry(snapshot, false)?;
            }
            self.end()?; // History
        }

        self.end() // Entry
    }

    fn write_times(&mut self, times: &Times) -> Result<()> {
        self.start("Times")?;
        self.elem("CreationTime", &timestamp::encode(times.creation))?;
        self.elem(
            "LastModificationTime",
            &timestamp::encode(times.last_modification),
        )?;
        self.elem("LastAccessTime", &timestamp::encode(times.last_access))?;
        self.elem("ExpiryTime", &timestamp::encode(times.expiry))?;
        self.elem("Expires", bool_str(times.expires))?;
        self.elem("UsageCount", &times.usage_count.to_string())?;
        self.elem("LocationChanged", &timestamp::encode(times.location_changed))?;
        self.end()
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn tri_state_str(value: Option<bool>) -> &'static str {
    match value {
        None => "null",
        Some(true) => "True",
        Some(false) => "False",
    }
}

fn encode_uuid(uuid: Option<Uuid>) -> String {
    let bytes = uuid.unwrap_or(Uuid::nil()).into_bytes();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Fields in a stable order: the well-known ones first, the rest sorted
fn ordered_fields(entry: &Entry) -> Vec<(&str, &FieldValue)> {
    const WELL_KNOWN: [&str; 5] = [
        FIELD_TITLE,
        FIELD_USERNAME,
        FIELD_PASSWORD,
        FIELD_URL,
        FIELD_NOTES,
    ];
    let mut out: Vec<(&str, &FieldValue)> = Vec::new();
    for key in WELL_KNOWN {
        if let Some(value) = entry.field_value(key) {
            out.push((key, value));
        }
    }
    let mut rest: Vec<(&str, &FieldValue)> = entry
        .fields()
        .filter(|(key, _)| !WELL_KNOWN.contains(key))
        .collect();
    rest.sort_by_key(|(key, _)| *key);
    out.extend(rest);
    out
}
