//! Pull-parser state machine for the XML body
//!
//! Every open tag pushes exactly one context frame; every close tag pops
//! one and commits the finished piece (a field, a node, a tombstone) into
//! the builders. `History` re-enters the entry context and appends the
//! resulting snapshots to the owning entry instead of the index. Unknown
//! elements parse as inert leaves, so a newer generator's extra data is
//! skipped rather than fatal. At end of stream every stack must have
//! unwound, otherwise the document is malformed.

use base64::Engine;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use xml::attribute::OwnedAttribute;
use xml::reader::{EventReader, XmlEvent};

use crate::crypto::InnerStream;
use crate::db::binary_pool::BinaryId;
use crate::db::custom_data::CustomDataItem;
use crate::db::database::{Database, DeletedObject, DuplicateIdPolicy};
use crate::db::entry::{Attachment, AutoTypeAssociation, Entry, FieldValue};
use crate::db::group::Group;
use crate::db::meta::CustomIcon;
use crate::db::protected::ProtectedString;
use crate::db::times::Times;
use crate::error::{Error, Result};
use crate::xml::timestamp;

/// Parse the decrypted XML document into the database. `binary_ids` maps
/// wire attachment indexes (inner-header order) to pool ids.
pub(crate) fn parse_document(
    xml_bytes: &[u8],
    stream: &mut InnerStream,
    db: &mut Database,
    policy: DuplicateIdPolicy,
    binary_ids: &[BinaryId],
) -> Result<()> {
    let mut parser = Parser::new(db, stream, policy, binary_ids);
    for event in EventReader::new(xml_bytes) {
        match event.map_err(|e| Error::Malformed(format!("XML: {e}")))? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => parser.open(&name.local_name, &attributes)?,
            XmlEvent::EndElement { .. } => parser.close()?,
            XmlEvent::Characters(text) | XmlEvent::CData(text) => parser.text.push_str(&text),
            _ => {}
        }
    }
    parser.finish()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    KeePassFile,
    Meta,
    MemoryProtection,
    MetaCustomIcons,
    MetaCustomIcon,
    MetaBinaries,
    MetaCustomData,
    MetaCustomDataItem,
    Root,
    Group,
    GroupTimes,
    GroupCustomData,
    GroupCustomDataItem,
    Entry,
    EntryTimes,
    EntryString,
    EntryBinary,
    EntryAutoType,
    EntryAutoTypeItem,
    EntryHistory,
    EntryCustomData,
    EntryCustomDataItem,
    DeletedObjects,
    DeletedObject,
    /// A known or unknown element that only carries text
    Leaf,
    /// Inside an unrecognized subtree; everything below is skipped
    Unknown,
}

struct Frame {
    context: Context,
    name: String,
}

#[derive(Default)]
struct CustomDataScratch {
    key: Option<String>,
    value: Option<String>,
    last_modified: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct IconScratch {
    uuid: Option<Uuid>,
    data: Option<Vec<u8>>,
    name: Option<String>,
    last_modified: Option<DateTime<Utc>>,
    failed: bool,
}

struct Parser<'a> {
    db: &'a mut Database,
    stream: &'a mut InnerStream,
    policy: DuplicateIdPolicy,
    binary_ids: &'a [BinaryId],
    /// Extra wire indexes introduced by a legacy `<Meta><Binaries>` block
    meta_binaries: Vec<(usize, BinaryId)>,

    stack: Vec<Frame>,
    text: String,
    group_stack: Vec<Group>,
    entry_stack: Vec<Entry>,
    root_seen: bool,

    // Scratch for the currently open sub-structures. Leaves never nest,
    // so one slot per shape is enough.
    string_key: Option<String>,
    string_value: Option<FieldValue>,
    value_protected: bool,
    binary_key: Option<String>,
    binary_ref: Option<usize>,
    binary_inline: Option<Vec<u8>>,
    meta_binary_id: Option<usize>,
    meta_binary_compressed: bool,
    assoc_window: Option<String>,
    assoc_sequence: Option<String>,
    custom_data: CustomDataScratch,
    icon: IconScratch,
    deleted_uuid: Option<Uuid>,
    deleted_time: Option<DateTime<Utc>>,
}

impl<'a> Parser<'a> {
    fn new(
        db: &'a mut Database,
        stream: &'a mut InnerStream,
        policy: DuplicateIdPolicy,
        binary_ids: &'a [BinaryId],
    ) -> Self {
        Self {
            db,
            stream,
            policy,
            binary_ids,
            meta_binaries: Vec::new(),
            stack: Vec::new(),
            text: String::new(),
            group_stack: Vec::new(),
            entry_stack: Vec::new(),
            root_seen: false,
            string_key: None,
            string_value: None,
            value_protected: false,
            binary_key: None,
            binary_ref: None,
            binary_inline: None,
            meta_binary_id: None,
            meta_binary_compressed: false,
            assoc_window: None,
            assoc_sequence: None,
            custom_data: CustomDataScratch::default(),
            icon: IconScratch::default(),
            deleted_uuid: None,
            deleted_time: None,
        }
    }

    fn context(&self) -> Option<Context> {
        self.stack.last().map(|frame| frame.context)
    }

    fn open(&mut self, name: &str, attributes: &[OwnedAttribute]) -> Result<()> {
        self.text.clear();
        let context = match (self.context(), name) {
            (None, "KeePassFile") => Context::KeePassFile,
            (None, other) => {
                return Err(Error::Malformed(format!(
                    "unexpected root element <{other}>"
                )))
            }

            (Some(Context::KeePassFile), "Meta") => Context::Meta,
            (Some(Context::KeePassFile), "Root") => Context::Root,

            (Some(Context::Meta), "MemoryProtection") => Context::MemoryProtection,
            (Some(Context::Meta), "CustomIcons") => Context::MetaCustomIcons,
            (Some(Context::Meta), "Binaries") => Context::MetaBinaries,
            (Some(Context::Meta), "CustomData") => Context::MetaCustomData,

            (Some(Context::MetaCustomIcons), "Icon") => {
                self.icon = IconScratch::default();
                Context::MetaCustomIcon
            }
            (Some(Context::MetaBinaries), "Binary") => {
                self.meta_binary_id = attr(attributes, "ID").and_then(|v| v.parse().ok());
                self.meta_binary_compressed = attr(attributes, "Compressed")
                    .map(is_true)
                    .unwrap_or(false);
                Context::Leaf
            }
            (Some(Context::MetaCustomData), "Item") => {
                self.custom_data = CustomDataScratch::default();
                Context::MetaCustomDataItem
            }

            (Some(Context::Root), "Group") => {
                if self.root_seen && self.group_stack.is_empty() {
                    return Err(Error::Malformed("multiple root groups".into()));
                }
                self.root_seen = true;
                self.group_stack.push(Group::new(String::new()));
                Context::Group
            }
            (Some(Context::Root), "DeletedObjects") => Context::DeletedObjects,

            (Some(Context::Group), "Group") => {
                self.group_stack.push(Group::new(String::new()));
                Context::Group
            }
            (Some(Context::Group), "Entry") => {
                self.entry_stack.push(Entry::empty());
                Context::Entry
            }
            (Some(Context::Group), "Times") => Context::GroupTimes,
            (Some(Context::Group), "CustomData") => Context::GroupCustomData,
            (Some(Context::GroupCustomData), "Item") => {
                self.custom_data = CustomDataScratch::default();
                Context::GroupCustomDataItem
            }

            (Some(Context::Entry), "Times") => Context::EntryTimes,
            (Some(Context::Entry), "String") => {
                self.string_key = None;
                self.string_value = None;
                Context::EntryString
            }
            (Some(Context::Entry), "Binary") => {
                self.binary_key = None;
                self.binary_ref = None;
                self.binary_inline = None;
                Context::EntryBinary
            }
            (Some(Context::Entry), "AutoType") => Context::EntryAutoType,
            (Some(Context::Entry), "History") => {
                if self.entry_stack.len() > 1 {
                    return Err(Error::Malformed(
                        "history inside a history snapshot".into(),
                    ));
                }
                Context::EntryHistory
            }
            (Some(Context::Entry), "CustomData") => Context::EntryCustomData,
            (Some(Context::EntryCustomData), "Item") => {
                self.custom_data = CustomDataScratch::default();
                Context::EntryCustomDataItem
            }

            (Some(Context::EntryString), "Value") => {
                self.value_protected = attr(attributes, "Protected").map(is_true).unwrap_or(false);
                Context::Leaf
            }
            (Some(Context::EntryBinary), "Value") => {
                self.binary_ref = attr(attributes, "Ref").and_then(|v| v.parse().ok());
                Context::Leaf
            }

            (Some(Context::EntryAutoType), "Association") => {
                self.assoc_window = None;
                self.assoc_sequence = None;
                Context::EntryAutoTypeItem
            }

            (Some(Context::EntryHistory), "Entry") => {
                self.entry_stack.push(Entry::empty());
                Context::Entry
            }

            (Some(Context::DeletedObjects), "DeletedObject") => {
                self.deleted_uuid = None;
                self.deleted_time = None;
                Context::DeletedObject
            }

            (Some(Context::Leaf | Context::Unknown), _) => Context::Unknown,
            // Anything else is a text leaf of the enclosing context
            (Some(_), _) => Context::Leaf,
        };
        self.stack.push(Frame {
            context,
            name: name.to_string(),
        });
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let frame = self
            .stack
            .pop()
            .ok_or_else(|| Error::Malformed("unbalanced close tag".into()))?;
        let text = std::mem::take(&mut self.text);

        match frame.context {
            Context::Leaf => self.commit_leaf(&frame.name, text)?,
            Context::Group => self.close_group()?,
            Context::Entry => self.close_entry()?,
            Context::EntryString => {
                let key = self.string_key.take().ok_or_else(|| {
                    Error::Malformed("entry string without a key".into())
                })?;
                let value = self
                    .string_value
                    .take()
                    .unwrap_or(FieldValue::Plain(String::new()));
                self.current_entry()?.set_field(key, value);
            }
            Context::EntryBinary => self.close_entry_binary()?,
            Context::EntryAutoTypeItem => {
                let association = AutoTypeAssociation {
                    window: self.assoc_window.take().unwrap_or_default(),
                    sequence: self.assoc_sequence.take().unwrap_or_default(),
                };
                self.current_entry()?.auto_type.associations.push(association);
            }
            Context::MetaCustomIcon => self.close_custom_icon(),
            Context::MetaCustomDataItem => {
                if let Some((key, item)) = self.take_custom_data_item() {
                    self.db.meta.custom_data.set_item(key, item);
                }
            }
            Context::GroupCustomDataItem => {
                if let Some((key, item)) = self.take_custom_data_item() {
                    self.current_group()?.custom_data.set_item(key, item);
                }
            }
            Context::EntryCustomDataItem => {
                if let Some((key, item)) = self.take_custom_data_item() {
                    self.current_entry()?.custom_data.set_item(key, item);
                }
            }
            Context::DeletedObject => {
                let uuid = self
                    .deleted_uuid
                    .take()
                    .ok_or_else(|| Error::Malformed("deleted object without uuid".into()))?;
                let deletion_time = self
                    .deleted_time
                    .take()
                    .ok_or_else(|| Error::Malformed("deleted object without time".into()))?;
                self.db.deleted_objects.push(DeletedObject {
                    uuid,
                    deletion_time,
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        if !self.stack.is_empty() || !self.group_stack.is_empty() || !self.entry_stack.is_empty() {
            return Err(Error::Malformed(
                "document ended with unclosed contexts".into(),
            ));
        }
        if !self.root_seen || self.db.root_uuid().is_nil() {
            return Err(Error::Malformed("document has no root group".into()));
        }
        Ok(())
    }

    // --- node commits ------------------------------------------------

    fn close_group(&mut self) -> Result<()> {
        let group = self
            .group_stack
            .pop()
            .ok_or_else(|| Error::Malformed("unbalanced group context".into()))?;
        let final_uuid = self.db.index_group(group, self.policy)?;

        // Children were indexed before their parent finished; point them
        // at the final uuid (which may be renumbered).
        let (child_groups, child_entries) = {
            let group = self
                .db
                .group(&final_uuid)
                .expect("group was just indexed");
            (group.groups.clone(), group.entries.clone())
        };
        for child in child_groups {
            if let Some(child) = self.db.group_mut(&child) {
                child.parent = Some(final_uuid);
            }
        }
        for child in child_entries {
            if let Some(child) = self.db.entry_mut(&child) {
                child.parent = Some(final_uuid);
            }
        }

        if let Some(parent) = self.group_stack.last_mut() {
            parent.groups.push(final_uuid);
        } else {
            self.db.set_root(final_uuid);
        }
        Ok(())
    }

    fn close_entry(&mut self) -> Result<()> {
        let entry = self
            .entry_stack
            .pop()
            .ok_or_else(|| Error::Malformed("unbalanced entry context".into()))?;

        // After popping, a History context on top means this entry was a
        // snapshot of the one still on the stack.
        if self.context() == Some(Context::EntryHistory) {
            self.current_entry()?.history.push(entry);
            return Ok(());
        }

        let final_uuid = self.db.index_entry(entry, self.policy)?;
        self.group_stack
            .last_mut()
            .ok_or_else(|| Error::Malformed("entry outside any group".into()))?
            .entries
            .push(final_uuid);
        Ok(())
    }

    fn close_entry_binary(&mut self) -> Result<()> {
        let key = self.binary_key.take().unwrap_or_default();
        let binary = if let Some(wire_index) = self.binary_ref.take() {
            self.resolve_binary_ref(wire_index)?
        } else if let Some(data) = self.binary_inline.take() {
            self.db.binaries.put(&data, false)?
        } else {
            return Err(Error::Malformed(format!(
                "attachment {key:?} has neither a reference nor inline data"
            )));
        };
        self.current_entry()?.binaries.push(Attachment { key, binary });
        Ok(())
    }

    fn resolve_binary_ref(&self, wire_index: usize) -> Result<BinaryId> {
        if let Some(id) = self.binary_ids.get(wire_index) {
            return Ok(*id);
        }
        self.meta_binaries
            .iter()
            .find(|(index, _)| *index == wire_index)
            .map(|(_, id)| *id)
            .ok_or_else(|| {
                Error::Malformed(format!("unresolved attachment reference {wire_index}"))
            })
    }

    fn close_custom_icon(&mut self) {
        // Icons are best-effort: a bad one degrades to "absent" instead of
        // failing the open.
        if self.icon.failed {
            tracing::warn!("skipping custom icon that failed to decode");
            return;
        }
        let (Some(uuid), Some(data)) = (self.icon.uuid.take(), self.icon.data.take()) else {
            tracing::warn!("skipping incomplete custom icon");
            return;
        };
        match self.db.binaries.put(&data, false) {
            Ok(id) => self.db.meta.custom_icons.push(CustomIcon {
                uuid,
                data: id,
                name: self.icon.name.take(),
                last_modified: self.icon.last_modified.take(),
            }),
            Err(err) => tracing::warn!("failed to store custom icon payload: {err}"),
        }
    }

    fn take_custom_data_item(&mut self) -> Option<(String, CustomDataItem)> {
        let key = self.custom_data.key.take()?;
        Some((
            key,
            CustomDataItem {
                value: self.custom_data.value.take().unwrap_or_default(),
                last_modified: self.custom_data.last_modified.take(),
            },
        ))
    }

    // --- leaves ------------------------------------------------------

    fn commit_leaf(&mut self, name: &str, text: String) -> Result<()> {
        let Some(parent) = self.context() else {
            return Ok(());
        };
        match parent {
            Context::Meta => self.meta_leaf(name, text)?,
            Context::MemoryProtection => {
                let mp = &mut self.db.meta.memory_protection;
                match name {
                    "ProtectTitle" => mp.protect_title = is_true(&text),
                    "ProtectUserName" => mp.protect_username = is_true(&text),
                    "ProtectPassword" => mp.protect_password = is_true(&text),
                    "ProtectURL" => mp.protect_url = is_true(&text),
                    "ProtectNotes" => mp.protect_notes = is_true(&text),
                    _ => {}
                }
            }
            Context::MetaCustomIcon => match name {
                "UUID" => match decode_uuid(&text) {
                    Ok(uuid) => self.icon.uuid = Some(uuid),
                    Err(_) => self.icon.failed = true,
                },
                "Data" => {
                    match base64::engine::general_purpose::STANDARD.decode(text.trim()) {
                        Ok(data) => self.icon.data = Some(data),
                        Err(_) => self.icon.failed = true,
                    }
                }
                "Name" => self.icon.name = Some(text),
                "LastModificationTime" => {
                    self.icon.last_modified = timestamp::decode(&text).ok();
                }
                _ => {}
            },
            Context::MetaBinaries if name == "Binary" => {
                let Some(wire_index) = self.meta_binary_id.take() else {
                    return Err(Error::Malformed("metadata binary without ID".into()));
                };
                let data = base64::engine::general_purpose::STANDARD
                    .decode(text.trim())
                    .map_err(|_| Error::Malformed("metadata binary is not base64".into()))?;
                let id = if self.meta_binary_compressed {
                    self.db.binaries.put_compressed(&data, false)?
                } else {
                    self.db.binaries.put(&data, false)?
                };
                self.meta_binaries.push((wire_index, id));
            }
            Context::MetaCustomDataItem
            | Context::GroupCustomDataItem
            | Context::EntryCustomDataItem => match name {
                "Key" => self.custom_data.key = Some(text),
                "Value" => self.custom_data.value = Some(text),
                "LastModificationTime" => {
                    self.custom_data.last_modified = Some(timestamp::decode(&text)?);
                }
                _ => {}
            },
            Context::Group => self.group_leaf(name, text)?,
            Context::GroupTimes => {
                set_times(&mut self.current_group()?.times, name, &text)?;
            }
            Context::Entry => self.entry_leaf(name, text)?,
            Context::EntryTimes => {
                set_times(&mut self.current_entry()?.times, name, &text)?;
            }
            Context::EntryString => match name {
                "Key" => self.string_key = Some(text),
                "Value" => {
                    self.string_value = Some(if self.value_protected {
                        let plaintext = self.stream.decrypt_base64(text.trim())?;
                        let plaintext = String::from_utf8(plaintext).map_err(|_| {
                            Error::Malformed("protected value is not UTF-8".into())
                        })?;
                        FieldValue::Protected(ProtectedString::new(plaintext))
                    } else {
                        FieldValue::Plain(text)
                    });
                    self.value_protected = false;
                }
                _ => {}
            },
            Context::EntryBinary => match name {
                "Key" => self.binary_key = Some(text),
                "Value" => {
                    if self.binary_ref.is_none() && !text.trim().is_empty() {
                        let data = base64::engine::general_purpose::STANDARD
                            .decode(text.trim())
                            .map_err(|_| {
                                Error::Malformed("inline attachment is not base64".into())
                            })?;
                        self.binary_inline = Some(data);
                    }
                }
                _ => {}
            },
            Context::EntryAutoType => {
                let auto_type = &mut self.current_entry()?.auto_type;
                match name {
                    "Enabled" => auto_type.enabled = is_true(&text),
                    "DataTransferObfuscation" => {
                        auto_type.obfuscation = text.trim().parse().unwrap_or(0);
                    }
                    "DefaultSequence" => auto_type.default_sequence = text,
                    _ => {}
                }
            }
            Context::EntryAutoTypeItem => match name {
                "Window" => self.assoc_window = Some(text),
                "KeystrokeSequence" => self.assoc_sequence = Some(text),
                _ => {}
            },
            Context::DeletedObject => match name {
                "UUID" => self.deleted_uuid = Some(decode_uuid(&text)?),
                "DeletionTime" => self.deleted_time = Some(timestamp::decode(&text)?),
                _ => {}
            },
            _ => {}
        }
        Ok(())
    }

    fn meta_leaf(&mut self, name: &str, text: String) -> Result<()> {
        let meta = &mut self.db.meta;
        match name {
            "Generator" => meta.generator = text,
            "DatabaseName" => meta.database_name = text,
            "DatabaseNameChanged" => meta.database_name_changed = Some(timestamp::decode(&text)?),
            "DatabaseDescription" => meta.database_description = text,
            "DatabaseDescriptionChanged" => {
                meta.database_description_changed = Some(timestamp::decode(&text)?)
            }
            "DefaultUserName" => meta.default_username = text,
            "DefaultUserNameChanged" => {
                meta.default_username_changed = Some(timestamp::decode(&text)?)
            }
            "MaintenanceHistoryDays" => {
                meta.maintenance_history_days = text.trim().parse().unwrap_or(365)
            }
            "Color" => meta.color = non_empty(text),
            "MasterKeyChanged" => meta.master_key_changed = Some(timestamp::decode(&text)?),
            "MasterKeyChangeRec" => {
                meta.master_key_change_rec = text.trim().parse().unwrap_or(-1)
            }
            "MasterKeyChangeForce" => {
                meta.master_key_change_force = text.trim().parse().unwrap_or(-1)
            }
            "RecycleBinEnabled" => meta.recycle_bin_enabled = is_true(&text),
            "RecycleBinUUID" => meta.recycle_bin_uuid = decode_optional_uuid(&text)?,
            "RecycleBinChanged" => meta.recycle_bin_changed = Some(timestamp::decode(&text)?),
            "EntryTemplatesGroup" => meta.entry_templates_group = decode_optional_uuid(&text)?,
            "EntryTemplatesGroupChanged" => {
                meta.entry_templates_group_changed = Some(timestamp::decode(&text)?)
            }
            "HistoryMaxItems" => meta.history_max_items = text.trim().parse().unwrap_or(10),
            "HistoryMaxSize" => {
                meta.history_max_size = text.trim().parse().unwrap_or(6 * 1024 * 1024)
            }
            "LastSelectedGroup" => meta.last_selected_group = decode_optional_uuid(&text)?,
            "LastTopVisibleGroup" => meta.last_top_visible_group = decode_optional_uuid(&text)?,
            "SettingsChanged" => meta.settings_changed = Some(timestamp::decode(&text)?),
            _ => {}
        }
        Ok(())
    }

    fn group_leaf(&mut self, name: &str, text: String) -> Result<()> {
        let group = self.current_group()?;
        match name {
            "UUID" => group.uuid = decode_uuid(&text)?,
            "Name" => group.name = text,
            "Notes" => group.notes = text,
            "IconID" => group.icon_id = text.trim().parse().unwrap_or(48),
            "CustomIconUUID" => group.custom_icon = decode_optional_uuid(&text)?,
            "IsExpanded" => group.is_expanded = is_true(&text),
            "DefaultAutoTypeSequence" => group.default_autotype_sequence = text,
            "EnableAutoType" => group.enable_auto_type = tri_state(&text),
            "EnableSearching" => group.enable_searching = tri_state(&text),
            "LastTopVisibleEntry" => {
                group.last_top_visible_entry = decode_optional_uuid(&text)?
            }
            "Tags" => group.tags = parse_tags(&text),
            _ => {}
        }
        Ok(())
    }

    fn entry_leaf(&mut self, name: &str, text: String) -> Result<()> {
        let entry = self.current_entry()?;
        match name {
            "UUID" => entry.uuid = decode_uuid(&text)?,
            "IconID" => entry.icon_id = text.trim().parse().unwrap_or(0),
            "CustomIconUUID" => entry.custom_icon = decode_optional_uuid(&text)?,
            "ForegroundColor" => entry.foreground_color = non_empty(text),
            "BackgroundColor" => entry.background_color = non_empty(text),
            "OverrideURL" => entry.override_url = text,
            "QualityCheck" => entry.quality_check = is_true(&text),
            "Tags" => entry.tags = parse_tags(&text),
            _ => {}
        }
        Ok(())
    }

    fn current_group(&mut self) -> Result<&mut Group> {
        self.group_stack
            .last_mut()
            .ok_or_else(|| Error::Malformed("group data outside any group".into()))
    }

    fn current_entry(&mut self) -> Result<&mut Entry> {
        self.entry_stack
            .last_mut()
            .ok_or_else(|| Error::Malformed("entry data outside any entry".into()))
    }
}

fn attr<'a>(attributes: &'a [OwnedAttribute], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|a| a.name.local_name == name)
        .map(|a| a.value.as_str())
}

fn is_true(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("true") || text.trim() == "1"
}

fn tri_state(text: &str) -> Option<bool> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("null") || text.is_empty() {
        None
    } else {
        Some(is_true(text))
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn parse_tags(text: &str) -> Vec<String> {
    let separator = if text.contains(';') { ';' } else { ',' };
    text.split(separator)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn decode_uuid(text: &str) -> Result<Uuid> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .map_err(|_| Error::Malformed(format!("invalid uuid {text:?}")))?;
    let raw: [u8; 16] = raw
        .try_into()
        .map_err(|_| Error::Malformed(format!("invalid uuid {text:?}")))?;
    Ok(Uuid::from_bytes(raw))
}

fn decode_optional_uuid(text: &str) -> Result<Option<Uuid>> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    let uuid = decode_uuid(text)?;
    Ok(if uuid.is_nil() { None } else { Some(uuid) })
}

fn set_times(times: &mut Times, name: &str, text: &str) -> Result<()> {
    match name {
        "CreationTime" => times.creation = timestamp::decode(text)?,
        "LastModificationTime" => times.last_modification = timestamp::decode(text)?,
        "LastAccessTime" => times.last_access = timestamp::decode(text)?,
        "ExpiryTime" => times.expiry = timestamp::decode(text)?,
        "Expires" => times.expires = is_true(text),
        "UsageCount" => times.usage_count = text.trim().parse().unwrap_or(0),
        "LocationChanged" => times.location_changed = timestamp::decode(text)?,
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::inner_stream::INNER_STREAM_CHACHA20;
    use crate::db::database::Settings;

    const STREAM_KEY: [u8; 64] = [0x42; 64];

    fn parse(xml: &str, policy: DuplicateIdPolicy) -> Result<Database> {
        let mut db = Database::bare(Settings::default_kdbx());
        let mut stream = InnerStream::new(INNER_STREAM_CHACHA20, &STREAM_KEY)?;
        parse_document(xml.as_bytes(), &mut stream, &mut db, policy, &[])?;
        Ok(db)
    }

    fn uuid_b64(byte: u8) -> String {
        base64::engine::general_purpose::STANDARD.encode([byte; 16])
    }

    #[test]
    fn test_minimal_document() {
        let xml = format!(
            "<KeePassFile><Meta><DatabaseName>demo</DatabaseName></Meta><Root>\
             <Group><UUID>{root}</UUID><Name>Root</Name>\
               <Entry><UUID>{e1}</UUID>\
                 <String><Key>Title</Key><Value>hello</Value></String>\
               </Entry>\
               <Group><UUID>{child}</UUID><Name>Work</Name></Group>\
             </Group>\
             <DeletedObjects><DeletedObject><UUID>{tomb}</UUID>\
               <DeletionTime>2024-01-02T03:04:05Z</DeletionTime>\
             </DeletedObject></DeletedObjects>\
             </Root></KeePassFile>",
            root = uuid_b64(1),
            e1 = uuid_b64(2),
            child = uuid_b64(3),
            tomb = uuid_b64(4),
        );
        let db = parse(&xml, DuplicateIdPolicy::Reject).unwrap();

        assert_eq!(db.meta.database_name, "demo");
        let root = db.root_group();
        assert_eq!(root.name, "Root");
        assert_eq!(root.entries.len(), 1);
        assert_eq!(root.groups.len(), 1);

        let entry = db.entry(&Uuid::from_bytes([2; 16])).unwrap();
        assert_eq!(entry.title(), Some("hello"));
        assert_eq!(entry.parent, Some(db.root_uuid()));

        let child = db.group(&Uuid::from_bytes([3; 16])).unwrap();
        assert_eq!(child.parent, Some(db.root_uuid()));

        assert_eq!(db.deleted_objects.len(), 1);
        assert_eq!(db.deleted_objects[0].uuid, Uuid::from_bytes([4; 16]));
    }

    #[test]
    fn test_history_entries_are_not_indexed() {
        let xml = format!(
            "<KeePassFile><Root><Group><UUID>{root}</UUID><Name>r</Name>\
             <Entry><UUID>{e}</UUID>\
               <String><Key>Title</Key><Value>current</Value></String>\
               <History>\
                 <Entry><UUID>{e}</UUID>\
                   <String><Key>Title</Key><Value>old</Value></String>\
                 </Entry>\
               </History>\
             </Entry></Group></Root></KeePassFile>",
            root = uuid_b64(1),
            e = uuid_b64(2),
        );
        let db = parse(&xml, DuplicateIdPolicy::Reject).unwrap();

        // One indexed entry despite the snapshot reusing the same uuid
        assert_eq!(db.entries().count(), 1);
        let entry = db.entry(&Uuid::from_bytes([2; 16])).unwrap();
        assert_eq!(entry.title(), Some("current"));
        assert_eq!(entry.history.len(), 1);
        assert_eq!(entry.history[0].title(), Some("old"));
    }

    #[test]
    fn test_protected_value_decrypted_in_document_order() {
        let mut enc = InnerStream::new(INNER_STREAM_CHACHA20, &STREAM_KEY).unwrap();
        let first = enc.encrypt_to_base64(b"alpha");
        let second = enc.encrypt_to_base64(b"beta");
        let xml = format!(
            "<KeePassFile><Root><Group><UUID>{root}</UUID><Name>r</Name>\
             <Entry><UUID>{e1}</UUID>\
               <String><Key>Password</Key><Value Protected=\"True\">{first}</Value></String>\
             </Entry>\
             <Entry><UUID>{e2}</UUID>\
               <String><Key>Password</Key><Value Protected=\"True\">{second}</Value></String>\
             </Entry></Group></Root></KeePassFile>",
            root = uuid_b64(1),
            e1 = uuid_b64(2),
            e2 = uuid_b64(3),
        );
        let db = parse(&xml, DuplicateIdPolicy::Reject).unwrap();
        let e1 = db.entry(&Uuid::from_bytes([2; 16])).unwrap();
        let e2 = db.entry(&Uuid::from_bytes([3; 16])).unwrap();
        assert_eq!(e1.password(), Some("alpha"));
        assert_eq!(e2.password(), Some("beta"));
        assert!(e1
            .field_value("Password")
            .is_some_and(FieldValue::is_protected));
    }

    #[test]
    fn test_duplicate_uuid_policies() {
        let xml = format!(
            "<KeePassFile><Root><Group><UUID>{root}</UUID><Name>r</Name>\
             <Entry><UUID>{e}</UUID></Entry>\
             <Entry><UUID>{e}</UUID></Entry>\
             </Group></Root></KeePassFile>",
            root = uuid_b64(1),
            e = uuid_b64(2),
        );

        let err = parse(&xml, DuplicateIdPolicy::Reject).unwrap_err();
        assert!(matches!(err, Error::DuplicateId(_)));

        let db = parse(&xml, DuplicateIdPolicy::Renumber).unwrap();
        assert_eq!(db.entries().count(), 2);
        // Both entries keep their position under the root group
        assert_eq!(db.root_group().entries.len(), 2);
        assert_eq!(db.root_group().entries[0], Uuid::from_bytes([2; 16]));
        assert_ne!(db.root_group().entries[1], Uuid::from_bytes([2; 16]));
    }

    #[test]
    fn test_unknown_elements_are_skipped() {
        let xml = format!(
            "<KeePassFile><Meta><SomePluginBlock><Nested><Deep>x</Deep></Nested></SomePluginBlock></Meta>\
             <Root><Group><UUID>{root}</UUID><Name>r</Name>\
             <Entry><UUID>{e}</UUID><FutureFeature>y</FutureFeature></Entry>\
             </Group></Root></KeePassFile>",
            root = uuid_b64(1),
            e = uuid_b64(2),
        );
        let db = parse(&xml, DuplicateIdPolicy::Reject).unwrap();
        assert_eq!(db.entries().count(), 1);
    }

    #[test]
    fn test_truncated_document_is_malformed() {
        let xml = format!(
            "<KeePassFile><Root><Group><UUID>{root}</UUID><Name>r</Name>",
            root = uuid_b64(1),
        );
        assert!(matches!(
            parse(&xml, DuplicateIdPolicy::Reject),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_root_group_is_malformed() {
        let xml = "<KeePassFile><Root><DeletedObjects></DeletedObjects></Root></KeePassFile>";
        assert!(matches!(
            parse(xml, DuplicateIdPolicy::Reject),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_wrong_root_element() {
        assert!(matches!(
            parse("<NotKeePass/>", DuplicateIdPolicy::Reject),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_unresolved_binary_ref_is_malformed() {
        let xml = format!(
            "<KeePassFile><Root><Group><UUID>{root}</UUID><Name>r</Name>\
             <Entry><UUID>{e}</UUID>\
               <Binary><Key>a.txt</Key><Value Ref=\"5\"/></Binary>\
             </Entry></Group></Root></KeePassFile>",
            root = uuid_b64(1),
            e = uuid_b64(2),
        );
        assert!(matches!(
            parse(&xml, DuplicateIdPolicy::Reject),
            Err(Error::Malformed(_))
        ));
    }
}
