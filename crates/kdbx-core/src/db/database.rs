//! Database operations and indexes
//!
//! The database is an explicitly owned value: opening produces one,
//! closing consumes it. All lookups go through Uuid indexes; groups and
//! entries reference each other by id only.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{CipherId, KdfParams};
use crate::db::binary_pool::{BinaryId, BinaryPool};
use crate::db::entry::Entry;
use crate::db::group::Group;
use crate::db::meta::Meta;
use crate::db::times::truncate_to_seconds;
use crate::error::{Error, Result};
use crate::format;
use crate::format::variant_dict::VariantDict;
use crate::keys::CompositeKey;

/// Which container family the database is persisted as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileVersion {
    /// Legacy fixed-header binary format
    Kdb,
    /// KDBX 4.x
    Kdbx { minor: u16 },
}

/// Persistence settings carried between open and save
#[derive(Debug, Clone)]
pub struct Settings {
    pub version: FileVersion,
    pub cipher: CipherId,
    /// Gzip the body (KDBX only; the legacy format has no body
    /// compression)
    pub compression: bool,
    pub kdf: KdfParams,
    /// Unencrypted plugin data from the outer header, preserved verbatim
    pub public_custom_data: Option<VariantDict>,
}

impl Settings {
    pub fn default_kdbx() -> Self {
        Self {
            version: FileVersion::Kdbx { minor: 1 },
            cipher: CipherId::Aes256,
            compression: true,
            kdf: KdfParams::default_argon2(),
            public_custom_data: None,
        }
    }

    pub fn default_kdb() -> Self {
        Self {
            version: FileVersion::Kdb,
            cipher: CipherId::Aes256,
            compression: false,
            kdf: KdfParams::default_aes(),
            public_custom_data: None,
        }
    }
}

/// What to do when a loaded stream contains two nodes with the same id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateIdPolicy {
    /// Fail the open with `DuplicateId`
    #[default]
    Reject,
    /// Assign a fresh id and keep the node's position under its parent
    Renumber,
}

/// Pipeline phase reported to the progress callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    TransformKey,
    Decrypt,
    Verify,
    Parse,
    Serialize,
    Encrypt,
    Write,
}

/// Progress callback invoked at phase boundaries
pub type ProgressFn = Box<dyn FnMut(Phase) + Send>;

/// Options for opening a database
#[derive(Default)]
pub struct OpenOptions {
    pub duplicate_id_policy: DuplicateIdPolicy,
    pub progress: Option<ProgressFn>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duplicate_id_policy(mut self, policy: DuplicateIdPolicy) -> Self {
        self.duplicate_id_policy = policy;
        self
    }

    pub fn progress(mut self, callback: ProgressFn) -> Self {
        self.progress = Some(callback);
        self
    }

    pub(crate) fn report(&mut self, phase: Phase) {
        tracing::debug!(?phase, "pipeline phase");
        if let Some(callback) = &mut self.progress {
            callback(phase);
        }
    }
}

impl std::fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenOptions")
            .field("duplicate_id_policy", &self.duplicate_id_policy)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Tombstone for a removed node, kept for merge reconciliation by outer
/// tooling. Appended, never removed here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedObject {
    pub uuid: Uuid,
    pub deletion_time: DateTime<Utc>,
}

/// Metadata about the database (for display without walking the tree)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    pub name: String,
    pub description: String,
    pub entry_count: usize,
    pub group_count: usize,
}

/// A tree node for displaying the group hierarchy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupTreeNode {
    pub uuid: Uuid,
    pub name: String,
    pub entry_count: usize,
    pub children: Vec<GroupTreeNode>,
}

/// Name of the legacy backup group (the V3 counterpart of the recycle bin)
pub const BACKUP_GROUP_NAME: &str = "Backup";

/// An open password database
#[derive(Debug)]
pub struct Database {
    pub meta: Meta,
    pub settings: Settings,
    /// All groups indexed by UUID
    groups: HashMap<Uuid, Group>,
    /// All entries indexed by UUID. History snapshots are not indexed.
    entries: HashMap<Uuid, Entry>,
    /// Root group UUID
    root: Uuid,
    /// Legacy 32-bit group ids, maintained only for V3 round trips
    legacy_ids: HashMap<u32, Uuid>,
    pub deleted_objects: Vec<DeletedObject>,
    /// Attachment and icon payloads
    pub binaries: BinaryPool,
    /// Composite key retained for saving (factors, not derived keys)
    key: Option<CompositeKey>,
}

impl Database {
    /// Create a new empty database with the given name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let root = Group::new(name.clone());
        let root_uuid = root.uuid;

        let mut groups = HashMap::new();
        groups.insert(root_uuid, root);

        let mut meta = Meta::default();
        meta.database_name = name;

        Self {
            meta,
            settings: Settings::default_kdbx(),
            groups,
            entries: HashMap::new(),
            root: root_uuid,
            legacy_ids: HashMap::new(),
            deleted_objects: Vec::new(),
            binaries: BinaryPool::new(),
            key: None,
        }
    }

    /// Empty shell used by the format decoders; the root is set by the
    /// tree codec once the stream provides it.
    pub(crate) fn bare(settings: Settings) -> Self {
        Self {
            meta: Meta::default(),
            settings,
            groups: HashMap::new(),
            entries: HashMap::new(),
            root: Uuid::nil(),
            legacy_ids: HashMap::new(),
            deleted_objects: Vec::new(),
            binaries: BinaryPool::new(),
            key: None,
        }
    }

    /// Open a database from bytes with a composite key
    pub fn open(data: &[u8], key: CompositeKey) -> Result<Self> {
        Self::open_with_options(data, key, OpenOptions::default())
    }

    /// Open a database from bytes, selecting duplicate-id policy and a
    /// progress callback
    pub fn open_with_options(
        data: &[u8],
        key: CompositeKey,
        mut options: OpenOptions,
    ) -> Result<Self> {
        let mut db = match format::detect(data)? {
            format::FormatKind::Kdb => format::kdb::open(data, &key, &mut options)?,
            format::FormatKind::Kdbx => format::kdbx::open(data, &key, &mut options)?,
        };
        db.key = Some(key);
        Ok(db)
    }

    /// Serialize and encrypt the database with the retained composite key.
    /// The master seed, IV, KDF salt and inner stream key are
    /// re-randomized; a hardware factor is challenged again.
    pub fn save(&mut self) -> Result<Vec<u8>> {
        self.save_with_progress(&mut |_| {})
    }

    /// Save, reporting pipeline phases to a callback
    pub fn save_with_progress(&mut self, progress: &mut dyn FnMut(Phase)) -> Result<Vec<u8>> {
        let key = self.key.take().ok_or(Error::EmptyCredential)?;
        let result = match self.settings.version {
            FileVersion::Kdb => format::kdb::save(self, &key, progress),
            FileVersion::Kdbx { .. } => format::kdbx::save(self, &key, progress),
        };
        self.key = Some(key);
        result
    }

    /// Save into a writer
    pub fn save_to(&mut self, writer: &mut impl std::io::Write) -> Result<()> {
        let bytes = self.save()?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// Replace the composite key used for subsequent saves
    pub fn set_key(&mut self, key: CompositeKey) {
        self.key = Some(key);
        self.meta.master_key_changed = Some(truncate_to_seconds(Utc::now()));
    }

    /// Explicitly close the database: wipe indexes, drop spooled
    /// attachment files and the retained key material
    pub fn close(mut self) {
        self.groups.clear();
        self.entries.clear();
        self.legacy_ids.clear();
        self.deleted_objects.clear();
        self.binaries.clear();
        self.key = None;
    }

    /// Get database metadata
    pub fn metadata(&self) -> DatabaseMetadata {
        DatabaseMetadata {
            name: self.meta.database_name.clone(),
            description: self.meta.database_description.clone(),
            entry_count: self.entries.len(),
            group_count: self.groups.len(),
        }
    }

    pub fn root_uuid(&self) -> Uuid {
        self.root
    }

    /// Get the root group
    pub fn root_group(&self) -> &Group {
        self.groups.get(&self.root).expect("root group must exist")
    }

    /// Get all groups
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Get all entries
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Get a group by UUID
    pub fn group(&self, uuid: &Uuid) -> Option<&Group> {
        self.groups.get(uuid)
    }

    /// Get a mutable group by UUID
    pub fn group_mut(&mut self, uuid: &Uuid) -> Option<&mut Group> {
        self.groups.get_mut(uuid)
    }

    /// Get an entry by UUID
    pub fn entry(&self, uuid: &Uuid) -> Option<&Entry> {
        self.entries.get(uuid)
    }

    /// Get a mutable entry by UUID
    pub fn entry_mut(&mut self, uuid: &Uuid) -> Option<&mut Entry> {
        self.entries.get_mut(uuid)
    }

    /// Add an entry to the database, under the root group when no parent
    /// is set
    pub fn add_entry(&mut self, mut entry: Entry) -> Uuid {
        let entry_uuid = entry.uuid;

        if entry.parent.is_none() {
            entry.parent = Some(self.root);
        }
        if let Some(parent_uuid) = entry.parent {
            if let Some(group) = self.groups.get_mut(&parent_uuid) {
                group.add_entry(entry_uuid);
            }
        }

        self.entries.insert(entry_uuid, entry);
        entry_uuid
    }

    /// Delete an entry, leaving a tombstone
    pub fn delete_entry(&mut self, uuid: &Uuid) -> Result<Entry> {
        let entry = self
            .entries
            .remove(uuid)
            .ok_or(Error::EntryNotFound(*uuid))?;

        if let Some(parent_uuid) = entry.parent {
            if let Some(group) = self.groups.get_mut(&parent_uuid) {
                group.remove_entry(uuid);
            }
        }
        self.tombstone(*uuid);
        Ok(entry)
    }

    /// Add a group to the database, under the root group when no parent
    /// is set
    pub fn add_group(&mut self, mut group: Group) -> Uuid {
        let group_uuid = group.uuid;

        if group.parent.is_none() && group_uuid != self.root {
            group.parent = Some(self.root);
        }
        if let Some(parent_uuid) = group.parent {
            if let Some(parent) = self.groups.get_mut(&parent_uuid) {
                parent.add_child(group_uuid);
            }
        }
        if let Some(legacy_id) = group.legacy_id {
            self.legacy_ids.insert(legacy_id, group_uuid);
        }

        self.groups.insert(group_uuid, group);
        group_uuid
    }

    /// Delete a group and everything under it, leaving tombstones
    pub fn delete_group(&mut self, uuid: &Uuid) -> Result<()> {
        if uuid == &self.root {
            return Err(Error::Malformed("cannot delete the root group".into()));
        }

        let group = self.groups.remove(uuid).ok_or(Error::GroupNotFound(*uuid))?;

        if let Some(parent_uuid) = group.parent {
            if let Some(parent) = self.groups.get_mut(&parent_uuid) {
                parent.remove_child(uuid);
            }
        }
        if let Some(legacy_id) = group.legacy_id {
            self.legacy_ids.remove(&legacy_id);
        }

        for entry_uuid in &group.entries {
            self.entries.remove(entry_uuid);
            self.tombstone(*entry_uuid);
        }
        for child_uuid in &group.groups {
            let _ = self.delete_group(child_uuid);
        }
        self.tombstone(*uuid);
        Ok(())
    }

    /// Move an entry under a different group
    pub fn move_entry(&mut self, entry_uuid: &Uuid, new_parent: &Uuid) -> Result<()> {
        if !self.groups.contains_key(new_parent) {
            return Err(Error::GroupNotFound(*new_parent));
        }
        let old_parent = {
            let entry = self
                .entries
                .get_mut(entry_uuid)
                .ok_or(Error::EntryNotFound(*entry_uuid))?;
            let old = entry.parent.replace(*new_parent);
            entry.times.touch_moved();
            old
        };
        if let Some(old_parent) = old_parent {
            if let Some(group) = self.groups.get_mut(&old_parent) {
                group.remove_entry(entry_uuid);
            }
        }
        if let Some(group) = self.groups.get_mut(new_parent) {
            group.add_entry(*entry_uuid);
        }
        Ok(())
    }

    /// Move a group under a different parent. Moving a group into its own
    /// subtree is rejected.
    pub fn move_group(&mut self, group_uuid: &Uuid, new_parent: &Uuid) -> Result<()> {
        if group_uuid == &self.root {
            return Err(Error::Malformed("cannot move the root group".into()));
        }
        if !self.groups.contains_key(group_uuid) {
            return Err(Error::GroupNotFound(*group_uuid));
        }
        if !self.groups.contains_key(new_parent) {
            return Err(Error::GroupNotFound(*new_parent));
        }
        // Walk up from the new parent; hitting the moved group means a cycle
        let mut cursor = Some(*new_parent);
        while let Some(uuid) = cursor {
            if uuid == *group_uuid {
                return Err(Error::Malformed(
                    "cannot move a group into its own subtree".into(),
                ));
            }
            cursor = self.groups.get(&uuid).and_then(|g| g.parent);
        }

        let old_parent = {
            let group = self
                .groups
                .get_mut(group_uuid)
                .expect("presence checked above");
            let old = group.parent.replace(*new_parent);
            group.times.touch_moved();
            old
        };
        if let Some(old_parent) = old_parent {
            if let Some(parent) = self.groups.get_mut(&old_parent) {
                parent.remove_child(group_uuid);
            }
        }
        if let Some(parent) = self.groups.get_mut(new_parent) {
            parent.add_child(*group_uuid);
        }
        Ok(())
    }

    /// Move an entry to the format's trash: the recycle bin for KDBX
    /// (created on demand when enabled), the "Backup" group for legacy
    /// databases
    pub fn recycle_entry(&mut self, entry_uuid: &Uuid) -> Result<()> {
        let destination = self.recycle_destination()?;
        self.move_entry(entry_uuid, &destination)
    }

    /// Resolve (creating if necessary) the recycle-bin or backup group
    pub fn recycle_destination(&mut self) -> Result<Uuid> {
        match self.settings.version {
            FileVersion::Kdbx { .. } => {
                if !self.meta.recycle_bin_enabled {
                    return Err(Error::Malformed("recycle bin is disabled".into()));
                }
                if let Some(uuid) = self.meta.recycle_bin_uuid {
                    if self.groups.contains_key(&uuid) {
                        return Ok(uuid);
                    }
                }
                let mut bin = Group::new("Recycle Bin");
                bin.icon_id = 43;
                bin.enable_auto_type = Some(false);
                bin.enable_searching = Some(false);
                let uuid = self.add_group(bin);
                self.meta.recycle_bin_uuid = Some(uuid);
                self.meta.recycle_bin_changed = Some(truncate_to_seconds(Utc::now()));
                Ok(uuid)
            }
            FileVersion::Kdb => {
                let root = self.root_group();
                let existing = root
                    .groups
                    .iter()
                    .find(|uuid| {
                        self.groups
                            .get(uuid)
                            .is_some_and(|g| g.name == BACKUP_GROUP_NAME)
                    })
                    .copied();
                match existing {
                    Some(uuid) => Ok(uuid),
                    None => Ok(self.add_group(Group::new(BACKUP_GROUP_NAME))),
                }
            }
        }
    }

    /// Search entries by query over titles, usernames, URLs, notes and
    /// tags
    pub fn search(&self, query: &str) -> Vec<&Entry> {
        let query_lower = query.to_lowercase();
        let matches = |s: Option<&str>| {
            s.map(|s| s.to_lowercase().contains(&query_lower))
                .unwrap_or(false)
        };
        self.entries
            .values()
            .filter(|entry| {
                matches(entry.title())
                    || matches(entry.username())
                    || matches(entry.url())
                    || matches(entry.notes())
                    || entry
                        .tags
                        .iter()
                        .any(|t| t.to_lowercase().contains(&query_lower))
            })
            .collect()
    }

    /// Get entries in a specific group
    pub fn entries_in_group(&self, group_uuid: &Uuid) -> Vec<&Entry> {
        self.groups
            .get(group_uuid)
            .map(|group| {
                group
                    .entries
                    .iter()
                    .filter_map(|uuid| self.entries.get(uuid))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get the group tree structure (for sidebar display)
    pub fn group_tree(&self) -> GroupTreeNode {
        self.build_group_tree(&self.root)
    }

    fn build_group_tree(&self, uuid: &Uuid) -> GroupTreeNode {
        let group = self.groups.get(uuid).expect("group must exist");
        GroupTreeNode {
            uuid: *uuid,
            name: group.name.clone(),
            entry_count: group.entries.len(),
            children: group
                .groups
                .iter()
                .map(|child| self.build_group_tree(child))
                .collect(),
        }
    }

    /// Change body compression and re-encode every stored attachment
    /// payload to match. A no-op for the legacy body, which is never
    /// compressed.
    pub fn set_compression(&mut self, compressed: bool) -> Result<()> {
        if matches!(self.settings.version, FileVersion::Kdbx { .. }) {
            self.settings.compression = compressed;
        }
        let ids: Vec<BinaryId> = self.binaries.ids().collect();
        for id in ids {
            self.binaries.set_compressed(id, compressed)?;
        }
        Ok(())
    }

    /// Every pool id referenced by a reachable entry (history included) or
    /// custom icon
    pub fn referenced_binaries(&self) -> HashSet<BinaryId> {
        let mut referenced = HashSet::new();
        for entry in self.entries.values() {
            collect_entry_binaries(entry, &mut referenced);
        }
        for icon in &self.meta.custom_icons {
            referenced.insert(icon.data);
        }
        referenced
    }

    /// Drop pool payloads no reachable node references; returns how many
    /// were removed
    pub fn sweep_binaries(&mut self) -> usize {
        let referenced = self.referenced_binaries();
        self.binaries.sweep(&referenced)
    }

    fn tombstone(&mut self, uuid: Uuid) {
        self.deleted_objects.push(DeletedObject {
            uuid,
            deletion_time: truncate_to_seconds(Utc::now()),
        });
    }

    // --- codec support -----------------------------------------------

    pub(crate) fn set_root(&mut self, uuid: Uuid) {
        self.root = uuid;
    }

    /// Index a decoded group, applying the duplicate-id policy. Returns
    /// the final uuid (fresh when renumbered).
    pub(crate) fn index_group(
        &mut self,
        mut group: Group,
        policy: DuplicateIdPolicy,
    ) -> Result<Uuid> {
        if self.groups.contains_key(&group.uuid) {
            match policy {
                DuplicateIdPolicy::Reject => {
                    return Err(Error::DuplicateId(group.uuid.to_string()))
                }
                DuplicateIdPolicy::Renumber => group.uuid = Uuid::new_v4(),
            }
        }
        if let Some(legacy_id) = group.legacy_id {
            if self.legacy_ids.contains_key(&legacy_id) {
                match policy {
                    DuplicateIdPolicy::Reject => {
                        return Err(Error::DuplicateId(legacy_id.to_string()))
                    }
                    DuplicateIdPolicy::Renumber => {
                        group.legacy_id = Some(self.fresh_legacy_id());
                    }
                }
            }
        }
        if let Some(legacy_id) = group.legacy_id {
            self.legacy_ids.insert(legacy_id, group.uuid);
        }
        let uuid = group.uuid;
        self.groups.insert(uuid, group);
        Ok(uuid)
    }

    /// Index a decoded entry, applying the duplicate-id policy
    pub(crate) fn index_entry(
        &mut self,
        mut entry: Entry,
        policy: DuplicateIdPolicy,
    ) -> Result<Uuid> {
        if self.entries.contains_key(&entry.uuid) {
            match policy {
                DuplicateIdPolicy::Reject => {
                    return Err(Error::DuplicateId(entry.uuid.to_string()))
                }
                DuplicateIdPolicy::Renumber => entry.uuid = Uuid::new_v4(),
            }
        }
        let uuid = entry.uuid;
        self.entries.insert(uuid, entry);
        Ok(uuid)
    }

    pub(crate) fn group_by_legacy_id(&self, id: u32) -> Option<Uuid> {
        self.legacy_ids.get(&id).copied()
    }

    pub(crate) fn fresh_legacy_id(&self) -> u32 {
        let mut candidate = self
            .legacy_ids
            .keys()
            .max()
            .map(|max| max.wrapping_add(1))
            .unwrap_or(1);
        while self.legacy_ids.contains_key(&candidate) || candidate == 0 {
            candidate = candidate.wrapping_add(1);
        }
        candidate
    }

    /// Assign legacy ids to any group missing one (the root keeps none;
    /// it is synthetic in the legacy format)
    pub(crate) fn assign_legacy_ids(&mut self) {
        let missing: Vec<Uuid> = self
            .walk_groups_preorder()
            .into_iter()
            .filter(|uuid| *uuid != self.root)
            .filter(|uuid| {
                self.groups
                    .get(uuid)
                    .is_some_and(|g| g.legacy_id.is_none())
            })
            .collect();
        for uuid in missing {
            let id = self.fresh_legacy_id();
            if let Some(group) = self.groups.get_mut(&uuid) {
                group.legacy_id = Some(id);
            }
            self.legacy_ids.insert(id, uuid);
        }
    }

    /// All group uuids in pre-order starting at the root
    pub(crate) fn walk_groups_preorder(&self) -> Vec<Uuid> {
        let mut out = Vec::with_capacity(self.groups.len());
        let mut stack = vec![self.root];
        while let Some(uuid) = stack.pop() {
            if let Some(group) = self.groups.get(&uuid) {
                out.push(uuid);
                for child in group.groups.iter().rev() {
                    stack.push(*child);
                }
            }
        }
        out
    }
}

fn collect_entry_binaries(entry: &Entry, referenced: &mut HashSet<BinaryId>) {
    for attachment in &entry.binaries {
        referenced.insert(attachment.binary);
    }
    for snapshot in &entry.history {
        collect_entry_binaries(snapshot, referenced);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::entry::EntryBuilder;

    #[test]
    fn test_database_creation() {
        let db = Database::new("My Passwords");
        assert_eq!(db.meta.database_name, "My Passwords");
        assert_eq!(db.entries().count(), 0);
        assert_eq!(db.groups().count(), 1); // Root group
    }

    #[test]
    fn test_add_and_delete_entry() {
        let mut db = Database::new("Test DB");
        let uuid = db.add_entry(Entry::new("GitHub"));

        assert!(db.entry(&uuid).is_some());
        assert_eq!(db.root_group().entries, vec![uuid]);

        db.delete_entry(&uuid).unwrap();
        assert!(db.entry(&uuid).is_none());
        assert!(db.root_group().entries.is_empty());
        assert_eq!(db.deleted_objects.len(), 1);
        assert_eq!(db.deleted_objects[0].uuid, uuid);
    }

    #[test]
    fn test_delete_group_recurses() {
        let mut db = Database::new("Test DB");
        let work = db.add_group(Group::new("Work"));
        let mut sub = Group::new("Servers");
        sub.parent = Some(work);
        let sub = db.add_group(sub);
        let entry = db.add_entry(EntryBuilder::new("ssh").parent(sub).build());

        db.delete_group(&work).unwrap();
        assert!(db.group(&work).is_none());
        assert!(db.group(&sub).is_none());
        assert!(db.entry(&entry).is_none());
        assert_eq!(db.deleted_objects.len(), 3);
    }

    #[test]
    fn test_move_group_rejects_cycles() {
        let mut db = Database::new("Test DB");
        let a = db.add_group(Group::new("A"));
        let mut b = Group::new("B");
        b.parent = Some(a);
        let b = db.add_group(b);

        assert!(db.move_group(&a, &b).is_err());
        let root = db.root_uuid();
        assert!(db.move_group(&b, &root).is_ok());
    }

    #[test]
    fn test_search() {
        let mut db = Database::new("Test DB");
        db.add_entry(EntryBuilder::new("GitHub Account").username("user@github.com").build());
        db.add_entry(EntryBuilder::new("Work Email").username("user@work.com").build());

        assert_eq!(db.search("github").len(), 1);
        assert_eq!(db.search("user").len(), 2);
    }

    #[test]
    fn test_duplicate_entry_policy() {
        let mut db = Database::new("Test DB");
        let entry = Entry::new("one");
        let uuid = entry.uuid;
        db.index_entry(entry.clone(), DuplicateIdPolicy::Reject).unwrap();

        let err = db
            .index_entry(entry.clone(), DuplicateIdPolicy::Reject)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateId(_)));

        let renumbered = db
            .index_entry(entry, DuplicateIdPolicy::Renumber)
            .unwrap();
        assert_ne!(renumbered, uuid);
        assert_eq!(db.entries().count(), 2);
    }

    #[test]
    fn test_recycle_bin_created_on_demand() {
        let mut db = Database::new("Test DB");
        let entry = db.add_entry(Entry::new("old"));

        db.recycle_entry(&entry).unwrap();
        let bin = db.meta.recycle_bin_uuid.expect("bin created");
        assert_eq!(db.entry(&entry).unwrap().parent, Some(bin));
        assert_eq!(db.group(&bin).unwrap().name, "Recycle Bin");
    }

    #[test]
    fn test_backup_group_for_legacy() {
        let mut db = Database::new("Test DB");
        db.settings = Settings::default_kdb();
        let entry = db.add_entry(Entry::new("old"));

        db.recycle_entry(&entry).unwrap();
        let backup = db.recycle_destination().unwrap();
        assert_eq!(db.group(&backup).unwrap().name, BACKUP_GROUP_NAME);
        assert_eq!(db.entry(&entry).unwrap().parent, Some(backup));
        // Second call reuses the same group
        assert_eq!(db.recycle_destination().unwrap(), backup);
    }

    #[test]
    fn test_binary_sweep() {
        let mut db = Database::new("Test DB");
        let used = db.binaries.put(b"used", false).unwrap();
        let _orphan = db.binaries.put(b"orphan", false).unwrap();
        db.add_entry(EntryBuilder::new("with file").attachment("a.txt", used).build());

        assert_eq!(db.sweep_binaries(), 1);
        assert!(db.binaries.contains(used));
    }

    #[test]
    fn test_close_wipes_state() {
        let mut db = Database::new("Test DB");
        db.add_entry(Entry::new("e"));
        db.close();
    }
}
