//! In-memory database object model

pub mod binary_pool;
pub mod custom_data;
pub mod database;
pub mod entry;
pub mod group;
pub mod meta;
pub mod protected;
pub mod times;

pub use binary_pool::{BinaryId, BinaryPool};
pub use custom_data::{CustomData, CustomDataItem};
pub use database::{
    Database, DatabaseMetadata, DeletedObject, DuplicateIdPolicy, FileVersion, GroupTreeNode,
    OpenOptions, Phase, Settings,
};
pub use entry::{Attachment, AutoType, AutoTypeAssociation, Entry, EntryBuilder, FieldValue};
pub use group::Group;
pub use meta::{CustomIcon, MemoryProtection, Meta};
pub use protected::{ProtectedBinary, ProtectedString};
pub use times::Times;
