//! Metadata Module - file records and the stores that persist them
//!
//! The storage engine treats metadata persistence as an external dependency
//! reached through [`MetadataStore`]. Two implementations ship with the crate:
//! an in-memory store for tests and embedding, and a sled-backed store.

mod memory;
mod sled_store;

pub use memory::InMemoryStore;
pub use sled_store::SledStore;

use crate::identity::UserId;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted key in tree {tree}")]
    CorruptedKey { tree: &'static str },
}

/// Metadata of one stored file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Primary key
    pub id: Uuid,

    /// Owner of the file, never changes
    pub owner_id: UserId,

    /// User facing name, unique among the owner's live records
    pub display_name: String,

    /// Name of the file inside the owner's directory
    pub content_key: String,

    /// Size recorded at upload time
    pub size_bytes: u64,

    pub created_at: DateTime<Utc>,

    /// Refreshed on every successful mutation
    pub updated_at: DateTime<Utc>,

    /// The file was found missing at read time; the next reconciliation
    /// removes this record
    #[serde(default)]
    pub deleted_from_disk: bool,

    /// Disk mtime disagrees with `updated_at`; only valid for the current
    /// response, never persisted
    #[serde(skip)]
    pub suspicious_modified: bool,
}

impl FileRecord {
    /// Create a record for a file that was just written to disk
    pub fn new(owner_id: UserId, display_name: String, content_key: String, size_bytes: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            display_name,
            content_key,
            size_bytes,
            created_at: now,
            updated_at: now,
            deleted_from_disk: false,
            suspicious_modified: false,
        }
    }

    /// Record is expected to have a file on disk
    pub fn is_live(&self) -> bool {
        !self.deleted_from_disk
    }

    pub fn to_dto(&self) -> FileRecordDto {
        FileRecordDto::from(self)
    }
}

/// Record representation handed to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecordDto {
    pub id: Uuid,
    pub owner_id: UserId,
    pub display_name: String,
    pub size_bytes: u64,
    pub content_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted_from_disk: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub suspicious_modified: bool,
}

impl From<&FileRecord> for FileRecordDto {
    fn from(record: &FileRecord) -> Self {
        Self {
            id: record.id,
            owner_id: record.owner_id,
            display_name: record.display_name.clone(),
            size_bytes: record.size_bytes,
            content_key: record.content_key.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            deleted_from_disk: record.deleted_from_disk,
            suspicious_modified: record.suspicious_modified,
        }
    }
}

/// Keyed persistence of file records
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a record, replacing any record with the same id
    async fn insert(&self, record: FileRecord) -> Result<(), MetaError>;

    /// Remove a record, returning it if it existed
    async fn delete(&self, owner_id: UserId, id: Uuid) -> Result<Option<FileRecord>, MetaError>;

    async fn find_by_id_and_owner(
        &self,
        id: Uuid,
        owner_id: UserId,
    ) -> Result<Option<FileRecord>, MetaError>;

    async fn find_all_by_owner(&self, owner_id: UserId) -> Result<Vec<FileRecord>, MetaError>;
}

/// Lookup of users known to the identity subsystem
#[async_trait]
pub trait UserRegistry: Send + Sync {
    async fn user_exists(&self, owner_id: UserId) -> Result<bool, MetaError>;

    /// Record that `owner_id` is a live user; repeated calls are no-ops
    async fn ensure_user(&self, owner_id: UserId) -> Result<(), MetaError>;
}
