//! Sled-backed metadata store
//!
//! Records live in the `files` tree under `owner_id (8 bytes BE) ++ id (16
//! bytes)` so that all records of one owner form a contiguous prefix. Known
//! users live in the `users` tree keyed by their big-endian id.

use super::{FileRecord, MetaError, MetadataStore, UserRegistry};
use crate::identity::UserId;

use async_trait::async_trait;
use std::path::Path;
use uuid::Uuid;

const FILES_TREE: &str = "files";
const USERS_TREE: &str = "users";

/// Persistent metadata store on top of sled
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    files: sled::Tree,
    users: sled::Tree,
}

impl SledStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetaError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Open a throwaway database that is removed when dropped
    pub fn temporary() -> Result<Self, MetaError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, MetaError> {
        let files = db.open_tree(FILES_TREE)?;
        let users = db.open_tree(USERS_TREE)?;
        Ok(Self { db, files, users })
    }

    fn record_key(owner_id: UserId, id: Uuid) -> [u8; 24] {
        let mut key = [0u8; 24];
        key[..8].copy_from_slice(&owner_id.to_be_bytes());
        key[8..].copy_from_slice(id.as_bytes());
        key
    }

    fn decode(bytes: &[u8]) -> Result<FileRecord, MetaError> {
        serde_json::from_slice(bytes).map_err(|e| MetaError::Serialization(e.to_string()))
    }

    /// Make a user known to [`UserRegistry::user_exists`]
    pub fn register_user(&self, owner_id: UserId) -> Result<(), MetaError> {
        self.users.insert(owner_id.to_be_bytes(), Vec::<u8>::new())?;
        Ok(())
    }

    pub fn remove_user(&self, owner_id: UserId) -> Result<(), MetaError> {
        self.users.remove(owner_id.to_be_bytes())?;
        Ok(())
    }

    /// All users currently registered
    pub fn users(&self) -> Result<Vec<UserId>, MetaError> {
        self.users
            .iter()
            .keys()
            .map(|key| {
                let key = key?;
                let bytes: [u8; 8] = key[..]
                    .try_into()
                    .map_err(|_| MetaError::CorruptedKey { tree: USERS_TREE })?;
                Ok(UserId::new(u64::from_be_bytes(bytes)))
            })
            .collect()
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<(), MetaError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SledStore {
    async fn insert(&self, record: FileRecord) -> Result<(), MetaError> {
        let key = Self::record_key(record.owner_id, record.id);
        let value =
            serde_json::to_vec(&record).map_err(|e| MetaError::Serialization(e.to_string()))?;
        self.files.insert(key, value)?;
        Ok(())
    }

    async fn delete(&self, owner_id: UserId, id: Uuid) -> Result<Option<FileRecord>, MetaError> {
        self.files
            .remove(Self::record_key(owner_id, id))?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    async fn find_by_id_and_owner(
        &self,
        id: Uuid,
        owner_id: UserId,
    ) -> Result<Option<FileRecord>, MetaError> {
        self.files
            .get(Self::record_key(owner_id, id))?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    async fn find_all_by_owner(&self, owner_id: UserId) -> Result<Vec<FileRecord>, MetaError> {
        self.files
            .scan_prefix(owner_id.to_be_bytes())
            .values()
            .map(|value| Self::decode(&value?))
            .collect()
    }
}

#[async_trait]
impl UserRegistry for SledStore {
    async fn user_exists(&self, owner_id: UserId) -> Result<bool, MetaError> {
        Ok(self.users.contains_key(owner_id.to_be_bytes())?)
    }

    async fn ensure_user(&self, owner_id: UserId) -> Result<(), MetaError> {
        if !self.users.contains_key(owner_id.to_be_bytes())? {
            self.register_user(owner_id)?;
        }
        Ok(())
    }
}
