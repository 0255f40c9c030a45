//! In-memory metadata store

use super::{FileRecord, MetaError, MetadataStore, UserRegistry};
use crate::identity::UserId;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Metadata store kept entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<Uuid, FileRecord>>,
    users: RwLock<HashSet<UserId>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a user known to [`UserRegistry::user_exists`]
    pub fn register_user(&self, owner_id: UserId) {
        self.users.write().insert(owner_id);
    }

    pub fn remove_user(&self, owner_id: UserId) {
        self.users.write().remove(&owner_id);
    }

    /// Number of records across all owners
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    async fn insert(&self, record: FileRecord) -> Result<(), MetaError> {
        self.records.write().insert(record.id, record);
        Ok(())
    }

    async fn delete(&self, owner_id: UserId, id: Uuid) -> Result<Option<FileRecord>, MetaError> {
        let mut records = self.records.write();
        let owned = records.get(&id).is_some_and(|r| r.owner_id == owner_id);
        Ok(if owned { records.remove(&id) } else { None })
    }

    async fn find_by_id_and_owner(
        &self,
        id: Uuid,
        owner_id: UserId,
    ) -> Result<Option<FileRecord>, MetaError> {
        Ok(self
            .records
            .read()
            .get(&id)
            .filter(|r| r.owner_id == owner_id)
            .cloned())
    }

    async fn find_all_by_owner(&self, owner_id: UserId) -> Result<Vec<FileRecord>, MetaError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UserRegistry for InMemoryStore {
    async fn user_exists(&self, owner_id: UserId) -> Result<bool, MetaError> {
        Ok(self.users.read().contains(&owner_id))
    }

    async fn ensure_user(&self, owner_id: UserId) -> Result<(), MetaError> {
        self.register_user(owner_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_owner_scoping() {
        let store = InMemoryStore::new();
        let record = FileRecord::new(UserId::new(1), "a.txt".into(), "k1".into(), 1);
        let id = record.id;
        store.insert(record).await.unwrap();

        assert!(store.find_by_id_and_owner(id, UserId::new(1)).await.unwrap().is_some());
        assert!(store.find_by_id_and_owner(id, UserId::new(2)).await.unwrap().is_none());
        assert!(store.delete(UserId::new(2), id).await.unwrap().is_none());
        assert_eq!(store.len(), 1);

        let deleted = store.delete(UserId::new(1), id).await.unwrap();
        assert_eq!(deleted.map(|r| r.id), Some(id));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_user_registry() {
        let store = InMemoryStore::new();
        store.register_user(UserId::new(5));

        assert!(store.user_exists(UserId::new(5)).await.unwrap());
        assert!(!store.user_exists(UserId::new(6)).await.unwrap());

        store.remove_user(UserId::new(5));
        assert!(!store.user_exists(UserId::new(5)).await.unwrap());

        store.ensure_user(UserId::new(6)).await.unwrap();
        assert!(store.user_exists(UserId::new(6)).await.unwrap());
    }
}
