//! Keyed lock table serializing work on one user's directory

use crate::identity::UserId;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per user, created on first use and never removed.
///
/// Operations on different users never contend; there is no global lock.
#[derive(Debug, Clone, Default)]
pub struct UserLocks {
    locks: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to the user's directory
    pub async fn lock(&self, owner_id: UserId) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(owner_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        mutex.lock_owned().await
    }

    /// Take the user's lock only if it is free
    pub fn try_lock(&self, owner_id: UserId) -> Option<OwnedMutexGuard<()>> {
        let mutex = self
            .locks
            .entry(owner_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        mutex.try_lock_owned().ok()
    }

    /// Number of users that have a lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
