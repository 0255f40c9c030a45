//! Quota Management
//!
//! Enforces the per-file and per-user size ceilings. Usage is always measured
//! on disk, so it can never drift from what is actually stored.

use super::{PathStore, StorageError};
use crate::identity::UserId;

use serde::{Deserialize, Serialize};

/// Storage quota configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Largest single file (bytes)
    pub max_file_size: u64,
    /// Largest total size of one user's directory (bytes)
    pub max_folder_size: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024,    // 10 MB
            max_folder_size: 100 * 1024 * 1024, // 100 MB
        }
    }
}

impl QuotaConfig {
    /// Decide whether `incoming` more bytes fit next to `usage`
    pub fn check(&self, usage: u64, incoming: u64) -> QuotaCheckResult {
        match usage.checked_add(incoming) {
            Some(total) if total <= self.max_folder_size => QuotaCheckResult::Allowed,
            _ => QuotaCheckResult::InsufficientQuota {
                usage,
                incoming,
                limit: self.max_folder_size,
            },
        }
    }
}

/// Result of quota check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaCheckResult {
    Allowed,
    InsufficientQuota { usage: u64, incoming: u64, limit: u64 },
}

/// User quota summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSummary {
    pub bytes_used: u64,
    pub bytes_limit: u64,
    pub bytes_available: u64,
    pub usage_percentage: f64,
    pub max_file_size: u64,
}

/// Quota guard - rejects uploads that would overflow the configured limits
#[derive(Debug, Clone)]
pub struct QuotaGuard {
    config: QuotaConfig,
    paths: PathStore,
}

impl QuotaGuard {
    pub fn new(config: QuotaConfig, paths: PathStore) -> Self {
        Self { config, paths }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Fail with [`StorageError::FileTooLarge`] above the per-file ceiling
    pub fn assert_file_size(&self, size: u64) -> Result<(), StorageError> {
        tracing::debug!("Checking file size {} against {}", size, self.config.max_file_size);
        if size > self.config.max_file_size {
            return Err(StorageError::FileTooLarge {
                size,
                limit: self.config.max_file_size,
            });
        }
        Ok(())
    }

    /// Fail with [`StorageError::QuotaExceeded`] when the owner's directory
    /// cannot take `incoming` more bytes. Returns the measured usage.
    pub async fn assert_folder_capacity(
        &self,
        owner_id: UserId,
        incoming: u64,
    ) -> Result<u64, StorageError> {
        let usage = self.paths.folder_size(owner_id).await?;

        match self.config.check(usage, incoming) {
            QuotaCheckResult::Allowed => Ok(usage),
            QuotaCheckResult::InsufficientQuota {
                usage,
                incoming,
                limit,
            } => {
                tracing::warn!(
                    "User {} over quota: {} used + {} incoming > {}",
                    owner_id,
                    usage,
                    incoming,
                    limit
                );
                Err(StorageError::QuotaExceeded {
                    owner: owner_id,
                    usage,
                    incoming,
                    limit,
                })
            }
        }
    }

    /// Get user's quota summary
    pub async fn summary(&self, owner_id: UserId) -> Result<QuotaSummary, StorageError> {
        let used = self.paths.folder_size(owner_id).await?;
        let limit = self.config.max_folder_size;

        Ok(QuotaSummary {
            bytes_used: used,
            bytes_limit: limit,
            bytes_available: limit.saturating_sub(used),
            usage_percentage: if limit == 0 {
                100.0
            } else {
                (used as f64 / limit as f64 * 100.0).min(100.0)
            },
            max_file_size: self.config.max_file_size,
        })
    }
}
