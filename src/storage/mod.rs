//! Storage Module - physical layout, naming, quotas and per-user locking
//!
//! Everything that touches the upload directory goes through [`PathStore`].

mod locks;
mod naming;
mod paths;
mod quota;

pub use locks::UserLocks;
pub use naming::{content_key, resolve_name, split_name, ResolvedName, CONTENT_KEY_NAMESPACE};
pub use paths::{DirectoryScan, DiskEntry, EntryKind, PathStore};
pub use quota::{QuotaCheckResult, QuotaConfig, QuotaGuard, QuotaSummary};

use crate::identity::UserId;
use crate::meta::MetaError;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("The uploaded file is empty")]
    FileIsEmpty,

    #[error("Too many files: only {limit} file(s) may be uploaded per operation")]
    FilesLimitExceeded { limit: usize },

    #[error("Invalid identifier '{0}': expected XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX")]
    InvalidIdentifierFormat(String),

    #[error("File size {size} exceeds the limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Quota exceeded for user {owner}: {usage} used, {incoming} incoming, limit {limit}")]
    QuotaExceeded {
        owner: UserId,
        usage: u64,
        incoming: u64,
        limit: u64,
    },

    #[error("Record {id} not found for user {owner}")]
    RecordNotFound { owner: UserId, id: Uuid },

    #[error("File '{name}' of user {owner} not found on disk")]
    FileNotOnDisk { owner: UserId, name: String },

    #[error("Failed to copy file: {0}")]
    CopyError(#[source] std::io::Error),

    #[error("Not enough free disk space to store a file for user {owner}")]
    InsufficientSpace { owner: UserId },

    #[error("Cannot access directory of user {owner}: {source}")]
    DirectoryAccessError {
        owner: UserId,
        #[source]
        source: std::io::Error,
    },

    #[error("File '{name}' of user {owner} is not readable")]
    FileNotReadable { owner: UserId, name: String },

    #[error("Path escapes the user directory: {0}")]
    PathEscape(String),

    #[error("Reconciliation of user {owner} did not finish before its deadline")]
    ReconciliationTimedOut { owner: UserId },

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetaError),
}

/// Coarse classification a boundary uses to pick a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller input rejected before any I/O
    Validation,
    /// Policy rejection, recoverable by freeing space or shrinking the file
    Quota,
    /// Genuine absence or a race with reconciliation
    NotFound,
    /// Environment failure
    Io,
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::FileIsEmpty
            | StorageError::FilesLimitExceeded { .. }
            | StorageError::InvalidIdentifierFormat(_) => ErrorKind::Validation,
            StorageError::FileTooLarge { .. } | StorageError::QuotaExceeded { .. } => {
                ErrorKind::Quota
            }
            StorageError::RecordNotFound { .. } | StorageError::FileNotOnDisk { .. } => {
                ErrorKind::NotFound
            }
            StorageError::CopyError(_)
            | StorageError::InsufficientSpace { .. }
            | StorageError::DirectoryAccessError { .. }
            | StorageError::FileNotReadable { .. }
            | StorageError::PathEscape(_)
            | StorageError::ReconciliationTimedOut { .. }
            | StorageError::TaskFailed(_)
            | StorageError::Metadata(_) => ErrorKind::Io,
        }
    }

    /// Name of the request field the error refers to
    pub fn field(&self) -> &'static str {
        match self {
            StorageError::InvalidIdentifierFormat(_) | StorageError::RecordNotFound { .. } => "id",
            StorageError::DirectoryAccessError { .. }
            | StorageError::ReconciliationTimedOut { .. } => "directory",
            StorageError::Metadata(_) | StorageError::TaskFailed(_) => "server",
            _ => "file",
        }
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(error: tokio::task::JoinError) -> Self {
        StorageError::TaskFailed(error.to_string())
    }
}
