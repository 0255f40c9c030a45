//! FileVault Core - Per-user file storage with self-healing metadata
//!
//! This crate stores user files on a local filesystem and keeps a metadata
//! record for every file in sync with the bytes on disk. Every request first
//! reconciles the user's directory against the metadata store, so callers never
//! see a record pointing at a missing file.

pub mod identity;
pub mod meta;
pub mod service;
pub mod storage;
pub mod sync;
pub mod telemetry;

pub use identity::UserId;
pub use meta::{FileRecord, FileRecordDto, InMemoryStore, MetadataStore, SledStore, UserRegistry};
pub use service::{FetchedFile, StorageService, UploadFile};
pub use storage::{ErrorKind, StorageError};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Prefix of environment variables that override configuration values
pub const ENV_PREFIX: &str = "FILEVAULT";

/// Main error type for FileVault operations
#[derive(Error, Debug)]
pub enum FileVaultError {
    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] meta::MetaError),

    #[error("Identity error: {0}")]
    Identity(#[from] identity::IdentityError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FileVaultError>;

/// Core configuration for the file vault
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Largest single file accepted (in bytes)
    pub max_file_size_bytes: u64,

    /// Largest total size of one user's directory (in bytes)
    pub max_folder_size_bytes: u64,

    /// Root under which every user gets their own directory
    pub base_upload_directory: PathBuf,

    /// Maximum number of files accepted by one upload call
    pub max_files_per_upload: usize,

    /// Allowed drift between disk mtime and `updated_at` before a file is
    /// flagged as suspiciously modified
    pub modification_tolerance_ms: u64,

    /// Deadline for one directory walk; `None` waits indefinitely
    pub walk_timeout_ms: Option<u64>,

    /// Run the periodic global reconciliation
    pub global_reconciliation_enabled: bool,

    /// Period of the global reconciliation
    pub global_reconciliation_interval_ms: u64,

    /// Location of the sled metadata database
    pub metadata_path: PathBuf,

    /// Default tracing filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 10 * 1024 * 1024,    // 10 MB
            max_folder_size_bytes: 100 * 1024 * 1024, // 100 MB
            base_upload_directory: PathBuf::from("./filevault_data/uploads"),
            max_files_per_upload: 1,
            modification_tolerance_ms: 1_000,
            walk_timeout_ms: None,
            global_reconciliation_enabled: false,
            global_reconciliation_interval_ms: 5_000,
            metadata_path: PathBuf::from("./filevault_data/metadata"),
            log_filter: "info".to_string(),
        }
    }
}

impl VaultConfig {
    /// Load configuration: defaults, then an optional TOML file, then
    /// `FILEVAULT_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn modification_tolerance(&self) -> Duration {
        Duration::from_millis(self.modification_tolerance_ms)
    }

    pub fn walk_timeout(&self) -> Option<Duration> {
        self.walk_timeout_ms.map(Duration::from_millis)
    }

    pub fn global_reconciliation_interval(&self) -> Duration {
        Duration::from_millis(self.global_reconciliation_interval_ms.max(1))
    }
}
