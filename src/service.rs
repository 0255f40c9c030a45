//! Storage Service - the public file operations
//!
//! Every operation runs under the owner's lock and starts with a per-user
//! reconciliation, so it always works on repaired state:
//!
//! ```text
//! validate input → lock → reconcile → check → write disk → persist metadata
//! ```
//!
//! Disk is written before metadata is committed, so a crash can leave an
//! untracked file (removed by the next scan) but never a record without bytes.

use crate::identity::UserId;
use crate::meta::{FileRecord, FileRecordDto, MetadataStore, UserRegistry};
use crate::storage::{
    resolve_name, PathStore, QuotaConfig, QuotaGuard, QuotaSummary, StorageError, UserLocks,
};
use crate::sync::{ReconcileOutcome, ReconciliationScanner};
use crate::VaultConfig;

use chrono::Utc;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Characters left unescaped in an RFC 5987 `filename*` value
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Length of a hyphenated UUID
const IDENTIFIER_LENGTH: usize = 36;

/// One file of an upload payload
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// Name requested by the client; blank or absent becomes `file`
    pub name: Option<String>,
    pub content: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: Some(name.into()),
            content: content.into(),
        }
    }

    pub fn unnamed(content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: None,
            content: content.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// An opened file ready to be streamed to the client
#[derive(Debug)]
pub struct FetchedFile {
    pub record: FileRecordDto,
    pub file: tokio::fs::File,
    /// Value for the `Content-Disposition` header
    pub content_disposition: String,
    /// MIME type guessed from the display name
    pub content_type: String,
}

/// Per-user file storage with self-healing metadata
pub struct StorageService {
    paths: PathStore,
    quota: QuotaGuard,
    scanner: ReconciliationScanner,
    store: Arc<dyn MetadataStore>,
    registry: Option<Arc<dyn UserRegistry>>,
    locks: UserLocks,
    max_files_per_upload: usize,
}

impl StorageService {
    pub fn new(config: &VaultConfig, store: Arc<dyn MetadataStore>) -> crate::Result<Self> {
        let paths = PathStore::new(&config.base_upload_directory)?;
        let quota = QuotaGuard::new(
            QuotaConfig {
                max_file_size: config.max_file_size_bytes,
                max_folder_size: config.max_folder_size_bytes,
            },
            paths.clone(),
        );
        let scanner = ReconciliationScanner::new(paths.clone(), store.clone())
            .with_tolerance(config.modification_tolerance())
            .with_walk_timeout(config.walk_timeout());

        tracing::info!(
            "Storage service rooted at {}",
            paths.base_directory().display()
        );

        Ok(Self {
            paths,
            quota,
            scanner,
            store,
            registry: None,
            locks: UserLocks::new(),
            max_files_per_upload: config.max_files_per_upload,
        })
    }

    /// Register every user this service works for, so the global scan
    /// keeps their directories
    pub fn with_registry(mut self, registry: Arc<dyn UserRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn paths(&self) -> &PathStore {
        &self.paths
    }

    pub fn scanner(&self) -> &ReconciliationScanner {
        &self.scanner
    }

    /// Lock table shared with the global reconciliation
    pub fn locks(&self) -> &UserLocks {
        &self.locks
    }

    /// Store multiple files for `owner_id`.
    ///
    /// Files are committed one by one; a failure leaves earlier files of the
    /// payload stored.
    pub async fn upload(
        &self,
        owner_id: UserId,
        files: Vec<UploadFile>,
    ) -> Result<Vec<FileRecordDto>, StorageError> {
        self.validate_payload(&files)?;

        let (_guard, outcome) = self.synchronized(owner_id).await?;
        let mut live_names = live_names(&outcome.records);

        let mut uploaded = Vec::with_capacity(files.len());
        for file in files {
            let record = self.store_file(owner_id, file, &live_names).await?;
            live_names.push(record.display_name.clone());
            uploaded.push(record.to_dto());
        }

        Ok(uploaded)
    }

    /// Store a single file for `owner_id`
    pub async fn upload_one(
        &self,
        owner_id: UserId,
        file: UploadFile,
    ) -> Result<FileRecordDto, StorageError> {
        let mut uploaded = self.upload(owner_id, vec![file]).await?;
        uploaded.pop().ok_or(StorageError::FileIsEmpty)
    }

    /// All files of `owner_id`, oldest first
    pub async fn list(&self, owner_id: UserId) -> Result<Vec<FileRecordDto>, StorageError> {
        self.list_matching(owner_id, |_| true).await
    }

    /// Files of `owner_id` accepted by `predicate`, oldest first
    pub async fn list_matching<P>(
        &self,
        owner_id: UserId,
        predicate: P,
    ) -> Result<Vec<FileRecordDto>, StorageError>
    where
        P: Fn(&FileRecord) -> bool,
    {
        let (_guard, outcome) = self.synchronized(owner_id).await?;
        Ok(outcome
            .records
            .iter()
            .filter(|record| predicate(record))
            .map(FileRecord::to_dto)
            .collect())
    }

    /// Open a file of `owner_id` for download
    pub async fn fetch(&self, owner_id: UserId, id: &str) -> Result<FetchedFile, StorageError> {
        let id = parse_identifier(id)?;
        let (_guard, outcome) = self.synchronized(owner_id).await?;
        let mut record = locate(outcome.records, owner_id, id)?;

        if record.deleted_from_disk {
            return Err(StorageError::FileNotOnDisk {
                owner: owner_id,
                name: record.display_name,
            });
        }

        let file = match self.paths.read(owner_id, &record.content_key).await {
            Ok(file) => file,
            Err(StorageError::FileNotOnDisk { .. }) => {
                tracing::warn!(
                    "File '{}' of user {} vanished, marked as deleted from disk",
                    record.display_name,
                    owner_id
                );
                record.deleted_from_disk = true;
                self.store.insert(record.clone()).await?;
                return Err(StorageError::FileNotOnDisk {
                    owner: owner_id,
                    name: record.display_name,
                });
            }
            Err(e) => return Err(e),
        };

        let content_type = mime_guess::from_path(&record.display_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        tracing::debug!("Serving '{}' to user {}", record.display_name, owner_id);

        Ok(FetchedFile {
            content_disposition: content_disposition(&record.display_name),
            content_type,
            record: record.to_dto(),
            file,
        })
    }

    /// Delete a file of `owner_id`, returning its last known state
    pub async fn delete(&self, owner_id: UserId, id: &str) -> Result<FileRecordDto, StorageError> {
        let id = parse_identifier(id)?;
        let (_guard, outcome) = self.synchronized(owner_id).await?;

        // Reconciliation already dropped a record whose file was gone
        if let Some(pruned) = outcome.pruned.iter().find(|record| record.id == id) {
            tracing::info!(
                "Deleted '{}' of user {} (file was already gone)",
                pruned.display_name,
                owner_id
            );
            return Ok(pruned.to_dto());
        }

        let record = locate(outcome.records, owner_id, id)?;
        self.remove_record(owner_id, record).await
    }

    /// Delete every file of `owner_id`
    pub async fn delete_all(&self, owner_id: UserId) -> Result<Vec<FileRecordDto>, StorageError> {
        let (_guard, outcome) = self.synchronized(owner_id).await?;

        let mut deleted = Vec::with_capacity(outcome.records.len());
        for record in outcome.records {
            deleted.push(self.remove_record(owner_id, record).await?);
        }

        tracing::info!("Deleted all {} file(s) of user {}", deleted.len(), owner_id);
        Ok(deleted)
    }

    /// Refresh `updated_at` of a file together with its disk mtime
    pub async fn touch(&self, owner_id: UserId, id: &str) -> Result<FileRecordDto, StorageError> {
        let id = parse_identifier(id)?;
        let (_guard, outcome) = self.synchronized(owner_id).await?;
        let mut record = locate(outcome.records, owner_id, id)?;

        let now = Utc::now();
        self.paths.touch(owner_id, &record.content_key, now).await?;
        record.updated_at = now;
        record.suspicious_modified = false;
        self.store.insert(record.clone()).await?;

        tracing::info!("Touched '{}' of user {}", record.display_name, owner_id);
        Ok(record.to_dto())
    }

    pub async fn quota_summary(&self, owner_id: UserId) -> Result<QuotaSummary, StorageError> {
        let (_guard, _outcome) = self.synchronized(owner_id).await?;
        self.quota.summary(owner_id).await
    }

    /// Take the owner's lock, register the owner and repair their directory.
    ///
    /// The guard must be held for the rest of the operation.
    async fn synchronized(
        &self,
        owner_id: UserId,
    ) -> Result<(OwnedMutexGuard<()>, ReconcileOutcome), StorageError> {
        let guard = self.locks.lock(owner_id).await;
        if let Some(registry) = &self.registry {
            registry.ensure_user(owner_id).await?;
        }
        let outcome = self.scanner.reconcile_user(owner_id).await?;
        Ok((guard, outcome))
    }

    fn validate_payload(&self, files: &[UploadFile]) -> Result<(), StorageError> {
        if files.is_empty() || files.iter().any(|file| file.content.is_empty()) {
            return Err(StorageError::FileIsEmpty);
        }

        if files.len() > self.max_files_per_upload {
            return Err(StorageError::FilesLimitExceeded {
                limit: self.max_files_per_upload,
            });
        }

        files
            .iter()
            .try_for_each(|file| self.quota.assert_file_size(file.size()))
    }

    /// Write one file and commit its record. The caller holds the lock.
    async fn store_file(
        &self,
        owner_id: UserId,
        file: UploadFile,
        live_names: &[String],
    ) -> Result<FileRecord, StorageError> {
        let resolved = resolve_name(owner_id, file.name.as_deref(), live_names);

        // Files already written in this payload are on disk and counted
        self.quota
            .assert_folder_capacity(owner_id, file.size())
            .await?;

        let written = self
            .paths
            .save(owner_id, &resolved.content_key, &mut file.content.as_slice())
            .await?;

        let record = FileRecord::new(
            owner_id,
            resolved.display_name,
            resolved.content_key,
            written,
        );

        // Align the mtime with the record so the file does not look tampered
        if let Err(e) = self
            .paths
            .touch(owner_id, &record.content_key, record.updated_at)
            .await
        {
            tracing::warn!(
                "Could not set modification time of '{}': {}",
                record.display_name,
                e
            );
        }

        if let Err(e) = self.store.insert(record.clone()).await {
            tracing::error!(
                "Failed to persist '{}' of user {}, removing written file: {}",
                record.display_name,
                owner_id,
                e
            );
            let _ = self.paths.delete(owner_id, &record.content_key).await;
            return Err(e.into());
        }

        tracing::info!(
            "Uploaded '{}' ({} bytes) for user {}",
            record.display_name,
            record.size_bytes,
            owner_id
        );
        Ok(record)
    }

    async fn remove_record(
        &self,
        owner_id: UserId,
        record: FileRecord,
    ) -> Result<FileRecordDto, StorageError> {
        if !record.deleted_from_disk {
            match self.paths.delete(owner_id, &record.content_key).await {
                Ok(()) => {}
                Err(StorageError::FileNotOnDisk { .. }) => {
                    tracing::warn!(
                        "File '{}' of user {} already gone from disk",
                        record.display_name,
                        owner_id
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.store.delete(owner_id, record.id).await?;
        tracing::info!("Deleted '{}' of user {}", record.display_name, owner_id);

        Ok(record.to_dto())
    }
}

fn live_names(records: &[FileRecord]) -> Vec<String> {
    records
        .iter()
        .filter(|record| record.is_live())
        .map(|record| record.display_name.clone())
        .collect()
}

fn locate(records: Vec<FileRecord>, owner_id: UserId, id: Uuid) -> Result<FileRecord, StorageError> {
    records
        .into_iter()
        .find(|record| record.id == id)
        .ok_or(StorageError::RecordNotFound { owner: owner_id, id })
}

/// Parse a record id; only the hyphenated UUID form is accepted
pub fn parse_identifier(id: &str) -> Result<Uuid, StorageError> {
    let invalid = || StorageError::InvalidIdentifierFormat(id.to_string());

    if id.len() != IDENTIFIER_LENGTH {
        return Err(invalid());
    }
    Uuid::parse_str(id).map_err(|_| invalid())
}

/// `Content-Disposition` value with an ASCII fallback and the exact name
/// percent-encoded as UTF-8
pub fn content_disposition(display_name: &str) -> String {
    let fallback: String = display_name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(display_name, FILENAME_ENCODE_SET)
    )
}
