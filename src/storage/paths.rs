//! Physical layout of the upload directory
//!
//! ```text
//! <base_upload_directory>/
//! └── <owner_id>/
//!     └── <content_key>
//! ```
//!
//! Nothing is trusted from metadata: every read, write and delete re-checks
//! the target on disk, and every resolved path is re-anchored under the
//! owner's directory.

use super::StorageError;
use crate::identity::UserId;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWriteExt};
use walkdir::WalkDir;

/// Type of a directory entry found on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file, with whether it could be opened for reading
    File { readable: bool },
    Directory,
    /// Symlinks, sockets, devices
    Other,
}

/// One entry of a directory listing
#[derive(Debug, Clone)]
pub struct DiskEntry {
    pub name: String,
    pub path: PathBuf,
    pub kind: EntryKind,
    pub modified: Option<DateTime<Utc>>,
}

/// Complete listing of one directory level
#[derive(Debug, Default)]
pub struct DirectoryScan {
    pub entries: Vec<DiskEntry>,

    /// Entries that could not be inspected, with the reason
    pub skipped: Vec<(String, String)>,
}

/// Sole owner of the on-disk layout
#[derive(Debug, Clone)]
pub struct PathStore {
    base: PathBuf,
}

impl PathStore {
    /// Create a store rooted at `base`; relative paths are anchored at the
    /// current working directory
    pub fn new(base: impl AsRef<Path>) -> io::Result<Self> {
        let base = base.as_ref();
        let absolute = if base.is_absolute() {
            base.to_path_buf()
        } else {
            std::env::current_dir()?.join(base)
        };

        Ok(Self {
            base: normalize(&absolute),
        })
    }

    pub fn base_directory(&self) -> &Path {
        &self.base
    }

    /// Path of the owner's directory, without touching the disk
    pub fn user_directory_path(&self, owner_id: UserId) -> PathBuf {
        self.base.join(owner_id.to_string())
    }

    /// The owner's directory, created with its parents when absent
    pub async fn user_directory(&self, owner_id: UserId) -> Result<PathBuf, StorageError> {
        let directory = self.user_directory_path(owner_id);
        let access_error = |source| StorageError::DirectoryAccessError {
            owner: owner_id,
            source,
        };

        match tokio::fs::metadata(&directory).await {
            Ok(metadata) if metadata.is_dir() => {
                // Opening the listing proves the directory is readable
                tokio::fs::read_dir(&directory).await.map_err(access_error)?;
            }
            Ok(_) => {
                return Err(access_error(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{} is not a directory", directory.display()),
                )));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&directory)
                    .await
                    .map_err(access_error)?;
                tracing::info!("Created directory for user {}", owner_id);
            }
            Err(e) => return Err(access_error(e)),
        }

        Ok(directory)
    }

    /// Resolve a content key to its path inside the owner's directory.
    ///
    /// Fails with [`StorageError::PathEscape`] unless the key names a direct
    /// child of that directory.
    pub fn resolve(&self, owner_id: UserId, content_key: &str) -> Result<PathBuf, StorageError> {
        let directory = self.user_directory_path(owner_id);
        let escape = || StorageError::PathEscape(content_key.to_string());

        let mut components = Path::new(content_key).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return Err(escape()),
        }

        let path = normalize(&directory.join(content_key));
        if path.parent() != Some(directory.as_path()) {
            return Err(escape());
        }

        Ok(path)
    }

    /// Copy `reader` into the owner's directory under `content_key`,
    /// replacing any existing file. Returns the number of bytes written.
    pub async fn save<R>(
        &self,
        owner_id: UserId,
        content_key: &str,
        reader: &mut R,
    ) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.user_directory(owner_id).await?;
        let destination = self.resolve(owner_id, content_key)?;

        let result = async {
            let mut file = tokio::fs::File::create(&destination).await?;
            let written = tokio::io::copy(reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<u64, io::Error>(written)
        }
        .await;

        match result {
            Ok(written) => {
                tracing::debug!("Saved {} bytes to {}", written, destination.display());
                Ok(written)
            }
            Err(e) => {
                // Never leave a partial file behind
                let _ = tokio::fs::remove_file(&destination).await;

                if is_disk_full(&e) {
                    tracing::error!("No space left while saving a file for user {}", owner_id);
                    Err(StorageError::InsufficientSpace { owner: owner_id })
                } else {
                    tracing::warn!("Failed to copy file for user {}: {}", owner_id, e);
                    Err(StorageError::CopyError(e))
                }
            }
        }
    }

    /// Remove a stored file; [`StorageError::FileNotOnDisk`] if it is absent
    pub async fn delete(&self, owner_id: UserId, content_key: &str) -> Result<(), StorageError> {
        self.user_directory(owner_id).await?;
        let path = self.resolve(owner_id, content_key)?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("Deleted {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::FileNotOnDisk {
                owner: owner_id,
                name: content_key.to_string(),
            }),
            Err(e) => Err(StorageError::DirectoryAccessError {
                owner: owner_id,
                source: e,
            }),
        }
    }

    /// Open a stored file for reading
    pub async fn read(
        &self,
        owner_id: UserId,
        content_key: &str,
    ) -> Result<tokio::fs::File, StorageError> {
        self.user_directory(owner_id).await?;
        let path = self.resolve(owner_id, content_key)?;
        let not_found = || StorageError::FileNotOnDisk {
            owner: owner_id,
            name: content_key.to_string(),
        };

        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => return Err(not_found()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
            Err(_) => {
                return Err(StorageError::FileNotReadable {
                    owner: owner_id,
                    name: content_key.to_string(),
                })
            }
        }

        tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => not_found(),
            _ => StorageError::FileNotReadable {
                owner: owner_id,
                name: content_key.to_string(),
            },
        })
    }

    /// Sum of the sizes of all regular files below the owner's directory.
    ///
    /// Entries that cannot be inspected are logged and skipped.
    pub async fn folder_size(&self, owner_id: UserId) -> Result<u64, StorageError> {
        let directory = self.user_directory(owner_id).await?;
        let size = tokio::task::spawn_blocking(move || walk_size(&directory)).await?;
        Ok(size)
    }

    /// Filesystem modification time of a stored file
    pub async fn last_modified(
        &self,
        owner_id: UserId,
        content_key: &str,
    ) -> Result<DateTime<Utc>, StorageError> {
        let path = self.resolve(owner_id, content_key)?;

        let metadata = tokio::fs::metadata(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::FileNotOnDisk {
                owner: owner_id,
                name: content_key.to_string(),
            },
            _ => StorageError::FileNotReadable {
                owner: owner_id,
                name: content_key.to_string(),
            },
        })?;

        metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .map_err(|_| StorageError::FileNotReadable {
                owner: owner_id,
                name: content_key.to_string(),
            })
    }

    /// Set the modification time of a stored file
    pub async fn touch(
        &self,
        owner_id: UserId,
        content_key: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let path = self.resolve(owner_id, content_key)?;
        let modified = SystemTime::from(at);

        tokio::task::spawn_blocking(move || {
            std::fs::File::options()
                .write(true)
                .open(&path)?
                .set_modified(modified)
        })
        .await?
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::FileNotOnDisk {
                owner: owner_id,
                name: content_key.to_string(),
            },
            _ => StorageError::FileNotReadable {
                owner: owner_id,
                name: content_key.to_string(),
            },
        })
    }

    /// List the owner's directory one level deep
    pub async fn scan_user_directory(&self, owner_id: UserId) -> Result<DirectoryScan, StorageError> {
        let directory = self.user_directory(owner_id).await?;
        let scan = tokio::task::spawn_blocking(move || scan_directory(&directory)).await?;
        Ok(scan)
    }

    /// List the base directory one level deep; a missing base is empty
    pub async fn scan_base_directory(&self) -> Result<DirectoryScan, StorageError> {
        let base = self.base.clone();
        if !tokio::fs::try_exists(&base).await.unwrap_or(false) {
            return Ok(DirectoryScan::default());
        }
        let scan = tokio::task::spawn_blocking(move || scan_directory(&base)).await?;
        Ok(scan)
    }

    /// Remove an entry produced by one of the scans; directories are removed
    /// recursively. Refuses paths outside the base directory.
    pub async fn remove_entry(&self, entry: &DiskEntry) -> io::Result<()> {
        let path = normalize(&entry.path);
        if path == self.base || !path.starts_with(&self.base) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is outside the upload directory", path.display()),
            ));
        }

        match entry.kind {
            EntryKind::Directory => tokio::fs::remove_dir_all(&path).await,
            _ => tokio::fs::remove_file(&path).await,
        }
    }
}

/// Lexically resolve `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn is_disk_full(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded
    )
}

fn walk_size(directory: &Path) -> u64 {
    let entries: Vec<_> = WalkDir::new(directory)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Entry skipped while computing folder size: {}", e);
                None
            }
        })
        .collect();

    entries
        .par_iter()
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| match entry.metadata() {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                tracing::warn!(
                    "File '{}' skipped while computing folder size: {}",
                    entry.file_name().to_string_lossy(),
                    e
                );
                0
            }
        })
        .sum()
}

fn scan_directory(directory: &Path) -> DirectoryScan {
    let mut skipped = Vec::new();
    let entries: Vec<_> = WalkDir::new(directory)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                let name = e
                    .path()
                    .and_then(Path::file_name)
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                skipped.push((name, e.to_string()));
                None
            }
        })
        .collect();

    let entries = entries.par_iter().map(inspect_entry).collect();

    DirectoryScan { entries, skipped }
}

fn inspect_entry(entry: &walkdir::DirEntry) -> DiskEntry {
    let file_type = entry.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File {
            readable: std::fs::File::open(entry.path()).is_ok(),
        }
    } else {
        EntryKind::Other
    };

    let modified = entry
        .metadata()
        .ok()
        .and_then(|metadata| metadata.modified().ok())
        .map(DateTime::<Utc>::from);

    DiskEntry {
        name: entry.file_name().to_string_lossy().into_owned(),
        path: entry.path().to_path_buf(),
        kind,
        modified,
    }
}
