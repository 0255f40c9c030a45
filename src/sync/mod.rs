//! Sync Module - reconciliation of metadata and disk state
//!
//! Two scans share one scanner:
//!
//! - the per-user scan runs before every request and repairs the requesting
//!   user's directory and records;
//! - the global scan runs periodically over the whole upload directory and
//!   removes stray files and directories of unknown users.
//!
//! Both scans first build a complete picture of the disk and only then apply
//! repairs, so an interrupted walk never leaves half-applied changes.

pub mod scheduler;

use crate::identity::UserId;
use crate::meta::{FileRecord, MetadataStore, UserRegistry};
use crate::storage::{DirectoryScan, DiskEntry, EntryKind, PathStore, StorageError, UserLocks};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default tolerance between disk mtime and `updated_at`
pub const DEFAULT_MODIFICATION_TOLERANCE: Duration = Duration::from_secs(1);

/// Default number of users reconciled at once by the global scan
pub const DEFAULT_SCAN_CONCURRENCY: usize = 8;

/// Repair or observation made by a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncAction {
    /// Untracked file removed from a user directory
    NotUserFile,
    /// Directory with a tracked name removed from a user directory
    FileIsDirectory,
    /// Symlink or special file with a tracked name removed
    NotRegularFile,
    /// Unreadable tracked file removed
    FileNotReadable,
    /// Record removed because its file is gone
    FileNotFoundOnDisk,
    /// File changed outside the service; reported, never repaired
    SuspiciousModification,
    /// Non-directory removed from the base directory
    InvalidFileRemoved,
    /// Directory of an unknown user removed
    OrphanDirectoryRemoved,
    /// Entry that could not be inspected or removed
    FileSkipped,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncAction::NotUserFile => "NotUserFile",
            SyncAction::FileIsDirectory => "FileIsDirectory",
            SyncAction::NotRegularFile => "NotRegularFile",
            SyncAction::FileNotReadable => "FileNotReadable",
            SyncAction::FileNotFoundOnDisk => "FileNotFoundOnDisk",
            SyncAction::SuspiciousModification => "SuspiciousModification",
            SyncAction::InvalidFileRemoved => "InvalidFileRemoved",
            SyncAction::OrphanDirectoryRemoved => "OrphanDirectoryRemoved",
            SyncAction::FileSkipped => "FileSkipped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub action: SyncAction,
    /// File, directory or record name the action applied to
    pub name: String,
}

/// Summary of one per-user scan
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub owner: UserId,
    pub events: Vec<SyncEvent>,
}

impl ReconcileReport {
    fn new(owner: UserId) -> Self {
        Self {
            owner,
            events: Vec::new(),
        }
    }

    fn push(&mut self, action: SyncAction, name: impl Into<String>) {
        self.events.push(SyncEvent {
            action,
            name: name.into(),
        });
    }

    pub fn count(&self, action: SyncAction) -> usize {
        self.events.iter().filter(|e| e.action == action).count()
    }

    /// Nothing had to be repaired or reported
    pub fn is_clean(&self) -> bool {
        self.events.is_empty()
    }
}

/// Repaired records of one user together with what was done
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Surviving records, annotated and sorted by creation time
    pub records: Vec<FileRecord>,
    /// Records removed because their file was gone, flagged
    /// `deleted_from_disk`
    pub pruned: Vec<FileRecord>,
    pub report: ReconcileReport,
}

/// Summary of one global scan
#[derive(Debug, Clone, Default)]
pub struct GlobalScanReport {
    pub events: Vec<SyncEvent>,
    pub users_reconciled: usize,
    pub errors: usize,
}

impl GlobalScanReport {
    fn push(&mut self, action: SyncAction, name: impl Into<String>) {
        self.events.push(SyncEvent {
            action,
            name: name.into(),
        });
    }

    pub fn count(&self, action: SyncAction) -> usize {
        self.events.iter().filter(|e| e.action == action).count()
    }
}

/// What to do with the contents of a user directory
#[derive(Debug, Default)]
struct RepairPlan {
    removals: Vec<(DiskEntry, SyncAction)>,
    /// Content key -> disk modification time
    present: HashMap<String, Option<DateTime<Utc>>>,
}

/// Classify every entry of a user directory against the known content keys
fn plan_user_repairs(scan: DirectoryScan, known_keys: &HashSet<&str>) -> RepairPlan {
    let mut plan = RepairPlan::default();

    for entry in scan.entries {
        let action = if !known_keys.contains(entry.name.as_str()) {
            SyncAction::NotUserFile
        } else {
            match entry.kind {
                EntryKind::Directory => SyncAction::FileIsDirectory,
                EntryKind::Other => SyncAction::NotRegularFile,
                EntryKind::File { readable: false } => SyncAction::FileNotReadable,
                EntryKind::File { readable: true } => {
                    plan.present.insert(entry.name.clone(), entry.modified);
                    continue;
                }
            }
        };
        plan.removals.push((entry, action));
    }

    plan
}

fn diverges(modified: DateTime<Utc>, updated_at: DateTime<Utc>, tolerance: Duration) -> bool {
    let drift = (modified - updated_at).num_milliseconds().unsigned_abs();
    drift > tolerance.as_millis() as u64
}

/// Reconciles metadata records with the files on disk
#[derive(Clone)]
pub struct ReconciliationScanner {
    paths: PathStore,
    store: Arc<dyn MetadataStore>,
    tolerance: Duration,
    walk_timeout: Option<Duration>,
    scan_concurrency: usize,
}

impl ReconciliationScanner {
    pub fn new(paths: PathStore, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            paths,
            store,
            tolerance: DEFAULT_MODIFICATION_TOLERANCE,
            walk_timeout: None,
            scan_concurrency: DEFAULT_SCAN_CONCURRENCY,
        }
    }

    /// Set the allowed drift between disk mtime and `updated_at`
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Abort walks that take longer than `timeout`
    pub fn with_walk_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.walk_timeout = timeout;
        self
    }

    /// Limit how many users the global scan reconciles at once
    pub fn with_scan_concurrency(mut self, concurrency: usize) -> Self {
        self.scan_concurrency = concurrency.max(1);
        self
    }

    pub fn paths(&self) -> &PathStore {
        &self.paths
    }

    /// Reconcile one user's directory with their records.
    ///
    /// The caller must hold the user's lock.
    pub async fn reconcile_user(&self, owner_id: UserId) -> Result<ReconcileOutcome, StorageError> {
        let mut report = ReconcileReport::new(owner_id);
        let records = self.store.find_all_by_owner(owner_id).await?;

        let scan = with_deadline(
            owner_id,
            self.walk_timeout,
            self.paths.scan_user_directory(owner_id),
        )
        .await?;

        for (name, reason) in &scan.skipped {
            tracing::warn!("File '{}' of user {} skipped: {}", name, owner_id, reason);
            report.push(SyncAction::FileSkipped, name.clone());
        }

        let known_keys: HashSet<&str> = records.iter().map(|r| r.content_key.as_str()).collect();
        let plan = plan_user_repairs(scan, &known_keys);

        for (entry, action) in &plan.removals {
            match self.paths.remove_entry(entry).await {
                Ok(()) => {
                    tracing::warn!(
                        "Removed '{}' from directory of user {} ({})",
                        entry.name,
                        owner_id,
                        action
                    );
                    report.push(*action, entry.name.clone());
                }
                Err(e) => {
                    tracing::warn!(
                        "File '{}' of user {} skipped: {}",
                        entry.name,
                        owner_id,
                        e
                    );
                    report.push(SyncAction::FileSkipped, entry.name.clone());
                }
            }
        }

        let mut survivors = Vec::with_capacity(records.len());
        let mut pruned = Vec::new();
        for mut record in records {
            let Some(modified) = plan.present.get(&record.content_key) else {
                self.store.delete(owner_id, record.id).await?;
                tracing::warn!(
                    "File '{}' of user {} not found on disk, record removed",
                    record.display_name,
                    owner_id
                );
                report.push(SyncAction::FileNotFoundOnDisk, record.display_name.clone());
                record.deleted_from_disk = true;
                pruned.push(record);
                continue;
            };

            if record.deleted_from_disk {
                // The file reappeared before the record was cleaned up
                record.deleted_from_disk = false;
                self.store.insert(record.clone()).await?;
            }

            if let Some(modified) = modified {
                if diverges(*modified, record.updated_at, self.tolerance) {
                    tracing::warn!(
                        "File '{}' of user {} modified outside the service (disk {}, record {})",
                        record.display_name,
                        owner_id,
                        modified,
                        record.updated_at
                    );
                    record.suspicious_modified = true;
                    report.push(SyncAction::SuspiciousModification, record.display_name.clone());
                }
            }

            survivors.push(record);
        }

        survivors.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.display_name.cmp(&b.display_name))
        });

        if !report.is_clean() {
            tracing::info!(
                "Reconciled user {}: {} event(s), {} record(s) kept",
                owner_id,
                report.events.len(),
                survivors.len()
            );
        }

        Ok(ReconcileOutcome {
            records: survivors,
            pruned,
            report,
        })
    }

    /// Reconcile the whole upload directory.
    ///
    /// Errors are logged and counted per entry; the scan never stops early.
    pub async fn reconcile_all(
        &self,
        registry: &dyn UserRegistry,
        locks: &UserLocks,
    ) -> GlobalScanReport {
        let mut report = GlobalScanReport::default();

        let listing = match self.walk_timeout {
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.paths.scan_base_directory()).await {
                    Ok(listing) => listing,
                    Err(_) => {
                        tracing::warn!("Base directory walk exceeded {:?}, discarded", deadline);
                        report.errors += 1;
                        return report;
                    }
                }
            }
            None => self.paths.scan_base_directory().await,
        };

        let scan = match listing {
            Ok(scan) => scan,
            Err(e) => {
                tracing::error!("Global reconciliation could not list the base directory: {}", e);
                report.errors += 1;
                return report;
            }
        };

        for (name, reason) in &scan.skipped {
            tracing::warn!("Base directory entry '{}' skipped: {}", name, reason);
            report.push(SyncAction::FileSkipped, name.clone());
            report.errors += 1;
        }

        let mut live_users = Vec::new();
        for entry in &scan.entries {
            if entry.kind != EntryKind::Directory {
                self.remove_base_entry(entry, SyncAction::InvalidFileRemoved, &mut report)
                    .await;
                continue;
            }

            let Ok(owner_id) = entry.name.parse::<UserId>() else {
                self.remove_base_entry(entry, SyncAction::OrphanDirectoryRemoved, &mut report)
                    .await;
                continue;
            };

            match registry.user_exists(owner_id).await {
                Ok(true) => live_users.push(owner_id),
                Ok(false) => {
                    let _guard = locks.lock(owner_id).await;
                    self.remove_base_entry(entry, SyncAction::OrphanDirectoryRemoved, &mut report)
                        .await;
                }
                Err(e) => {
                    tracing::warn!("Could not look up user {}: {}", owner_id, e);
                    report.push(SyncAction::FileSkipped, entry.name.clone());
                    report.errors += 1;
                }
            }
        }

        let outcomes: Vec<_> = stream::iter(live_users)
            .map(|owner_id| async move {
                let _guard = locks.lock(owner_id).await;
                (owner_id, self.reconcile_user(owner_id).await)
            })
            .buffer_unordered(self.scan_concurrency)
            .collect()
            .await;

        for (owner_id, outcome) in outcomes {
            match outcome {
                Ok(outcome) => {
                    report.users_reconciled += 1;
                    report.events.extend(outcome.report.events);
                }
                Err(e) => {
                    tracing::warn!("Reconciliation of user {} failed: {}", owner_id, e);
                    report.errors += 1;
                }
            }
        }

        tracing::info!(
            "Global reconciliation finished: {} user(s), {} event(s), {} error(s)",
            report.users_reconciled,
            report.events.len(),
            report.errors
        );

        report
    }

    async fn remove_base_entry(
        &self,
        entry: &DiskEntry,
        action: SyncAction,
        report: &mut GlobalScanReport,
    ) {
        match self.paths.remove_entry(entry).await {
            Ok(()) => {
                tracing::warn!("Removed '{}' from the upload directory ({})", entry.name, action);
                report.push(action, entry.name.clone());
            }
            Err(e) => {
                tracing::warn!("Base directory entry '{}' skipped: {}", entry.name, e);
                report.push(SyncAction::FileSkipped, entry.name.clone());
                report.errors += 1;
            }
        }
    }
}

/// Run a user walk under an optional deadline; an expired walk yields nothing
async fn with_deadline<T, F>(
    owner_id: UserId,
    deadline: Option<Duration>,
    walk: F,
) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, walk).await.map_err(|_| {
            tracing::warn!("Walk for user {} exceeded {:?}, discarded", owner_id, deadline);
            StorageError::ReconciliationTimedOut { owner: owner_id }
        })?,
        None => walk.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{InMemoryStore, MetaError};
    use async_trait::async_trait;
    use tempfile::TempDir;

    const OWNER: UserId = UserId::new(21);

    struct Fixture {
        _temp_dir: TempDir,
        store: Arc<InMemoryStore>,
        scanner: ReconciliationScanner,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let paths = PathStore::new(temp_dir.path().join("uploads")).unwrap();
        let store = Arc::new(InMemoryStore::new());
        let scanner = ReconciliationScanner::new(paths, store.clone());
        Fixture {
            _temp_dir: temp_dir,
            store,
            scanner,
        }
    }

    /// Write a file and a matching record whose timestamps follow the file
    async fn tracked(fixture: &Fixture, name: &str) -> FileRecord {
        let key = crate::storage::content_key(OWNER, name);
        fixture
            .scanner
            .paths()
            .save(OWNER, &key, &mut &b"content"[..])
            .await
            .unwrap();

        let mut record = FileRecord::new(OWNER, name.to_string(), key.clone(), 7);
        record.updated_at = fixture.scanner.paths().last_modified(OWNER, &key).await.unwrap();
        fixture.store.insert(record.clone()).await.unwrap();
        record
    }

    #[tokio::test]
    async fn test_clean_directory_is_untouched() {
        let fixture = fixture();
        let record = tracked(&fixture, "a.txt").await;

        let outcome = fixture.scanner.reconcile_user(OWNER).await.unwrap();

        assert!(outcome.report.is_clean());
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].id, record.id);
        assert!(!outcome.records[0].suspicious_modified);
    }

    #[tokio::test]
    async fn test_missing_file_removes_record() {
        let fixture = fixture();
        let gone = tracked(&fixture, "gone.txt").await;
        let kept = tracked(&fixture, "kept.txt").await;
        std::fs::remove_file(fixture.scanner.paths().resolve(OWNER, &gone.content_key).unwrap())
            .unwrap();

        let outcome = fixture.scanner.reconcile_user(OWNER).await.unwrap();

        assert_eq!(outcome.report.count(SyncAction::FileNotFoundOnDisk), 1);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].id, kept.id);
        assert_eq!(outcome.pruned.len(), 1);
        assert_eq!(outcome.pruned[0].id, gone.id);
        assert!(outcome.pruned[0].deleted_from_disk);
        assert!(fixture
            .store
            .find_by_id_and_owner(gone.id, OWNER)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_stray_entries_are_removed() {
        let fixture = fixture();
        let record = tracked(&fixture, "a.txt").await;
        let directory = fixture.scanner.paths().user_directory_path(OWNER);
        std::fs::write(directory.join("stray.bin"), b"junk").unwrap();
        std::fs::create_dir(directory.join("stray-dir")).unwrap();

        let outcome = fixture.scanner.reconcile_user(OWNER).await.unwrap();

        assert_eq!(outcome.report.count(SyncAction::NotUserFile), 2);
        assert!(!directory.join("stray.bin").exists());
        assert!(!directory.join("stray-dir").exists());
        assert!(directory.join(&record.content_key).exists());
        assert_eq!(outcome.records.len(), 1);
    }

    #[tokio::test]
    async fn test_directory_with_tracked_name_is_removed() {
        let fixture = fixture();
        let key = crate::storage::content_key(OWNER, "a.txt");
        let directory = fixture.scanner.paths().user_directory(OWNER).await.unwrap();
        std::fs::create_dir(directory.join(&key)).unwrap();
        let record = FileRecord::new(OWNER, "a.txt".into(), key.clone(), 1);
        fixture.store.insert(record).await.unwrap();

        let outcome = fixture.scanner.reconcile_user(OWNER).await.unwrap();

        assert_eq!(outcome.report.count(SyncAction::FileIsDirectory), 1);
        assert_eq!(outcome.report.count(SyncAction::FileNotFoundOnDisk), 1);
        assert!(outcome.records.is_empty());
        assert!(!directory.join(&key).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tracked_symlink_is_removed() {
        let fixture = fixture();
        let key = crate::storage::content_key(OWNER, "link.txt");
        let directory = fixture.scanner.paths().user_directory(OWNER).await.unwrap();
        let target = fixture._temp_dir.path().join("target.txt");
        std::fs::write(&target, b"outside").unwrap();
        std::os::unix::fs::symlink(&target, directory.join(&key)).unwrap();
        let record = FileRecord::new(OWNER, "link.txt".into(), key.clone(), 7);
        fixture.store.insert(record.clone()).await.unwrap();

        let outcome = fixture.scanner.reconcile_user(OWNER).await.unwrap();

        assert_eq!(outcome.report.count(SyncAction::NotRegularFile), 1);
        assert_eq!(outcome.report.count(SyncAction::FileNotFoundOnDisk), 1);
        assert!(outcome.records.is_empty());
        assert!(std::fs::symlink_metadata(directory.join(&key)).is_err());
        assert!(target.exists());
        assert!(fixture
            .store
            .find_by_id_and_owner(record.id, OWNER)
            .await
            .unwrap()
            .is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_tracked_file_is_removed() {
        use std::os::unix::fs::PermissionsExt;

        let fixture = fixture();
        let record = tracked(&fixture, "secret.txt").await;
        let path = fixture
            .scanner
            .paths()
            .resolve(OWNER, &record.content_key)
            .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o000)).unwrap();

        // Permission bits do not stop root
        if std::fs::File::open(&path).is_ok() {
            return;
        }

        let outcome = fixture.scanner.reconcile_user(OWNER).await.unwrap();

        assert_eq!(outcome.report.count(SyncAction::FileNotReadable), 1);
        assert_eq!(outcome.report.count(SyncAction::FileNotFoundOnDisk), 1);
        assert!(outcome.records.is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_external_modification_is_flagged_not_persisted() {
        let fixture = fixture();
        let record = tracked(&fixture, "a.txt").await;
        let later = record.updated_at + chrono::Duration::seconds(30);
        fixture
            .scanner
            .paths()
            .touch(OWNER, &record.content_key, later)
            .await
            .unwrap();

        let outcome = fixture.scanner.reconcile_user(OWNER).await.unwrap();

        assert!(outcome.records[0].suspicious_modified);
        assert_eq!(outcome.report.count(SyncAction::SuspiciousModification), 1);
        let stored = fixture
            .store
            .find_by_id_and_owner(record.id, OWNER)
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.suspicious_modified);
    }

    #[tokio::test]
    async fn test_drift_within_tolerance_is_trusted() {
        let fixture = fixture();
        let record = tracked(&fixture, "a.txt").await;
        let slightly_later = record.updated_at + chrono::Duration::milliseconds(500);
        fixture
            .scanner
            .paths()
            .touch(OWNER, &record.content_key, slightly_later)
            .await
            .unwrap();

        let outcome = fixture.scanner.reconcile_user(OWNER).await.unwrap();
        assert!(!outcome.records[0].suspicious_modified);
    }

    #[tokio::test]
    async fn test_reappeared_file_clears_deleted_flag() {
        let fixture = fixture();
        let mut record = tracked(&fixture, "a.txt").await;
        record.deleted_from_disk = true;
        fixture.store.insert(record.clone()).await.unwrap();

        let outcome = fixture.scanner.reconcile_user(OWNER).await.unwrap();

        assert!(!outcome.records[0].deleted_from_disk);
        let stored = fixture
            .store
            .find_by_id_and_owner(record.id, OWNER)
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.deleted_from_disk);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let fixture = fixture();
        tracked(&fixture, "a.txt").await;
        let directory = fixture.scanner.paths().user_directory_path(OWNER);
        std::fs::write(directory.join("stray"), b"junk").unwrap();

        let first = fixture.scanner.reconcile_user(OWNER).await.unwrap();
        let second = fixture.scanner.reconcile_user(OWNER).await.unwrap();

        assert!(!first.report.is_clean());
        assert!(second.report.is_clean());
        assert_eq!(first.records.len(), second.records.len());
    }

    #[tokio::test]
    async fn test_expired_deadline_discards_walk() {
        let result: Result<(), StorageError> = with_deadline(
            OWNER,
            Some(Duration::from_millis(10)),
            std::future::pending(),
        )
        .await;

        assert!(matches!(
            result,
            Err(StorageError::ReconciliationTimedOut { owner: OWNER })
        ));
    }

    #[tokio::test]
    async fn test_global_scan_removes_invalid_entries() {
        let fixture = fixture();
        tracked(&fixture, "a.txt").await;
        fixture.store.register_user(OWNER);

        let base = fixture.scanner.paths().base_directory().to_path_buf();
        std::fs::write(base.join("loose-file"), b"junk").unwrap();
        std::fs::create_dir(base.join("not-a-user")).unwrap();
        std::fs::create_dir(base.join("404")).unwrap();
        std::fs::write(base.join("404").join("orphan"), b"junk").unwrap();

        let locks = UserLocks::new();
        let report = fixture
            .scanner
            .reconcile_all(fixture.store.as_ref(), &locks)
            .await;

        assert_eq!(report.count(SyncAction::InvalidFileRemoved), 1);
        assert_eq!(report.count(SyncAction::OrphanDirectoryRemoved), 2);
        assert_eq!(report.users_reconciled, 1);
        assert_eq!(report.errors, 0);
        assert!(!base.join("loose-file").exists());
        assert!(!base.join("not-a-user").exists());
        assert!(!base.join("404").exists());
        assert!(base.join(OWNER.to_string()).is_dir());
    }

    #[tokio::test]
    async fn test_global_scan_cleans_uncommitted_files() {
        let fixture = fixture();
        let record = tracked(&fixture, "a.txt").await;
        fixture.store.register_user(OWNER);
        let directory = fixture.scanner.paths().user_directory_path(OWNER);
        std::fs::write(directory.join("written-but-never-committed"), b"x").unwrap();

        let report = fixture
            .scanner
            .reconcile_all(fixture.store.as_ref(), &UserLocks::new())
            .await;

        assert_eq!(report.count(SyncAction::NotUserFile), 1);
        assert!(!directory.join("written-but-never-committed").exists());
        assert!(directory.join(&record.content_key).exists());
    }

    #[tokio::test]
    async fn test_global_scan_without_base_directory() {
        let fixture = fixture();

        let report = fixture
            .scanner
            .reconcile_all(fixture.store.as_ref(), &UserLocks::new())
            .await;

        assert!(report.events.is_empty());
        assert_eq!(report.errors, 0);
    }

    /// Registry whose backend is down
    struct UnreachableRegistry;

    #[async_trait]
    impl UserRegistry for UnreachableRegistry {
        async fn user_exists(&self, _owner_id: UserId) -> Result<bool, MetaError> {
            Err(MetaError::Serialization("registry unavailable".into()))
        }

        async fn ensure_user(&self, _owner_id: UserId) -> Result<(), MetaError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_global_scan_keeps_directory_when_lookup_fails() {
        let fixture = fixture();
        let base = fixture.scanner.paths().base_directory().to_path_buf();
        std::fs::create_dir_all(base.join("5")).unwrap();
        std::fs::write(base.join("5").join("data"), b"x").unwrap();

        let report = fixture
            .scanner
            .reconcile_all(&UnreachableRegistry, &UserLocks::new())
            .await;

        assert_eq!(report.count(SyncAction::FileSkipped), 1);
        assert_eq!(report.errors, 1);
        assert_eq!(report.users_reconciled, 0);
        assert!(base.join("5").join("data").exists());
    }

    #[tokio::test]
    async fn test_global_scan_with_bounded_concurrency() {
        let fixture = fixture();
        let scanner = fixture.scanner.clone().with_scan_concurrency(1);
        let base = scanner.paths().base_directory().to_path_buf();

        for id in 1..=3u64 {
            let directory = base.join(id.to_string());
            std::fs::create_dir_all(&directory).unwrap();
            std::fs::write(directory.join("stray"), b"x").unwrap();
            fixture.store.register_user(UserId::new(id));
        }

        let report = scanner
            .reconcile_all(fixture.store.as_ref(), &UserLocks::new())
            .await;

        assert_eq!(report.users_reconciled, 3);
        assert_eq!(report.count(SyncAction::NotUserFile), 3);
        assert_eq!(report.errors, 0);
        for id in 1..=3u64 {
            assert!(!base.join(id.to_string()).join("stray").exists());
        }
    }
}
