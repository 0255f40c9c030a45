//! Periodic global reconciliation

use super::{GlobalScanReport, ReconciliationScanner};
use crate::meta::UserRegistry;
use crate::storage::UserLocks;
use crate::VaultConfig;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Run [`ReconciliationScanner::reconcile_all`] every `interval` until the
/// returned handle is aborted. A run that overlaps the next tick delays it.
pub fn spawn_global_reconciliation(
    scanner: ReconciliationScanner,
    registry: Arc<dyn UserRegistry>,
    locks: UserLocks,
    interval: Duration,
) -> JoinHandle<()> {
    tracing::info!("Global reconciliation scheduled every {:?}", interval);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let report = scanner.reconcile_all(registry.as_ref(), &locks).await;
            tracing::debug!(
                "Scheduled reconciliation run: {} event(s), {} error(s)",
                report.events.len(),
                report.errors
            );
        }
    })
}

/// Run one global scan at startup when the configuration enables the
/// global reconciliation; `None` when it is disabled
pub async fn startup_reconciliation(
    config: &VaultConfig,
    scanner: &ReconciliationScanner,
    registry: &dyn UserRegistry,
    locks: &UserLocks,
) -> Option<GlobalScanReport> {
    if !config.global_reconciliation_enabled {
        return None;
    }

    let report = scanner.reconcile_all(registry, locks).await;
    tracing::info!(
        "Startup reconciliation: {} user(s), {} event(s), {} error(s)",
        report.users_reconciled,
        report.events.len(),
        report.errors
    );
    Some(report)
}

/// Start the periodic scan when the configuration enables it
pub fn spawn_if_enabled(
    config: &VaultConfig,
    scanner: ReconciliationScanner,
    registry: Arc<dyn UserRegistry>,
    locks: UserLocks,
) -> Option<JoinHandle<()>> {
    if !config.global_reconciliation_enabled {
        tracing::info!("Global reconciliation disabled");
        return None;
    }

    Some(spawn_global_reconciliation(
        scanner,
        registry,
        locks,
        config.global_reconciliation_interval(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{InMemoryStore, SledStore};
    use crate::service::{StorageService, UploadFile};
    use crate::storage::PathStore;
    use crate::sync::SyncAction;
    use crate::UserId;
    use tempfile::TempDir;

    fn scanner(temp_dir: &TempDir, store: Arc<InMemoryStore>) -> ReconciliationScanner {
        let paths = PathStore::new(temp_dir.path().join("uploads")).unwrap();
        ReconciliationScanner::new(paths, store)
    }

    #[tokio::test]
    async fn test_disabled_by_default() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());

        let handle = spawn_if_enabled(
            &VaultConfig::default(),
            scanner(&temp_dir, store.clone()),
            store,
            UserLocks::new(),
        );

        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn test_scheduled_run_cleans_base_directory() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let scanner = scanner(&temp_dir, store.clone());
        let base = scanner.paths().base_directory().to_path_buf();
        std::fs::create_dir_all(&base).unwrap();
        std::fs::write(base.join("stray"), b"junk").unwrap();

        let config = VaultConfig {
            global_reconciliation_enabled: true,
            global_reconciliation_interval_ms: 20,
            ..VaultConfig::default()
        };
        let handle = spawn_if_enabled(&config, scanner, store, UserLocks::new()).unwrap();

        // The first tick fires immediately
        for _ in 0..100 {
            if !base.join("stray").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();

        assert!(!base.join("stray").exists());
    }

    #[tokio::test]
    async fn test_startup_scan_keeps_existing_uploads() {
        let temp_dir = TempDir::new().unwrap();
        let config = VaultConfig {
            base_upload_directory: temp_dir.path().join("uploads"),
            global_reconciliation_enabled: true,
            ..VaultConfig::default()
        };
        let store = Arc::new(SledStore::temporary().unwrap());
        let owner = UserId::new(1);

        let service = StorageService::new(&config, store.clone())
            .unwrap()
            .with_registry(store.clone());
        service
            .upload_one(owner, UploadFile::new("keep.txt", "keep"))
            .await
            .unwrap();

        // Same sequence the daemon runs on start
        let restarted = StorageService::new(&config, store.clone())
            .unwrap()
            .with_registry(store.clone());
        let report = startup_reconciliation(
            &config,
            restarted.scanner(),
            store.as_ref(),
            restarted.locks(),
        )
        .await
        .unwrap();

        assert_eq!(report.count(SyncAction::OrphanDirectoryRemoved), 0);
        assert_eq!(report.users_reconciled, 1);
        assert!(restarted.paths().user_directory_path(owner).is_dir());
        let listed = restarted.list(owner).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].display_name, "keep.txt");
    }

    #[tokio::test]
    async fn test_startup_scan_skipped_when_disabled() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let scanner = scanner(&temp_dir, store.clone());
        let base = scanner.paths().base_directory().to_path_buf();
        std::fs::create_dir_all(base.join("9")).unwrap();

        let report = startup_reconciliation(
            &VaultConfig::default(),
            &scanner,
            store.as_ref(),
            &UserLocks::new(),
        )
        .await;

        assert!(report.is_none());
        assert!(base.join("9").is_dir());
    }
}
