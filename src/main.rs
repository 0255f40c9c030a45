//! filevaultd - runs the storage reconciliation for a file vault
//!
//! Usage: `filevaultd [CONFIG_FILE]`
//!
//! Environment variables prefixed `FILEVAULT_` override the file, e.g.
//! `FILEVAULT_GLOBAL_RECONCILIATION_ENABLED=true`.

use filevault_core::sync::scheduler;
use filevault_core::{telemetry, SledStore, StorageService, VaultConfig};

use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = VaultConfig::load(config_path.as_deref())?;

    telemetry::init_tracing(&config.log_filter);
    tracing::info!("++ Starting filevaultd");
    tracing::info!("++ Upload directory: {}", config.base_upload_directory.display());
    tracing::info!("++ Metadata: {}", config.metadata_path.display());

    let store = Arc::new(SledStore::open(&config.metadata_path)?);
    let service = StorageService::new(&config, store.clone())?.with_registry(store.clone());

    scheduler::startup_reconciliation(&config, service.scanner(), store.as_ref(), service.locks())
        .await;

    let task = scheduler::spawn_if_enabled(
        &config,
        service.scanner().clone(),
        store.clone(),
        service.locks().clone(),
    );

    if let Some(task) = task {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown requested");
        task.abort();
    }

    store.flush().await?;
    tracing::info!("filevaultd stopped");

    Ok(())
}
