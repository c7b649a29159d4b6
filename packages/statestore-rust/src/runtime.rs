//! Process-wide store instance and startup orchestration.
//!
//! The backend is a process-lifetime shared object: [`init`] resolves the
//! configuration, runs whichever migration direction it demands, preloads
//! the database cache, and installs the instance that [`store`] hands out.
//! [`install`] is the explicit test seam for swapping in an alternate
//! implementation; there are no other globals.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{BackendKind, StoreConfig};
use crate::error::StoreError;
use crate::migrate;
use crate::store::backends::{DatabaseStore, FilesystemStore};
use crate::store::contract::StateStore;

static INSTANCE: RwLock<Option<Arc<dyn StateStore>>> = RwLock::new(None);

/// Initializes the store from the process environment.
pub async fn init() -> Result<Arc<dyn StateStore>, StoreError> {
    init_with(StoreConfig::from_env()?).await
}

/// Initializes the store from an explicit configuration and installs the
/// process-wide instance.
pub async fn init_with(config: StoreConfig) -> Result<Arc<dyn StateStore>, StoreError> {
    let store: Arc<dyn StateStore> = match config.backend {
        BackendKind::Database => {
            // resolve() guarantees a URL when the database backend is picked.
            let url = config.db_url.as_deref().ok_or_else(|| {
                StoreError::InvalidConfig("database backend without a URL".to_string())
            })?;

            let db = DatabaseStore::connect(url).await?;
            let report =
                migrate::import_state_dir(db.pool(), &config.state_dir, &config.home).await?;
            if !report.complete() {
                tracing::warn!(
                    failed = report.failed,
                    "filesystem import incomplete; it will retry on next startup"
                );
            }
            db.ensure_preloaded().await?;
            Arc::new(db)
        }
        BackendKind::Filesystem => {
            // A lingering database URL means we downgraded: restore rows to
            // disk before serving. A dead database only delays the restore
            // until the next startup; it never blocks the filesystem backend.
            if let Some(url) = &config.db_url {
                match DatabaseStore::connect(url).await {
                    Ok(db) => {
                        if let Err(err) =
                            migrate::export_to_state_dir(db.pool(), &config.state_dir, &config.home)
                                .await
                        {
                            tracing::warn!(error = %err, "database export failed; will retry on next startup");
                        }
                        db.close().await?;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "database unreachable; skipping export");
                    }
                }
            }
            Arc::new(FilesystemStore::new(config.home.clone()))
        }
    };

    install(Arc::clone(&store));
    Ok(store)
}

/// Returns the installed process-wide instance.
pub fn store() -> Result<Arc<dyn StateStore>, StoreError> {
    INSTANCE.read().clone().ok_or(StoreError::NotInitialized)
}

/// Installs (or replaces) the process-wide instance. Called by [`init_with`];
/// also the seam tests use to substitute their own store.
pub fn install(store: Arc<dyn StateStore>) {
    *INSTANCE.write() = Some(store);
}

/// Durability barrier on the installed instance.
pub async fn flush() -> Result<(), StoreError> {
    store()?.flush().await
}

/// Flushes and releases the installed instance.
pub async fn close() -> Result<(), StoreError> {
    let taken = INSTANCE.write().take();
    match taken {
        Some(store) => store.close().await,
        None => Ok(()),
    }
}
