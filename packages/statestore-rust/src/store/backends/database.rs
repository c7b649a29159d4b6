//! `PostgreSQL` implementation of the store contract.
//!
//! Documents live in a single `kv` table; the process serves reads out of a
//! write-through [`DashMap`] cache that is preloaded at startup. Writes and
//! deletes publish to the cache synchronously and persist on a background
//! **write chain**: a per-key serial queue of tasks that preserves issue
//! order without cross-key blocking. [`flush`](StateStore::flush) is the
//! durability barrier that awaits every queued task.
//!
//! `update_json_with_lock` deliberately bypasses the chain: it runs inside a
//! transaction holding `pg_advisory_xact_lock`, which serializes concurrent
//! updaters across processes even when the row does not exist yet
//! (`SELECT ... FOR UPDATE` only locks existing rows).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, OnceCell};
use tokio::task::JoinHandle;

use crate::error::StoreError;
use crate::keys;
use crate::migrate::schema;
use crate::store::contract::{JsonUpdater, StateStore, UpdateDecision};

const UPSERT_SQL: &str = "INSERT INTO kv (key, data, updated_at) VALUES ($1, $2, now()) \
     ON CONFLICT (key) DO UPDATE SET data = EXCLUDED.data, updated_at = now()";
const DELETE_SQL: &str = "DELETE FROM kv WHERE key = $1";
const SELECT_ONE_SQL: &str = "SELECT data FROM kv WHERE key = $1";
const SELECT_ALL_SQL: &str = "SELECT key, data FROM kv";
const SELECT_SOME_SQL: &str = "SELECT key, data FROM kv WHERE key = ANY($1)";
const ADVISORY_LOCK_SQL: &str = "SELECT pg_advisory_xact_lock($1)";

/// Marker property that wraps plain-text documents in a JSON object, since
/// the `kv` column always stores JSON.
const TEXT_MARKER: &str = "__text";

/// A queued cache mutation awaiting persistence on the write chain.
enum Mutation {
    Upsert(Arc<Value>),
    Delete,
}

struct Inner {
    pool: PgPool,
    /// Write-through cache; the only shared mutable state in the backend.
    /// Values are deep-cloned on the way in and on the way out.
    cache: DashMap<String, Arc<Value>>,
    /// Per-key chain tails. A new task swaps itself in and awaits the
    /// receiver it displaced, which serializes tasks per key in issue order.
    chain_tails: DashMap<String, oneshot::Receiver<()>>,
    /// Every not-yet-flushed write-chain task.
    pending: Mutex<Vec<JoinHandle<()>>>,
    preloaded: AtomicBool,
    preload_inflight: AtomicBool,
    preload_once: OnceCell<()>,
    /// Captured at construction so synchronous call sites can spawn
    /// background work.
    runtime: Handle,
}

/// Store backend over a `PostgreSQL` `kv` table with a write-through cache.
pub struct DatabaseStore {
    inner: Arc<Inner>,
}

impl DatabaseStore {
    /// Connects a pool, applies pending schema migrations, and builds the
    /// backend. The cache is empty until [`ensure_preloaded`](Self::ensure_preloaded)
    /// runs.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(8).connect(url).await?;
        schema::apply_migrations(&pool).await?;
        Ok(Self::with_pool(pool))
    }

    /// Builds the backend over an existing pool. The caller is responsible
    /// for having applied schema migrations.
    #[must_use]
    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                cache: DashMap::new(),
                chain_tails: DashMap::new(),
                pending: Mutex::new(Vec::new()),
                preloaded: AtomicBool::new(false),
                preload_inflight: AtomicBool::new(false),
                preload_once: OnceCell::new(),
                runtime: Handle::current(),
            }),
        }
    }

    /// The underlying pool, shared with the migrator.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    // --- Preloading ---

    /// Loads every row into the cache, replacing the current image.
    pub async fn preload_all(&self) -> Result<(), StoreError> {
        preload_all_rows(&self.inner).await
    }

    /// Targeted warm-up for a known set of keys.
    pub async fn preload(&self, keys: &[String]) -> Result<(), StoreError> {
        let rows: Vec<(String, Value)> = sqlx::query_as(SELECT_SOME_SQL)
            .bind(keys)
            .fetch_all(&self.inner.pool)
            .await?;
        for (key, doc) in rows {
            self.inner.cache.insert(key, Arc::new(doc));
        }
        Ok(())
    }

    /// Memoized [`preload_all`](Self::preload_all). Errors propagate so
    /// startup can fail fast rather than serving an empty cache.
    pub async fn ensure_preloaded(&self) -> Result<(), StoreError> {
        self.inner
            .preload_once
            .get_or_try_init(|| async { preload_all_rows(&self.inner).await })
            .await?;
        Ok(())
    }

    // --- Write chain ---

    /// Publishes a cache mutation and queues its persistence task.
    ///
    /// The chain-tail swap and the cache change happen under one per-key
    /// critical section, so chain order can never disagree with cache order.
    fn submit_mutation(&self, key: &str, mutation: Mutation) {
        let key_owned = key.to_string();
        let inner = Arc::clone(&self.inner);
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let (prev_rx, prior) = {
            let mut tail = self
                .inner
                .chain_tails
                .entry(key_owned.clone())
                .or_insert_with(completed_tail);
            let prev_rx = std::mem::replace(tail.value_mut(), done_rx);
            let prior = match &mutation {
                Mutation::Upsert(published) => self
                    .inner
                    .cache
                    .insert(key_owned.clone(), Arc::clone(published)),
                Mutation::Delete => self.inner.cache.remove(&key_owned).map(|(_, doc)| doc),
            };
            (prev_rx, prior)
        };

        let handle = self.inner.runtime.spawn(async move {
            // Wait for the predecessor on this key; a dropped sender counts
            // as completed.
            let _ = prev_rx.await;
            run_mutation(&inner, &key_owned, mutation, prior).await;
            let _ = done_tx.send(());
        });

        let mut pending = self.inner.pending.lock();
        pending.retain(|task| !task.is_finished());
        pending.push(handle);
    }
}

#[async_trait]
impl StateStore for DatabaseStore {
    // --- Reads (cache lookups) ---

    fn read_json(&self, key: &str) -> Result<Option<Value>, StoreError> {
        if let Some(entry) = self.inner.cache.get(key) {
            return Ok(Some(entry.value().as_ref().clone()));
        }
        if !self.inner.preloaded.load(Ordering::Acquire) {
            self.spawn_background_preload(key);
        }
        Ok(None)
    }

    fn read_json5(&self, key: &str) -> Result<Option<Value>, StoreError> {
        // The database stores strict JSON only.
        self.read_json(key)
    }

    fn read_text(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .inner
            .cache
            .get(key)
            .and_then(|entry| text_of(entry.value())))
    }

    // --- Writes ---

    async fn write_json(&self, key: &str, doc: &Value) -> Result<(), StoreError> {
        self.submit_mutation(key, Mutation::Upsert(Arc::new(doc.clone())));
        Ok(())
    }

    async fn write_json_with_backup(&self, key: &str, doc: &Value) -> Result<(), StoreError> {
        // Sidecar backups are a filesystem notion; the table has row history
        // in `updated_at` only.
        self.write_json(key, doc).await
    }

    async fn write_text(&self, key: &str, content: &str) -> Result<(), StoreError> {
        self.write_json(key, &json!({ TEXT_MARKER: content })).await
    }

    // --- Update protocol ---

    async fn update_json_with_lock(
        &self,
        key: &str,
        updater: JsonUpdater,
    ) -> Result<Option<Value>, StoreError> {
        let mut tx = self.inner.pool.begin().await?;

        // Serializes callers even when the row does not exist yet; the lock
        // releases at commit/rollback, matching the transactional envelope.
        sqlx::query(ADVISORY_LOCK_SQL)
            .bind(keys::stable_lock_id(key))
            .execute(&mut *tx)
            .await?;

        let current: Option<Value> = sqlx::query_scalar(SELECT_ONE_SQL)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

        let decision = updater(current.clone()).map_err(|source| StoreError::UpdateAborted {
            key: key.to_string(),
            source,
        })?;

        match decision {
            UpdateDecision::Write(next) => {
                sqlx::query(UPSERT_SQL)
                    .bind(key)
                    .bind(&next)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                self.inner
                    .cache
                    .insert(key.to_string(), Arc::new(next.clone()));
                Ok(Some(next))
            }
            UpdateDecision::Keep => {
                tx.commit().await?;
                // Reconcile the cache with the value observed under the lock.
                match &current {
                    Some(doc) => {
                        self.inner
                            .cache
                            .insert(key.to_string(), Arc::new(doc.clone()));
                    }
                    None => {
                        self.inner.cache.remove(key);
                    }
                }
                Ok(current)
            }
        }
    }

    // --- Deletion ---

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.submit_mutation(key, Mutation::Delete);
        Ok(())
    }

    // --- Durability and lifecycle ---

    async fn flush(&self) -> Result<(), StoreError> {
        let drained: Vec<JoinHandle<()>> = {
            let mut pending = self.inner.pending.lock();
            pending.drain(..).collect()
        };
        for task in drained {
            if let Err(err) = task.await {
                // The task already compensated the cache and logged; a panic
                // here only matters for diagnostics.
                tracing::warn!(error = %err, "write-chain task failed during flush");
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.flush().await?;
        self.inner.pool.close().await;
        Ok(())
    }
}

impl DatabaseStore {
    fn spawn_background_preload(&self, key: &str) {
        if self.inner.preload_inflight.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!(
            key = %key,
            "read before preload; loading all rows in the background"
        );
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            if let Err(err) = preload_all_rows(&inner).await {
                tracing::warn!(error = %err, "background preload failed");
                inner.preload_inflight.store(false, Ordering::Release);
            }
        });
    }
}

impl std::fmt::Debug for DatabaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseStore")
            .field("cached_keys", &self.inner.cache.len())
            .field("preloaded", &self.inner.preloaded.load(Ordering::Relaxed))
            .finish()
    }
}

/// Persists one queued mutation, compensating the cache on failure.
async fn run_mutation(inner: &Inner, key: &str, mutation: Mutation, prior: Option<Arc<Value>>) {
    match mutation {
        Mutation::Upsert(published) => {
            let result = sqlx::query(UPSERT_SQL)
                .bind(key)
                .bind(published.as_ref())
                .execute(&inner.pool)
                .await;
            if let Err(err) = result {
                tracing::warn!(key = %key, error = %err, "background upsert failed; compensating cache");
                match inner.cache.entry(key.to_string()) {
                    // Revert only while our clone is still the visible value;
                    // a later mutation owns the slot otherwise.
                    MapEntry::Occupied(mut slot) if Arc::ptr_eq(slot.get(), &published) => {
                        match prior {
                            Some(previous) => {
                                slot.insert(previous);
                            }
                            None => {
                                slot.remove();
                            }
                        }
                    }
                    _ => {
                        tracing::debug!(key = %key, "failed write superseded; cache left as is");
                    }
                }
            }
        }
        Mutation::Delete => {
            let result = sqlx::query(DELETE_SQL).bind(key).execute(&inner.pool).await;
            if let Err(err) = result {
                tracing::warn!(key = %key, error = %err, "background delete failed; compensating cache");
                if let Some(previous) = prior {
                    // Restore only when no later write has claimed the slot.
                    inner.cache.entry(key.to_string()).or_insert(previous);
                }
            }
        }
    }
}

async fn preload_all_rows(inner: &Inner) -> Result<(), StoreError> {
    let rows: Vec<(String, Value)> = sqlx::query_as(SELECT_ALL_SQL)
        .fetch_all(&inner.pool)
        .await?;
    inner.cache.clear();
    for (key, doc) in rows {
        inner.cache.insert(key, Arc::new(doc));
    }
    inner.preloaded.store(true, Ordering::Release);
    tracing::debug!(keys = inner.cache.len(), "state cache preloaded");
    Ok(())
}

/// A chain tail that is already complete, for a key's first mutation.
fn completed_tail() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(());
    rx
}

/// Extracts the text form of a cached document: the `__text` marker object
/// written by [`StateStore::write_text`], or a plain string entry.
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(content) => Some(content.clone()),
        Value::Object(map) => map
            .get(TEXT_MARKER)
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}
