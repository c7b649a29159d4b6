//! The store contract consumed by every call site.
//!
//! Defines [`StateStore`], the pluggable persistence seam of the runtime.
//! Implementations: filesystem (one JSON document per file) and `PostgreSQL`
//! (single `kv` table behind a write-through cache).
//!
//! Reads are synchronous and non-suspending on both backends so callers can
//! treat state as cheap local memory. Writes return once the new value is
//! observable to readers in this process; on the database backend durability
//! is deferred until [`flush`](StateStore::flush).

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;

/// Outcome of an updater closure passed to
/// [`update_json_with_lock`](StateStore::update_json_with_lock).
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateDecision {
    /// Leave the document as observed: no durable write, no cache change.
    Keep,
    /// Persist this document atomically in place of the observed one.
    Write(Value),
}

/// Result of a read that distinguishes *absent* from *present*.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackRead {
    /// The stored document, or the caller's fallback when absent.
    pub value: Value,
    /// Whether the key actually existed.
    pub exists: bool,
}

/// Read-modify-write closure for [`update_json_with_lock`](StateStore::update_json_with_lock).
///
/// Observes a snapshot no concurrent update can have interleaved against
/// (`None` when the key does not exist) and decides what to persist. Must be
/// pure with respect to external state: it may run while a cross-process
/// lock or database transaction is held.
///
/// Boxed `dyn FnOnce` rather than a generic parameter so the trait stays
/// object-safe behind `Arc<dyn StateStore>`.
pub type JsonUpdater = Box<dyn FnOnce(Option<Value>) -> anyhow::Result<UpdateDecision> + Send>;

/// Pluggable key-value state store.
///
/// Keys are storage keys as produced by [`crate::keys::normalize`]: relative
/// to the user's home directory when the state lives under it, absolute
/// otherwise. Documents are opaque JSON values; the store never inspects
/// them. The key prefix `_migration/` is reserved for the store itself.
///
/// Used as `Arc<dyn StateStore>`.
#[async_trait]
pub trait StateStore: Send + Sync {
    // --- Reads (synchronous, non-suspending) ---

    /// Reads a document with strict JSON semantics.
    ///
    /// Absent key is `Ok(None)`. A document that exists but cannot be parsed
    /// strictly is [`StoreError::Corrupt`].
    fn read_json(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Reads a document tolerating JSON5 syntax.
    ///
    /// Only meaningful on the filesystem backend, where human-edited files
    /// live; the database backend stores strict JSON and treats this as
    /// [`read_json`](Self::read_json).
    fn read_json5(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Reads a plain-text document. Absent key is `Ok(None)`.
    fn read_text(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Reads a document, distinguishing *absent* from *present*.
    fn read_json_with_fallback(
        &self,
        key: &str,
        fallback: Value,
    ) -> Result<FallbackRead, StoreError> {
        Ok(match self.read_json(key)? {
            Some(value) => FallbackRead {
                value,
                exists: true,
            },
            None => FallbackRead {
                value: fallback,
                exists: false,
            },
        })
    }

    // --- Writes ---

    /// Persists a document under `key`.
    ///
    /// Returns once the write is observable to readers in this process.
    /// Filesystem: the file is on disk. Database: the cache holds the new
    /// value and the upsert is queued on the per-key write chain; await
    /// [`flush`](Self::flush) for durability.
    async fn write_json(&self, key: &str, doc: &Value) -> Result<(), StoreError>;

    /// [`write_json`](Self::write_json), keeping a `<file>.bak` sidecar on
    /// the filesystem backend. The database backend has no sidecar notion
    /// and treats this as a plain write.
    async fn write_json_with_backup(&self, key: &str, doc: &Value) -> Result<(), StoreError>;

    /// Persists a plain string under `key`.
    async fn write_text(&self, key: &str, content: &str) -> Result<(), StoreError>;

    // --- Update protocol ---

    /// Atomic read-modify-write on a single key.
    ///
    /// The sole correctness pillar for multi-writer state. The updater runs
    /// exactly once per successful invocation under per-key mutual exclusion
    /// that holds across processes; unrelated keys proceed in parallel.
    /// Malformed existing state surfaces as [`StoreError::Corrupt`] and is
    /// never silently treated as empty. Updater failure aborts with no
    /// persistent effect.
    ///
    /// Returns the post-call document (`None` when the key did not exist and
    /// the updater kept it that way).
    async fn update_json_with_lock(
        &self,
        key: &str,
        updater: JsonUpdater,
    ) -> Result<Option<Value>, StoreError>;

    // --- Deletion ---

    /// Removes a document. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    // --- Durability and lifecycle ---

    /// Durability barrier: resolves once every previously issued write and
    /// delete is durable. A no-op on the filesystem backend, where writes
    /// are synchronous.
    async fn flush(&self) -> Result<(), StoreError>;

    /// Flushes pending work and releases backend resources.
    async fn close(&self) -> Result<(), StoreError>;
}
