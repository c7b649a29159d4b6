//! OpenClaw state store — pluggable JSON document storage with filesystem
//! and `PostgreSQL` backends behind one contract.
//!
//! Call sites (sandbox registries, pairing store, cron store, telegram
//! offsets, restart sentinels) read and write small JSON documents through
//! [`StateStore`]. Reads are synchronous on both backends; the database
//! backend serves them from a write-through cache preloaded at startup and
//! persists on per-key ordered background tasks, with
//! [`StateStore::flush`] as the durability barrier.
//! [`StateStore::update_json_with_lock`] is the atomic read-modify-write
//! primitive for multi-writer state.

pub mod config;
pub mod error;
pub mod json_io;
pub mod keys;
pub mod migrate;
pub mod path_lock;
pub mod runtime;
pub mod store;

pub use config::{BackendKind, StoreConfig};
pub use error::StoreError;
pub use store::backends::{DatabaseStore, FilesystemStore};
pub use store::contract::{FallbackRead, JsonUpdater, StateStore, UpdateDecision};
