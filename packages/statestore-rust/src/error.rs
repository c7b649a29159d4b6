//! Error taxonomy for the state store.
//!
//! Absence is not an error: reads return `None` (or a fallback) for keys that
//! were never written. Everything that *is* an error falls into one of the
//! variants below, so callers can distinguish a malformed document from a
//! broken transport or a misconfigured process.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the store contract and its supporting machinery.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed JSON on a strict read or update path.
    ///
    /// Strict paths never heal a corrupt document into "empty"; the operation
    /// stops so an updater cannot overwrite data it failed to read.
    #[error("corrupt document at {key}")]
    Corrupt {
        /// Storage key (or path) of the offending document.
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Bad `OPENCLAW_DATASTORE` value, or the database backend selected
    /// without a connection URL. Fatal at startup.
    #[error("invalid datastore configuration: {0}")]
    InvalidConfig(String),

    /// The cross-process file lock could not be acquired within the retry
    /// budget.
    #[error("could not lock {path} after {attempts} attempts")]
    LockTimeout {
        /// Path the lock protects.
        path: PathBuf,
        /// Number of acquisition attempts made before giving up.
        attempts: u32,
    },

    /// A database query or transaction failed.
    #[error("datastore transport failure")]
    Transport(#[from] sqlx::Error),

    /// A filesystem operation failed for a reason other than absence.
    #[error("datastore i/o failure at {path}")]
    Io {
        /// Path of the failing operation.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The caller-supplied updater returned an error. Nothing was written;
    /// on the database backend the transaction was rolled back.
    #[error("update aborted for {key}")]
    UpdateAborted {
        /// Key the update targeted.
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// `runtime::store()` was called before `runtime::init()`.
    #[error("state store not initialized")]
    NotInitialized,
}

impl StoreError {
    /// Wraps a filesystem error with the path it occurred at.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps a strict-parse failure with the key (or path) it occurred at.
    pub(crate) fn corrupt(key: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Corrupt {
            key: key.into(),
            source: source.into(),
        }
    }
}
