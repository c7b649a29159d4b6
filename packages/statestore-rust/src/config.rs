//! Backend selection and state-directory configuration.
//!
//! One environment variable picks the backend. An unrecognized value is a
//! fatal configuration error, and so is selecting the database backend
//! without a connection URL: silently falling through to a different
//! backend would scatter a user's state across two stores.

use std::env;
use std::path::PathBuf;

use crate::error::StoreError;

/// Selects the backend: `fs` / `filesystem` / unset, or `database` / `db`.
pub const ENV_DATASTORE: &str = "OPENCLAW_DATASTORE";

/// `PostgreSQL` connection string; required for the database backend.
pub const ENV_STATE_DB_URL: &str = "OPENCLAW_STATE_DB_URL";

/// Optional override of the state directory root.
pub const ENV_STATE_DIR: &str = "OPENCLAW_STATE_DIR";

const DEFAULT_STATE_SUBDIR: &str = ".openclaw";

/// Which backend serves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// One JSON document per file under the state directory.
    Filesystem,
    /// A single `kv` table behind a write-through cache.
    Database,
}

impl BackendKind {
    /// Resolves the backend from a raw `OPENCLAW_DATASTORE` value.
    ///
    /// Unset (or blank, which is how shells express "unset") means
    /// filesystem, even when a database URL happens to be present.
    pub fn resolve(raw: Option<&str>) -> Result<Self, StoreError> {
        let Some(raw) = raw else {
            return Ok(Self::Filesystem);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "fs" | "filesystem" => Ok(Self::Filesystem),
            "db" | "database" => Ok(Self::Database),
            other => Err(StoreError::InvalidConfig(format!(
                "unrecognized {ENV_DATASTORE} value {other:?} (expected fs, filesystem, db, or database)"
            ))),
        }
    }
}

/// Resolved store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Backend the process runs on.
    pub backend: BackendKind,
    /// The user's home directory; anchor for relative storage keys.
    pub home: PathBuf,
    /// Root of the on-disk state tree (default `~/.openclaw`).
    pub state_dir: PathBuf,
    /// Database URL, when configured. Present on the filesystem backend too
    /// while a downgrade migration is still pending.
    pub db_url: Option<String>,
}

impl StoreConfig {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self, StoreError> {
        let home = home_dir()?;
        Self::resolve(
            env::var(ENV_DATASTORE).ok().as_deref(),
            env::var(ENV_STATE_DB_URL).ok().as_deref(),
            env::var(ENV_STATE_DIR).ok().as_deref(),
            home,
        )
    }

    /// Pure resolution from raw values; the testable core of
    /// [`from_env`](Self::from_env).
    pub fn resolve(
        datastore: Option<&str>,
        db_url: Option<&str>,
        state_dir: Option<&str>,
        home: PathBuf,
    ) -> Result<Self, StoreError> {
        let backend = BackendKind::resolve(datastore)?;
        let db_url = db_url
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string);

        if backend == BackendKind::Database && db_url.is_none() {
            return Err(StoreError::InvalidConfig(format!(
                "{ENV_DATASTORE} selects the database backend but {ENV_STATE_DB_URL} is not set"
            )));
        }

        let state_dir = match state_dir.map(str::trim).filter(|dir| !dir.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => home.join(DEFAULT_STATE_SUBDIR),
        };

        Ok(Self {
            backend,
            home,
            state_dir,
            db_url,
        })
    }
}

fn home_dir() -> Result<PathBuf, StoreError> {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or_else(|| {
            StoreError::InvalidConfig(
                "cannot locate the home directory (HOME / USERPROFILE unset)".to_string(),
            )
        })
}
