//! Bidirectional state transfer between the filesystem and the database.
//!
//! Both directions are idempotent and restart-safe: a sentinel (a reserved
//! database row, or a marker file in the state directory) records full
//! completion, and it is written only when *every* document transferred.
//! A partial run leaves the sentinel absent so the next startup retries.
//! Neither direction ever overwrites pre-existing data on the target, so
//! racing against another process booting simultaneously is safe.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::PgPool;
use walkdir::WalkDir;

use crate::error::StoreError;
use crate::json_io;
use crate::keys;

/// Reserved database row marking a completed filesystem import.
pub const FS_TO_DB_SENTINEL_KEY: &str = "_migration/fs-to-db";

/// Marker file (relative to the state directory) for a completed export.
pub const DB_TO_FS_MARKER: &str = ".migrated-from-db";

/// Directory basenames that hold scratch or bulk data, never store state.
const EXCLUDED_DIRS: &[&str] = &["workspace", "sessions", "media", "logs", "node_modules"];

/// Per-workspace scratch directories.
const EXCLUDED_DIR_PREFIX: &str = "workspace-";

/// Sidecar and staging files that accompany real documents.
const EXCLUDED_SUFFIXES: &[&str] = &[".bak", ".tmp", ".lock"];

/// Outcome of one transfer run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    /// Candidate documents discovered on the source.
    pub total: usize,
    /// Documents written to the target.
    pub transferred: usize,
    /// Documents skipped because the target already had them.
    pub skipped: usize,
    /// Documents that could not be read or written.
    pub failed: usize,
}

impl TransferReport {
    /// Whether the run completed without failures (and thus wrote the
    /// sentinel).
    #[must_use]
    pub fn complete(&self) -> bool {
        self.failed == 0
    }
}

/// Imports the state directory into the database (upgrade direction).
///
/// Pre-existing rows win (`ON CONFLICT DO NOTHING`); unreadable files are
/// skipped with a warning and counted as failed. The sentinel row is written
/// only on a clean run.
pub async fn import_state_dir(
    pool: &PgPool,
    state_dir: &Path,
    home: &Path,
) -> Result<TransferReport, StoreError> {
    let already: Option<i32> = sqlx::query_scalar("SELECT 1 FROM kv WHERE key = $1")
        .bind(FS_TO_DB_SENTINEL_KEY)
        .fetch_optional(pool)
        .await?;
    if already.is_some() {
        tracing::debug!("filesystem import already completed; skipping");
        return Ok(TransferReport::default());
    }

    let home_str = home.to_string_lossy();
    let files = collect_state_files(state_dir);
    let mut report = TransferReport {
        total: files.len(),
        ..TransferReport::default()
    };

    for path in files {
        let doc = match json_io::load_json(&path) {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                // Vanished between enumeration and read.
                report.skipped += 1;
                continue;
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable state file");
                report.failed += 1;
                continue;
            }
        };

        let key = keys::normalize(&path.to_string_lossy(), &home_str);
        let outcome = sqlx::query(
            "INSERT INTO kv (key, data) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING",
        )
        .bind(&key)
        .bind(&doc)
        .execute(pool)
        .await;

        match outcome {
            Ok(done) if done.rows_affected() == 0 => report.skipped += 1,
            Ok(_) => report.transferred += 1,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "failed to import state file");
                report.failed += 1;
            }
        }
    }

    if report.complete() {
        sqlx::query("INSERT INTO kv (key, data) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING")
            .bind(FS_TO_DB_SENTINEL_KEY)
            .bind(sentinel_payload(report.transferred))
            .execute(pool)
            .await?;
    }

    tracing::info!(
        migrated = report.transferred,
        total = report.total,
        skipped = report.skipped,
        failed = report.failed,
        "filesystem import finished"
    );
    Ok(report)
}

/// Exports database rows back onto the filesystem (downgrade direction).
///
/// Existing files are never overwritten. Keys that are absolute paths of a
/// different OS family cannot be re-anchored here and are rejected with an
/// error rather than guessed at. The marker file is written only on a clean
/// run.
pub async fn export_to_state_dir(
    pool: &PgPool,
    state_dir: &Path,
    home: &Path,
) -> Result<TransferReport, StoreError> {
    let marker = state_dir.join(DB_TO_FS_MARKER);
    if marker.exists() {
        tracing::debug!("database export already completed; skipping");
        return Ok(TransferReport::default());
    }

    let rows: Vec<(String, Value)> =
        sqlx::query_as("SELECT key, data FROM kv WHERE key NOT LIKE '_migration/%'")
            .fetch_all(pool)
            .await?;

    let mut report = TransferReport {
        total: rows.len(),
        ..TransferReport::default()
    };

    for (key, doc) in rows {
        if keys::foreign_absolute(&key) {
            tracing::warn!(
                key = %key,
                "key is an absolute path from a different OS family; refusing to restore"
            );
            report.failed += 1;
            continue;
        }

        let target = keys::materialize(&key, home);
        if target.exists() {
            report.skipped += 1;
            continue;
        }

        match json_io::save_json(&target, &doc) {
            Ok(()) => report.transferred += 1,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "failed to restore state file");
                report.failed += 1;
            }
        }
    }

    if report.complete() {
        json_io::save_json(&marker, &sentinel_payload(report.transferred))?;
    }

    tracing::info!(
        restored = report.transferred,
        total = report.total,
        skipped = report.skipped,
        failed = report.failed,
        "database export finished"
    );
    Ok(report)
}

fn sentinel_payload(count: usize) -> Value {
    json!({
        "migratedAt": Utc::now().to_rfc3339(),
        "count": count,
    })
}

/// Enumerates candidate `*.json` documents under the state directory,
/// pruning scratch/bulk directories and sidecar files.
fn collect_state_files(state_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(state_dir)
        .into_iter()
        .filter_entry(|entry| !prune_dir(entry))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| wanted_document(&entry.file_name().to_string_lossy()))
        .map(walkdir::DirEntry::into_path)
        .collect()
}

fn prune_dir(entry: &walkdir::DirEntry) -> bool {
    if !entry.file_type().is_dir() || entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    EXCLUDED_DIRS.contains(&name.as_ref()) || name.starts_with(EXCLUDED_DIR_PREFIX)
}

fn wanted_document(name: &str) -> bool {
    name.ends_with(".json") && !EXCLUDED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}
