//! Cross-process file lock for read-modify-write on a single document.
//!
//! The lock is a sibling `<path>.lock` file created with `create_new`, which
//! is atomic on every filesystem the store targets. The lock file records the
//! owning pid and acquisition time; a lock older than the staleness bound is
//! assumed to belong to a dead process and is broken.
//!
//! Release happens in `Drop`, so the lock is returned on every exit path,
//! including panics inside the critical section.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::json_io;

/// Maximum acquisition attempts before reporting [`StoreError::LockTimeout`].
const MAX_ATTEMPTS: u32 = 10;

/// First backoff delay; doubles per attempt.
const BACKOFF_MIN: Duration = Duration::from_millis(100);

/// Backoff ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// A lock held longer than this is considered abandoned and may be broken.
const STALE_AFTER: Duration = Duration::from_secs(30);

/// Contents of a lock file, for staleness checks and post-mortem debugging.
#[derive(Debug, Serialize, Deserialize)]
struct LockStamp {
    pid: u32,
    acquired_at_millis: u64,
}

/// Exclusive advisory lock on a target path.
///
/// Guarantees inter-process mutual exclusion on the document the path names.
/// The lock is released when the guard is dropped.
#[derive(Debug)]
pub struct PathLock {
    lock_path: PathBuf,
}

impl PathLock {
    /// Acquires the lock for `target`, retrying with exponential backoff and
    /// jitter, and breaking stale locks along the way.
    pub async fn acquire(target: &Path) -> Result<Self, StoreError> {
        let lock_path = json_io::sibling_with_suffix(target, ".lock");

        for attempt in 0..MAX_ATTEMPTS {
            match Self::try_create(&lock_path) {
                Ok(lock) => return Ok(lock),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if Self::break_if_stale(&lock_path) {
                        // Holder is gone; retry immediately.
                        continue;
                    }
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(err) => return Err(StoreError::io(&lock_path, err)),
            }
        }

        Err(StoreError::LockTimeout {
            path: lock_path,
            attempts: MAX_ATTEMPTS,
        })
    }

    fn try_create(lock_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)?;

        let stamp = LockStamp {
            pid: process::id(),
            acquired_at_millis: now_millis(),
        };
        // Stamp write failures do not invalidate the lock itself; the file
        // existing is what excludes other processes.
        if let Ok(body) = serde_json::to_vec(&stamp) {
            let _ = file.write_all(&body);
        }

        Ok(Self {
            lock_path: lock_path.to_path_buf(),
        })
    }

    /// Removes the lock file if its holder has clearly abandoned it.
    ///
    /// Returns `true` if the lock was broken. Staleness is judged from the
    /// acquisition stamp inside the file, falling back to the file's mtime
    /// when the stamp is unreadable.
    fn break_if_stale(lock_path: &Path) -> bool {
        let age = lock_age(lock_path);
        match age {
            Some(age) if age > STALE_AFTER => {
                tracing::warn!(
                    lock = %lock_path.display(),
                    age_secs = age.as_secs(),
                    "breaking stale lock"
                );
                // Racing breakers are fine: only one unlink wins, and the
                // winner still has to go through create_new.
                fs::remove_file(lock_path).is_ok()
            }
            _ => false,
        }
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.lock_path) {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(
                    lock = %self.lock_path.display(),
                    error = %err,
                    "failed to release lock file"
                );
            }
        }
    }
}

/// Exponential backoff with full jitter: uniform over `[delay/2, delay]`.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_MIN.saturating_mul(1_u32 << attempt.min(16));
    let capped = exp.min(BACKOFF_MAX);
    let half = capped / 2;
    half + rand::rng().random_range(Duration::ZERO..=half)
}

fn lock_age(lock_path: &Path) -> Option<Duration> {
    if let Ok(raw) = fs::read_to_string(lock_path) {
        if let Ok(stamp) = serde_json::from_str::<LockStamp>(&raw) {
            return Some(Duration::from_millis(
                now_millis().saturating_sub(stamp.acquired_at_millis),
            ));
        }
    }
    let modified = fs::metadata(lock_path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Milliseconds since the Unix epoch.
fn now_millis() -> u64 {
    // Millisecond timestamps fit in u64 far beyond any plausible uptime.
    #[allow(clippy::cast_possible_truncation)]
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    millis
}
