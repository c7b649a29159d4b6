//! Storage-key normalization and stable advisory-lock ids.
//!
//! Call sites address state by absolute filesystem path. [`normalize`] maps
//! those paths to portable storage keys: paths under the user's home
//! directory become relative keys (so the same profile moves between hosts),
//! everything else stays absolute. [`materialize`] is the reverse mapping
//! used when restoring database rows back onto a filesystem.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Largest integer losslessly representable in an IEEE-754 double (2^53 - 1).
///
/// Advisory lock ids stay below this bound so they survive drivers that
/// cannot transmit full 64-bit integers.
const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Maps a call-site path to its portable storage key.
///
/// If `key` lies under `home` (matched on exact `home`, `home/…`, or
/// `home\…`), the home prefix *and* one following separator are stripped,
/// yielding a relative key such as `.openclaw/credentials/auth.json`.
/// Any other path is kept verbatim. Both `/` and `\` are accepted as the
/// home-boundary separator so keys written on one OS family normalize the
/// same way on another.
#[must_use]
pub fn normalize(key: &str, home: &str) -> String {
    if let Some(rest) = key.strip_prefix(home) {
        if rest.is_empty() {
            return String::new();
        }
        if let Some(relative) = rest.strip_prefix('/').or_else(|| rest.strip_prefix('\\')) {
            return relative.to_string();
        }
        // Shares a string prefix with home but not a path boundary
        // (e.g. /home/user2 under home /home/user): keep it absolute.
    }
    key.to_string()
}

/// Maps a storage key back to a concrete filesystem path.
///
/// Absolute keys are used verbatim; relative keys are re-anchored under the
/// current `home`.
#[must_use]
pub fn materialize(storage_key: &str, home: &Path) -> PathBuf {
    let path = Path::new(storage_key);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        home.join(path)
    }
}

/// Whether a storage key is an absolute path of a *different* OS family.
///
/// Such keys arise when state was persisted outside `home` on another host;
/// they cannot be restored here without guessing a layout, so restore paths
/// refuse them with a clear error.
#[must_use]
pub fn foreign_absolute(storage_key: &str) -> bool {
    if cfg!(windows) {
        // A Unix-rooted key has no meaningful anchor on Windows.
        storage_key.starts_with('/')
    } else {
        // Drive-letter (`C:\…`) and UNC (`\\host\…`) keys have no meaningful
        // anchor on Unix.
        let bytes = storage_key.as_bytes();
        let drive_rooted = bytes.len() >= 3
            && bytes[0].is_ascii_alphabetic()
            && bytes[1] == b':'
            && (bytes[2] == b'\\' || bytes[2] == b'/');
        drive_rooted || storage_key.starts_with("\\\\")
    }
}

/// Derives a deterministic advisory-lock id for a storage key.
///
/// First 8 bytes of SHA-256(key) interpreted as a signed 64-bit big-endian
/// integer, absolute value, modulo [`MAX_SAFE_INTEGER`]. Well-distributed
/// across arbitrary keys and stable across processes and hosts.
#[must_use]
pub fn stable_lock_id(key: &str) -> i64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut head = [0_u8; 8];
    head.copy_from_slice(&digest[..8]);
    let raw = i64::from_be_bytes(head);
    // unsigned_abs avoids the i64::MIN overflow that abs() would hit.
    #[allow(clippy::cast_possible_wrap)]
    let id = (raw.unsigned_abs() % MAX_SAFE_INTEGER) as i64;
    id
}
