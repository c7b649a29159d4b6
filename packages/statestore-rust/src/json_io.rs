//! Atomic JSON file I/O for the filesystem backend and the migrator.
//!
//! Writes go to a temporary sibling first and land via rename, so a crash
//! mid-write never leaves a half-written document behind. Parent directories
//! are created with mode `0o700`: everything under the state directory is
//! per-user data.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process;

use rand::Rng;
use serde_json::Value;

use crate::error::StoreError;

/// Loads a document with a strict JSON parse.
///
/// Absent file is `Ok(None)`; a file that exists but does not parse is
/// [`StoreError::Corrupt`].
pub fn load_json(path: &Path) -> Result<Option<Value>, StoreError> {
    let Some(raw) = read_if_present(path)? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| StoreError::corrupt(path.display().to_string(), err))
}

/// Loads a document, tolerating JSON5 syntax.
///
/// Tries a strict JSON parse first, then JSON5. If both fail the error
/// carries the *strict* parse failure as its cause, since that is the format
/// the store writes. Only meant for human-editable files.
pub fn load_json_lenient(path: &Path) -> Result<Option<Value>, StoreError> {
    let Some(raw) = read_if_present(path)? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(doc) => Ok(Some(doc)),
        Err(strict_err) => match json5::from_str::<Value>(&raw) {
            Ok(doc) => Ok(Some(doc)),
            Err(_) => Err(StoreError::corrupt(path.display().to_string(), strict_err)),
        },
    }
}

/// Loads a file's contents verbatim. Absent file is `Ok(None)`.
pub fn load_text(path: &Path) -> Result<Option<String>, StoreError> {
    read_if_present(path)
}

/// Persists a document atomically: temp sibling, then rename over the target.
pub fn save_json(path: &Path, doc: &Value) -> Result<(), StoreError> {
    let mut body = serde_json::to_vec_pretty(doc)
        .map_err(|err| StoreError::corrupt(path.display().to_string(), err))?;
    body.push(b'\n');
    atomic_write(path, &body)
}

/// [`save_json`], then a best-effort copy to `<path>.bak`.
///
/// The backup exists for manual recovery only; a failed copy is logged and
/// swallowed.
pub fn save_json_with_backup(path: &Path, doc: &Value) -> Result<(), StoreError> {
    save_json(path, doc)?;
    let backup = sibling_with_suffix(path, ".bak");
    if let Err(err) = fs::copy(path, &backup) {
        tracing::warn!(
            path = %path.display(),
            error = %err,
            "backup copy failed; primary write already landed"
        );
    }
    Ok(())
}

/// Writes a string verbatim, atomically.
pub fn save_text(path: &Path, content: &str) -> Result<(), StoreError> {
    atomic_write(path, content.as_bytes())
}

/// Appends `suffix` to the full file name (`auth.json` -> `auth.json.bak`).
pub(crate) fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn read_if_present(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

fn atomic_write(path: &Path, body: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        create_dir_private(parent).map_err(|err| StoreError::io(parent, err))?;
    }

    // Temp name carries pid + random bytes so concurrent writers of the same
    // target never collide on the staging file.
    let temp = sibling_with_suffix(
        path,
        &format!(".{}.{:08x}.tmp", process::id(), rand::rng().random::<u32>()),
    );
    fs::write(&temp, body).map_err(|err| StoreError::io(&temp, err))?;
    fs::rename(&temp, path).map_err(|err| {
        let _ = fs::remove_file(&temp);
        StoreError::io(path, err)
    })
}

#[cfg(unix)]
fn create_dir_private(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    match fs::DirBuilder::new().recursive(true).mode(0o700).create(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(not(unix))]
fn create_dir_private(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}
