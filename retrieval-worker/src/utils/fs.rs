//! Filesystem helpers shared across modules.
//!
//! Every helper attaches the operation and path to IO failures so callers can
//! propagate with `?` without losing context.

use std::io::ErrorKind;
use std::path::Path;

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error("creating directory", path, e))
}

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    ensure_dir_all(parent).await
}

/// Ensure a directory exists (synchronous variant).
pub fn ensure_dir_all_sync(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error("creating directory", path, e))
}

/// Move a file into place, falling back to copy + remove when `rename` crosses
/// a filesystem boundary.
pub async fn move_file(from: &Path, to: &Path) -> Result<()> {
    ensure_parent_dir(to).await?;
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            tokio::fs::copy(from, to)
                .await
                .map_err(|e| io_error("copying file", to, e))?;
            tokio::fs::remove_file(from)
                .await
                .map_err(|e| io_error("removing file", from, e))
        }
        Err(e) => Err(io_error("moving file", from, e)),
    }
}

/// Remove a file or a directory tree. A path that is already gone is not an
/// error and yields `false`.
pub async fn remove_path(path: &Path) -> Result<bool> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(io_error("reading metadata of", path, e)),
    };

    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error("removing", path, e)),
    }
}

/// Total size in bytes of a file, or of every regular file under a directory.
pub fn path_size_sync(path: &Path) -> Result<u64> {
    let meta = std::fs::symlink_metadata(path).map_err(|e| io_error("reading metadata of", path, e))?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }

    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| {
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walk error"));
            io_error("walking", path, source)
        })?;
        if entry.file_type().is_file() {
            total += entry
                .metadata()
                .map(|m| m.len())
                .unwrap_or_default();
        }
    }
    Ok(total)
}
