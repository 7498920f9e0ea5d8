//! Scoped scratch directories.
//!
//! [`TempWorkingDir`] moves the process into a fresh directory for the
//! duration of a job. [`CacheTmpPath`] is a private staging directory inside a
//! cache location, announced to other sweeps by a sibling `.lock` marker.
//! Both clean up on drop, on every exit path.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::warn;

use crate::Result;
use crate::utils::fs::{ensure_dir_all_sync, io_error};

/// Extension of claim and staging markers.
pub const LOCK_EXTENSION: &str = "lock";

/// Prefix of staging directories created inside cache locations.
pub const STAGING_PREFIX: &str = ".sweep-";

/// Process working directory switched to a fresh temporary directory.
///
/// The working directory is process-wide: only one guard may be alive at a
/// time in a process.
#[derive(Debug)]
pub struct TempWorkingDir {
    previous: PathBuf,
    path: PathBuf,
    dir: Option<TempDir>,
}

impl TempWorkingDir {
    /// Enter a fresh directory under the system temp directory.
    pub fn enter() -> Result<Self> {
        Self::enter_in(&std::env::temp_dir())
    }

    pub fn enter_in(parent: &Path) -> Result<Self> {
        let previous = std::env::current_dir()
            .map_err(|e| io_error("reading current directory", Path::new("."), e))?;
        ensure_dir_all_sync(parent)?;

        let dir = tempfile::Builder::new()
            .prefix("job-")
            .tempdir_in(parent)
            .map_err(|e| io_error("creating temporary directory in", parent, e))?;
        let path = dir
            .path()
            .canonicalize()
            .map_err(|e| io_error("resolving", dir.path(), e))?;
        std::env::set_current_dir(&path).map_err(|e| io_error("entering", &path, e))?;

        Ok(Self {
            previous,
            path,
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn previous(&self) -> &Path {
        &self.previous
    }
}

impl Drop for TempWorkingDir {
    fn drop(&mut self) {
        if let Err(e) = std::env::set_current_dir(&self.previous) {
            warn!(
                "Failed to restore working directory {}: {}",
                self.previous.display(),
                e
            );
        }
        if let Some(dir) = self.dir.take()
            && let Err(e) = dir.close()
        {
            warn!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

/// `<path>.lock`
pub fn marker_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(LOCK_EXTENSION);
    PathBuf::from(name)
}

/// Staging directory inside a cache location plus its `<dir>.lock` marker.
#[derive(Debug)]
pub struct CacheTmpPath {
    dir: Option<TempDir>,
    path: PathBuf,
    marker: PathBuf,
}

impl CacheTmpPath {
    pub fn new(base_dir: &Path) -> Result<Self> {
        ensure_dir_all_sync(base_dir)?;
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(base_dir)
            .map_err(|e| io_error("creating staging directory in", base_dir, e))?;
        let path = dir.path().to_path_buf();
        let marker = marker_path(&path);
        std::fs::write(&marker, chrono::Utc::now().to_rfc3339())
            .map_err(|e| io_error("writing", &marker, e))?;

        Ok(Self {
            dir: Some(dir),
            path,
            marker,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }
}

impl Drop for CacheTmpPath {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take()
            && let Err(e) = dir.close()
        {
            warn!("Failed to remove staging directory {}: {}", self.path.display(), e);
        }
        if let Err(e) = std::fs::remove_file(&self.marker)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to remove {}: {}", self.marker.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial(cwd)]
    fn test_working_dir_restored_and_removed() {
        let parent = TempDir::new().unwrap();
        let before = std::env::current_dir().unwrap();

        let path = {
            let guard = TempWorkingDir::enter_in(parent.path()).unwrap();
            assert_eq!(std::env::current_dir().unwrap(), guard.path());
            std::fs::write("artifact.bin", b"x").unwrap();
            assert!(guard.path().join("artifact.bin").exists());
            guard.path().to_path_buf()
        };

        assert_eq!(std::env::current_dir().unwrap(), before);
        assert!(!path.exists());
    }

    #[test]
    #[serial(cwd)]
    fn test_working_dir_restored_on_panic() {
        let parent = TempDir::new().unwrap();
        let before = std::env::current_dir().unwrap();
        let parent_path = parent.path().to_path_buf();

        let result = std::panic::catch_unwind(move || {
            let _guard = TempWorkingDir::enter_in(&parent_path).unwrap();
            panic!("adaptor blew up");
        });

        assert!(result.is_err());
        assert_eq!(std::env::current_dir().unwrap(), before);
        assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_cache_tmp_path_marker() {
        let base = TempDir::new().unwrap();
        let (path, marker) = {
            let tmp = CacheTmpPath::new(base.path()).unwrap();
            assert!(tmp.path().is_dir());
            assert!(tmp.marker().is_file());
            assert_eq!(tmp.marker(), marker_path(tmp.path()));
            let name = tmp.path().file_name().unwrap().to_str().unwrap();
            assert!(name.starts_with(STAGING_PREFIX));
            (tmp.path().to_path_buf(), tmp.marker().to_path_buf())
        };
        assert!(!path.exists());
        assert!(!marker.exists());
    }
}
