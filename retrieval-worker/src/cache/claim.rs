//! Execution claims.
//!
//! A claim is the file `<volume root>/<key>.lock`, created exclusively by
//! the process computing `key` and removed when that computation ends. Other
//! processes wait for it to disappear.
//!
//! This is best-effort mutual exclusion: the create-if-absent is atomic on a
//! local filesystem but not on eventually consistent shared storage.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::scheduler::WorkerIdentity;
use crate::utils::fs::{ensure_dir_all_sync, io_error};
use crate::workdir::LOCK_EXTENSION;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimConfig {
    /// How often a waiter re-checks a held claim.
    pub poll_interval: Duration,
    /// Age past which a claim counts as abandoned.
    pub validity_period: Duration,
    /// Longest a waiter blocks before giving up.
    pub timeout: Duration,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            validity_period: Duration::from_secs(86_400),
            timeout: Duration::from_secs(86_400),
        }
    }
}

/// Contents of a claim file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimInfo {
    pub hostname: String,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
}

pub fn claim_path(root: &Path, key: &str) -> PathBuf {
    root.join(format!("{key}.{LOCK_EXTENSION}"))
}

/// Age of a marker file from its modification time.
pub fn marker_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}

/// Held claim. Dropping it removes the claim file.
#[derive(Debug)]
pub struct ClaimGuard {
    key: String,
    path: PathBuf,
}

impl ClaimGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(key = %self.key, "Released execution claim"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove claim {}: {}", self.path.display(), e),
        }
    }
}

/// Create the claim for `key` unless another process holds it.
pub fn try_claim(root: &Path, key: &str, identity: &WorkerIdentity) -> Result<Option<ClaimGuard>> {
    ensure_dir_all_sync(root)?;
    let path = claim_path(root, key);

    let mut file = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => return Err(io_error("creating claim", &path, e)),
    };

    // The guard exists before the write so a failed write still cleans up.
    let guard = ClaimGuard {
        key: key.to_string(),
        path,
    };
    let info = ClaimInfo {
        hostname: identity.hostname.clone(),
        pid: identity.pid,
        created_at: Utc::now(),
    };
    serde_json::to_writer(&mut file, &info)?;
    file.flush().map_err(|e| io_error("writing claim", &guard.path, e))?;

    Ok(Some(guard))
}

/// Acquire the claim for `key`, polling while another process holds it.
///
/// An abandoned claim is reported but never broken here; clearing it is the
/// janitor's job. Fails with [`Error::ClaimTimeout`] once `config.timeout`
/// has elapsed.
pub async fn acquire(
    root: &Path,
    key: &str,
    config: &ClaimConfig,
    identity: &WorkerIdentity,
) -> Result<ClaimGuard> {
    let started = Instant::now();
    let mut reported_abandoned = false;

    loop {
        if let Some(guard) = try_claim(root, key, identity)? {
            debug!(key, "Acquired execution claim");
            return Ok(guard);
        }

        let waited = started.elapsed();
        if waited >= config.timeout {
            return Err(Error::ClaimTimeout {
                key: key.to_string(),
                waited,
            });
        }

        let path = claim_path(root, key);
        if !reported_abandoned
            && marker_age(&path).is_some_and(|age| age >= config.validity_period)
        {
            warn!(
                key,
                "Execution claim {} is older than the lock validity period; waiting for the cache cleaner to reclaim it",
                path.display()
            );
            reported_abandoned = true;
        }

        debug!(key, "Execution claim held by another process, waiting");
        sleep(config.poll_interval.min(config.timeout - waited)).await;
    }
}
