//! Compute-or-fetch wrapper around the cache index.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use super::claim::{ClaimConfig, acquire};
use crate::adaptor::RetrievedArtifact;
use crate::config::StorageCredentials;
use crate::database::models::{CacheEntry, NewCacheEntry, ResultDescriptor};
use crate::database::repositories::CacheStore;
use crate::scheduler::WorkerIdentity;
use crate::utils::fs::{io_error, move_file};
use crate::volume::{CacheDepth, Volume};
use crate::{Error, Result};

/// Outcome of [`CacheWrapper::compute_or_fetch`].
#[derive(Debug, Clone)]
pub struct Memoized {
    pub entry: CacheEntry,
    /// False when the entry was served from the cache.
    pub computed: bool,
}

#[derive(Clone)]
pub struct CacheWrapper {
    store: Arc<dyn CacheStore>,
    claims: ClaimConfig,
    depth: CacheDepth,
    identity: WorkerIdentity,
}

impl CacheWrapper {
    pub fn new(
        store: Arc<dyn CacheStore>,
        claims: ClaimConfig,
        depth: CacheDepth,
        identity: WorkerIdentity,
    ) -> Self {
        Self {
            store,
            claims,
            depth,
            identity,
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Serve `key` from the cache, or compute it under the key's claim and
    /// store the artifact on `volume`.
    ///
    /// The claim is released on every exit path, including a failed or
    /// cancelled computation.
    pub async fn compute_or_fetch<F, Fut>(
        &self,
        volume: &Volume,
        key: &str,
        tag: Option<&str>,
        compute: F,
    ) -> Result<Memoized>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RetrievedArtifact>>,
    {
        if let Some(entry) = self.store.get(key).await? {
            debug!(key, "Cache hit");
            return Ok(Memoized {
                entry,
                computed: false,
            });
        }

        let root = volume.local_root()?;
        let _claim = acquire(&root, key, &self.claims, &self.identity).await?;

        // Whoever held the claim before us may have produced the entry.
        if let Some(entry) = self.store.get(key).await? {
            debug!(key, "Cache hit after waiting for claim");
            return Ok(Memoized {
                entry,
                computed: false,
            });
        }

        let artifact = compute().await?;
        let entry = self.store_artifact(volume, key, tag, &artifact).await?;
        info!(key, size = entry.size, urlpath = %entry.result.urlpath, "Stored new cache entry");

        Ok(Memoized {
            entry,
            computed: true,
        })
    }

    async fn store_artifact(
        &self,
        volume: &Volume,
        key: &str,
        tag: Option<&str>,
        artifact: &RetrievedArtifact,
    ) -> Result<CacheEntry> {
        let meta = tokio::fs::metadata(&artifact.path)
            .await
            .map_err(|e| io_error("reading metadata of", &artifact.path, e))?;
        if !meta.is_file() {
            return Err(Error::validation(format!(
                "artifact {} is not a regular file",
                artifact.path.display()
            )));
        }

        let location = volume.location(self.depth, Utc::now())?;
        let file_name = match artifact.path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{key}.{ext}"),
            None => key.to_string(),
        };
        let dest = location.join(&file_name);
        move_file(&artifact.path, &dest).await?;
        make_world_readable(&dest).await?;

        self.store
            .insert(&NewCacheEntry {
                key: key.to_string(),
                result: ResultDescriptor {
                    urlpath: volume.unstrip(&dest),
                    content_type: artifact.content_type.clone(),
                    size: meta.len(),
                },
                size: meta.len(),
                tag: tag.map(str::to_string),
                volume: volume.as_str().to_string(),
                location: location.to_string_lossy().into_owned(),
                file_name,
            })
            .await
    }
}

#[cfg(unix)]
async fn make_world_readable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
        .await
        .map_err(|e| io_error("setting permissions of", path, e))
}

#[cfg(not(unix))]
async fn make_world_readable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Make a stored artifact readable by job owners when its volume's protocol
/// requires it.
pub async fn publish(
    volume: &Volume,
    entry: &CacheEntry,
    storage: &StorageCredentials,
) -> Result<()> {
    if volume.protocol().requires_public_read() {
        if storage.object_storage_url.is_none() || storage.cache_bucket.is_none() {
            return Err(Error::config(format!(
                "volume {volume} needs OBJECT_STORAGE_URL and CACHE_BUCKET to publish {}",
                entry.result.urlpath
            )));
        }
        // Object storage ACLs are not managed by the bundled store.
        return Err(Error::UnsupportedProtocol(format!(
            "{} (publishing {})",
            volume.protocol().name(),
            entry.result.urlpath
        )));
    }
    Ok(())
}
