//! Size-based eviction sweep.

use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::cache::{claim_path, marker_age};
use crate::config::CleanerConfig;
use crate::database::RetryPolicy;
use crate::database::repositories::{CacheStore, SqliteCacheStore};
use crate::database::time::now_ms;
use crate::utils::fs::{io_error, path_size_sync, remove_path};
use crate::volume::{Volume, is_partition_name};
use crate::workdir::{CacheTmpPath, LOCK_EXTENSION, STAGING_PREFIX};
use crate::{Error, Result};

/// What one sweep of a volume did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub volume: String,
    /// Cache items found across the volume's locations.
    pub scanned: usize,
    pub evicted: usize,
    pub evicted_bytes: u64,
    pub unknown_deleted: usize,
    /// Abandoned claims and staging directories removed.
    pub claims_reclaimed: usize,
    pub remaining_bytes: u64,
}

/// A file or directory found in a cache location.
#[derive(Debug, Clone)]
struct Item {
    name: String,
    path: PathBuf,
    size: u64,
    last_used: SystemTime,
}

struct Listed {
    name: String,
    path: PathBuf,
    meta: Metadata,
}

pub struct Janitor {
    config: CleanerConfig,
    store: Option<Arc<dyn CacheStore>>,
}

impl Janitor {
    /// `store` is required unless the config disables the cache index.
    pub fn new(config: CleanerConfig, store: Option<Arc<dyn CacheStore>>) -> Result<Self> {
        config.validate()?;
        if config.use_database && store.is_none() {
            return Err(Error::config(
                "USE_DATABASE is set but no cache index was provided",
            ));
        }
        Ok(Self { config, store })
    }

    /// Open the cache index named by the config when it is used.
    pub async fn connect(config: CleanerConfig) -> Result<Self> {
        let store: Option<Arc<dyn CacheStore>> = if config.use_database {
            let store =
                SqliteCacheStore::connect(&config.cache_db_url, RetryPolicy::default()).await?;
            Some(Arc::new(store))
        } else {
            None
        };
        Self::new(config, store)
    }

    pub fn config(&self) -> &CleanerConfig {
        &self.config
    }

    /// Sweep every volume in order. Stops at the first failure; volumes
    /// already swept keep their progress.
    pub async fn run(&self, volumes: &[Volume]) -> Result<Vec<SweepReport>> {
        let mut reports = Vec::with_capacity(volumes.len());
        for volume in volumes {
            if !volume.protocol().is_local() {
                warn!(volume = %volume, "Skipping volume: only local volumes can be swept");
                continue;
            }
            let report = self.sweep_volume(volume).await?;
            info!(
                volume = %report.volume,
                scanned = report.scanned,
                evicted = report.evicted,
                evicted_bytes = report.evicted_bytes,
                unknown_deleted = report.unknown_deleted,
                claims_reclaimed = report.claims_reclaimed,
                remaining_bytes = report.remaining_bytes,
                "Swept cache volume"
            );
            reports.push(report);
        }
        Ok(reports)
    }

    pub async fn sweep_volume(&self, volume: &Volume) -> Result<SweepReport> {
        let root = volume.local_root()?;
        let locations = volume.existing_locations(self.config.cache_depth)?;
        let mut report = SweepReport {
            volume: volume.to_string(),
            ..Default::default()
        };

        report.claims_reclaimed += self.reclaim_stale(&root).await?;
        for location in locations.iter().filter(|l| **l != root) {
            report.claims_reclaimed += self.reclaim_stale(location).await?;
        }

        let in_flight = self.live_claims(&root).await?;
        for location in &locations {
            if !tokio::fs::try_exists(location).await.unwrap_or(false) {
                continue;
            }
            self.sweep_location(&root, location, &in_flight, &mut report)
                .await?;
        }
        Ok(report)
    }

    async fn sweep_location(
        &self,
        root: &Path,
        location: &Path,
        in_flight: &HashSet<String>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let staging = CacheTmpPath::new(location)?;
        debug!(location = %location.display(), staging = %staging.path().display(), "Sweeping location");

        let mut items = self.scan(location, in_flight).await?;
        report.scanned += items.len();

        if self.store.is_some() && self.config.deletes_unknown_files() {
            let unknown = self.delete_unknown(root, location, &mut items, &staging).await?;
            report.unknown_deleted += unknown;
        }

        let mut total: u64 = items.iter().map(|i| i.size).sum();
        let (evicted, freed) = match &self.store {
            Some(store) => {
                self.evict_indexed(store.as_ref(), location, &items, &mut total, &staging)
                    .await?
            }
            None => self.evict_by_age(items, &mut total, &staging).await?,
        };
        report.evicted += evicted;
        report.evicted_bytes += freed;
        report.remaining_bytes += total;

        if total > self.config.max_size {
            warn!(
                location = %location.display(),
                remaining_bytes = total,
                max_size = self.config.max_size,
                "Location is still above the size ceiling after eviction"
            );
        }
        Ok(())
    }

    /// Remove claims, staging markers and staging directories older than the
    /// lock validity period.
    async fn reclaim_stale(&self, dir: &Path) -> Result<usize> {
        let lock_suffix = format!(".{LOCK_EXTENSION}");
        let mut reclaimed = 0;

        for listed in list_dir(dir).await? {
            if let Some(guarded) = listed.name.strip_suffix(&lock_suffix) {
                if !self.is_stale(&listed.path) {
                    continue;
                }
                if guarded.starts_with(STAGING_PREFIX) {
                    remove_path(&dir.join(guarded)).await?;
                }
                if remove_path(&listed.path).await? {
                    warn!(path = %listed.path.display(), "Removed abandoned lock");
                    reclaimed += 1;
                }
            } else if listed.name.starts_with(STAGING_PREFIX) && listed.meta.is_dir() {
                let marker = dir.join(format!("{}{lock_suffix}", listed.name));
                let orphaned = !tokio::fs::try_exists(&marker).await.unwrap_or(false);
                if orphaned && self.is_stale(&listed.path) && remove_path(&listed.path).await? {
                    warn!(path = %listed.path.display(), "Removed orphaned staging directory");
                    reclaimed += 1;
                }
            }
        }
        Ok(reclaimed)
    }

    /// Keys with a claim still inside its validity period.
    async fn live_claims(&self, root: &Path) -> Result<HashSet<String>> {
        let lock_suffix = format!(".{LOCK_EXTENSION}");
        Ok(list_dir(root)
            .await?
            .into_iter()
            .filter(|l| !self.is_stale(&l.path))
            .filter_map(|l| l.name.strip_suffix(&lock_suffix).map(str::to_string))
            .filter(|key| !key.starts_with(STAGING_PREFIX))
            .collect())
    }

    fn is_stale(&self, path: &Path) -> bool {
        marker_age(path).is_some_and(|age| age > self.config.lock_validity_period)
    }

    /// Whether `key` is claimed right now, regardless of the snapshot taken
    /// at the start of the sweep.
    fn is_claimed(&self, root: &Path, key: &str) -> bool {
        marker_age(&claim_path(root, key)).is_some_and(|age| age <= self.config.lock_validity_period)
    }

    /// Cache items in `location`, leaving out locks, staging directories,
    /// nested partitions and artifacts of in-flight computations.
    async fn scan(&self, location: &Path, in_flight: &HashSet<String>) -> Result<Vec<Item>> {
        let lock_suffix = format!(".{LOCK_EXTENSION}");
        let mut items = Vec::new();

        for listed in list_dir(location).await? {
            let name = listed.name;
            if name.ends_with(&lock_suffix) || name.starts_with(STAGING_PREFIX) {
                continue;
            }
            if listed.meta.is_dir() && (is_partition_name(&name, 0) || is_partition_name(&name, 1))
            {
                continue;
            }
            if in_flight.contains(item_key(&name)) {
                debug!(name = %name, "Skipping artifact of in-flight computation");
                continue;
            }

            let size = if listed.meta.is_dir() {
                let path = listed.path.clone();
                tokio::task::spawn_blocking(move || path_size_sync(&path))
                    .await
                    .map_err(|e| Error::Other(format!("size task failed: {e}")))??
            } else {
                listed.meta.len()
            };
            let last_used = listed
                .meta
                .accessed()
                .or_else(|_| listed.meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);

            items.push(Item {
                name,
                path: listed.path,
                size,
                last_used,
            });
        }
        Ok(items)
    }

    async fn delete_unknown(
        &self,
        root: &Path,
        location: &Path,
        items: &mut Vec<Item>,
        staging: &CacheTmpPath,
    ) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let location_str = location.to_string_lossy();
        let mut unknown = Vec::new();
        for item in items.iter() {
            if !store.is_known_file(&location_str, &item.name).await? {
                unknown.push(item.name.clone());
            }
        }

        let mut dropped = HashSet::new();
        let mut deleted = 0;
        for (i, chunk) in unknown.chunks(self.batch_size()).enumerate() {
            if i > 0 {
                self.pause().await;
            }
            for name in chunk {
                // A worker may have claimed the key and moved its artifact in
                // after the claim snapshot, with the index row still pending.
                if self.is_claimed(root, item_key(name)) {
                    debug!(name = %name, "Skipping unindexed artifact of in-flight computation");
                    dropped.insert(name.clone());
                    continue;
                }
                if store.is_known_file(&location_str, name).await? {
                    continue;
                }
                if discard(&location.join(name), staging).await? {
                    info!(location = %location.display(), name = %name, "Deleted unknown file");
                    deleted += 1;
                }
                dropped.insert(name.clone());
            }
        }
        items.retain(|item| !dropped.contains(&item.name));
        Ok(deleted)
    }

    /// Evict in index order until the location fits.
    async fn evict_indexed(
        &self,
        store: &dyn CacheStore,
        location: &Path,
        items: &[Item],
        total: &mut u64,
        staging: &CacheTmpPath,
    ) -> Result<(usize, u64)> {
        let location_str = location.to_string_lossy();
        let mut sizes: HashMap<&str, u64> =
            items.iter().map(|i| (i.name.as_str(), i.size)).collect();
        let (mut evicted, mut freed) = (0, 0);

        while *total > self.config.max_size {
            let batch = store
                .eviction_candidates(&location_str, self.config.method, now_ms(), self.config.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            for entry in &batch {
                if *total <= self.config.max_size {
                    break;
                }
                store.remove_index_entry(entry.id).await?;
                discard(&entry.artifact_path(), staging).await?;

                let size = sizes.remove(entry.file_name.as_str()).unwrap_or(0);
                *total = total.saturating_sub(size);
                evicted += 1;
                freed += size;
                debug!(key = %entry.key, size, "Evicted cache entry");
            }

            if *total > self.config.max_size {
                self.pause().await;
            }
        }
        Ok((evicted, freed))
    }

    /// Evict least recently used items by filesystem time until the location
    /// fits.
    async fn evict_by_age(
        &self,
        mut items: Vec<Item>,
        total: &mut u64,
        staging: &CacheTmpPath,
    ) -> Result<(usize, u64)> {
        items.sort_by(|a, b| a.last_used.cmp(&b.last_used).then_with(|| a.name.cmp(&b.name)));
        let (mut evicted, mut freed) = (0, 0);

        for (i, chunk) in items.chunks(self.batch_size()).enumerate() {
            if *total <= self.config.max_size {
                break;
            }
            if i > 0 {
                self.pause().await;
            }
            for item in chunk {
                if *total <= self.config.max_size {
                    break;
                }
                discard(&item.path, staging).await?;
                *total = total.saturating_sub(item.size);
                evicted += 1;
                freed += item.size;
                debug!(name = %item.name, size = item.size, "Evicted cache item");
            }
        }
        Ok((evicted, freed))
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size.max(1) as usize
    }

    async fn pause(&self) {
        if !self.config.batch_delay.is_zero() {
            tokio::time::sleep(self.config.batch_delay).await;
        }
    }
}

impl std::fmt::Debug for Janitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Janitor")
            .field("config", &self.config)
            .field("use_database", &self.store.is_some())
            .finish()
    }
}

/// Cache key an item name belongs to (`<key>.<ext>` or `<key>`).
fn item_key(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// Move `path` out of its location into the staging directory, then delete
/// it. Returns false when it was already gone.
async fn discard(path: &Path, staging: &CacheTmpPath) -> Result<bool> {
    let Some(name) = path.file_name() else {
        return Ok(false);
    };
    let staged = staging.path().join(name);
    match tokio::fs::rename(path, &staged).await {
        Ok(()) => remove_path(&staged).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(_) => remove_path(path).await,
    }
}

async fn list_dir(dir: &Path) -> Result<Vec<Listed>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error("listing", dir, e)),
    };

    let mut listed = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("listing", dir, e))?
    {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        // Entries can vanish between listing and stat under concurrent sweeps.
        let Ok(meta) = tokio::fs::symlink_metadata(entry.path()).await else {
            continue;
        };
        listed.push(Listed {
            name,
            path: entry.path(),
            meta,
        });
    }
    listed.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(listed)
}
