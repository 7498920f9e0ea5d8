//! Expiry of cache entries by collection and creation time.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::database::repositories::{
    CacheStore, CollectionSelector, ExpiryFilter, validate_window,
};
use crate::database::time::{datetime_to_ms, now_ms};
use crate::{Error, Result};

/// Which entries to expire and how.
#[derive(Debug, Clone)]
pub struct ExpireOptions {
    /// Collection tags to expire. Exclusive with `all_collections`.
    pub collection_ids: Vec<String>,
    pub all_collections: bool,
    /// Only entries created before this instant. Defaults to now.
    pub before: Option<DateTime<Utc>>,
    /// Only entries created at or after this instant.
    pub after: Option<DateTime<Utc>>,
    /// Delete rows and artifacts instead of marking them expired.
    pub delete: bool,
    /// Count what would be expired without changing anything.
    pub dry_run: bool,
    pub batch_size: u32,
    pub batch_delay: Duration,
}

impl Default for ExpireOptions {
    fn default() -> Self {
        Self {
            collection_ids: Vec::new(),
            all_collections: false,
            before: None,
            after: None,
            delete: false,
            dry_run: false,
            batch_size: 100,
            batch_delay: Duration::ZERO,
        }
    }
}

impl ExpireOptions {
    pub fn for_collections<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            collection_ids: ids.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn for_all_collections() -> Self {
        Self {
            all_collections: true,
            ..Default::default()
        }
    }

    pub fn with_window(mut self, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> Self {
        self.after = after;
        self.before = before;
        self
    }

    pub fn with_delete(mut self, delete: bool) -> Self {
        self.delete = delete;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_batching(mut self, size: u32, delay: Duration) -> Self {
        self.batch_size = size;
        self.batch_delay = delay;
        self
    }

    /// Check the options and build the index filter they describe.
    pub fn filter(&self, now: i64) -> Result<ExpiryFilter> {
        let collections = match (self.collection_ids.is_empty(), self.all_collections) {
            (false, true) => {
                return Err(Error::config(
                    "--collection-id and --all-collections are mutually exclusive",
                ));
            }
            (true, false) => {
                return Err(Error::config(
                    "one of --collection-id or --all-collections is required",
                ));
            }
            (true, true) => CollectionSelector::All,
            (false, false) => CollectionSelector::Tags(self.collection_ids.clone()),
        };
        if self.batch_size == 0 {
            return Err(Error::config("batch size must be at least 1"));
        }

        let after = self.after.map(datetime_to_ms);
        let before = Some(self.before.map(datetime_to_ms).unwrap_or(now));
        validate_window(after, before)?;

        Ok(ExpiryFilter {
            collections,
            after,
            before,
            now,
        })
    }
}

/// Expire (or delete) every live entry matching `opts`.
///
/// Returns the number of entries affected, or under `dry_run` the number that
/// would be. Invalid options fail before the index is read.
pub async fn expire_cache_entries(store: &dyn CacheStore, opts: &ExpireOptions) -> Result<u64> {
    let filter = opts.filter(now_ms())?;

    if opts.dry_run {
        let count = store.count_matching(&filter).await?;
        info!(count, "Dry run: cache entries that would be expired");
        return Ok(count);
    }

    let mut total = 0u64;
    let mut first = true;
    loop {
        if !first && !opts.batch_delay.is_zero() {
            tokio::time::sleep(opts.batch_delay).await;
        }
        first = false;

        let batch = store.matching(&filter, opts.batch_size).await?;
        if batch.is_empty() {
            break;
        }

        let affected = if opts.delete {
            let mut deleted = 0;
            for entry in &batch {
                if store.delete(entry).await? {
                    deleted += 1;
                }
            }
            deleted
        } else {
            let ids: Vec<i64> = batch.iter().map(|e| e.id).collect();
            store.expire(&ids, filter.now).await?
        };
        debug!(batch = batch.len(), affected, "Processed expiry batch");
        total += affected;

        if batch.len() < opts.batch_size as usize {
            break;
        }
    }

    info!(count = total, deleted = opts.delete, "Expired cache entries");
    Ok(total)
}
