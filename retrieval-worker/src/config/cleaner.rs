//! Configuration of the cache cleaner.

use std::path::PathBuf;
use std::time::Duration;

use super::worker::{DEFAULT_CACHE_DB_URL, DEFAULT_LOCK_VALIDITY_SECS};
use super::{Lookup, bool_var, env_lookup, parse_var, secs_var, size_var, var};
use crate::database::models::EvictionMethod;
use crate::volume::CacheDepth;
use crate::{Error, Result};

/// Configuration for one cache cleaner run.
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Size ceiling per cache location, in bytes.
    pub max_size: u64,
    pub method: EvictionMethod,
    /// Order evictions from the cache index instead of filesystem times.
    pub use_database: bool,
    /// Also delete files that have no index entry.
    pub delete_unknown_files: bool,
    /// Age past which claims and staging markers count as abandoned.
    pub lock_validity_period: Duration,
    pub cache_depth: CacheDepth,
    /// Entries processed per unit of work.
    pub batch_size: u32,
    /// Pause between batches.
    pub batch_delay: Duration,
    pub data_volumes_config: Option<PathBuf>,
    pub cache_db_url: String,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000_000_000,
            method: EvictionMethod::Lru,
            use_database: true,
            delete_unknown_files: false,
            lock_validity_period: Duration::from_secs(DEFAULT_LOCK_VALIDITY_SECS),
            cache_depth: CacheDepth::Root,
            batch_size: 100,
            batch_delay: Duration::ZERO,
            data_volumes_config: None,
            cache_db_url: DEFAULT_CACHE_DB_URL.to_string(),
        }
    }
}

impl CleanerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the process environment.
    ///
    /// Variables: `MAX_SIZE` (bytes, default 1e9), `METHOD` (`LRU` | `LFU`),
    /// `USE_DATABASE` (default true), `DELETE_UNKNOWN_FILES` (default false),
    /// `LOCK_VALIDITY_PERIOD` (seconds, default 86400), `CACHE_DEPTH`,
    /// `BATCH_SIZE` (default 100), `BATCH_DELAY` (seconds, default 0),
    /// `DATA_VOLUMES_CONFIG`, `CACHE_DB_URL`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self> {
        let defaults = Self::default();

        let cache_depth = match parse_var::<u8>(lookup, "CACHE_DEPTH")? {
            Some(depth) => CacheDepth::try_from(depth)?,
            None => defaults.cache_depth,
        };

        let config = Self {
            max_size: size_var(lookup, "MAX_SIZE")?.unwrap_or(defaults.max_size),
            method: parse_var(lookup, "METHOD")?.unwrap_or(defaults.method),
            use_database: bool_var(lookup, "USE_DATABASE")?.unwrap_or(defaults.use_database),
            delete_unknown_files: bool_var(lookup, "DELETE_UNKNOWN_FILES")?
                .unwrap_or(defaults.delete_unknown_files),
            lock_validity_period: secs_var(lookup, "LOCK_VALIDITY_PERIOD")?
                .unwrap_or(defaults.lock_validity_period),
            cache_depth,
            batch_size: parse_var(lookup, "BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            batch_delay: secs_var(lookup, "BATCH_DELAY")?.unwrap_or(defaults.batch_delay),
            data_volumes_config: var(lookup, "DATA_VOLUMES_CONFIG").map(PathBuf::from),
            cache_db_url: var(lookup, "CACHE_DB_URL").unwrap_or(defaults.cache_db_url),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("BATCH_SIZE must be at least 1"));
        }
        if !self.use_database && self.method == EvictionMethod::Lfu {
            return Err(Error::config(
                "METHOD=LFU needs access counts from the cache index (USE_DATABASE=true)",
            ));
        }
        Ok(())
    }

    /// Unknown files are always deleted when the index is not consulted.
    pub fn deletes_unknown_files(&self) -> bool {
        self.delete_unknown_files || !self.use_database
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_method(mut self, method: EvictionMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_use_database(mut self, use_database: bool) -> Self {
        self.use_database = use_database;
        self
    }

    pub fn with_delete_unknown_files(mut self, delete: bool) -> Self {
        self.delete_unknown_files = delete;
        self
    }

    pub fn with_lock_validity_period(mut self, period: Duration) -> Self {
        self.lock_validity_period = period;
        self
    }

    pub fn with_cache_depth(mut self, depth: CacheDepth) -> Self {
        self.cache_depth = depth;
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }
}
