//! Configuration of the job execution path.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use super::{Lookup, env_lookup, parse_var, secs_var, var};
use crate::Result;
use crate::cache::ClaimConfig;
use crate::context::LogLevel;
use crate::database::RetryPolicy;
use crate::volume::CacheDepth;

pub const DEFAULT_JOB_DB_URL: &str = "sqlite:jobs.db?mode=rwc";
pub const DEFAULT_CACHE_DB_URL: &str = "sqlite:cache.db?mode=rwc";
pub const DEFAULT_LOCK_VALIDITY_SECS: u64 = 86_400;

/// Object storage credentials, never logged. Publishing to an object-store
/// volume requires `object_storage_url` and `cache_bucket`.
#[derive(Clone, Default)]
pub struct StorageCredentials {
    pub cache_bucket: Option<String>,
    pub admin: Option<String>,
    pub password: Option<String>,
    pub object_storage_url: Option<String>,
    pub api_url: Option<String>,
}

impl fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("cache_bucket", &self.cache_bucket)
            .field("admin", &self.admin)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("object_storage_url", &self.object_storage_url)
            .field("api_url", &self.api_url)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub job_db_url: String,
    pub cache_db_url: String,
    /// Data-volumes file; `None` means the pool cannot be loaded.
    pub data_volumes_config: Option<PathBuf>,
    pub storage: StorageCredentials,
    /// Minimum level of context messages persisted as job events.
    pub event_threshold: LogLevel,
    pub cache_depth: CacheDepth,
    pub claims: ClaimConfig,
    pub session_retry: RetryPolicy,
    /// Parent of per-job working directories; system temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_db_url: DEFAULT_JOB_DB_URL.to_string(),
            cache_db_url: DEFAULT_CACHE_DB_URL.to_string(),
            data_volumes_config: None,
            storage: StorageCredentials::default(),
            event_threshold: LogLevel::Info,
            cache_depth: CacheDepth::Root,
            claims: ClaimConfig::default(),
            session_retry: RetryPolicy::default(),
            scratch_dir: None,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// Variables:
    /// - `COMPUTE_DB_URL` or `COMPUTE_DB_PATH`: job store (default `sqlite:jobs.db?mode=rwc`)
    /// - `CACHE_DB_URL`: cache index (default `sqlite:cache.db?mode=rwc`)
    /// - `DATA_VOLUMES_CONFIG`: path of the data-volumes file
    /// - `CACHE_BUCKET`, `STORAGE_ADMIN`, `STORAGE_PASSWORD`, `OBJECT_STORAGE_URL`, `STORAGE_API_URL`
    /// - `WORKER_LOG_LEVEL`: minimum persisted event level (default `INFO`)
    /// - `CACHE_DEPTH`: 0, 1 or 2 (default 0)
    /// - `CLAIM_POLL_INTERVAL`: seconds between claim checks (default 5)
    /// - `LOCK_VALIDITY_PERIOD`: seconds before a claim counts as abandoned (default 86400)
    /// - `CLAIM_TIMEOUT`: seconds to wait for a claim (default: the lock validity period)
    /// - `SESSION_MAX_ATTEMPTS`: attempts per database operation (default 3)
    /// - `SESSION_RETRY_DELAY_MS`: base delay between attempts (default 100)
    /// - `WORKER_SCRATCH_DIR`: parent of job working directories
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self> {
        let defaults = Self::default();

        let job_db_url = var(lookup, "COMPUTE_DB_URL")
            .or_else(|| var(lookup, "COMPUTE_DB_PATH").map(|path| format!("sqlite:{path}?mode=rwc")))
            .unwrap_or(defaults.job_db_url);

        let validity_period = secs_var(lookup, "LOCK_VALIDITY_PERIOD")?
            .unwrap_or(Duration::from_secs(DEFAULT_LOCK_VALIDITY_SECS));
        let claims = ClaimConfig {
            poll_interval: secs_var(lookup, "CLAIM_POLL_INTERVAL")?
                .unwrap_or(defaults.claims.poll_interval),
            validity_period,
            timeout: secs_var(lookup, "CLAIM_TIMEOUT")?.unwrap_or(validity_period),
        };

        let session_retry = RetryPolicy::new(
            parse_var(lookup, "SESSION_MAX_ATTEMPTS")?.unwrap_or(defaults.session_retry.max_attempts),
            parse_var::<u64>(lookup, "SESSION_RETRY_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.session_retry.base_delay),
        );

        let cache_depth = match parse_var::<u8>(lookup, "CACHE_DEPTH")? {
            Some(depth) => CacheDepth::try_from(depth)?,
            None => defaults.cache_depth,
        };

        let event_threshold = match var(lookup, "WORKER_LOG_LEVEL") {
            Some(level) => level.parse()?,
            None => defaults.event_threshold,
        };

        Ok(Self {
            job_db_url,
            cache_db_url: var(lookup, "CACHE_DB_URL").unwrap_or(defaults.cache_db_url),
            data_volumes_config: var(lookup, "DATA_VOLUMES_CONFIG").map(PathBuf::from),
            storage: StorageCredentials {
                cache_bucket: var(lookup, "CACHE_BUCKET"),
                admin: var(lookup, "STORAGE_ADMIN"),
                password: var(lookup, "STORAGE_PASSWORD"),
                object_storage_url: var(lookup, "OBJECT_STORAGE_URL"),
                api_url: var(lookup, "STORAGE_API_URL"),
            },
            event_threshold,
            cache_depth,
            claims,
            session_retry,
            scratch_dir: var(lookup, "WORKER_SCRATCH_DIR").map(PathBuf::from),
        })
    }
}
