//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use retrieval_worker::adaptor::RetrievedArtifact;
use retrieval_worker::cache::ClaimConfig;
use retrieval_worker::database::repositories::{SqliteCacheStore, SqliteJobStore};
use retrieval_worker::database::{RetryPolicy, init_pool, run_job_migrations};
use retrieval_worker::scheduler::WorkerIdentity;
use serde_json::{Map, Value};

pub fn sqlite_url(dir: &Path, name: &str) -> String {
    format!("sqlite:{}?mode=rwc", dir.join(name).display())
}

pub async fn job_store(dir: &Path) -> SqliteJobStore {
    let pool = init_pool(&sqlite_url(dir, "jobs.db"))
        .await
        .expect("Failed to create job pool");
    run_job_migrations(&pool)
        .await
        .expect("Failed to run job migrations");
    SqliteJobStore::new(pool, RetryPolicy::default())
}

pub async fn cache_store(dir: &Path) -> SqliteCacheStore {
    SqliteCacheStore::connect(&sqlite_url(dir, "cache.db"), RetryPolicy::default())
        .await
        .expect("Failed to open cache index")
}

pub fn identity() -> WorkerIdentity {
    WorkerIdentity {
        hostname: "test-host".to_string(),
        pid: 4242,
    }
}

/// Fast polling, short timeout.
pub fn quick_claims() -> ClaimConfig {
    ClaimConfig {
        poll_interval: Duration::from_millis(20),
        validity_period: Duration::from_secs(3600),
        timeout: Duration::from_secs(10),
    }
}

pub fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("expected a JSON object")
}

/// Write `size` bytes to `dir/name` and describe it as an adaptor result.
pub async fn artifact(dir: &Path, name: &str, size: usize) -> RetrievedArtifact {
    tokio::fs::create_dir_all(dir).await.unwrap();
    let path = dir.join(name);
    tokio::fs::write(&path, vec![b'x'; size]).await.unwrap();
    RetrievedArtifact {
        path,
        content_type: "application/octet-stream".to_string(),
    }
}
