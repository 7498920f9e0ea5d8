//! Job orchestration end to end: real job store, cache index and volume.
//!
//! Jobs switch the process working directory, so every test is serialized.

mod common;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use retrieval_worker::adaptor::AdaptorRegistry;
use retrieval_worker::cache::claim_path;
use retrieval_worker::config::WorkerConfig;
use retrieval_worker::database::models::{EventType, JobDbModel, JobStatus};
use retrieval_worker::database::repositories::{JobStore, SqliteJobStore};
use retrieval_worker::scheduler::{Scheduler, WorkerIdentity};
use retrieval_worker::volume::Volume;
use retrieval_worker::worker::Worker;
use retrieval_worker::{Error, Result};
use serde_json::{Value, json};
use serial_test::serial;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    jobs: Arc<SqliteJobStore>,
    worker: Worker,
    volume: Volume,
}

impl Fixture {
    async fn new() -> Self {
        Self::with_volume(|dir| Volume::parse(&dir.join("volume").to_string_lossy()).unwrap()).await
    }

    async fn with_volume(volume: impl FnOnce(&Path) -> Volume) -> Self {
        let dir = TempDir::new().unwrap();
        let jobs = Arc::new(common::job_store(dir.path()).await);
        let cache = Arc::new(common::cache_store(dir.path()).await);
        let volume = volume(dir.path());

        let config = WorkerConfig {
            claims: common::quick_claims(),
            scratch_dir: Some(dir.path().join("scratch")),
            ..Default::default()
        };
        let worker = Worker::new(
            config,
            jobs.clone(),
            cache,
            vec![volume.clone()],
            AdaptorRegistry::with_builtins(),
            common::identity(),
        )
        .unwrap();

        Self {
            dir,
            jobs,
            worker,
            volume,
        }
    }

    async fn submit(&self, id: &str, adaptor: &str, request: Value) {
        let job = JobDbModel::new(id, adaptor, &common::object(request)).with_collection("era5");
        self.jobs.create_job(&job).await.unwrap();
    }

    fn scratch(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }
}

#[derive(Default)]
struct RecordingScheduler {
    job_id: String,
    telemetry: Mutex<Vec<(String, Value)>>,
}

impl Scheduler for RecordingScheduler {
    fn current_job_id(&self) -> Result<String> {
        Ok(self.job_id.clone())
    }

    fn worker_identity(&self) -> WorkerIdentity {
        common::identity()
    }

    fn emit_telemetry(&self, name: &str, payload: Value) {
        self.telemetry.lock().unwrap().push((name.to_string(), payload));
    }
}

#[tokio::test]
#[serial]
async fn successful_job_attaches_cache_entry() {
    let fx = Fixture::new().await;
    fx.submit("job-1", "echo", json!({"variable": ["2t"], "area": {"south": -90, "north": 90}}))
        .await;
    let cwd = std::env::current_dir().unwrap();

    let outcome = fx.worker.run_job("job-1").await.unwrap();

    assert!(outcome.computed);
    assert_eq!(outcome.cache_entry.tag.as_deref(), Some("era5"));
    let stored: Value =
        serde_json::from_slice(&std::fs::read(outcome.cache_entry.artifact_path()).unwrap()).unwrap();
    assert_eq!(stored, json!({"area": {"north": 90, "south": -90}, "variable": ["2t"]}));
    assert!(outcome.cache_entry.result.urlpath.starts_with("file://"));

    let job = fx.jobs.get_job("job-1").await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.cache_entry_id, Some(outcome.cache_entry.id));

    let events = fx.jobs.list_events("job-1").await.unwrap();
    assert_eq!(events[0].event_type(), Some(EventType::WorkerName));
    assert_eq!(events[0].message, "test-host:4242");
    assert!(events.iter().any(|e| e.message == "Echoing 2 request fields"));

    // Unwound: cwd restored, scratch emptied, claim released.
    assert_eq!(std::env::current_dir().unwrap(), cwd);
    assert_eq!(std::fs::read_dir(fx.scratch()).unwrap().count(), 0);
    let root = fx.volume.local_root().unwrap();
    assert!(!claim_path(&root, &outcome.cache_entry.key).exists());
}

#[tokio::test]
#[serial]
async fn relative_volume_outlives_the_job_workdir() {
    let cwd = std::env::current_dir().unwrap();
    let mut base = PathBuf::new();
    let fx = Fixture::with_volume(|dir| {
        std::env::set_current_dir(dir).unwrap();
        base = std::env::current_dir().unwrap();
        let volume = Volume::parse("cache-vol").unwrap();
        std::env::set_current_dir(&cwd).unwrap();
        volume
    })
    .await;
    fx.submit("job-1", "echo", json!({"year": 2024})).await;
    fx.submit("job-2", "echo", json!({"year": 2024})).await;

    let first = fx.worker.run_job("job-1").await.unwrap();

    let vol_root = base.join("cache-vol");
    let entry = &first.cache_entry;
    assert_eq!(PathBuf::from(&entry.location), vol_root);
    assert!(entry.artifact_path().exists());
    assert_eq!(
        entry.result.urlpath,
        format!("file://{}", vol_root.join(&entry.file_name).display())
    );
    assert!(!claim_path(&vol_root, &entry.key).exists());

    let second = fx.worker.run_job("job-2").await.unwrap();
    assert!(!second.computed);
    assert!(second.cache_entry.artifact_path().exists());
}

#[tokio::test]
#[serial]
async fn identical_request_is_served_from_cache() {
    let fx = Fixture::new().await;
    fx.submit("job-1", "echo", json!({"year": 2024, "month": 1})).await;
    fx.submit("job-2", "echo", json!({"month": 1, "year": 2024})).await;

    let first = fx.worker.run_job("job-1").await.unwrap();
    let second = fx.worker.run_job("job-2").await.unwrap();

    assert!(first.computed);
    assert!(!second.computed);
    assert_eq!(first.cache_entry.id, second.cache_entry.id);
    assert_eq!(
        fx.jobs.get_job("job-2").await.unwrap().cache_entry_id,
        Some(first.cache_entry.id)
    );
}

#[tokio::test]
#[serial]
async fn adaptor_failure_is_recorded_and_propagated() {
    let fx = Fixture::new().await;
    let missing = fx.dir.path().join("missing.grib");
    fx.submit("job-1", "file-copy", json!({"path": missing.to_string_lossy()}))
        .await;
    let cwd = std::env::current_dir().unwrap();

    let err = fx.worker.run_job("job-1").await.unwrap_err();
    assert!(matches!(&err, Error::Adaptor { kind, .. } if kind == "FileNotFound"));

    let job = fx.jobs.get_job("job-1").await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.cache_entry_id, None);

    let events = fx.jobs.list_events("job-1").await.unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.event_type(), Some(EventType::UserVisibleError));
    assert_eq!(
        last.message,
        format!("FileNotFound: no such file: {}", missing.display())
    );

    assert_eq!(std::env::current_dir().unwrap(), cwd);
    assert_eq!(std::fs::read_dir(fx.scratch()).unwrap().count(), 0);
    let leftover_claims = std::fs::read_dir(fx.volume.local_root().unwrap())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover_claims, 0);
}

#[tokio::test]
#[serial]
async fn unknown_adaptor_fails_the_job() {
    let fx = Fixture::new().await;
    fx.submit("job-1", "python-entry-point", json!({})).await;

    let err = fx.worker.run_job("job-1").await.unwrap_err();
    assert!(matches!(err, Error::UnknownAdaptor(_)));

    let events = fx.jobs.list_events("job-1").await.unwrap();
    assert_eq!(
        events.last().unwrap().message,
        "UnknownAdaptor: Unknown adaptor: python-entry-point"
    );
}

#[tokio::test]
#[serial]
async fn missing_job_is_not_found() {
    let fx = Fixture::new().await;

    let err = fx.worker.run_job("no-such-job").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
#[serial]
async fn run_current_reports_telemetry() {
    let fx = Fixture::new().await;
    fx.submit("job-1", "echo", json!({"a": 1})).await;
    let scheduler = RecordingScheduler {
        job_id: "job-1".to_string(),
        ..Default::default()
    };

    fx.worker.run_current(&scheduler).await.unwrap();

    let telemetry = scheduler.telemetry.lock().unwrap();
    let names: Vec<_> = telemetry.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["job.started", "job.finished"]);
    let finished = &telemetry[1].1;
    assert_eq!(finished["job_id"], "job-1");
    assert_eq!(finished["outcome"], "succeeded");
    assert_eq!(finished["cached"], false);
    assert!(finished["duration_ms"].is_u64());
}
