//! Job orchestration.
//!
//! [`Worker::run_job`] drives one job from dispatch to a terminal state:
//! announce the worker, fetch the job, pick a volume, enter a private
//! working directory, compute or fetch the result under the key's claim,
//! then attach the cache entry to the job. On failure the user sees
//! `"<kind>: <message>"` as a job event and the full error goes to the
//! operator log; the error is returned either way.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};
use tracing::{Instrument, error, info, info_span, warn};

use crate::adaptor::AdaptorRegistry;
use crate::cache::{CacheWrapper, cache_key, normalize_object, publish};
use crate::config::{WorkerConfig, env_lookup};
use crate::context::ExecutionContext;
use crate::database::models::{CacheEntry, JobStatus};
use crate::database::repositories::{CacheStore, JobStore, SqliteCacheStore, SqliteJobStore};
use crate::database::{init_pool, run_job_migrations};
use crate::scheduler::{Scheduler, WorkerIdentity};
use crate::volume::{Volume, parse_data_volumes_config, select_volume};
use crate::workdir::TempWorkingDir;
use crate::{Error, Result};

/// Terminal state of a successful job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub cache_entry: CacheEntry,
    /// False when the result was already cached.
    pub computed: bool,
}

pub struct Worker {
    config: WorkerConfig,
    jobs: Arc<dyn JobStore>,
    cache: CacheWrapper,
    volumes: Vec<Volume>,
    adaptors: AdaptorRegistry,
    identity: WorkerIdentity,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        jobs: Arc<dyn JobStore>,
        cache_store: Arc<dyn CacheStore>,
        volumes: Vec<Volume>,
        adaptors: AdaptorRegistry,
        identity: WorkerIdentity,
    ) -> Result<Self> {
        if volumes.is_empty() {
            return Err(Error::config("no cache volumes configured"));
        }
        let cache = CacheWrapper::new(
            cache_store,
            config.claims,
            config.cache_depth,
            identity.clone(),
        );
        Ok(Self {
            config,
            jobs,
            cache,
            volumes,
            adaptors,
            identity,
        })
    }

    /// Open the stores and volume pool named by `config`.
    pub async fn connect(
        config: WorkerConfig,
        adaptors: AdaptorRegistry,
        identity: WorkerIdentity,
    ) -> Result<Self> {
        let job_pool = init_pool(&config.job_db_url).await?;
        run_job_migrations(&job_pool).await?;
        let jobs = SqliteJobStore::new(job_pool, config.session_retry);
        let cache = SqliteCacheStore::connect(&config.cache_db_url, config.session_retry).await?;
        let volumes = parse_data_volumes_config(config.data_volumes_config.as_deref(), &env_lookup)?;

        Self::new(
            config,
            Arc::new(jobs),
            Arc::new(cache),
            volumes,
            adaptors,
            identity,
        )
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    /// Run the job the scheduler bound to this process, reporting telemetry.
    pub async fn run_current(&self, scheduler: &dyn Scheduler) -> Result<JobOutcome> {
        let job_id = scheduler.current_job_id()?;
        scheduler.emit_telemetry("job.started", json!({ "job_id": job_id }));

        let started = Instant::now();
        let result = self.run_job(&job_id).await;

        let status = if result.is_ok() {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        let mut payload = json!({
            "job_id": job_id,
            "duration_ms": started.elapsed().as_millis() as u64,
            "outcome": status.to_string(),
        });
        if let Ok(outcome) = &result {
            payload["cached"] = Value::Bool(!outcome.computed);
        }
        scheduler.emit_telemetry("job.finished", payload);

        result
    }

    pub async fn run_job(&self, job_id: &str) -> Result<JobOutcome> {
        let ctx = Arc::new(ExecutionContext::new(
            job_id,
            Arc::clone(&self.jobs),
            self.config.event_threshold,
        ));

        let span = info_span!("job", job_id = %job_id);
        async {
            match self.process(&ctx).await {
                Ok(outcome) => {
                    info!(
                        cache_entry_id = outcome.cache_entry.id,
                        computed = outcome.computed,
                        "Job succeeded"
                    );
                    Ok(outcome)
                }
                Err(err) => {
                    self.record_failure(&ctx, &err).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn process(&self, ctx: &Arc<ExecutionContext>) -> Result<JobOutcome> {
        ctx.announce_worker(&self.identity).await?;

        let job = self.jobs.get_job(ctx.job_id()).await?;
        self.jobs.set_status(&job.id, JobStatus::Running).await?;

        let key = cache_key(&job.adaptor, &job.request);
        let volume = select_volume(&self.volumes, &key)
            .ok_or_else(|| Error::config("no cache volumes configured"))?;
        info!(adaptor = %job.adaptor, key = %key, volume = %volume, "Running job");

        let workdir = match &self.config.scratch_dir {
            Some(parent) => TempWorkingDir::enter_in(parent)?,
            None => TempWorkingDir::enter()?,
        };

        let request = normalize_object(&job.request);

        let memo = self
            .cache
            .compute_or_fetch(volume, &key, job.collection_id.as_deref(), || async {
                let adaptor =
                    self.adaptors
                        .create(&job.adaptor, &job.config, &job.form, Arc::clone(ctx))?;
                adaptor.retrieve(&request, workdir.path()).await
            })
            .await?;

        publish(volume, &memo.entry, &self.config.storage).await?;
        self.jobs.complete_job(&job.id, memo.entry.id).await?;

        drop(workdir);
        Ok(JobOutcome {
            job_id: job.id,
            cache_entry: memo.entry,
            computed: memo.computed,
        })
    }

    async fn record_failure(&self, ctx: &ExecutionContext, err: &Error) {
        error!(error = ?err, "Job failed: {}", err);

        if let Err(e) = ctx.add_user_visible_error(&err.user_summary()).await {
            warn!("Failed to record user-visible failure: {}", e);
        }
        if let Err(e) = self.jobs.set_status(ctx.job_id(), JobStatus::Failed).await {
            warn!("Failed to mark job failed: {}", e);
        }
    }
}
