//! Job store repository.

use async_trait::async_trait;
use sqlx::SqliteConnection;

use crate::database::models::{EventType, Job, JobDbModel, JobEventDbModel, JobStatus};
use crate::database::session::{RetryPolicy, SessionGuard, SqliteSessionFactory};
use crate::database::time::now_ms;
use crate::database::DbPool;
use crate::{Error, Result};

/// Durable job store used by the worker.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;
    /// Fetch a job with its request, config and form in one round trip.
    async fn get_job(&self, id: &str) -> Result<Job>;
    async fn set_status(&self, id: &str, status: JobStatus) -> Result<()>;
    /// Attach the produced cache entry and mark the job succeeded, atomically.
    async fn complete_job(&self, id: &str, cache_entry_id: i64) -> Result<()>;

    // Events
    async fn add_event(&self, job_id: &str, event_type: EventType, message: &str) -> Result<()>;
    async fn list_events(&self, job_id: &str) -> Result<Vec<JobEventDbModel>>;
}

/// Statements that run inside a caller-provided session.
pub struct JobTxOps;

impl JobTxOps {
    pub async fn get_job(conn: &mut SqliteConnection, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    pub async fn insert_job(conn: &mut SqliteConnection, job: &JobDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job (id, adaptor, request, config, form, collection_id, cache_entry_id, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.adaptor)
        .bind(&job.request)
        .bind(&job.config)
        .bind(&job.form)
        .bind(&job.collection_id)
        .bind(job.cache_entry_id)
        .bind(&job.status)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn set_status(conn: &mut SqliteConnection, id: &str, status: JobStatus) -> Result<()> {
        let result = sqlx::query("UPDATE job SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(now_ms())
            .bind(id)
            .execute(conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Job", id));
        }
        Ok(())
    }

    pub async fn attach_cache_entry(
        conn: &mut SqliteConnection,
        id: &str,
        cache_entry_id: i64,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE job SET cache_entry_id = ?, updated_at = ? WHERE id = ?")
            .bind(cache_entry_id)
            .bind(now_ms())
            .bind(id)
            .execute(conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Job", id));
        }
        Ok(())
    }

    pub async fn insert_event(
        conn: &mut SqliteConnection,
        job_id: &str,
        event_type: EventType,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_event (job_id, event_type, message, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(event_type.to_string())
        .bind(message)
        .bind(now_ms())
        .execute(conn)
        .await?;
        Ok(())
    }
}

/// SQLite implementation of [`JobStore`]. Every call goes through the
/// session guard.
#[derive(Clone)]
pub struct SqliteJobStore {
    guard: SessionGuard<SqliteSessionFactory>,
}

impl SqliteJobStore {
    pub fn new(pool: DbPool, policy: RetryPolicy) -> Self {
        Self {
            guard: SessionGuard::new(SqliteSessionFactory::new(pool), policy),
        }
    }

    pub fn guard(&self) -> &SessionGuard<SqliteSessionFactory> {
        &self.guard
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        self.guard
            .run("create_job", None, |tx| {
                let job = job.clone();
                Box::pin(async move { JobTxOps::insert_job(&mut **tx, &job).await })
            })
            .await
    }

    async fn get_job(&self, id: &str) -> Result<Job> {
        let model = self
            .guard
            .run("get_job", None, |tx| {
                let id = id.to_string();
                Box::pin(async move { JobTxOps::get_job(&mut **tx, &id).await })
            })
            .await?;
        model.into_job()
    }

    async fn set_status(&self, id: &str, status: JobStatus) -> Result<()> {
        self.guard
            .run("set_job_status", None, |tx| {
                let id = id.to_string();
                Box::pin(async move { JobTxOps::set_status(&mut **tx, &id, status).await })
            })
            .await
    }

    async fn complete_job(&self, id: &str, cache_entry_id: i64) -> Result<()> {
        let guard = self.guard.clone();
        self.guard
            .run("complete_job", None, |session| {
                let guard = guard.clone();
                let id = id.to_string();
                Box::pin(async move {
                    // Both updates share the outer session and commit together.
                    guard
                        .run("attach_cache_entry", Some(&mut *session), |tx| {
                            let id = id.clone();
                            Box::pin(async move {
                                JobTxOps::attach_cache_entry(&mut **tx, &id, cache_entry_id).await
                            })
                        })
                        .await?;
                    guard
                        .run("set_job_status", Some(session), |tx| {
                            let id = id.clone();
                            Box::pin(async move {
                                JobTxOps::set_status(&mut **tx, &id, JobStatus::Succeeded).await
                            })
                        })
                        .await
                })
            })
            .await
    }

    async fn add_event(&self, job_id: &str, event_type: EventType, message: &str) -> Result<()> {
        self.guard
            .run("add_job_event", None, |tx| {
                let job_id = job_id.to_string();
                let message = message.to_string();
                Box::pin(async move {
                    JobTxOps::insert_event(&mut **tx, &job_id, event_type, &message).await
                })
            })
            .await
    }

    async fn list_events(&self, job_id: &str) -> Result<Vec<JobEventDbModel>> {
        self.guard
            .run("list_job_events", None, |tx| {
                let job_id = job_id.to_string();
                Box::pin(async move {
                    let events = sqlx::query_as::<_, JobEventDbModel>(
                        "SELECT * FROM job_event WHERE job_id = ? ORDER BY id",
                    )
                    .bind(&job_id)
                    .fetch_all(&mut **tx)
                    .await?;
                    Ok(events)
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_pool, run_job_migrations};
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqliteJobStore) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("jobs.db").display());
        let pool = init_pool(&url).await.unwrap();
        run_job_migrations(&pool).await.unwrap();
        (dir, SqliteJobStore::new(pool, RetryPolicy::default()))
    }

    #[tokio::test]
    async fn test_complete_job_attaches_entry() {
        let (_dir, store) = setup().await;
        let job = JobDbModel::new("job-1", "echo", json!({"a": 1}).as_object().unwrap());
        store.create_job(&job).await.unwrap();

        store.complete_job("job-1", 42).await.unwrap();

        let job = store.get_job("job-1").await.unwrap();
        assert_eq!(job.cache_entry_id, Some(42));
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_complete_missing_job_changes_nothing() {
        let (_dir, store) = setup().await;
        let err = store.complete_job("missing", 1).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_events_keep_emission_order() {
        let (_dir, store) = setup().await;
        store.add_event("job-1", EventType::WorkerName, "host:1").await.unwrap();
        store.add_event("job-1", EventType::Info, "first").await.unwrap();
        store.add_event("job-2", EventType::Info, "other job").await.unwrap();
        store.add_event("job-1", EventType::UserVisibleError, "second").await.unwrap();

        let events = store.list_events("job-1").await.unwrap();
        let messages: Vec<_> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["host:1", "first", "second"]);
        assert_eq!(events[2].event_type(), Some(EventType::UserVisibleError));
    }
}
