//! Persistence layer.
//!
//! Two SQLite databases back the worker: the job store (jobs and their
//! events) and the cache index (one row per memoized result). Both are
//! accessed through sqlx pools configured identically.

pub mod models;
pub mod repositories;
pub mod session;
pub mod time;

pub use session::{RetryPolicy, SessionFactory, SessionGuard, SqliteSession, SqliteSessionFactory};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;

use crate::Result;
use crate::utils::fs::io_error;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 8;

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Default WAL auto-checkpoint threshold in pages.
const DEFAULT_WAL_AUTOCHECKPOINT_PAGES: i32 = 1000;

/// Limit WAL size growth (bytes).
const DEFAULT_JOURNAL_SIZE_LIMIT_BYTES: i64 = 64 * 1024 * 1024;

async fn apply_per_connection_pragmas(
    conn: &mut sqlx::SqliteConnection,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "PRAGMA wal_autocheckpoint = {}",
        DEFAULT_WAL_AUTOCHECKPOINT_PAGES
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!(
        "PRAGMA journal_size_limit = {}",
        DEFAULT_JOURNAL_SIZE_LIMIT_BYTES
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

async fn ensure_wal_mode(pool: &DbPool) -> std::result::Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    let row = sqlx::query("PRAGMA journal_mode")
        .fetch_one(&mut *conn)
        .await?;
    let mode: String = row.get(0);
    if mode != "wal" && mode != "memory" {
        tracing::warn!("journal_mode was '{}', expected 'wal'; re-setting", mode);
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Pin a relative database file to the current directory. Pool connections
/// are opened lazily, possibly after a job has moved the process cwd.
fn resolve_database_path(options: SqliteConnectOptions) -> Result<SqliteConnectOptions> {
    let filename = options.get_filename().to_path_buf();
    let name = filename.to_string_lossy();
    if filename.is_absolute() || name.starts_with(':') || name.starts_with("file:") {
        return Ok(options);
    }
    let absolute =
        std::path::absolute(&filename).map_err(|e| io_error("resolving", &filename, e))?;
    Ok(options.filename(absolute))
}

/// Initialize a connection pool in WAL mode.
///
/// # Arguments
/// * `database_url` - SQLite database URL (e.g., "sqlite:jobs.db?mode=rwc")
pub async fn init_pool(database_url: &str) -> Result<DbPool> {
    let connect_options = resolve_database_path(SqliteConnectOptions::from_str(database_url)?)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(DEFAULT_POOL_SIZE)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options)
        .await?;

    ensure_wal_mode(&pool).await?;

    tracing::debug!(
        "Database pool initialized with WAL mode, {} max connections",
        DEFAULT_POOL_SIZE
    );

    Ok(pool)
}

/// Apply the job store schema (`job`, `job_event`).
pub async fn run_job_migrations(pool: &DbPool) -> Result<()> {
    tracing::debug!("Running job store migrations...");
    let mut migrator = sqlx::migrate!("./migrations/jobs");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await?;
    Ok(())
}

/// Apply the cache index schema (`cache_entry`).
pub async fn run_cache_migrations(pool: &DbPool) -> Result<()> {
    tracing::debug!("Running cache index migrations...");
    let mut migrator = sqlx::migrate!("./migrations/cache");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_pool_uses_wal() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("t.db").display());
        let pool = init_pool(&url).await.unwrap();

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(result.0, "wal");
    }

    #[test]
    #[serial_test::serial(cwd)]
    fn test_relative_database_path_is_pinned() {
        let options = SqliteConnectOptions::from_str("sqlite:jobs.db?mode=rwc").unwrap();
        let resolved = resolve_database_path(options).unwrap();
        assert_eq!(
            resolved.get_filename(),
            std::env::current_dir().unwrap().join("jobs.db")
        );

        let memory = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let before = memory.get_filename().to_path_buf();
        assert_eq!(resolve_database_path(memory).unwrap().get_filename(), before);
    }

    #[tokio::test]
    async fn test_both_schemas_share_one_database() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("t.db").display());
        let pool = init_pool(&url).await.unwrap();

        run_job_migrations(&pool).await.unwrap();
        run_cache_migrations(&pool).await.unwrap();
        // Re-running either set after the other is a no-op.
        run_job_migrations(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('job', 'job_event', 'cache_entry') ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<_> = tables.into_iter().map(|t| t.0).collect();
        assert_eq!(names, vec!["cache_entry", "job", "job_event"]);
    }
}
