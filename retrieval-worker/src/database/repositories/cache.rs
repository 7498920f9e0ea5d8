//! Cache index repository.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::database::models::{CacheEntry, CacheEntryDbModel, EvictionMethod, NewCacheEntry};
use crate::database::session::{RetryPolicy, SessionGuard, SqliteSessionFactory};
use crate::database::time::now_ms;
use crate::database::{DbPool, init_pool, run_cache_migrations};
use crate::utils::fs::remove_path;
use crate::{Error, Result};

/// Which collections an expiry targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionSelector {
    All,
    Tags(Vec<String>),
}

/// Live entries matching a collection selector and a `[after, before)`
/// creation window.
#[derive(Debug, Clone)]
pub struct ExpiryFilter {
    pub collections: CollectionSelector,
    pub after: Option<i64>,
    pub before: Option<i64>,
    /// Entries whose expiration is at or before this instant are not live.
    pub now: i64,
}

impl ExpiryFilter {
    fn push_where<'a>(&'a self, qb: &mut QueryBuilder<'a, Sqlite>) {
        qb.push(" WHERE (expiration IS NULL OR expiration > ");
        qb.push_bind(self.now);
        qb.push(")");

        if let CollectionSelector::Tags(tags) = &self.collections {
            if tags.is_empty() {
                qb.push(" AND 0");
            } else {
                qb.push(" AND tag IN (");
                let mut separated = qb.separated(", ");
                for tag in tags {
                    separated.push_bind(tag.as_str());
                }
                separated.push_unseparated(")");
            }
        }
        if let Some(after) = self.after {
            qb.push(" AND created_at >= ");
            qb.push_bind(after);
        }
        if let Some(before) = self.before {
            qb.push(" AND created_at < ");
            qb.push_bind(before);
        }
    }
}

/// Index of memoized results.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up a live entry. A hit refreshes its access time and count.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Insert or replace the entry for `entry.key`.
    async fn insert(&self, entry: &NewCacheEntry) -> Result<CacheEntry>;

    /// Remove the index row only. Removing a missing row is a no-op.
    async fn remove_index_entry(&self, id: i64) -> Result<bool>;

    /// Entries of `location` in eviction order: expired rows first, then by
    /// `method`.
    async fn eviction_candidates(
        &self,
        location: &str,
        method: EvictionMethod,
        now: i64,
        limit: u32,
    ) -> Result<Vec<CacheEntry>>;

    async fn is_known_file(&self, location: &str, file_name: &str) -> Result<bool>;

    async fn count_matching(&self, filter: &ExpiryFilter) -> Result<u64>;

    async fn matching(&self, filter: &ExpiryFilter, limit: u32) -> Result<Vec<CacheEntry>>;

    /// Mark entries expired at `at`. Returns the number of rows changed.
    async fn expire(&self, ids: &[i64], at: i64) -> Result<u64>;

    /// Remove the index row, then the artifact. Idempotent.
    async fn delete(&self, entry: &CacheEntry) -> Result<bool> {
        let removed = self.remove_index_entry(entry.id).await?;
        remove_path(&entry.artifact_path()).await?;
        Ok(removed)
    }
}

#[derive(Clone)]
pub struct SqliteCacheStore {
    guard: SessionGuard<SqliteSessionFactory>,
}

impl SqliteCacheStore {
    pub fn new(pool: DbPool, policy: RetryPolicy) -> Self {
        Self {
            guard: SessionGuard::new(SqliteSessionFactory::new(pool), policy),
        }
    }

    /// Open the index at `database_url` and apply its schema.
    pub async fn connect(database_url: &str, policy: RetryPolicy) -> Result<Self> {
        let pool = init_pool(database_url).await?;
        run_cache_migrations(&pool).await?;
        Ok(Self::new(pool, policy))
    }

    pub fn pool(&self) -> &DbPool {
        self.guard.factory().pool()
    }

    async fn fetch_entries(
        conn: &mut SqliteConnection,
        mut qb: QueryBuilder<'_, Sqlite>,
    ) -> Result<Vec<CacheEntry>> {
        qb.build_query_as::<CacheEntryDbModel>()
            .fetch_all(conn)
            .await?
            .into_iter()
            .map(CacheEntryDbModel::into_entry)
            .collect()
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let model = self
            .guard
            .run("get_cache_entry", None, |tx| {
                let key = key.to_string();
                Box::pin(async move {
                    let now = now_ms();
                    let model = sqlx::query_as::<_, CacheEntryDbModel>(
                        r#"
                        UPDATE cache_entry
                        SET last_accessed_at = ?, access_count = access_count + 1
                        WHERE key = ? AND (expiration IS NULL OR expiration > ?)
                        RETURNING *
                        "#,
                    )
                    .bind(now)
                    .bind(&key)
                    .bind(now)
                    .fetch_optional(&mut **tx)
                    .await?;
                    Ok(model)
                })
            })
            .await?;
        model.map(CacheEntryDbModel::into_entry).transpose()
    }

    async fn insert(&self, entry: &NewCacheEntry) -> Result<CacheEntry> {
        let model = self
            .guard
            .run("insert_cache_entry", None, |tx| {
                let entry = entry.clone();
                Box::pin(async move {
                    let now = now_ms();
                    let result = serde_json::to_string(&entry.result)?;
                    let model = sqlx::query_as::<_, CacheEntryDbModel>(
                        r#"
                        INSERT INTO cache_entry
                            (key, result, size, tag, volume, location, file_name, created_at, last_accessed_at, access_count, expiration)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL)
                        ON CONFLICT(key) DO UPDATE SET
                            result = excluded.result,
                            size = excluded.size,
                            tag = excluded.tag,
                            volume = excluded.volume,
                            location = excluded.location,
                            file_name = excluded.file_name,
                            created_at = excluded.created_at,
                            last_accessed_at = excluded.last_accessed_at,
                            access_count = 0,
                            expiration = NULL
                        RETURNING *
                        "#,
                    )
                    .bind(&entry.key)
                    .bind(result)
                    .bind(entry.size as i64)
                    .bind(&entry.tag)
                    .bind(&entry.volume)
                    .bind(&entry.location)
                    .bind(&entry.file_name)
                    .bind(now)
                    .bind(now)
                    .fetch_one(&mut **tx)
                    .await?;
                    Ok(model)
                })
            })
            .await?;
        model.into_entry()
    }

    async fn remove_index_entry(&self, id: i64) -> Result<bool> {
        self.guard
            .run("remove_cache_entry", None, |tx| {
                Box::pin(async move {
                    let result = sqlx::query("DELETE FROM cache_entry WHERE id = ?")
                        .bind(id)
                        .execute(&mut **tx)
                        .await?;
                    Ok(result.rows_affected() > 0)
                })
            })
            .await
    }

    async fn eviction_candidates(
        &self,
        location: &str,
        method: EvictionMethod,
        now: i64,
        limit: u32,
    ) -> Result<Vec<CacheEntry>> {
        let order = match method {
            EvictionMethod::Lru => "last_accessed_at ASC, id ASC",
            EvictionMethod::Lfu => "access_count ASC, last_accessed_at ASC, id ASC",
        };
        self.guard
            .run("cache_eviction_candidates", None, |tx| {
                let location = location.to_string();
                Box::pin(async move {
                    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM cache_entry WHERE location = ");
                    qb.push_bind(location);
                    qb.push(" ORDER BY (expiration IS NOT NULL AND expiration <= ");
                    qb.push_bind(now);
                    qb.push(") DESC, ");
                    qb.push(order);
                    qb.push(" LIMIT ");
                    qb.push_bind(i64::from(limit));
                    Self::fetch_entries(&mut **tx, qb).await
                })
            })
            .await
    }

    async fn is_known_file(&self, location: &str, file_name: &str) -> Result<bool> {
        self.guard
            .run("cache_is_known_file", None, |tx| {
                let location = location.to_string();
                let file_name = file_name.to_string();
                Box::pin(async move {
                    let found: Option<(i64,)> = sqlx::query_as(
                        "SELECT id FROM cache_entry WHERE location = ? AND file_name = ? LIMIT 1",
                    )
                    .bind(&location)
                    .bind(&file_name)
                    .fetch_optional(&mut **tx)
                    .await?;
                    Ok(found.is_some())
                })
            })
            .await
    }

    async fn count_matching(&self, filter: &ExpiryFilter) -> Result<u64> {
        self.guard
            .run("count_cache_entries", None, |tx| {
                let filter = filter.clone();
                Box::pin(async move {
                    let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM cache_entry");
                    filter.push_where(&mut qb);
                    let (count,): (i64,) = qb.build_query_as().fetch_one(&mut **tx).await?;
                    Ok(count.max(0) as u64)
                })
            })
            .await
    }

    async fn matching(&self, filter: &ExpiryFilter, limit: u32) -> Result<Vec<CacheEntry>> {
        self.guard
            .run("list_cache_entries", None, |tx| {
                let filter = filter.clone();
                Box::pin(async move {
                    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM cache_entry");
                    filter.push_where(&mut qb);
                    qb.push(" ORDER BY created_at ASC, id ASC LIMIT ");
                    qb.push_bind(i64::from(limit));
                    Self::fetch_entries(&mut **tx, qb).await
                })
            })
            .await
    }

    async fn expire(&self, ids: &[i64], at: i64) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.guard
            .run("expire_cache_entries", None, |tx| {
                let ids = ids.to_vec();
                Box::pin(async move {
                    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE cache_entry SET expiration = ");
                    qb.push_bind(at);
                    qb.push(" WHERE id IN (");
                    let mut separated = qb.separated(", ");
                    for id in ids {
                        separated.push_bind(id);
                    }
                    separated.push_unseparated(")");
                    let result = qb.build().execute(&mut **tx).await?;
                    Ok(result.rows_affected())
                })
            })
            .await
    }
}

impl std::fmt::Debug for SqliteCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCacheStore").finish_non_exhaustive()
    }
}

/// Reject malformed windows before touching the index.
pub fn validate_window(after: Option<i64>, before: Option<i64>) -> Result<()> {
    match (after, before) {
        (Some(after), Some(before)) if after >= before => Err(Error::validation(
            "`after` must be earlier than `before`",
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::ResultDescriptor;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqliteCacheStore) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("cache.db").display());
        let store = SqliteCacheStore::connect(&url, RetryPolicy::default())
            .await
            .unwrap();
        (dir, store)
    }

    fn new_entry(key: &str, tag: Option<&str>, size: u64) -> NewCacheEntry {
        NewCacheEntry {
            key: key.to_string(),
            result: ResultDescriptor {
                urlpath: format!("file:///cache/{key}.json"),
                content_type: "application/json".into(),
                size,
            },
            size,
            tag: tag.map(str::to_string),
            volume: "/cache".into(),
            location: "/cache".into(),
            file_name: format!("{key}.json"),
        }
    }

    #[tokio::test]
    async fn test_get_bumps_access() {
        let (_dir, store) = setup().await;
        store.insert(&new_entry("k1", None, 10)).await.unwrap();

        let first = store.get("k1").await.unwrap().unwrap();
        let second = store.get("k1").await.unwrap().unwrap();
        assert_eq!(first.access_count, 1);
        assert_eq!(second.access_count, 2);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_is_upsert_by_key() {
        let (_dir, store) = setup().await;
        let a = store.insert(&new_entry("k1", Some("a"), 10)).await.unwrap();
        let b = store.insert(&new_entry("k1", Some("b"), 20)).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.size, 20);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cache_entry")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_expired_rows_are_not_served_and_evicted_first() {
        let (_dir, store) = setup().await;
        let old = store.insert(&new_entry("old", None, 1)).await.unwrap();
        let fresh = store.insert(&new_entry("fresh", None, 1)).await.unwrap();
        sqlx::query("UPDATE cache_entry SET last_accessed_at = 1 WHERE id = ?")
            .bind(old.id)
            .execute(store.pool())
            .await
            .unwrap();

        let now = now_ms();
        assert_eq!(store.expire(&[fresh.id], now).await.unwrap(), 1);
        assert!(store.get("fresh").await.unwrap().is_none());

        let order = store
            .eviction_candidates("/cache", EvictionMethod::Lru, now, 10)
            .await
            .unwrap();
        let keys: Vec<_> = order.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["fresh", "old"]);
    }

    #[tokio::test]
    async fn test_matching_filters_tags_and_window() {
        let (_dir, store) = setup().await;
        store.insert(&new_entry("a", Some("foo"), 1)).await.unwrap();
        store.insert(&new_entry("b", Some("bar"), 1)).await.unwrap();
        store.insert(&new_entry("c", None, 1)).await.unwrap();
        let now = now_ms();

        let mut filter = ExpiryFilter {
            collections: CollectionSelector::Tags(vec!["foo".into(), "bar".into()]),
            after: Some(now - 60_000),
            before: Some(now + 60_000),
            now,
        };
        assert_eq!(store.count_matching(&filter).await.unwrap(), 2);

        filter.collections = CollectionSelector::All;
        assert_eq!(store.count_matching(&filter).await.unwrap(), 3);

        filter.before = Some(now - 30_000);
        assert_eq!(store.count_matching(&filter).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, store) = setup().await;
        let entry = store.insert(&new_entry("k", None, 1)).await.unwrap();
        assert!(store.delete(&entry).await.unwrap());
        assert!(!store.delete(&entry).await.unwrap());
    }

    #[test]
    fn test_validate_window() {
        assert!(validate_window(Some(1), Some(2)).is_ok());
        assert!(validate_window(Some(2), Some(2)).is_err());
        assert!(validate_window(None, Some(2)).is_ok());
    }
}
