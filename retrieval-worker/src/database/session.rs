//! Session guard for coordination-database access.
//!
//! [`SessionGuard::run`] wraps an operation that needs a database session.
//! When the caller passes its own session the operation runs inside it and
//! the caller keeps ownership; otherwise a session is opened for the attempt
//! and closed afterwards (committed on success, rolled back on failure).
//! Transient errors are retried up to [`RetryPolicy::max_attempts`] times.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::random;
use sqlx::{Sqlite, Transaction};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::DbPool;
use crate::Result;

/// Opens and closes database sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Send;

    async fn open(&self) -> Result<Self::Session>;

    /// Close a session this guard opened. `commit` is true when the wrapped
    /// operation succeeded.
    async fn close(&self, session: Self::Session, commit: bool) -> Result<()>;
}

/// A session on the SQLite stores is a pool transaction.
pub type SqliteSession = Transaction<'static, Sqlite>;

#[derive(Clone)]
pub struct SqliteSessionFactory {
    pool: DbPool,
}

impl SqliteSessionFactory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl SessionFactory for SqliteSessionFactory {
    type Session = SqliteSession;

    async fn open(&self) -> Result<SqliteSession> {
        Ok(self.pool.begin().await?)
    }

    async fn close(&self, session: SqliteSession, commit: bool) -> Result<()> {
        if commit {
            session.commit().await?;
        } else {
            session.rollback().await?;
        }
        Ok(())
    }
}

/// Retry policy for transient database errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Default::default()
        }
    }

    /// Delay before the attempt following `attempt` (1-based): exponential
    /// back-off plus up to 25% jitter, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let shift = attempt.saturating_sub(1).min(20);
        let capped_ms = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
        Duration::from_millis((capped_ms + jitter_ms).min(max_ms))
    }
}

/// Runs operations against sessions from `F`, with bounded retry.
pub struct SessionGuard<F> {
    factory: Arc<F>,
    policy: RetryPolicy,
}

impl<F> Clone for SessionGuard<F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            policy: self.policy,
        }
    }
}

impl<F: SessionFactory> SessionGuard<F> {
    pub fn new(factory: F, policy: RetryPolicy) -> Self {
        Self {
            factory: Arc::new(factory),
            policy,
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `op` with a session.
    ///
    /// With `Some(session)` the operation reuses the caller's session, which
    /// is never closed here. With `None` every attempt gets its own session.
    pub async fn run<T, Op>(
        &self,
        op_name: &'static str,
        mut session: Option<&mut F::Session>,
        mut op: Op,
    ) -> Result<T>
    where
        T: Send,
        Op: for<'s> FnMut(&'s mut F::Session) -> BoxFuture<'s, Result<T>> + Send,
    {
        let mut attempt = 1u32;
        loop {
            let result = match session.as_deref_mut() {
                Some(session) => op(session).await,
                None => self.run_in_new_session(op_name, &mut op).await,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    debug!(
                        "Transient database error during {}: {}; retrying in {:?} (attempt {}/{})",
                        op_name, err, delay, attempt, self.policy.max_attempts
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(
                            "{} failed after {} attempts: {}",
                            op_name, attempt, err
                        );
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn run_in_new_session<T, Op>(&self, op_name: &'static str, op: &mut Op) -> Result<T>
    where
        T: Send,
        Op: for<'s> FnMut(&'s mut F::Session) -> BoxFuture<'s, Result<T>> + Send,
    {
        let mut session = self.factory.open().await?;
        let result = op(&mut session).await;
        let closed = self.factory.close(session, result.is_ok()).await;

        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                warn!("Failed to close session after {} failed: {}", op_name, close_err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        assert_eq!(policy.delay_for(9), Duration::from_millis(500));
    }

    #[test]
    fn test_at_least_one_attempt() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
