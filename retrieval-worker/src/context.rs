//! Per-job execution context.
//!
//! Adaptors report progress through an [`ExecutionContext`]. Every message
//! goes to `tracing` tagged with the job id; messages at or above the
//! configured threshold are also appended to the job's durable events before
//! the call returns.

use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::Level;

use crate::database::models::{EventType, JobEventDbModel};
use crate::database::repositories::JobStore;
use crate::scheduler::WorkerIdentity;
use crate::{Error, Result};

/// Severity of a context log message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warning),
            "ERROR" | "CRITICAL" => Ok(Self::Error),
            other => Err(Error::config(format!("unknown log level: {other}"))),
        }
    }
}

/// Level -> (persisted event type, tracing level).
const DISPATCH: [(LogLevel, EventType, Level); 4] = [
    (LogLevel::Debug, EventType::Info, Level::DEBUG),
    (LogLevel::Info, EventType::Info, Level::INFO),
    (LogLevel::Warning, EventType::Warning, Level::WARN),
    (LogLevel::Error, EventType::Error, Level::ERROR),
];

impl LogLevel {
    fn dispatch(self) -> (EventType, Level) {
        let (_, event_type, level) = DISPATCH[self as usize];
        (event_type, level)
    }
}

fn emit(level: Level, job_id: &str, event_type: EventType, user_request: bool, message: &str) {
    let event_type: &'static str = event_type.into();
    match level {
        Level::ERROR => tracing::error!(job_id, event_type, user_request, "{}", message),
        Level::WARN => tracing::warn!(job_id, event_type, user_request, "{}", message),
        Level::INFO => tracing::info!(job_id, event_type, user_request, "{}", message),
        Level::DEBUG => tracing::debug!(job_id, event_type, user_request, "{}", message),
        _ => tracing::trace!(job_id, event_type, user_request, "{}", message),
    }
}

pub struct ExecutionContext {
    job_id: String,
    store: Arc<dyn JobStore>,
    threshold: LogLevel,
    buffer: Mutex<String>,
}

impl ExecutionContext {
    pub fn new(job_id: impl Into<String>, store: Arc<dyn JobStore>, threshold: LogLevel) -> Self {
        Self {
            job_id: job_id.into(),
            store,
            threshold,
            buffer: Mutex::new(String::new()),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn threshold(&self) -> LogLevel {
        self.threshold
    }

    pub async fn log(&self, level: LogLevel, message: &str) -> Result<()> {
        let (event_type, tracing_level) = level.dispatch();
        emit(tracing_level, &self.job_id, event_type, false, message);

        if level >= self.threshold {
            self.store.add_event(&self.job_id, event_type, message).await?;
        }
        Ok(())
    }

    pub async fn debug(&self, message: &str) -> Result<()> {
        self.log(LogLevel::Debug, message).await
    }

    pub async fn info(&self, message: &str) -> Result<()> {
        self.log(LogLevel::Info, message).await
    }

    pub async fn warning(&self, message: &str) -> Result<()> {
        self.log(LogLevel::Warning, message).await
    }

    pub async fn error(&self, message: &str) -> Result<()> {
        self.log(LogLevel::Error, message).await
    }

    /// Message for the end user. Always persisted, whatever the threshold.
    pub async fn add_user_visible_log(&self, message: &str) -> Result<()> {
        self.user_visible(message, false).await
    }

    pub async fn add_user_visible_error(&self, message: &str) -> Result<()> {
        self.user_visible(message, true).await
    }

    pub async fn user_visible(&self, message: &str, is_error: bool) -> Result<()> {
        let (event_type, level) = if is_error {
            (EventType::UserVisibleError, Level::ERROR)
        } else {
            (EventType::UserVisibleLog, Level::INFO)
        };
        emit(level, &self.job_id, event_type, true, message);
        self.store.add_event(&self.job_id, event_type, message).await
    }

    /// Record which host and process picked up the job.
    pub async fn announce_worker(&self, identity: &WorkerIdentity) -> Result<()> {
        let message = identity.to_string();
        emit(Level::INFO, &self.job_id, EventType::WorkerName, false, &message);
        self.store
            .add_event(&self.job_id, EventType::WorkerName, &message)
            .await
    }

    /// Append a fragment to the write buffer. Nothing is emitted until
    /// [`flush`](Self::flush).
    pub fn write(&self, fragment: &str) {
        self.buffer.lock().push_str(fragment);
    }

    /// Emit the buffered text as one `Info` message and clear the buffer.
    pub async fn flush(&self) -> Result<()> {
        let text = std::mem::take(&mut *self.buffer.lock());
        let text = text.trim_end_matches(['\r', '\n']);
        if text.is_empty() {
            return Ok(());
        }
        self.info(text).await
    }

    pub async fn events(&self) -> Result<Vec<JobEventDbModel>> {
        self.store.list_events(&self.job_id).await
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("job_id", &self.job_id)
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}
