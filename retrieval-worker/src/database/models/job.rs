//! Job store models.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;

use crate::Result;
use crate::database::time::now_ms;

/// Job database model.
/// One retrieval request dispatched by the scheduler.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    /// Registry identifier of the adaptor that serves this job
    pub adaptor: String,
    /// JSON object of request parameters
    pub request: String,
    /// JSON object of adaptor configuration
    pub config: String,
    /// JSON form/schema metadata
    pub form: String,
    pub collection_id: Option<String>,
    pub cache_entry_id: Option<i64>,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JobDbModel {
    pub fn new(id: impl Into<String>, adaptor: impl Into<String>, request: &Map<String, Value>) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            adaptor: adaptor.into(),
            request: Value::Object(request.clone()).to_string(),
            config: "{}".to_string(),
            form: "{}".to_string(),
            collection_id: None,
            cache_entry_id: None,
            status: JobStatus::Pending.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_config(mut self, config: &Map<String, Value>) -> Self {
        self.config = Value::Object(config.clone()).to_string();
        self
    }

    pub fn with_form(mut self, form: Value) -> Self {
        self.form = form.to_string();
        self
    }

    pub fn with_collection(mut self, collection_id: impl Into<String>) -> Self {
        self.collection_id = Some(collection_id.into());
        self
    }

    /// Decode the JSON columns.
    pub fn into_job(self) -> Result<Job> {
        Ok(Job {
            request: parse_object(&self.request)?,
            config: parse_object(&self.config)?,
            form: serde_json::from_str(&self.form)?,
            status: self.status.parse().unwrap_or(JobStatus::Pending),
            id: self.id,
            adaptor: self.adaptor,
            collection_id: self.collection_id,
            cache_entry_id: self.cache_entry_id,
        })
    }
}

fn parse_object(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(crate::Error::validation(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

/// A job as read by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub adaptor: String,
    pub request: Map<String, Value>,
    pub config: Map<String, Value>,
    pub form: Value,
    pub collection_id: Option<String>,
    pub cache_entry_id: Option<i64>,
    pub status: JobStatus,
}

/// Job status values recorded by the worker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Kinds of job event.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Info,
    Warning,
    Error,
    UserVisibleLog,
    UserVisibleError,
    WorkerName,
}

impl EventType {
    /// Events surfaced to the end user who submitted the request.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::UserVisibleLog | Self::UserVisibleError)
    }
}

/// Job event database model. Append-only.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobEventDbModel {
    pub id: i64,
    pub job_id: String,
    pub event_type: String,
    pub message: String,
    pub created_at: i64,
}

impl JobEventDbModel {
    pub fn event_type(&self) -> Option<EventType> {
        self.event_type.parse().ok()
    }
}
