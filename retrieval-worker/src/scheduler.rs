//! Interface to the job scheduler that dispatches work to this process.

use std::fmt;

use serde_json::Value;
use tracing::info;

use crate::{Error, Result};

/// Host and process a job runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub hostname: String,
    pub pid: u32,
}

impl WorkerIdentity {
    pub fn current() -> Self {
        Self {
            hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
            pid: std::process::id(),
        }
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.pid)
    }
}

pub trait Scheduler: Send + Sync {
    /// Identifier of the job this process was dispatched for.
    fn current_job_id(&self) -> Result<String>;

    fn worker_identity(&self) -> WorkerIdentity;

    fn emit_telemetry(&self, name: &str, payload: Value);
}

/// Scheduler binding read from the process environment (`JOB_ID`).
/// Telemetry is emitted as `tracing` events.
#[derive(Debug, Clone)]
pub struct EnvScheduler {
    job_id: Option<String>,
    identity: WorkerIdentity,
}

impl EnvScheduler {
    pub fn from_env() -> Self {
        Self::new(std::env::var("JOB_ID").ok())
    }

    pub fn new(job_id: Option<String>) -> Self {
        Self {
            job_id: job_id.filter(|id| !id.trim().is_empty()),
            identity: WorkerIdentity::current(),
        }
    }
}

impl Scheduler for EnvScheduler {
    fn current_job_id(&self) -> Result<String> {
        self.job_id
            .clone()
            .ok_or_else(|| Error::config("no job id bound to this process (JOB_ID is not set)"))
    }

    fn worker_identity(&self) -> WorkerIdentity {
        self.identity.clone()
    }

    fn emit_telemetry(&self, name: &str, payload: Value) {
        info!(target: "retrieval_worker::telemetry", telemetry = name, payload = %payload);
    }
}
