//! Crate-wide error types.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error while {op} {}: {source}", .path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {waited:?} waiting for the execution claim on {key}")]
    ClaimTimeout { key: String, waited: Duration },

    #[error("{message}")]
    Adaptor { kind: String, message: String },

    #[error("Unknown adaptor: {0}")]
    UnknownAdaptor(String),

    #[error("Unsupported storage protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Error raised by a retrieval adaptor. `kind` is what end users see as
    /// the failure class.
    pub fn adaptor(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Adaptor {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Whether this error belongs to the transient-infrastructure class
    /// (database busy/locked, pool exhaustion, lost connection).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DatabaseSqlx(err) => is_transient_sqlx(err),
            Self::Database(msg) => is_busy_message(msg),
            _ => false,
        }
    }

    /// Short failure class shown to end users next to the message.
    pub fn kind_name(&self) -> Cow<'_, str> {
        let name = match self {
            Self::Adaptor { kind, .. } => return Cow::Borrowed(kind.as_str()),
            Self::DatabaseSqlx(_) | Self::Database(_) => "DatabaseError",
            Self::Migration(_) => "MigrationError",
            Self::Serialization(_) => "SerializationError",
            Self::NotFound { .. } => "NotFound",
            Self::Validation(_) => "ValidationError",
            Self::Configuration(_) => "ConfigurationError",
            Self::IoPath { .. } | Self::Io(_) => "IoError",
            Self::ClaimTimeout { .. } => "ClaimTimeout",
            Self::UnknownAdaptor(_) => "UnknownAdaptor",
            Self::UnsupportedProtocol(_) => "UnsupportedProtocol",
            Self::Other(_) => "Error",
        };
        Cow::Borrowed(name)
    }

    /// `"<kind>: <message>"`, without any source chain.
    pub fn user_summary(&self) -> String {
        format!("{}: {}", self.kind_name(), self)
    }
}

fn is_busy_message(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(Cow::into_owned);
            // SQLITE_BUSY / SQLITE_LOCKED
            matches!(code.as_deref(), Some("5") | Some("6")) || is_busy_message(db_err.message())
        }
        other => is_busy_message(&other.to_string()),
    }
}
