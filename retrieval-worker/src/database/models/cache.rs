//! Cache index models.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::Result;

/// Cache index row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CacheEntryDbModel {
    pub id: i64,
    pub key: String,
    /// JSON-encoded [`ResultDescriptor`]
    pub result: String,
    pub size: i64,
    /// Collection the result was produced for
    pub tag: Option<String>,
    /// Volume the artifact lives on, as configured
    pub volume: String,
    /// Directory holding the artifact
    pub location: String,
    pub file_name: String,
    pub created_at: i64,
    pub last_accessed_at: i64,
    pub access_count: i64,
    /// Set when the entry was expired; expired rows are never served
    pub expiration: Option<i64>,
}

impl CacheEntryDbModel {
    pub fn into_entry(self) -> Result<CacheEntry> {
        Ok(CacheEntry {
            result: serde_json::from_str(&self.result)?,
            id: self.id,
            key: self.key,
            size: self.size.max(0) as u64,
            tag: self.tag,
            volume: self.volume,
            location: self.location,
            file_name: self.file_name,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            access_count: self.access_count,
            expiration: self.expiration,
        })
    }
}

/// Identity of a stored result, as handed back to job owners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultDescriptor {
    /// Where the artifact can be read, with its protocol prefix
    pub urlpath: String,
    pub content_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub id: i64,
    pub key: String,
    pub result: ResultDescriptor,
    pub size: u64,
    pub tag: Option<String>,
    pub volume: String,
    pub location: String,
    pub file_name: String,
    pub created_at: i64,
    pub last_accessed_at: i64,
    pub access_count: i64,
    pub expiration: Option<i64>,
}

impl CacheEntry {
    /// Local path of the artifact.
    pub fn artifact_path(&self) -> PathBuf {
        PathBuf::from(&self.location).join(&self.file_name)
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expiration.is_some_and(|at| at <= now_ms)
    }
}

/// Values for a new index row.
#[derive(Debug, Clone)]
pub struct NewCacheEntry {
    pub key: String,
    pub result: ResultDescriptor,
    pub size: u64,
    pub tag: Option<String>,
    pub volume: String,
    pub location: String,
    pub file_name: String,
}

/// Eviction priority used by the janitor.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(ascii_case_insensitive, serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum EvictionMethod {
    /// Least recently used first
    #[default]
    Lru,
    /// Least frequently used first
    Lfu,
}
