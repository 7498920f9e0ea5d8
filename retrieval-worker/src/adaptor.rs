//! Retrieval adaptors.
//!
//! Jobs name the adaptor that serves them by a stable identifier. The
//! [`AdaptorRegistry`] maps identifiers to factories linked into this
//! binary; nothing is loaded or evaluated from job payloads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::cache::normalize_object;
use crate::context::ExecutionContext;
use crate::utils::fs::io_error;
use crate::{Error, Result};

/// File produced by an adaptor inside the job's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedArtifact {
    pub path: PathBuf,
    pub content_type: String,
}

#[async_trait]
pub trait Adaptor: Send + Sync {
    /// Produce the artifact for `request`, writing only under `workdir`.
    async fn retrieve(&self, request: &Map<String, Value>, workdir: &Path)
    -> Result<RetrievedArtifact>;
}

pub trait AdaptorFactory: Send + Sync {
    fn create(
        &self,
        config: &Map<String, Value>,
        form: &Value,
        ctx: Arc<ExecutionContext>,
    ) -> Result<Box<dyn Adaptor>>;
}

impl<F> AdaptorFactory for F
where
    F: Fn(&Map<String, Value>, &Value, Arc<ExecutionContext>) -> Result<Box<dyn Adaptor>>
        + Send
        + Sync,
{
    fn create(
        &self,
        config: &Map<String, Value>,
        form: &Value,
        ctx: Arc<ExecutionContext>,
    ) -> Result<Box<dyn Adaptor>> {
        self(config, form, ctx)
    }
}

#[derive(Clone, Default)]
pub struct AdaptorRegistry {
    factories: HashMap<String, Arc<dyn AdaptorFactory>>,
}

impl AdaptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the adaptors shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(EchoAdaptor::ID, EchoFactory);
        registry.register(FileCopyAdaptor::ID, FileCopyFactory);
        registry
    }

    pub fn register(&mut self, id: impl Into<String>, factory: impl AdaptorFactory + 'static) {
        self.factories.insert(id.into(), Arc::new(factory));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn create(
        &self,
        id: &str,
        config: &Map<String, Value>,
        form: &Value,
        ctx: Arc<ExecutionContext>,
    ) -> Result<Box<dyn Adaptor>> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| Error::UnknownAdaptor(id.to_string()))?;
        factory.create(config, form, ctx)
    }
}

impl std::fmt::Debug for AdaptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptorRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

/// Writes the normalized request back as a JSON document.
///
/// Config: `delay_ms` (optional) sleeps before writing.
pub struct EchoAdaptor {
    delay: Duration,
    ctx: Arc<ExecutionContext>,
}

impl EchoAdaptor {
    pub const ID: &'static str = "echo";
}

struct EchoFactory;

impl AdaptorFactory for EchoFactory {
    fn create(
        &self,
        config: &Map<String, Value>,
        _form: &Value,
        ctx: Arc<ExecutionContext>,
    ) -> Result<Box<dyn Adaptor>> {
        let delay_ms = match config.get("delay_ms") {
            None | Some(Value::Null) => 0,
            Some(value) => value
                .as_u64()
                .ok_or_else(|| Error::config("echo: `delay_ms` must be a non-negative integer"))?,
        };
        Ok(Box::new(EchoAdaptor {
            delay: Duration::from_millis(delay_ms),
            ctx,
        }))
    }
}

#[async_trait]
impl Adaptor for EchoAdaptor {
    async fn retrieve(
        &self,
        request: &Map<String, Value>,
        workdir: &Path,
    ) -> Result<RetrievedArtifact> {
        self.ctx.write("Echoing ");
        self.ctx.write(&format!("{} request fields", request.len()));
        self.ctx.flush().await?;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let path = workdir.join("request.json");
        let body = serde_json::to_vec_pretty(&normalize_object(request))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| io_error("writing", &path, e))?;

        Ok(RetrievedArtifact {
            path,
            content_type: "application/json".to_string(),
        })
    }
}

/// Copies the local file named by the request's `path` field.
pub struct FileCopyAdaptor {
    ctx: Arc<ExecutionContext>,
}

impl FileCopyAdaptor {
    pub const ID: &'static str = "file-copy";
}

struct FileCopyFactory;

impl AdaptorFactory for FileCopyFactory {
    fn create(
        &self,
        _config: &Map<String, Value>,
        _form: &Value,
        ctx: Arc<ExecutionContext>,
    ) -> Result<Box<dyn Adaptor>> {
        Ok(Box::new(FileCopyAdaptor { ctx }))
    }
}

#[async_trait]
impl Adaptor for FileCopyAdaptor {
    async fn retrieve(
        &self,
        request: &Map<String, Value>,
        workdir: &Path,
    ) -> Result<RetrievedArtifact> {
        let source = request
            .get("path")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| Error::adaptor("InvalidRequest", "`path` is required"))?;

        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(Error::adaptor(
                "FileNotFound",
                format!("no such file: {}", source.display()),
            ));
        }

        let file_name = source
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("artifact"));
        let target = workdir.join(file_name);
        let copied = tokio::fs::copy(&source, &target)
            .await
            .map_err(|e| io_error("copying", &source, e))?;
        self.ctx
            .info(&format!("Copied {} bytes from {}", copied, source.display()))
            .await?;

        let content_type = request
            .get("content_type")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream")
            .to_string();

        Ok(RetrievedArtifact {
            path: target,
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = AdaptorRegistry::with_builtins();
        assert_eq!(registry.ids(), vec!["echo", "file-copy"]);
        assert!(registry.contains("echo"));
        assert!(!registry.contains("python-entry-point"));
    }
}
