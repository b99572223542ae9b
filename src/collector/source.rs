use super::CollectorError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Read-only access to the externally owned session cache.
///
/// `snapshot` returns the raw cache document in either accepted shape;
/// callers normalize it with [`crate::domain::normalize_cache`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn snapshot(&self) -> Result<Value, CollectorError>;
}

/// Cache held in memory and swapped wholesale by its owner.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionCache {
    cache: Arc<RwLock<Arc<Value>>>,
}

impl InMemorySessionCache {
    pub fn new(cache: Value) -> Self {
        Self {
            cache: Arc::new(RwLock::new(Arc::new(cache))),
        }
    }

    pub fn set_cache(&self, cache: Value) {
        *self.cache.write() = Arc::new(cache);
    }
}

#[async_trait]
impl SessionSource for InMemorySessionCache {
    async fn snapshot(&self) -> Result<Value, CollectorError> {
        let current = self.cache.read().clone();
        Ok(Value::clone(&current))
    }
}

/// Cache maintained by another process as a JSON file. Re-read on every snapshot.
#[derive(Debug, Clone)]
pub struct JsonFileSessionSource {
    path: PathBuf,
}

impl JsonFileSessionSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SessionSource for JsonFileSessionSource {
    async fn snapshot(&self) -> Result<Value, CollectorError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "session cache file not present yet");
                Ok(Value::Object(Map::new()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
