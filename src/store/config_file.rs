use super::{StoreError, read_optional, write_atomic};
use crate::domain::{LocalEndpointConfig, RemoteConfig};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOCAL_CONFIG_FILE: &str = "config.json";
const REMOTE_CACHE_FILE: &str = "remote_config.json";

/// Local endpoint config and the cached copy of the last remote config.
#[derive(Debug, Clone)]
pub struct ConfigFiles {
    local_path: PathBuf,
    remote_cache_path: PathBuf,
}

impl ConfigFiles {
    pub fn new(dir: &Path) -> Self {
        Self {
            local_path: dir.join(LOCAL_CONFIG_FILE),
            remote_cache_path: dir.join(REMOTE_CACHE_FILE),
        }
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn remote_cache_path(&self) -> &Path {
        &self.remote_cache_path
    }

    pub async fn load_local(&self) -> Result<Option<LocalEndpointConfig>, StoreError> {
        load_json(&self.local_path).await
    }

    pub async fn save_local(&self, config: &LocalEndpointConfig) -> Result<(), StoreError> {
        save_json(&self.local_path, config).await
    }

    pub async fn load_remote_cache(&self) -> Result<Option<RemoteConfig>, StoreError> {
        load_json(&self.remote_cache_path).await
    }

    pub async fn save_remote_cache(&self, config: &RemoteConfig) -> Result<(), StoreError> {
        save_json(&self.remote_cache_path, config).await
    }
}

async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let Some(content) = read_optional(path).await? else {
        debug!(path = %path.display(), "config file not present");
        return Ok(None);
    };

    match serde_json::from_str(&content) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable config file");
            Ok(None)
        }
    }
}

async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_config_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let files = ConfigFiles::new(temp_dir.path());
        assert!(files.load_local().await.unwrap().is_none());

        let config = LocalEndpointConfig {
            endpoint: "https://collector.example/upload".into(),
            token: Some("t0k".into()),
        };
        files.save_local(&config).await.unwrap();
        assert_eq!(files.load_local().await.unwrap(), Some(config));
    }

    #[tokio::test]
    async fn test_remote_cache_keeps_only_present_fields() {
        let temp_dir = TempDir::new().unwrap();
        let files = ConfigFiles::new(temp_dir.path());

        let config = RemoteConfig {
            enabled: Some(true),
            upload_interval_hours: Some(6.0),
            ..Default::default()
        };
        files.save_remote_cache(&config).await.unwrap();

        let raw = std::fs::read_to_string(files.remote_cache_path()).unwrap();
        assert!(!raw.contains("endpoint"));
        assert_eq!(files.load_remote_cache().await.unwrap(), Some(config));
    }

    #[tokio::test]
    async fn test_corrupt_file_reads_as_absent() {
        let temp_dir = TempDir::new().unwrap();
        let files = ConfigFiles::new(temp_dir.path());
        std::fs::write(files.remote_cache_path(), "{not json").unwrap();
        assert!(files.load_remote_cache().await.unwrap().is_none());
    }
}
