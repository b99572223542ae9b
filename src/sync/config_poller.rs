use crate::domain::{AppliedChanges, RemoteConfig, SettingsHandle};
use crate::sender::{ClientError, HttpClient};
use crate::store::ConfigFiles;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

#[cfg(test)]
use mockall::automock;

pub const DEFAULT_CONFIG_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Where operating configuration is fetched from.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteConfigSource: Send + Sync {
    async fn fetch(&self) -> Result<RemoteConfig, ClientError>;
}

/// Plain HTTP GET of a JSON config document.
#[derive(Debug, Clone)]
pub struct HttpConfigSource {
    client: HttpClient,
    url: Url,
    timeout: Duration,
}

impl HttpConfigSource {
    pub fn new(client: HttpClient, url: &str, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            client,
            url: HttpClient::parse_url(url)?,
            timeout,
        })
    }
}

#[async_trait]
impl RemoteConfigSource for HttpConfigSource {
    async fn fetch(&self) -> Result<RemoteConfig, ClientError> {
        let document = self.client.get_json(self.url.clone(), self.timeout).await?;
        serde_json::from_value(document).map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigOrigin {
    Remote,
    Cache,
}

/// Result of one `check_remote_config` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigCheck {
    /// Checked too recently; nothing was fetched or applied.
    Skipped { next_check_in: Duration },
    Applied {
        origin: ConfigOrigin,
        changes: AppliedChanges,
    },
    /// Remote fetch failed and no cached copy exists.
    Failed { reason: String },
}

impl ConfigCheck {
    pub fn is_skipped(&self) -> bool {
        matches!(self, ConfigCheck::Skipped { .. })
    }
}

/// Interval-gated remote config refresh with a local cache fallback.
pub struct ConfigPoller {
    source: Option<Arc<dyn RemoteConfigSource>>,
    files: ConfigFiles,
    settings: SettingsHandle,
    interval: Duration,
    last_check: Mutex<Option<Instant>>,
}

impl ConfigPoller {
    pub fn new(
        source: Option<Arc<dyn RemoteConfigSource>>,
        files: ConfigFiles,
        settings: SettingsHandle,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            files,
            settings,
            interval,
            last_check: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn check_remote_config(&self) -> ConfigCheck {
        {
            let mut last_check = self.last_check.lock();
            if let Some(last) = *last_check {
                let elapsed = last.elapsed();
                if elapsed < self.interval {
                    return ConfigCheck::Skipped {
                        next_check_in: self.interval - elapsed,
                    };
                }
            }
            // Claimed before fetching so a failing source is not hammered
            *last_check = Some(Instant::now());
        }

        let fetched = match &self.source {
            Some(source) => source.fetch().await,
            None => Err(ClientError::InvalidConfiguration(
                "no remote config source".into(),
            )),
        };

        match fetched {
            Ok(remote) => {
                let changes = self.settings.apply_remote(&remote);
                if let Err(e) = self.files.save_remote_cache(&remote).await {
                    warn!(error = %e, "failed to cache remote config");
                }
                if changes.any() {
                    info!(?changes, "applied remote config");
                } else {
                    debug!("remote config unchanged");
                }
                ConfigCheck::Applied {
                    origin: ConfigOrigin::Remote,
                    changes,
                }
            }
            Err(fetch_error) => {
                warn!(error = %fetch_error, "remote config fetch failed, trying cache");
                match self.files.load_remote_cache().await {
                    Ok(Some(cached)) => {
                        let changes = self.settings.apply_remote(&cached);
                        info!(?changes, "applied cached remote config");
                        ConfigCheck::Applied {
                            origin: ConfigOrigin::Cache,
                            changes,
                        }
                    }
                    Ok(None) => ConfigCheck::Failed {
                        reason: fetch_error.to_string(),
                    },
                    Err(cache_error) => ConfigCheck::Failed {
                        reason: format!("{fetch_error}; cache: {cache_error}"),
                    },
                }
            }
        }
    }
}
