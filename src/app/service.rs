use super::config::{Command, Config, ConfigError};
use super::shutdown::{ShutdownReason, wait_for_signal};
use crate::collector::{FileConsent, InMemorySessionCache, JsonFileSessionSource, SessionSource};
use crate::domain::SyncError;
use crate::sender::{ClientConfig, ClientError, HttpClient, HttpTransport};
use crate::store::{LocalStore, StoreError};
use crate::sync::{Collaborators, ConfigCheck, HttpConfigSource, RemoteConfigSource, SyncEngine};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Local store error: {0}")]
    Store(#[from] StoreError),
    #[error("HTTP client error: {0}")]
    Client(#[from] ClientError),
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("Failed to render output: {0}")]
    Output(#[from] serde_json::Error),
}

/// Owns the engine built from a [`Config`] and drives it as a daemon or for one command.
pub struct ServiceManager {
    config: Config,
    engine: SyncEngine,
    client: HttpClient,
}

impl ServiceManager {
    pub async fn new(config: Config) -> Result<Self, ServiceError> {
        let store = LocalStore::open(&config.data_path).await?;

        let client = HttpClient::new(ClientConfig {
            timeout: config.request_timeout,
            ..ClientConfig::default()
        })?;

        let config_source: Option<Arc<dyn RemoteConfigSource>> =
            match config.remote_config_url.as_deref() {
                Some(url) => Some(Arc::new(HttpConfigSource::new(
                    client.clone(),
                    url,
                    config.request_timeout,
                )?)),
                None => None,
            };

        let sessions: Arc<dyn SessionSource> = match &config.sessions_file {
            Some(path) => Arc::new(JsonFileSessionSource::new(path)),
            None => {
                warn!("no sessions file configured, uploading an empty session cache");
                Arc::new(InMemorySessionCache::new(json!({})))
            }
        };

        let consent_path = config.consent_path();
        debug!(path = %consent_path.display(), "consent marker");

        let engine = SyncEngine::new(
            config.engine_config(),
            store,
            Collaborators {
                transport: Arc::new(HttpTransport::new(client.clone())),
                sessions,
                consent: Arc::new(FileConsent::new(consent_path)),
                config_source,
            },
        );

        info!(
            data_dir = %config.data_path.display(),
            machine_id = %engine.store().identity(),
            "sync engine initialized"
        );
        Ok(Self {
            config,
            engine,
            client,
        })
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub async fn restore_endpoint(&self) -> Result<(), ServiceError> {
        if self.engine.load_saved_endpoint().await? {
            info!("using endpoint from local config file");
        }
        if !self.engine.settings().is_configured() {
            warn!("no upload endpoint configured, uploads will be refused until one is set");
        }
        Ok(())
    }

    /// Restore the saved endpoint and start whichever background workers are configured.
    pub async fn start(&self) -> Result<(), ServiceError> {
        self.restore_endpoint().await?;

        if self.config.remote_config_url.is_some() {
            self.engine.start_config_poller();
        }
        if self.engine.settings().auto_upload {
            self.engine.start_auto_upload(None);
        }
        Ok(())
    }

    /// Reconcile the pending log on a fixed interval until a shutdown signal arrives.
    pub async fn run_until_shutdown(&self) {
        self.run_until(wait_for_signal()).await;
    }

    /// Reconcile on a fixed interval until `shutdown` resolves, then stop the engine.
    ///
    /// A reconciliation pass in progress is cut short at its next retry backoff
    /// and still settles the pending log before this returns.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ShutdownReason>,
    {
        let mut reconcile = tokio::time::interval(self.config.schedule.reconcile_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                reason = &mut shutdown => {
                    info!(?reason, "shutdown requested");
                    break;
                }
                _ = reconcile.tick() => {
                    let pass = self.reconcile_once();
                    tokio::pin!(pass);
                    tokio::select! {
                        () = &mut pass => {}
                        reason = &mut shutdown => {
                            info!(?reason, "shutdown requested during reconciliation");
                            tokio::join!(self.engine.shutdown(), pass);
                            return;
                        }
                    }
                }
            }
        }

        self.engine.shutdown().await;
    }

    async fn reconcile_once(&self) {
        match self.engine.retry_pending().await {
            Ok(summary) if summary.total > 0 => info!(?summary, "pending log reconciled"),
            Ok(_) => debug!("pending log empty"),
            Err(SyncError::ConsentDenied | SyncError::NotConfigured) => {
                debug!("reconciliation skipped, transmission not permitted");
            }
            Err(e) => warn!(error = %e, "reconciliation failed"),
        }
    }

    /// Run a one-shot command and return its result as JSON.
    pub async fn execute(&self, command: &Command) -> Result<Value, ServiceError> {
        let output = match command {
            Command::Run => json!({ "error": "run is not a one-shot command" }),
            Command::Status => {
                let mut status = serde_json::to_value(self.engine.status().await?)?;
                status["http"] = serde_json::to_value(self.client.connection_stats())?;
                status
            }
            Command::Upload => serde_json::to_value(self.engine.upload_now().await?)?,
            Command::UploadSession { id_prefix } => {
                serde_json::to_value(self.engine.upload_session(id_prefix).await?)?
            }
            Command::UploadBatched { chunk_size } => {
                let chunk_size = chunk_size.unwrap_or(self.engine.chunk_size());
                serde_json::to_value(self.engine.upload_all_batched(chunk_size).await?)?
            }
            Command::RetryPending => serde_json::to_value(self.engine.retry_pending().await?)?,
            Command::CheckConfig => check_to_json(&self.engine.check_remote_config().await),
            Command::SaveEndpoint { endpoint, token } => {
                self.engine
                    .save_endpoint_config(endpoint.clone(), token.clone())
                    .await?;
                json!({ "saved": true })
            }
            Command::Snapshot => {
                let path = self.engine.snapshot_to_disk().await?;
                json!({ "path": path.display().to_string() })
            }
            Command::ListSnapshots => serde_json::to_value(self.engine.list_snapshots().await?)?,
            Command::Export => serde_json::to_value(self.engine.export_for_upload().await?)?,
            Command::Summary { limit } => serde_json::to_value(self.engine.summary(*limit).await?)?,
        };
        Ok(output)
    }
}

fn check_to_json(check: &ConfigCheck) -> Value {
    match check {
        ConfigCheck::Skipped { next_check_in } => json!({
            "result": "skipped",
            "next_check_in_secs": next_check_in.as_secs(),
        }),
        ConfigCheck::Applied { origin, changes } => json!({
            "result": "applied",
            "origin": origin,
            "changes": changes,
        }),
        ConfigCheck::Failed { reason } => json!({
            "result": "failed",
            "reason": reason,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AppliedChanges;
    use crate::sync::ConfigOrigin;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers::method};

    fn config(dir: &TempDir) -> Config {
        let mut config = Config {
            data_dir: Some(dir.path().join("data")),
            sessions_file: Some(dir.path().join("sessions.json")),
            ..Config::default()
        };
        config.post_process().unwrap();
        config
    }

    #[tokio::test]
    async fn test_status_without_sessions_file_content() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ServiceManager::new(config(&temp_dir)).await.unwrap();

        let status = manager.execute(&Command::Status).await.unwrap();
        assert_eq!(status["sessions"], 0);
        assert_eq!(status["consent"], false);
        assert_eq!(status["configured"], false);
        assert_eq!(status["http"]["total_requests"], 0);
    }

    #[tokio::test]
    async fn test_upload_refused_without_consent_marker() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config(&temp_dir);
        config.endpoint = Some("http://127.0.0.1:9/upload".into());
        let manager = ServiceManager::new(config).await.unwrap();

        let result = manager.execute(&Command::Upload).await;
        assert!(matches!(
            result,
            Err(ServiceError::Sync(SyncError::ConsentDenied))
        ));
    }

    #[tokio::test]
    async fn test_summary_and_export_commands() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir);
        std::fs::write(
            temp_dir.path().join("sessions.json"),
            r#"{"session-0001-long": {"project": "demo", "messages": [1, 2]}}"#,
        )
        .unwrap();
        let manager = ServiceManager::new(config.clone()).await.unwrap();
        assert!(matches!(
            manager.execute(&Command::Summary { limit: 100 }).await,
            Err(ServiceError::Sync(SyncError::ConsentDenied))
        ));

        std::fs::write(config.consent_path(), "").unwrap();
        let rows = manager
            .execute(&Command::Summary { limit: 100 })
            .await
            .unwrap();
        assert_eq!(rows[0]["id"], "session-");
        assert_eq!(rows[0]["messages"], 2);

        manager.execute(&Command::Snapshot).await.unwrap();
        let export = manager.execute(&Command::Export).await.unwrap();
        assert_eq!(export["count"], 1);
        assert!(export["file"].is_string());
    }

    #[tokio::test]
    async fn test_saved_endpoint_is_restored_on_start() {
        let temp_dir = TempDir::new().unwrap();
        {
            let manager = ServiceManager::new(config(&temp_dir)).await.unwrap();
            manager
                .execute(&Command::SaveEndpoint {
                    endpoint: "https://collector.example/upload".into(),
                    token: None,
                })
                .await
                .unwrap();
        }

        let manager = ServiceManager::new(config(&temp_dir)).await.unwrap();
        manager.start().await.unwrap();
        assert_eq!(
            manager.engine().settings().endpoint.as_deref(),
            Some("https://collector.example/upload")
        );
        manager.engine().shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_during_reconciliation_is_not_delayed_by_backoff() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&mock_server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let mut config = config(&temp_dir);
        config.endpoint = Some(format!("{}/upload", mock_server.uri()));
        config.initial_delay_ms = 30_000;
        config.post_process().unwrap();
        let manager = ServiceManager::new(config.clone()).await.unwrap();
        std::fs::write(config.consent_path(), "").unwrap();

        let pending = manager.engine().store().pending();
        pending.append(&json!({"n": 1})).await.unwrap();

        let start = std::time::Instant::now();
        manager
            .run_until(async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                ShutdownReason::Interrupt
            })
            .await;

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(pending.len().await.unwrap(), 1);
    }

    #[test]
    fn test_check_to_json_shapes() {
        let skipped = check_to_json(&ConfigCheck::Skipped {
            next_check_in: Duration::from_secs(90),
        });
        assert_eq!(skipped["next_check_in_secs"], 90);

        let applied = check_to_json(&ConfigCheck::Applied {
            origin: ConfigOrigin::Cache,
            changes: AppliedChanges {
                auto_upload: true,
                ..Default::default()
            },
        });
        assert_eq!(applied["origin"], "cache");
        assert_eq!(applied["changes"]["auto_upload"], true);
    }
}
