//! The synchronization engine: explicitly owned, with its background workers.

pub mod auto_upload;
pub mod batched;
pub mod config_poller;
mod task;

pub use auto_upload::{AutoUploadWorker, CycleReport, SnapshotUploader};
pub use batched::{BatchReport, BatchedUploadSummary};
pub use config_poller::{
    ConfigCheck, ConfigOrigin, ConfigPoller, DEFAULT_CONFIG_CHECK_INTERVAL, HttpConfigSource,
    RemoteConfigSource,
};

#[cfg(test)]
pub use config_poller::MockRemoteConfigSource;

use crate::buffer::{DEFAULT_CHUNK_SIZE, DEFAULT_QUEUE_WAIT, FullSnapshot, QueueStats, UploadQueue};
use crate::collector::{ConsentGate, SessionSource};
use crate::domain::{
    LocalEndpointConfig, RuntimeSettings, SessionSummary, SettingsHandle, SyncError,
    normalize_cache,
};
use crate::reliability::{
    Delivery, DeliveryStatsSnapshot, ReconcileSummary, ReliabilityManager, RetryConfig,
    RetryPolicy,
};
use crate::sender::{CodecError, HttpClient, PayloadCodec, Transport};
use crate::store::{ExportInfo, LocalStore, SnapshotInfo};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use task::BackgroundTask;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunk_size: usize,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
    pub queue_wait: Duration,
    /// Pause between batches of a batched upload.
    pub batch_pause: Duration,
    pub config_check_interval: Duration,
    pub initial_settings: RuntimeSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            queue_wait: DEFAULT_QUEUE_WAIT,
            batch_pause: Duration::from_millis(500),
            config_check_interval: DEFAULT_CONFIG_CHECK_INTERVAL,
            initial_settings: RuntimeSettings::default(),
        }
    }
}

/// Everything the engine talks to but does not own.
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub sessions: Arc<dyn SessionSource>,
    pub consent: Arc<dyn ConsentGate>,
    pub config_source: Option<Arc<dyn RemoteConfigSource>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub enabled: bool,
    pub consent: bool,
    pub configured: bool,
    pub sessions: usize,
    pub pending: usize,
    pub auto_upload_running: bool,
    pub config_poller_running: bool,
    pub queue_running: bool,
    pub machine_id: String,
    pub queue: QueueStats,
    pub delivery: DeliveryStatsSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionUpload {
    pub id: String,
    pub status: u16,
    pub attempts: u32,
}

pub struct SyncEngine {
    config: EngineConfig,
    store: LocalStore,
    settings: SettingsHandle,
    consent: Arc<dyn ConsentGate>,
    sessions: Arc<dyn SessionSource>,
    codec: PayloadCodec,
    reliability: Arc<ReliabilityManager>,
    queue: UploadQueue,
    auto_upload: Arc<AutoUploadWorker>,
    poller: Arc<ConfigPoller>,
    poller_task: Mutex<Option<BackgroundTask>>,
    root: CancellationToken,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, store: LocalStore, collaborators: Collaborators) -> Self {
        let Collaborators {
            transport,
            sessions,
            consent,
            config_source,
        } = collaborators;

        let root = CancellationToken::new();
        let settings = SettingsHandle::new(config.initial_settings.clone());
        let codec = PayloadCodec::new();

        let reliability = Arc::new(ReliabilityManager::new(
            transport,
            consent.clone(),
            settings.clone(),
            RetryPolicy::new(config.retry.clone()),
            store.pending().clone(),
            config.request_timeout,
        )
        .with_shutdown(root.clone()));
        let queue = UploadQueue::new(reliability.clone(), config.queue_wait, root.clone());
        let uploader = SnapshotUploader::new(
            reliability.clone(),
            sessions.clone(),
            codec.clone(),
            store.identity().as_str(),
        );
        let auto_upload = Arc::new(AutoUploadWorker::new(uploader, root.clone()));
        let poller = Arc::new(ConfigPoller::new(
            config_source,
            store.config_files().clone(),
            settings.clone(),
            config.config_check_interval,
        ));

        Self {
            config,
            store,
            settings,
            consent,
            sessions,
            codec,
            reliability,
            queue,
            auto_upload,
            poller,
            poller_task: Mutex::new(None),
            root,
        }
    }

    pub fn settings(&self) -> Arc<RuntimeSettings> {
        self.settings.snapshot()
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    /// Fill in endpoint/token from the local config file when none is set yet.
    pub async fn load_saved_endpoint(&self) -> Result<bool, SyncError> {
        if self.settings.snapshot().is_configured() {
            return Ok(false);
        }
        let Some(saved) = self.store.config_files().load_local().await? else {
            return Ok(false);
        };
        if saved.endpoint.is_empty() {
            return Ok(false);
        }
        self.settings.configure(Some(saved.endpoint), saved.token);
        Ok(true)
    }

    /// Update endpoint and/or token in memory. `None` keeps the current value.
    pub fn configure(&self, endpoint: Option<String>, token: Option<String>) {
        self.settings.configure(endpoint, token);
    }

    /// Configure and persist the endpoint to the local config file.
    pub async fn save_endpoint_config(
        &self,
        endpoint: String,
        token: Option<String>,
    ) -> Result<(), SyncError> {
        if endpoint.is_empty() {
            return Err(SyncError::InvalidConfig("endpoint required".into()));
        }
        HttpClient::parse_url(&endpoint).map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        self.settings.configure(Some(endpoint.clone()), token.clone());
        self.store
            .config_files()
            .save_local(&LocalEndpointConfig { endpoint, token })
            .await?;
        Ok(())
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.settings.set_enabled(enabled);
        info!(enabled, "transmission kill switch updated");
    }

    pub async fn status(&self) -> Result<EngineStatus, SyncError> {
        let settings = self.settings.snapshot();
        let cache = self.sessions.snapshot().await?;

        Ok(EngineStatus {
            version: crate::VERSION,
            enabled: settings.enabled,
            consent: self.consent.may_transmit(),
            configured: settings.is_configured(),
            sessions: normalize_cache(&cache).len(),
            pending: self.store.pending().len().await?,
            auto_upload_running: self.auto_upload.is_running(),
            config_poller_running: self.is_config_poller_running(),
            queue_running: self.queue.is_running(),
            machine_id: self.store.identity().to_string(),
            queue: self.queue.stats(),
            delivery: self.reliability.stats(),
        })
    }

    /// One full upload of the whole cache, the same thing an auto-upload cycle does.
    pub async fn upload_now(&self) -> Result<CycleReport, SyncError> {
        self.auto_upload.uploader().upload_full(&self.root).await
    }

    /// Upload the first session whose id starts with or contains `id_prefix`.
    pub async fn upload_session(&self, id_prefix: &str) -> Result<SessionUpload, SyncError> {
        self.reliability.transmit_settings()?;

        let cache = self.sessions.snapshot().await?;
        let record = normalize_cache(&cache)
            .into_iter()
            .find(|record| record.matches(id_prefix))
            .ok_or_else(|| SyncError::NotFound(id_prefix.to_string()))?;
        let id = record.id.clone();

        let payload = self
            .codec
            .encode(&FullSnapshot::new(self.store.identity().as_str(), vec![record]))?;
        let body = serde_json::to_value(&payload).map_err(CodecError::from)?;

        let Delivery { status, attempts } = self.reliability.deliver(body).await?;
        Ok(SessionUpload {
            id,
            status,
            attempts,
        })
    }

    pub async fn upload_all_batched(
        &self,
        chunk_size: usize,
    ) -> Result<BatchedUploadSummary, SyncError> {
        batched::upload_all_batched(
            &self.reliability,
            self.sessions.as_ref(),
            &self.codec,
            self.store.identity().as_str(),
            chunk_size,
            self.config.batch_pause,
        )
        .await
    }

    pub async fn retry_pending(&self) -> Result<ReconcileSummary, SyncError> {
        self.reliability.retry_pending().await
    }

    /// Queue an arbitrary unit for background delivery. Returns immediately.
    pub fn enqueue(&self, unit: Value) -> Result<(), SyncError> {
        self.queue.enqueue(unit)
    }

    /// Start the auto-upload loop. `None` uses the interval from the current settings.
    pub fn start_auto_upload(&self, interval: Option<Duration>) -> bool {
        let interval = interval.unwrap_or_else(|| self.settings.snapshot().upload_interval);
        self.settings.set_auto_upload(true, interval);
        self.auto_upload.start(interval)
    }

    pub async fn stop_auto_upload(&self) -> bool {
        let interval = self.settings.snapshot().upload_interval;
        self.settings.set_auto_upload(false, interval);
        self.auto_upload.stop().await
    }

    pub fn is_auto_upload_running(&self) -> bool {
        self.auto_upload.is_running()
    }

    /// Refresh configuration now (subject to the check interval) and follow the auto-upload toggle.
    pub async fn check_remote_config(&self) -> ConfigCheck {
        refresh_config(&self.poller, &self.auto_upload, &self.settings).await
    }

    /// Start the background config poller. Returns `false` if it is already running.
    pub fn start_config_poller(&self) -> bool {
        let mut task = self.poller_task.lock();
        if task.as_ref().is_some_and(BackgroundTask::is_running) {
            return false;
        }

        let poller = self.poller.clone();
        let auto_upload = self.auto_upload.clone();
        let settings = self.settings.clone();
        *task = Some(BackgroundTask::spawn(
            "config_poller",
            &self.root,
            move |token| async move {
                let interval = poller.interval();
                loop {
                    let check = refresh_config(&poller, &auto_upload, &settings).await;
                    debug!(?check, "config poll cycle");
                    tokio::select! {
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(interval) => {}
                    }
                }
            },
        ));
        info!(interval = ?self.poller.interval(), "config poller started");
        true
    }

    pub fn is_config_poller_running(&self) -> bool {
        self.poller_task
            .lock()
            .as_ref()
            .is_some_and(BackgroundTask::is_running)
    }

    /// Write the normalized session list to a timestamped local file.
    pub async fn snapshot_to_disk(&self) -> Result<PathBuf, SyncError> {
        if !self.consent.may_transmit() {
            return Err(SyncError::ConsentDenied);
        }
        let cache = self.sessions.snapshot().await?;
        let snapshot = FullSnapshot::new(self.store.identity().as_str(), normalize_cache(&cache));
        Ok(self.store.snapshots().save("full_snapshot", &snapshot).await?)
    }

    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, SyncError> {
        Ok(self.store.snapshots().list().await?)
    }

    /// Bundle the local snapshots into one export file. Nothing is sent.
    pub async fn export_for_upload(&self) -> Result<ExportInfo, SyncError> {
        if !self.consent.may_transmit() {
            return Err(SyncError::ConsentDenied);
        }
        Ok(self.store.snapshots().export_all().await?)
    }

    /// First `limit` sessions of the cache as short listing rows.
    pub async fn summary(&self, limit: usize) -> Result<Vec<SessionSummary>, SyncError> {
        if !self.consent.may_transmit() {
            return Err(SyncError::ConsentDenied);
        }
        let cache = self.sessions.snapshot().await?;
        Ok(normalize_cache(&cache)
            .iter()
            .take(limit)
            .map(|record| record.summary())
            .collect())
    }

    /// Stop every background task and wait for all of them to exit.
    pub async fn shutdown(&self) {
        info!("shutting down sync engine");
        self.root.cancel();

        let poller_task = self.poller_task.lock().take();
        let stop_poller = async {
            if let Some(task) = poller_task {
                task.stop().await;
            }
        };
        futures::join!(self.queue.stop(), self.auto_upload.stop(), stop_poller);
        info!("sync engine stopped");
    }
}

async fn refresh_config(
    poller: &ConfigPoller,
    auto_upload: &AutoUploadWorker,
    settings: &SettingsHandle,
) -> ConfigCheck {
    let check = poller.check_remote_config().await;
    if let ConfigCheck::Applied { changes, .. } = &check {
        if changes.auto_upload || changes.upload_interval {
            let current = settings.snapshot();
            if current.auto_upload {
                auto_upload.restart_with(current.upload_interval).await;
            } else if auto_upload.stop().await {
                info!("auto upload disabled by remote config");
            }
        }
    }
    if let ConfigCheck::Failed { reason } = &check {
        warn!(%reason, "no usable config source");
    }
    check
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{InMemorySessionCache, StaticConsent};
    use crate::domain::RemoteConfig;
    use crate::sender::{MockTransport, Outcome};
    use serde_json::json;
    use tempfile::TempDir;

    async fn engine(
        dir: &TempDir,
        transport: MockTransport,
        source: Option<MockRemoteConfigSource>,
        consent: bool,
    ) -> SyncEngine {
        let store = LocalStore::open(dir.path()).await.unwrap();
        let config = EngineConfig {
            batch_pause: Duration::ZERO,
            retry: RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                jitter: false,
            },
            initial_settings: RuntimeSettings {
                endpoint: Some("http://collector.test/upload".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        SyncEngine::new(
            config,
            store,
            Collaborators {
                transport: Arc::new(transport),
                sessions: Arc::new(InMemorySessionCache::new(json!({
                    "abc-123": {"project": "p", "messages": [{"m": 1}]},
                    "def-456": {"project": "q"}
                }))),
                consent: Arc::new(StaticConsent::new(consent)),
                config_source: source.map(|s| Arc::new(s) as Arc<dyn RemoteConfigSource>),
            },
        )
    }

    #[tokio::test]
    async fn test_status_reports_state() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir, MockTransport::new(), None, false).await;

        let status = engine.status().await.unwrap();
        assert_eq!(status.sessions, 2);
        assert_eq!(status.pending, 0);
        assert!(!status.consent);
        assert!(status.configured);
        assert!(!status.auto_upload_running);
        assert_eq!(status.machine_id, engine.store().identity().as_str());
    }

    #[tokio::test]
    async fn test_upload_session_by_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Outcome::Success { status: 201 });
        let engine = engine(&temp_dir, transport, None, true).await;

        let upload = engine.upload_session("def").await.unwrap();
        assert_eq!(upload.id, "def-456");
        assert_eq!(upload.status, 201);

        assert!(matches!(
            engine.upload_session("zzz").await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_save_endpoint_config_persists_and_validates() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir, MockTransport::new(), None, true).await;

        assert!(matches!(
            engine.save_endpoint_config("ftp://x".into(), None).await,
            Err(SyncError::InvalidConfig(_))
        ));

        engine
            .save_endpoint_config("https://new.example/u".into(), Some("tok".into()))
            .await
            .unwrap();
        assert_eq!(
            engine.settings().endpoint.as_deref(),
            Some("https://new.example/u")
        );
        let saved = engine.store().config_files().load_local().await.unwrap();
        assert_eq!(saved.unwrap().token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn test_snapshot_requires_consent_and_lists() {
        let temp_dir = TempDir::new().unwrap();
        let denied = engine(&temp_dir, MockTransport::new(), None, false).await;
        assert!(matches!(
            denied.snapshot_to_disk().await,
            Err(SyncError::ConsentDenied)
        ));

        let granted = engine(&temp_dir, MockTransport::new(), None, true).await;
        let path = granted.snapshot_to_disk().await.unwrap();
        assert!(path.exists());
        let listed = granted.list_snapshots().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].name.starts_with("full_snapshot_"));
    }

    #[tokio::test]
    async fn test_export_bundles_local_snapshots_without_sending() {
        let temp_dir = TempDir::new().unwrap();
        let mut transport = MockTransport::new();
        transport.expect_send().never();

        let denied = engine(&temp_dir, MockTransport::new(), None, false).await;
        assert!(matches!(
            denied.export_for_upload().await,
            Err(SyncError::ConsentDenied)
        ));

        let granted = engine(&temp_dir, transport, None, true).await;
        granted.snapshot_to_disk().await.unwrap();
        let export = granted.export_for_upload().await.unwrap();
        assert_eq!(export.count, 1);
        assert!(export.file.starts_with(granted.store().snapshots().dir()));

        // The bundle itself is never bundled again.
        let again = granted.export_for_upload().await.unwrap();
        assert_eq!(again.count, 1);
    }

    #[tokio::test]
    async fn test_summary_respects_limit_and_consent() {
        let temp_dir = TempDir::new().unwrap();
        let denied = engine(&temp_dir, MockTransport::new(), None, false).await;
        assert!(matches!(
            denied.summary(10).await,
            Err(SyncError::ConsentDenied)
        ));

        let granted = engine(&temp_dir, MockTransport::new(), None, true).await;
        let rows = granted.summary(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "abc-123");
        assert_eq!(rows[0].project, "p");
        assert_eq!(rows[0].messages, 1);
        assert_eq!(rows[1].messages, 0);

        assert_eq!(granted.summary(1).await.unwrap().len(), 1);
        assert!(granted.summary(0).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_config_toggles_auto_upload() {
        let temp_dir = TempDir::new().unwrap();
        let mut source = MockRemoteConfigSource::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                Ok(RemoteConfig {
                    auto_upload: Some(true),
                    upload_interval_hours: Some(2.0),
                    ..Default::default()
                })
            });
        source
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                Ok(RemoteConfig {
                    auto_upload: Some(false),
                    ..Default::default()
                })
            });
        let engine = engine(&temp_dir, MockTransport::new(), Some(source), true).await;

        engine.check_remote_config().await;
        assert!(engine.is_auto_upload_running());

        tokio::time::advance(Duration::from_secs(3600)).await;
        engine.check_remote_config().await;
        assert!(!engine.is_auto_upload_running());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_task() {
        let temp_dir = TempDir::new().unwrap();
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .returning(|_| Outcome::Success { status: 200 });
        let engine = engine(&temp_dir, transport, None, true).await;

        assert!(engine.start_auto_upload(Some(Duration::from_secs(3600))));
        assert!(engine.start_config_poller());
        assert!(!engine.start_config_poller());
        engine.enqueue(json!({"n": 1})).unwrap();

        engine.shutdown().await;
        let status = engine.status().await.unwrap();
        assert!(!status.auto_upload_running);
        assert!(!status.config_poller_running);
        assert!(!status.queue_running);
    }
}
