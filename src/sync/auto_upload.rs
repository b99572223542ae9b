use super::task::BackgroundTask;
use crate::buffer::FullSnapshot;
use crate::collector::SessionSource;
use crate::domain::{SyncError, normalize_cache};
use crate::reliability::ReliabilityManager;
use crate::sender::{CodecError, PayloadCodec};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one full upload sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub sessions: usize,
    pub original_size: usize,
    pub compressed_size: usize,
    pub attempts: u32,
}

/// Builds one payload from the whole session cache and sends it with retry.
#[derive(Clone)]
pub struct SnapshotUploader {
    reliability: Arc<ReliabilityManager>,
    sessions: Arc<dyn SessionSource>,
    codec: PayloadCodec,
    machine_id: String,
}

impl SnapshotUploader {
    pub fn new(
        reliability: Arc<ReliabilityManager>,
        sessions: Arc<dyn SessionSource>,
        codec: PayloadCodec,
        machine_id: impl Into<String>,
    ) -> Self {
        Self {
            reliability,
            sessions,
            codec,
            machine_id: machine_id.into(),
        }
    }

    /// Full upload: every session with complete message content, one request.
    ///
    /// `cancel` cuts retry backoff short; the payload is then parked in the pending log.
    pub async fn upload_full(&self, cancel: &CancellationToken) -> Result<CycleReport, SyncError> {
        self.reliability.transmit_settings()?;

        let cache = self.sessions.snapshot().await?;
        let records = normalize_cache(&cache);
        let sessions = records.len();

        let payload = self
            .codec
            .encode(&FullSnapshot::new(&self.machine_id, records))?;
        let body = serde_json::to_value(&payload).map_err(CodecError::from)?;

        let delivery = self.reliability.deliver_until(body, cancel).await?;
        Ok(CycleReport {
            sessions,
            original_size: payload.original_size(),
            compressed_size: payload.compressed_size(),
            attempts: delivery.attempts,
        })
    }
}

/// Interval loop around [`SnapshotUploader::upload_full`].
pub struct AutoUploadWorker {
    uploader: SnapshotUploader,
    parent: CancellationToken,
    task: Mutex<Option<(BackgroundTask, Duration)>>,
}

impl AutoUploadWorker {
    pub fn new(uploader: SnapshotUploader, parent: CancellationToken) -> Self {
        Self {
            uploader,
            parent,
            task: Mutex::new(None),
        }
    }

    pub fn uploader(&self) -> &SnapshotUploader {
        &self.uploader
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|(task, _)| task.is_running())
    }

    pub fn interval(&self) -> Option<Duration> {
        self.task
            .lock()
            .as_ref()
            .filter(|(task, _)| task.is_running())
            .map(|(_, interval)| *interval)
    }

    /// Start the loop. Returns `false` if it is already running.
    pub fn start(&self, interval: Duration) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|(t, _)| t.is_running()) {
            return false;
        }

        let uploader = self.uploader.clone();
        let spawned = BackgroundTask::spawn("auto_upload", &self.parent, move |token| {
            run(uploader, interval, token)
        });
        *task = Some((spawned, interval));
        info!(?interval, "auto upload started");
        true
    }

    pub async fn stop(&self) -> bool {
        let Some((task, _)) = self.task.lock().take() else {
            return false;
        };
        task.stop().await;
        info!("auto upload stopped");
        true
    }

    /// Stop and start again if the interval differs from the running one.
    pub async fn restart_with(&self, interval: Duration) {
        if self.interval() == Some(interval) {
            return;
        }
        self.stop().await;
        self.start(interval);
    }
}

async fn run(uploader: SnapshotUploader, interval: Duration, token: CancellationToken) {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }

        match uploader.upload_full(&token).await {
            Ok(report) => info!(?report, "auto upload cycle complete"),
            Err(SyncError::Cancelled { attempts }) => {
                info!(attempts, "auto upload cycle interrupted by stop");
                break;
            }
            Err(e @ (SyncError::ConsentDenied | SyncError::NotConfigured)) => {
                debug!(reason = %e, "auto upload cycle skipped");
            }
            Err(e) => warn!(error = %e, kind = e.kind(), "auto upload cycle failed"),
        }
    }
}
