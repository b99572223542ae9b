use crate::buffer::partition;
use crate::collector::SessionSource;
use crate::domain::{SyncError, normalize_cache};
use crate::reliability::ReliabilityManager;
use crate::sender::{CodecError, Outcome, PayloadCodec};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub batch: usize,
    pub sessions: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub original_size: usize,
    pub compressed_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchedUploadSummary {
    pub total_sessions: usize,
    pub total_batches: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub batches: Vec<BatchReport>,
}

/// Chunked upload of the whole cache. One attempt per batch; failed batches go to the pending log.
pub(crate) async fn upload_all_batched(
    reliability: &ReliabilityManager,
    sessions: &dyn SessionSource,
    codec: &PayloadCodec,
    machine_id: &str,
    chunk_size: usize,
    pause: Duration,
) -> Result<BatchedUploadSummary, SyncError> {
    let settings = reliability.transmit_settings()?;

    let cache = sessions.snapshot().await?;
    let records = normalize_cache(&cache);
    let total_sessions = records.len();
    let batches = partition(records, chunk_size, machine_id);

    let mut summary = BatchedUploadSummary {
        total_sessions,
        total_batches: batches.len(),
        ..Default::default()
    };
    info!(
        total_sessions,
        total_batches = summary.total_batches,
        chunk_size,
        "starting batched upload"
    );

    for (index, batch) in batches.iter().enumerate() {
        if index > 0 && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }

        let mut report = BatchReport {
            batch: batch.batch,
            sessions: batch.len(),
            success: false,
            status: None,
            error: None,
            original_size: 0,
            compressed_size: 0,
        };

        let body = match batch
            .encode(codec)
            .and_then(|envelope| {
                report.original_size = envelope.payload.original_size();
                report.compressed_size = envelope.payload.compressed_size();
                serde_json::to_value(&envelope).map_err(CodecError::from)
            }) {
            Ok(body) => body,
            Err(e) => {
                error!(batch = batch.batch, error = %e, "failed to encode batch, skipping");
                report.error = Some(SyncError::from(e).to_string());
                summary.failed += 1;
                summary.batches.push(report);
                continue;
            }
        };

        let outcome = reliability.send_once(&settings, body.clone()).await;
        report.status = outcome.status();
        match outcome {
            Outcome::Success { .. } => {
                report.success = true;
                summary.succeeded += 1;
            }
            Outcome::RetryableFailure { reason, .. } | Outcome::TerminalFailure { reason, .. } => {
                warn!(batch = batch.batch, %reason, "batch upload failed, moving to pending log");
                report.error = Some(reason);
                summary.failed += 1;
                if let Err(e) = reliability.park(&body).await {
                    error!(batch = batch.batch, error = %e, "failed to persist batch");
                }
            }
        }
        summary.batches.push(report);
    }

    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        "batched upload finished"
    );
    Ok(summary)
}
