pub mod retry;

pub use retry::{Delivery, RetryConfig, RetryError, RetryPolicy};

use crate::collector::ConsentGate;
use crate::domain::{RuntimeSettings, SettingsHandle, SyncError};
use crate::sender::{Outcome, Transport, UploadRequest};
use crate::store::{PendingEntry, PendingLog};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one reconciliation pass over the pending log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    /// Entries claimed at the start of the pass.
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Entries in the log afterwards, including any appended during the pass.
    pub remaining: usize,
}

#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub persisted: AtomicU64,
    pub persist_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStatsSnapshot {
    pub delivered: u64,
    pub failed: u64,
    pub persisted: u64,
    pub persist_errors: u64,
}

/// Retry policy plus pending-log routing. Every upload path sends through here.
pub struct ReliabilityManager {
    transport: Arc<dyn Transport>,
    consent: Arc<dyn ConsentGate>,
    settings: SettingsHandle,
    retry_policy: RetryPolicy,
    pending: PendingLog,
    request_timeout: Duration,
    shutdown: CancellationToken,
    stats: DeliveryStats,
}

impl ReliabilityManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        consent: Arc<dyn ConsentGate>,
        settings: SettingsHandle,
        retry_policy: RetryPolicy,
        pending: PendingLog,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            consent,
            settings,
            retry_policy,
            pending,
            request_timeout,
            shutdown: CancellationToken::new(),
            stats: DeliveryStats::default(),
        }
    }

    /// Token that interrupts retry backoff for `deliver` and `retry_pending`.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn pending(&self) -> &PendingLog {
        &self.pending
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Consent granted and the local kill switch on.
    pub fn may_transmit(&self) -> bool {
        self.settings.snapshot().enabled && self.consent.may_transmit()
    }

    /// Settings snapshot for one transmit cycle, or why transmission is refused.
    pub fn transmit_settings(&self) -> Result<Arc<RuntimeSettings>, SyncError> {
        let settings = self.settings.snapshot();
        if !settings.enabled || !self.consent.may_transmit() {
            return Err(SyncError::ConsentDenied);
        }
        if !settings.is_configured() {
            return Err(SyncError::NotConfigured);
        }
        Ok(settings)
    }

    /// A single attempt, no retry. Used by the batched upload path.
    pub async fn send_once(&self, settings: &RuntimeSettings, body: Value) -> Outcome {
        self.transport.send(self.request_for(settings, body)).await
    }

    /// Deliver one unit with retry; on failure the unit goes to the pending log.
    ///
    /// Refused units (consent, configuration) are returned as errors without
    /// being persisted.
    pub async fn deliver(&self, unit: Value) -> Result<Delivery, SyncError> {
        self.deliver_until(unit, &self.shutdown).await
    }

    /// Like [`deliver`](Self::deliver), but backoff stops as soon as `cancel`
    /// fires. A cancelled unit is parked like any other failure.
    pub async fn deliver_until(
        &self,
        unit: Value,
        cancel: &CancellationToken,
    ) -> Result<Delivery, SyncError> {
        let settings = self.transmit_settings()?;
        match self.send_with_retry(&settings, &unit, cancel).await {
            Ok(delivery) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(attempts = delivery.attempts, status = delivery.status, "unit delivered");
                Ok(delivery)
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                if let Err(store_error) = self.park(&unit).await {
                    error!(error = %store_error, "failed to persist undelivered unit, dropping it");
                }
                Err(e)
            }
        }
    }

    /// Append a unit to the pending log. Failures are counted and returned.
    pub async fn park(&self, unit: &Value) -> Result<(), SyncError> {
        match self.pending.append(unit).await {
            Ok(()) => {
                self.stats.persisted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.persist_errors.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Re-attempt everything in the pending log and keep only what still fails.
    ///
    /// On shutdown the pass stops early; entries it did not deliver stay in the log.
    pub async fn retry_pending(&self) -> Result<ReconcileSummary, SyncError> {
        let settings = self.transmit_settings()?;

        let Some(claim) = self.pending.claim().await? else {
            debug!("pending log empty, nothing to reconcile");
            return Ok(ReconcileSummary::default());
        };

        let total = claim.len();
        let mut still_failing: Vec<PendingEntry> = Vec::new();
        let mut succeeded = 0;

        for entry in claim.entries() {
            let Some(unit) = entry.unit().filter(|_| !self.shutdown.is_cancelled()) else {
                still_failing.push(entry.clone());
                continue;
            };
            match self.send_with_retry(&settings, unit, &self.shutdown).await {
                Ok(_) => succeeded += 1,
                Err(e) => {
                    debug!(error = %e, "pending unit still failing");
                    still_failing.push(entry.clone());
                }
            }
        }

        let failed = still_failing.len();
        let remaining = self.pending.settle(claim, still_failing).await?;
        self.stats
            .delivered
            .fetch_add(succeeded as u64, Ordering::Relaxed);

        let summary = ReconcileSummary {
            total,
            succeeded,
            failed,
            remaining,
        };
        if failed > 0 {
            warn!(?summary, "reconciliation left entries in pending log");
        } else {
            info!(?summary, "reconciliation complete");
        }
        Ok(summary)
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            persisted: self.stats.persisted.load(Ordering::Relaxed),
            persist_errors: self.stats.persist_errors.load(Ordering::Relaxed),
        }
    }

    async fn send_with_retry(
        &self,
        settings: &RuntimeSettings,
        unit: &Value,
        cancel: &CancellationToken,
    ) -> Result<Delivery, SyncError> {
        self.retry_policy
            .execute(cancel, |_| {
                self.transport.send(self.request_for(settings, unit.clone()))
            })
            .await
            .map_err(SyncError::from)
    }

    fn request_for(&self, settings: &RuntimeSettings, body: Value) -> UploadRequest {
        UploadRequest {
            endpoint: settings.endpoint.clone().unwrap_or_default(),
            token: settings.token.clone(),
            body,
            timeout: self.request_timeout,
        }
    }
}

impl From<RetryError> for SyncError {
    fn from(error: RetryError) -> Self {
        match error {
            RetryError::Terminal { status, reason, .. } => {
                SyncError::TerminalTransport { status, reason }
            }
            RetryError::MaxAttemptsExceeded {
                attempts,
                last_reason,
            } => SyncError::MaxRetriesExceeded {
                attempts,
                last_reason,
            },
            RetryError::Cancelled { attempts } => SyncError::Cancelled { attempts },
        }
    }
}
