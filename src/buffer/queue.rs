use crate::domain::SyncError;
use crate::reliability::ReliabilityManager;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_QUEUE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    drained: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Items moved to the pending log because the worker stopped before delivering them.
    pub drained: u64,
}

struct Worker {
    sender: UnboundedSender<Value>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Background worker draining a queue of upload units through the retry path.
///
/// Started lazily by the first `enqueue`, at most one at a time. Units the
/// worker cannot deliver end up in the pending log.
pub struct UploadQueue {
    reliability: Arc<ReliabilityManager>,
    queue_wait: Duration,
    parent: CancellationToken,
    worker: Mutex<Option<Worker>>,
    counters: Arc<QueueCounters>,
}

impl UploadQueue {
    pub fn new(
        reliability: Arc<ReliabilityManager>,
        queue_wait: Duration,
        parent: CancellationToken,
    ) -> Self {
        Self {
            reliability,
            queue_wait,
            parent,
            worker: Mutex::new(None),
            counters: Arc::new(QueueCounters::default()),
        }
    }

    /// Hand a unit to the worker. Never waits on the network.
    pub fn enqueue(&self, unit: Value) -> Result<(), SyncError> {
        if !self.reliability.may_transmit() {
            return Err(SyncError::ConsentDenied);
        }

        let mut worker = self.worker.lock();
        let unit = match worker.as_ref() {
            Some(running) if !running.handle.is_finished() => match running.sender.send(unit) {
                Ok(()) => {
                    self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(mpsc::error::SendError(unit)) => unit,
            },
            _ => unit,
        };

        let started = self.spawn_worker();
        if started.sender.send(unit).is_ok() {
            self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        }
        *worker = Some(started);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// A request already on the wire finishes; a unit waiting out a retry
    /// backoff is cancelled. Both that unit and anything still queued are
    /// written to the pending log.
    pub async fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        worker.token.cancel();
        drop(worker.sender);
        if let Err(e) = worker.handle.await {
            error!(error = %e, "upload queue worker panicked");
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            drained: self.counters.drained.load(Ordering::Relaxed),
        }
    }

    fn spawn_worker(&self) -> Worker {
        let (sender, receiver) = mpsc::unbounded_channel();
        let token = self.parent.child_token();
        let handle = tokio::spawn(run_worker(
            self.reliability.clone(),
            receiver,
            token.clone(),
            self.queue_wait,
            self.counters.clone(),
        ));
        info!(queue_wait = ?self.queue_wait, "upload queue worker started");
        Worker {
            sender,
            token,
            handle,
        }
    }
}

async fn run_worker(
    reliability: Arc<ReliabilityManager>,
    mut receiver: UnboundedReceiver<Value>,
    token: CancellationToken,
    queue_wait: Duration,
    counters: Arc<QueueCounters>,
) {
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            received = timeout(queue_wait, receiver.recv()) => match received {
                Ok(Some(unit)) => process(&reliability, unit, &counters, &token).await,
                Ok(None) => break,
                Err(_) => continue,
            },
        }
    }

    receiver.close();
    let mut drained = 0_u64;
    while let Ok(unit) = receiver.try_recv() {
        match reliability.park(&unit).await {
            Ok(()) => drained += 1,
            Err(e) => error!(error = %e, "failed to persist queued unit on stop"),
        }
    }
    counters.drained.fetch_add(drained, Ordering::Relaxed);
    info!(drained, "upload queue worker stopped");
}

async fn process(
    reliability: &ReliabilityManager,
    unit: Value,
    counters: &QueueCounters,
    token: &CancellationToken,
) {
    match reliability.deliver_until(unit.clone(), token).await {
        Ok(delivery) => {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
            debug!(attempts = delivery.attempts, "queued unit delivered");
        }
        Err(e @ (SyncError::ConsentDenied | SyncError::NotConfigured)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "queued unit refused, keeping it in pending log");
            if let Err(store_error) = reliability.park(&unit).await {
                error!(error = %store_error, "failed to persist refused unit");
            }
        }
        Err(SyncError::Cancelled { attempts }) => {
            counters.drained.fetch_add(1, Ordering::Relaxed);
            info!(attempts, "queued unit interrupted by stop, moved to pending log");
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, kind = e.kind(), "queued unit failed, moved to pending log");
        }
    }
}
