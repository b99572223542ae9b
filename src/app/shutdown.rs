use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tracing::{error, info};
#[cfg(unix)]
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    /// No signal could be installed; treated as an immediate request.
    ListenerFailed,
}

/// Resolves on the first SIGINT (or SIGTERM on unix).
#[cfg(unix)]
pub async fn wait_for_signal() -> ShutdownReason {
    let mut sigterm = match unix_signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler, listening for Ctrl+C only");
            return ctrl_c().await;
        }
    };

    tokio::select! {
        reason = ctrl_c() => reason,
        _ = sigterm.recv() => {
            info!("received SIGTERM, initiating graceful shutdown");
            ShutdownReason::Terminate
        }
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> ShutdownReason {
    ctrl_c().await
}

async fn ctrl_c() -> ShutdownReason {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("received SIGINT (Ctrl+C), initiating graceful shutdown");
            ShutdownReason::Interrupt
        }
        Err(e) => {
            error!(error = %e, "failed to listen for SIGINT");
            ShutdownReason::ListenerFailed
        }
    }
}
