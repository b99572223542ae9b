use thiserror::Error;

use crate::collector::CollectorError;
use crate::sender::CodecError;
use crate::store::StoreError;

/// Top-level error type for the synchronization core.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Transmission refused because consent is not granted or the kill switch is off.
    #[error("Consent denied: transmission is not permitted")]
    ConsentDenied,

    #[error("Not configured: no upload endpoint set")]
    NotConfigured,

    #[error("Serialization error: {0}")]
    Serialization(#[from] CodecError),

    #[error("Terminal transport failure (status {status:?}): {reason}")]
    TerminalTransport { status: Option<u16>, reason: String },

    #[error("Maximum retries exceeded after {attempts} attempts: {last_reason}")]
    MaxRetriesExceeded { attempts: u32, last_reason: String },

    /// The engine or worker stopped while the unit was waiting to be retried.
    #[error("Cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("Session cache unavailable: {0}")]
    Source(#[from] CollectorError),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    /// Short machine-readable kind, used in reports and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::ConsentDenied => "consent_denied",
            SyncError::NotConfigured => "not_configured",
            SyncError::Serialization(_) => "serialization_error",
            SyncError::TerminalTransport { .. } => "terminal_transport_failure",
            SyncError::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            SyncError::Cancelled { .. } => "cancelled",
            SyncError::Persistence(_) => "persistence_failure",
            SyncError::Source(_) => "source_unavailable",
            SyncError::NotFound(_) => "not_found",
            SyncError::InvalidConfig(_) => "invalid_config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(SyncError::NotConfigured.kind(), "not_configured");
        assert_eq!(SyncError::NotFound("abc".into()).kind(), "not_found");
        assert_eq!(SyncError::Cancelled { attempts: 1 }.kind(), "cancelled");
    }
}
