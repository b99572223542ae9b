use super::client::{ClientError, HttpClient};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

/// One HTTP POST of an upload unit to the collector.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub endpoint: String,
    pub token: Option<String>,
    pub body: Value,
    pub timeout: Duration,
}

/// Classified result of a single transmission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Collector acknowledged with a 2xx status.
    Success { status: u16 },
    /// Timeout, connection failure or a 5xx status.
    RetryableFailure { status: Option<u16>, reason: String },
    /// Any other status, or a request that can never be built.
    TerminalFailure { status: Option<u16>, reason: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Outcome::Success { status } => Some(*status),
            Outcome::RetryableFailure { status, .. } | Outcome::TerminalFailure { status, .. } => {
                *status
            }
        }
    }
}

pub fn classify_status(status: u16) -> Outcome {
    match status {
        200..=299 => Outcome::Success { status },
        500.. => Outcome::RetryableFailure {
            status: Some(status),
            reason: format!("HTTP {status}"),
        },
        _ => Outcome::TerminalFailure {
            status: Some(status),
            reason: format!("HTTP {status}"),
        },
    }
}

pub fn classify_client_error(error: &ClientError) -> Outcome {
    match error {
        ClientError::NetworkError(e) if e.is_builder() => Outcome::TerminalFailure {
            status: None,
            reason: format!("request could not be built: {e}"),
        },
        ClientError::NetworkError(e) if e.is_timeout() => Outcome::RetryableFailure {
            status: None,
            reason: "timeout".to_string(),
        },
        ClientError::NetworkError(e) => Outcome::RetryableFailure {
            status: None,
            reason: format!("connection failure: {e}"),
        },
        ClientError::HttpError { status, .. } => classify_status(*status),
        ClientError::InvalidConfiguration(_)
        | ClientError::InvalidUrl { .. }
        | ClientError::InvalidResponse(_) => Outcome::TerminalFailure {
            status: None,
            reason: error.to_string(),
        },
    }
}

/// Performs a single send and classifies it. Implementations must not touch shared state.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: UploadRequest) -> Outcome;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: HttpClient,
}

impl HttpTransport {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: UploadRequest) -> Outcome {
        let url = match HttpClient::parse_url(&request.endpoint) {
            Ok(url) => url,
            Err(e) => return classify_client_error(&e),
        };

        debug!(endpoint = %url, "sending upload unit");

        let response = self
            .client
            .post_json(url, &request.body, request.token.as_deref(), request.timeout)
            .await;

        let outcome = match response {
            Ok(response) => classify_status(response.status().as_u16()),
            Err(e) => classify_client_error(&e),
        };

        if !outcome.is_success() {
            warn!(?outcome, "upload attempt failed");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_ranges() {
        assert_eq!(classify_status(200), Outcome::Success { status: 200 });
        assert_eq!(classify_status(204), Outcome::Success { status: 204 });
        assert!(matches!(
            classify_status(503),
            Outcome::RetryableFailure {
                status: Some(503),
                ..
            }
        ));
        assert!(matches!(
            classify_status(500),
            Outcome::RetryableFailure { .. }
        ));
        assert!(matches!(
            classify_status(404),
            Outcome::TerminalFailure {
                status: Some(404),
                ..
            }
        ));
        assert!(matches!(
            classify_status(301),
            Outcome::TerminalFailure { .. }
        ));
        assert!(matches!(
            classify_status(429),
            Outcome::TerminalFailure { .. }
        ));
    }

    #[test]
    fn test_invalid_url_is_terminal() {
        let error = HttpClient::parse_url("::nope::").unwrap_err();
        assert!(matches!(
            classify_client_error(&error),
            Outcome::TerminalFailure { status: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_http_transport_rejects_bad_endpoint_without_network() {
        let client = HttpClient::new(Default::default()).unwrap();
        let transport = HttpTransport::new(client.clone());
        let outcome = transport
            .send(UploadRequest {
                endpoint: "mailto:someone".into(),
                token: None,
                body: serde_json::json!({}),
                timeout: Duration::from_secs(1),
            })
            .await;
        assert!(matches!(outcome, Outcome::TerminalFailure { .. }));
        assert_eq!(client.connection_stats().total_requests, 0);
    }

    #[tokio::test]
    async fn test_mock_transport_is_usable() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .times(1)
            .returning(|_| Outcome::Success { status: 202 });
        let outcome = mock
            .send(UploadRequest {
                endpoint: "http://localhost/upload".into(),
                token: None,
                body: serde_json::json!({"k": 1}),
                timeout: Duration::from_secs(1),
            })
            .await;
        assert_eq!(outcome.status(), Some(202));
    }
}
