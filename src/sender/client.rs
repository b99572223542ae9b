use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, ClientBuilder, Response};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },
    #[error("Invalid response body: {0}")]
    InvalidResponse(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub connection_timeout: Duration,
    pub max_connections: usize,
    pub keep_alive_timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            max_connections: 4,
            keep_alive_timeout: Duration::from_secs(60),
            user_agent: format!("session-telemetry/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Request counters since the client was built, as reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_ms: u64,
}

#[derive(Debug, Default)]
pub struct ClientStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_response_time: AtomicU64,
}

impl ClientStats {
    pub fn record_request(&self, success: bool, response_time: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time
            .fetch_add(response_time.as_millis() as u64, Ordering::Relaxed);

        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Shared reqwest client with connection pooling and request accounting.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    pub config: ClientConfig,
    pub stats: Arc<ClientStats>,
}

impl HttpClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .connect_timeout(config.connection_timeout)
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(config.keep_alive_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                ClientError::InvalidConfiguration(format!("Failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            config,
            stats: Arc::new(ClientStats::default()),
        })
    }

    pub fn parse_url(raw: &str) -> Result<Url, ClientError> {
        let url = Url::parse(raw).map_err(|e| ClientError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ClientError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("unsupported scheme '{other}'"),
            }),
        }
    }

    /// POST a JSON body. Non-2xx statuses are returned as a response, not an error.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: Url,
        body: &T,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        let headers = Self::auth_headers(token)?;
        let start = Instant::now();

        let result = self
            .client
            .post(url)
            .headers(headers)
            .timeout(timeout)
            .json(body)
            .send()
            .await;

        match result {
            Ok(response) => {
                self.stats
                    .record_request(response.status().is_success(), start.elapsed());
                Ok(response)
            }
            Err(e) => {
                self.stats.record_request(false, start.elapsed());
                Err(ClientError::NetworkError(e))
            }
        }
    }

    /// Plain GET returning a JSON document.
    pub async fn get_json(&self, url: Url, timeout: Duration) -> Result<Value, ClientError> {
        let start = Instant::now();
        let response = self.client.get(url).timeout(timeout).send().await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_request(false, start.elapsed());
                return Err(ClientError::NetworkError(e));
            }
        };

        let status = response.status();
        self.stats.record_request(status.is_success(), start.elapsed());

        if !status.is_success() {
            return Err(ClientError::HttpError {
                status: status.as_u16(),
                message: format!("GET failed: {status}"),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        let total_requests = self.stats.total_requests.load(Ordering::Relaxed);
        let total_response_time = self.stats.total_response_time.load(Ordering::Relaxed);

        let average_response_ms = total_response_time.checked_div(total_requests).unwrap_or(0);

        ConnectionStats {
            total_requests,
            successful_requests: self.stats.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.stats.failed_requests.load(Ordering::Relaxed),
            average_response_ms,
        }
    }

    fn auth_headers(token: Option<&str>) -> Result<HeaderMap, ClientError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                ClientError::InvalidConfiguration("Token contains invalid header characters".into())
            })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_rejects_non_http_schemes() {
        assert!(HttpClient::parse_url("https://collector.example/upload").is_ok());
        assert!(matches!(
            HttpClient::parse_url("ftp://collector.example"),
            Err(ClientError::InvalidUrl { .. })
        ));
        assert!(HttpClient::parse_url("not a url").is_err());
    }

    #[test]
    fn test_auth_header_only_with_token() {
        assert!(HttpClient::auth_headers(None).unwrap().is_empty());
        assert!(HttpClient::auth_headers(Some("")).unwrap().is_empty());

        let headers = HttpClient::auth_headers(Some("abc123")).unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer abc123");
    }

    #[test]
    fn test_stats_start_empty() {
        let client = HttpClient::new(ClientConfig::default()).unwrap();
        let stats = client.connection_stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.average_response_ms, 0);
    }
}
