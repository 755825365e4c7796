//! reqwest implementation of [`HttpTransport`].
//!
//! One [`HttpClient`] is created per engine and shared by every transfer,
//! taking advantage of reqwest's connection pooling. Decompression is left
//! off so byte offsets in `Range` requests match bytes on disk.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, ETAG, HeaderMap};
use tracing::{debug, instrument, warn};

use super::DownloadError;
use super::constants::CONNECT_TIMEOUT_SECS;
use super::transport::{HttpTransport, TransferRequest, TransferResponse};
use crate::retry::{RetryDecision, RetryPolicy, classify_error};

/// Default `User-Agent` sent when a task does not set one.
pub const DEFAULT_USER_AGENT: &str = concat!("rdl/", env!("CARGO_PKG_VERSION"));

/// HTTP client for streaming downloads.
///
/// # Example
///
/// ```no_run
/// use resumable_dl::download::{HttpClient, HttpTransport, TransferRequest};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new();
/// let response = client
///     .get(TransferRequest {
///         url: "https://example.com/file.iso".to_string(),
///         headers: vec![("Range".to_string(), "bytes=0-".to_string())],
///         connect_timeout: None,
///         request_timeout: None,
///     })
///     .await?;
/// println!("status {}", response.status);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    retry: RetryPolicy,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with the default user agent and no request retries.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::with_user_agent(DEFAULT_USER_AGENT)
            .expect("failed to build HTTP client with static configuration")
    }

    /// Creates a client that sends `user_agent` unless a task overrides it.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Network`] if the TLS backend or resolver
    /// cannot be initialised.
    pub fn with_user_agent(user_agent: &str) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| DownloadError::network("<client>", e))?;
        Ok(Self {
            client,
            retry: RetryPolicy::no_retry(),
        })
    }

    /// Retries requests that fail before any response arrives.
    ///
    /// Responses, including error statuses, are never retried here.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }

    async fn send_once(&self, request: &TransferRequest) -> Result<reqwest::Response, DownloadError> {
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(limit) = request.request_timeout {
            builder = builder.timeout(limit);
        }

        let send = builder.send();
        let sent = match request.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, send)
                .await
                .map_err(|_| DownloadError::timeout(&request.url))?,
            None => send.await,
        };
        sent.map_err(|e| map_reqwest_error(&request.url, e))
    }
}

#[async_trait]
impl HttpTransport for HttpClient {
    #[instrument(skip(self, request), fields(url = %request.url))]
    async fn get(&self, request: TransferRequest) -> Result<TransferResponse, DownloadError> {
        let mut attempt = 1;
        let response = loop {
            match self.send_once(&request).await {
                Ok(response) => break response,
                Err(error) => match self.retry.should_retry(classify_error(&error), attempt) {
                    RetryDecision::Retry {
                        delay,
                        attempt: next,
                    } => {
                        warn!(error = %error, attempt, delay_ms = delay.as_millis(), "request failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt = next;
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        debug!(%reason, "not retrying request");
                        return Err(error);
                    }
                },
            }
        };

        let status = response.status().as_u16();
        let headers = response.headers();
        let content_length =
            header_value(headers, CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok());
        let content_range = header_value(headers, CONTENT_RANGE.as_str());
        let etag = header_value(headers, ETAG.as_str());
        debug!(status, ?content_length, ?content_range, ?etag, "response headers");

        let url = request.url;
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| map_reqwest_error(&url, e)))
            .boxed();

        Ok(TransferResponse {
            status,
            content_length,
            content_range,
            etag,
            body,
        })
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn map_reqwest_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else if error.is_builder() {
        DownloadError::invalid_url(url)
    } else {
        DownloadError::network(url, error)
    }
}
