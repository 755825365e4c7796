//! HTTP transport port consumed by the transfer executor.
//!
//! The executor only needs a streaming GET: status code, the three headers
//! that drive resume negotiation, and a body it can read chunk by chunk.
//! [`HttpClient`](super::HttpClient) implements this over reqwest; tests and
//! embedders can supply their own implementation.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use super::DownloadError;

/// Response body as a stream of chunks.
pub type BodyStream = BoxStream<'static, Result<Bytes, DownloadError>>;

/// A streaming GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Target URL.
    pub url: String,
    /// Headers in send order, including `Range`/`If-Range`.
    pub headers: Vec<(String, String)>,
    /// Limit on the time until response headers arrive.
    pub connect_timeout: Option<Duration>,
    /// Limit on the whole exchange, body included.
    pub request_timeout: Option<Duration>,
}

impl TransferRequest {
    /// Returns the first header value with the given name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Response headers and body of a streaming GET.
pub struct TransferResponse {
    /// HTTP status code.
    pub status: u16,
    /// `Content-Length` header.
    pub content_length: Option<u64>,
    /// Raw `Content-Range` header.
    pub content_range: Option<String>,
    /// `ETag` header.
    pub etag: Option<String>,
    /// Body chunks.
    pub body: BodyStream,
}

impl TransferResponse {
    /// 2xx status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 206 Partial Content.
    #[must_use]
    pub fn is_partial_content(&self) -> bool {
        self.status == 206
    }

    /// 416 Range Not Satisfiable.
    #[must_use]
    pub fn is_range_not_satisfiable(&self) -> bool {
        self.status == 416
    }
}

impl fmt::Debug for TransferResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .field("etag", &self.etag)
            .finish_non_exhaustive()
    }
}

/// Parsed `Content-Range: bytes <start>-<end>/<total>` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` when the server sends `*` for an unknown length.
    pub total: Option<u64>,
}

impl ContentRange {
    /// Parses a satisfied byte range; returns `None` for anything else.
    #[must_use]
    pub fn parse(header: &str) -> Option<Self> {
        let spec = header.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = spec.split_once('/')?;
        let (start, end) = range.trim().split_once('-')?;
        let start = start.trim().parse().ok()?;
        let end = end.trim().parse().ok()?;
        let total = match total.trim() {
            "*" => None,
            value => Some(value.parse().ok()?),
        };
        (start <= end).then_some(Self { start, end, total })
    }
}

/// Streaming HTTP GET used by transfers.
///
/// Non-success statuses are returned as responses, not errors; only failures
/// to obtain a response at all are errors.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends the request and returns once response headers are available.
    async fn get(&self, request: TransferRequest) -> Result<TransferResponse, DownloadError>;
}
