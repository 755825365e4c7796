//! Closure-driven [`HttpTransport`] for unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::Notify;

use crate::download::{DownloadError, HttpTransport, TransferRequest, TransferResponse};

type Respond = Box<dyn Fn(&TransferRequest) -> TransferResponse + Send + Sync>;

pub struct StubTransport {
    respond: Respond,
    gate: Option<Arc<Notify>>,
    requests: Mutex<Vec<TransferRequest>>,
}

impl StubTransport {
    pub fn new(respond: impl Fn(&TransferRequest) -> TransferResponse + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            gate: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Every request waits for `gate` to be notified before answering.
    pub fn gated(
        gate: Arc<Notify>,
        respond: impl Fn(&TransferRequest) -> TransferResponse + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            gate: Some(gate),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl HttpTransport for StubTransport {
    async fn get(&self, request: TransferRequest) -> Result<TransferResponse, DownloadError> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok((self.respond)(&request))
    }
}

/// A response with `body` sent as one chunk and a matching `Content-Length`.
pub fn response(status: u16, body: &'static [u8]) -> TransferResponse {
    TransferResponse {
        status,
        content_length: Some(body.len() as u64),
        content_range: None,
        etag: None,
        body: futures_util::stream::iter(vec![Ok(Bytes::from_static(body))]).boxed(),
    }
}
