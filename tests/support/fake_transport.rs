//! In-process HTTP transport with scripted range and validator behaviour.
//!
//! Serves one body for every URL. Honours `Range: bytes=N-` (unless range
//! support is switched off) and `If-Range`, and can hold a response body at
//! a byte offset so a test can pause or cancel at an exact point.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use resumable_dl::download::{DownloadError, HttpTransport, TransferRequest, TransferResponse};
use tokio::sync::Notify;

const SERVE_CHUNK: usize = 64 * 1024;

/// Signals for one held response body.
#[derive(Clone)]
pub struct HoldHandle {
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

impl HoldHandle {
    /// Resolves once every byte before the hold offset has been consumed.
    pub async fn reached(&self) {
        tokio::time::timeout(super::WAIT_LIMIT, self.reached.notified())
            .await
            .expect("body never reached the hold offset");
    }

    /// Lets the held body continue.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

struct Hold {
    at: usize,
    handle: HoldHandle,
}

struct Script {
    etag: Option<String>,
    ranges: bool,
    status: Option<u16>,
    hold: Option<Hold>,
    requests: Vec<TransferRequest>,
}

pub struct ScriptedTransport {
    content: Bytes,
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new(content: impl Into<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            content: content.into(),
            script: Mutex::new(Script {
                etag: Some("\"v1\"".to_string()),
                ranges: true,
                status: None,
                hold: None,
                requests: Vec::new(),
            }),
        })
    }

    /// A body of `len` bytes with a repeating, non-trivial pattern.
    pub fn with_size(len: usize) -> Arc<Self> {
        #[allow(clippy::cast_possible_truncation)]
        let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        Self::new(content)
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn set_etag(&self, etag: Option<&str>) {
        self.script.lock().unwrap().etag = etag.map(str::to_string);
    }

    pub fn set_ranges(&self, ranges: bool) {
        self.script.lock().unwrap().ranges = ranges;
    }

    /// Answers every request with `status` and an empty body until cleared.
    pub fn fail_with_status(&self, status: Option<u16>) {
        self.script.lock().unwrap().status = status;
    }

    /// Holds the next response body at absolute byte `offset`.
    pub fn hold_at(&self, offset: u64) -> HoldHandle {
        let handle = HoldHandle {
            reached: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        self.script.lock().unwrap().hold = Some(Hold {
            at: usize::try_from(offset).unwrap(),
            handle: handle.clone(),
        });
        handle
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        self.script.lock().unwrap().requests.clone()
    }

    pub fn last_request(&self) -> TransferRequest {
        self.requests().pop().expect("no request was sent")
    }
}

fn requested_start(request: &TransferRequest) -> Option<usize> {
    request
        .header("Range")?
        .strip_prefix("bytes=")?
        .strip_suffix('-')?
        .parse()
        .ok()
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(&self, request: TransferRequest) -> Result<TransferResponse, DownloadError> {
        let (etag, ranges, status, hold) = {
            let mut script = self.script.lock().unwrap();
            script.requests.push(request.clone());
            (
                script.etag.clone(),
                script.ranges,
                script.status,
                script.hold.take(),
            )
        };

        if let Some(status) = status {
            return Ok(TransferResponse {
                status,
                content_length: Some(0),
                content_range: None,
                etag,
                body: futures_util::stream::empty().boxed(),
            });
        }

        let len = self.content.len();
        let validator_matches = match (request.header("If-Range"), etag.as_deref()) {
            (Some(sent), Some(current)) => sent == current,
            (Some(_), None) => false,
            (None, _) => true,
        };
        let start = requested_start(&request).filter(|_| ranges && validator_matches);

        let (status, start, content_range) = match start {
            Some(start) if start > len => {
                return Ok(TransferResponse {
                    status: 416,
                    content_length: Some(0),
                    content_range: Some(format!("bytes */{len}")),
                    etag,
                    body: futures_util::stream::empty().boxed(),
                });
            }
            Some(start) => (
                206,
                start,
                Some(format!("bytes {start}-{}/{len}", len.saturating_sub(1))),
            ),
            None => (200, 0, None),
        };

        Ok(TransferResponse {
            status,
            content_length: Some((len - start) as u64),
            content_range,
            etag,
            body: body_stream(self.content.clone(), start, hold),
        })
    }
}

struct BodyState {
    content: Bytes,
    pos: usize,
    hold: Option<Hold>,
}

fn body_stream(content: Bytes, start: usize, hold: Option<Hold>) -> resumable_dl::download::BodyStream {
    let state = BodyState {
        content,
        pos: start,
        hold: hold.filter(|h| h.at >= start),
    };
    futures_util::stream::unfold(state, |mut state| async move {
        if let Some(hold) = state.hold.take_if(|h| h.at == state.pos) {
            hold.handle.reached.notify_one();
            hold.handle.release.notified().await;
        }
        let end = state.content.len();
        if state.pos >= end {
            return None;
        }
        let mut next = (state.pos + SERVE_CHUNK).min(end);
        if let Some(hold) = &state.hold {
            next = next.min(hold.at);
        }
        let chunk = state.content.slice(state.pos..next);
        state.pos = next;
        Some((Ok(chunk), state))
    })
    .boxed()
}
