//! Single-activation transfer of one task.
//!
//! An executor owns one attempt at moving a task's bytes from the server
//! into `<filename>.part` and then into place:
//!
//! 1. reconcile any temp file left by an earlier activation with the stored
//!    byte count
//! 2. send a ranged GET (`Range: bytes=<downloaded>-`, plus `If-Range` when
//!    a validator is known)
//! 3. decide from the response whether the server resumed or restarted
//! 4. stream the body in [`CHUNK_SIZE`] slices, checkpointing progress
//! 5. move the finished file to its destination
//!
//! A [`StopSignal`] interrupts the transfer at the next chunk boundary; the
//! recorded [`StopReason`] decides between `Paused` (temp file kept) and a
//! cancellation (temp file deleted).

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use super::constants::CHUNK_SIZE;
use super::paths::{destination_path, fallback_temp_path, temp_path};
use super::progress::ProgressTracker;
use super::signal::{StopReason, StopSignal};
use super::transport::{BodyStream, ContentRange, HttpTransport, TransferRequest};
use super::DownloadError;
use crate::engine::notifier::ChangeNotifier;
use crate::engine::persister::Persister;
use crate::status::TaskStatus;
use crate::task::{DownloadListener, Task, TaskHandle, TaskView, lock_task};

/// Reason stored on tasks stopped by a cancel request.
pub(crate) const CANCELLED_REASON: &str = "task cancelled";

/// Engine-wide timeouts used when a task sets none.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TransferDefaults {
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

/// How an activation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransferOutcome {
    Completed(PathBuf),
    Paused,
    Cancelled,
    Failed(String),
}

enum Interrupted {
    Stopped,
    Error(DownloadError),
}

impl From<DownloadError> for Interrupted {
    fn from(error: DownloadError) -> Self {
        Self::Error(error)
    }
}

pub(crate) struct TransferExecutor {
    task: TaskHandle,
    transport: Arc<dyn HttpTransport>,
    persister: Persister,
    notifier: ChangeNotifier,
    defaults: TransferDefaults,
    signal: StopSignal,
    temp: PathBuf,
    resume_supported: bool,
}

impl TransferExecutor {
    pub(crate) fn new(
        task: TaskHandle,
        transport: Arc<dyn HttpTransport>,
        persister: Persister,
        notifier: ChangeNotifier,
        defaults: TransferDefaults,
        signal: StopSignal,
    ) -> Self {
        let temp = {
            let t = lock_task(&task);
            temp_path(&t.dir, &t.filename)
        };
        Self {
            task,
            transport,
            persister,
            notifier,
            defaults,
            signal,
            temp,
            resume_supported: false,
        }
    }

    /// Runs the activation to its end and records the outcome on the task.
    pub(crate) async fn run(mut self) -> TransferOutcome {
        let listener = lock_task(&self.task).listener.clone();
        match self.transfer(&listener).await {
            Ok(destination) => self.finish_completed(&listener, destination),
            Err(Interrupted::Stopped) => match self.signal.reason().cloned() {
                Some(StopReason::Pause { prior }) => self.finish_paused(&listener, prior),
                Some(StopReason::Cancel) | None => self.finish_cancelled(&listener).await,
            },
            Err(Interrupted::Error(error)) => self.finish_failed(&listener, error).await,
        }
    }

    async fn transfer(&mut self, listener: &DownloadListener) -> Result<PathBuf, Interrupted> {
        self.reconcile_temp_file().await;

        let view = self.update_task(|t| {
            t.status = TaskStatus::Running;
            t.touch();
        });
        self.notifier.changed();
        listener.started(&view);

        let request = self.build_request();
        let url = request.url.clone();
        debug!(range = ?request.header("Range"), if_range = ?request.header("If-Range"), "sending request");
        let response = tokio::select! {
            biased;
            () = self.signal.stopped() => return Err(Interrupted::Stopped),
            response = self.transport.get(request) => response?,
        };

        let etag = response.etag.clone().unwrap_or_default();
        let validator_changed = {
            let t = lock_task(&self.task);
            !etag.is_empty() && !t.etag.is_empty() && t.etag != etag
        };
        if response.is_range_not_satisfiable() || validator_changed {
            debug!(status = response.status, validator_changed, "server cannot resume, starting over");
            self.discard_temp().await;
            self.update_task(|t| {
                t.reset_progress();
                t.total_bytes = 0;
            });
        }
        if !response.is_success() {
            return Err(DownloadError::http_status(&url, response.status).into());
        }

        let offset = if response.is_partial_content() {
            let range = response.content_range.as_deref().and_then(ContentRange::parse);
            let expected = lock_task(&self.task).downloaded_bytes;
            if range.map(|r| r.start) != Some(expected) {
                return Err(
                    DownloadError::unexpected_range(&url, expected, range.map(|r| r.start)).into(),
                );
            }
            self.resume_supported = true;
            self.update_task(|t| {
                t.etag = etag;
                t.total_bytes = range.and_then(|r| r.total).unwrap_or(0);
            });
            expected
        } else {
            self.discard_temp().await;
            let content_length = response.content_length;
            self.update_task(|t| {
                t.etag = etag;
                t.reset_progress();
                t.total_bytes = content_length.unwrap_or(0);
            });
            0
        };
        info!(status = response.status, offset, "transfer started");

        let mut writer = self.open_temp(offset).await?;
        let streamed = self.stream_body(&mut writer, response.body, listener).await;
        let flushed = writer.flush().await;
        drop(writer);
        streamed?;
        flushed.map_err(|e| DownloadError::io(&self.temp, e))?;

        let (dir, filename, policy, downloaded, total) = {
            let mut t = lock_task(&self.task);
            if t.total_bytes == 0 {
                t.total_bytes = t.downloaded_bytes;
            }
            (
                t.dir.clone(),
                t.filename.clone(),
                t.rename_policy,
                t.downloaded_bytes,
                t.total_bytes,
            )
        };
        if downloaded != total {
            return Err(DownloadError::integrity(&self.temp, total, downloaded).into());
        }

        let destination = destination_path(&dir, &filename, policy);
        tokio::fs::rename(&self.temp, &destination)
            .await
            .map_err(|e| DownloadError::io(&destination, e))?;
        Ok(destination)
    }

    /// Brings the temp file and the stored byte count into agreement.
    async fn reconcile_temp_file(&mut self) {
        let (dir, filename, downloaded) = {
            let t = lock_task(&self.task);
            (t.dir.clone(), t.filename.clone(), t.downloaded_bytes)
        };
        let primary = temp_path(&dir, &filename);
        let fallback = fallback_temp_path(&dir, &filename);

        if downloaded > 0 {
            for candidate in [&fallback, &primary] {
                if let Ok(meta) = tokio::fs::metadata(candidate).await {
                    let kept = downloaded.min(meta.len());
                    debug!(path = %candidate.display(), kept, "resuming from temp file");
                    self.temp.clone_from(candidate);
                    self.update_task(|t| {
                        t.downloaded_bytes = kept;
                        t.speed = 0;
                        t.eta_secs = 0;
                    });
                    return;
                }
            }
            debug!("no temp file to resume from");
        } else if primary.exists() {
            if let Err(e) = tokio::fs::remove_file(&primary).await {
                warn!(path = %primary.display(), error = %e, "cannot delete stale temp file, using fallback name");
                let _ = tokio::fs::remove_file(&fallback).await;
                self.temp = fallback;
                self.update_task(|t| t.reset_progress());
                return;
            }
        }
        self.temp = primary;
        self.update_task(|t| t.reset_progress());
    }

    fn build_request(&self) -> TransferRequest {
        let t = lock_task(&self.task);
        let mut headers = Vec::with_capacity(t.headers.len() + 2);
        if !t.etag.is_empty() {
            headers.push(("If-Range".to_string(), t.etag.clone()));
        }
        headers.push(("Range".to_string(), format!("bytes={}-", t.downloaded_bytes)));
        headers.extend(t.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        TransferRequest {
            url: t.url.clone(),
            headers,
            connect_timeout: t.connect_timeout.or(self.defaults.connect_timeout),
            request_timeout: t.request_timeout.or(self.defaults.request_timeout),
        }
    }

    async fn open_temp(&self, offset: u64) -> Result<BufWriter<tokio::fs::File>, DownloadError> {
        let io_err = |e| DownloadError::io(&self.temp, e);
        if let Some(parent) = self.temp.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.temp)
            .await
            .map_err(io_err)?;
        file.set_len(offset).await.map_err(io_err)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        Ok(BufWriter::new(file))
    }

    async fn stream_body(
        &self,
        writer: &mut BufWriter<tokio::fs::File>,
        mut body: BodyStream,
        listener: &DownloadListener,
    ) -> Result<(), Interrupted> {
        let start = lock_task(&self.task).downloaded_bytes;
        let mut tracker = ProgressTracker::new(Instant::now(), start);

        loop {
            let next = tokio::select! {
                biased;
                () = self.signal.stopped() => return Err(Interrupted::Stopped),
                next = body.next() => next,
            };
            let Some(chunk) = next else {
                return Ok(());
            };
            let chunk = chunk?;

            for slice in chunk.chunks(CHUNK_SIZE) {
                writer
                    .write_all(slice)
                    .await
                    .map_err(|e| DownloadError::io(&self.temp, e))?;
                let (downloaded, total) = {
                    let mut t = lock_task(&self.task);
                    t.downloaded_bytes += slice.len() as u64;
                    (t.downloaded_bytes, t.total_bytes)
                };
                self.record_progress(&mut tracker, listener, downloaded, total);
                if self.signal.is_stopped() {
                    return Err(Interrupted::Stopped);
                }
            }
        }
    }

    fn record_progress(
        &self,
        tracker: &mut ProgressTracker,
        listener: &DownloadListener,
        downloaded: u64,
        total: u64,
    ) {
        let update = tracker.observe(Instant::now(), downloaded, total);
        if update.speed.is_none() && !update.checkpoint {
            return;
        }
        let checkpoint = {
            let mut t = lock_task(&self.task);
            if let Some(sample) = update.speed {
                t.speed = sample.bytes_per_sec;
                t.eta_secs = sample.eta_secs;
            }
            if update.checkpoint {
                t.touch();
                Some((t.clone(), t.view(), t.progress_percent()))
            } else {
                None
            }
        };
        if let Some((snapshot, view, percent)) = checkpoint {
            self.persister.update(snapshot);
            self.notifier.changed();
            listener.progressed(&view, percent);
        }
    }

    fn finish_completed(&self, listener: &DownloadListener, destination: PathBuf) -> TransferOutcome {
        let view = self.update_task(|t| {
            t.status = TaskStatus::PostProcessing;
            t.speed = 0;
            t.eta_secs = 0;
            t.touch();
        });
        self.notifier.changed();
        listener.completed(&view);

        let snapshot = self.commit_status(|_| TaskStatus::Completed);
        info!(path = %destination.display(), bytes = snapshot.downloaded_bytes, "download completed");
        TransferOutcome::Completed(destination)
    }

    fn finish_paused(&self, listener: &DownloadListener, prior: TaskStatus) -> TransferOutcome {
        let view = self.commit_status(|_| TaskStatus::paused(prior));
        info!(downloaded = view.downloaded_bytes, "download paused");
        listener.paused(&view);
        TransferOutcome::Paused
    }

    async fn finish_cancelled(&self, listener: &DownloadListener) -> TransferOutcome {
        self.discard_temp().await;
        let view = self.commit_status(|current| TaskStatus::failed(CANCELLED_REASON, current));
        info!("download cancelled");
        listener.cancelled(&view);
        TransferOutcome::Cancelled
    }

    async fn finish_failed(&self, listener: &DownloadListener, error: DownloadError) -> TransferOutcome {
        if !self.resume_supported {
            self.discard_temp().await;
            self.update_task(|t| t.reset_progress());
        }
        let reason = error.to_string();
        let view = self.commit_status(|current| TaskStatus::failed(reason.clone(), current));
        warn!(error = %error, resumable = self.resume_supported, "download failed");
        listener.failed(&view, &error);
        TransferOutcome::Failed(reason)
    }

    /// Sets the status from the current one, persists and publishes the change.
    fn commit_status(&self, next: impl FnOnce(TaskStatus) -> TaskStatus) -> TaskView {
        let (snapshot, view) = {
            let mut t = lock_task(&self.task);
            let current = std::mem::take(&mut t.status);
            t.status = next(current);
            t.speed = 0;
            t.eta_secs = 0;
            t.touch();
            (t.clone(), t.view())
        };
        self.persister.update(snapshot);
        self.notifier.changed();
        view
    }

    fn update_task(&self, apply: impl FnOnce(&mut Task)) -> TaskView {
        let mut t = lock_task(&self.task);
        apply(&mut t);
        t.view()
    }

    async fn discard_temp(&self) {
        remove_if_exists(&self.temp).await;
    }
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "temp file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "cannot remove temp file"),
    }
}
