//! Throughput sampling and checkpoint cadence for a running transfer.
//!
//! The tracker is pure: callers pass the current instant, which keeps the
//! thresholds testable without sleeping.

use std::time::Instant;

use super::constants::{CHECKPOINT_MIN_BYTES, CHECKPOINT_MIN_INTERVAL, SPEED_SAMPLE_INTERVAL};

/// A throughput sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SpeedSample {
    pub bytes_per_sec: u64,
    pub eta_secs: u64,
}

/// What the transfer should do after writing a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ProgressUpdate {
    /// New speed/ETA to store, when a sample window closed.
    pub speed: Option<SpeedSample>,
    /// Persist the task and fire the progress hook.
    pub checkpoint: bool,
}

#[derive(Debug)]
pub(crate) struct ProgressTracker {
    sample_at: Instant,
    sample_bytes: u64,
    checkpoint_at: Instant,
    checkpoint_bytes: u64,
}

impl ProgressTracker {
    pub(crate) fn new(now: Instant, downloaded: u64) -> Self {
        Self {
            sample_at: now,
            sample_bytes: downloaded,
            checkpoint_at: now,
            checkpoint_bytes: downloaded,
        }
    }

    /// Records that `downloaded` of `total` bytes (0 = unknown) are on disk at `now`.
    pub(crate) fn observe(&mut self, now: Instant, downloaded: u64, total: u64) -> ProgressUpdate {
        let mut update = ProgressUpdate::default();

        let sample_elapsed = now.saturating_duration_since(self.sample_at);
        if sample_elapsed >= SPEED_SAMPLE_INTERVAL {
            let elapsed_ms = u64::try_from(sample_elapsed.as_millis()).unwrap_or(u64::MAX);
            let delta = downloaded.saturating_sub(self.sample_bytes);
            let bytes_per_sec = delta.saturating_mul(1000) / elapsed_ms.max(1);
            let eta_secs = if bytes_per_sec > 0 && total > downloaded {
                (total - downloaded) / bytes_per_sec
            } else {
                0
            };
            update.speed = Some(SpeedSample {
                bytes_per_sec,
                eta_secs,
            });
            self.sample_at = now;
            self.sample_bytes = downloaded;
        }

        let checkpoint_elapsed = now.saturating_duration_since(self.checkpoint_at);
        if downloaded.saturating_sub(self.checkpoint_bytes) >= CHECKPOINT_MIN_BYTES
            && checkpoint_elapsed >= CHECKPOINT_MIN_INTERVAL
        {
            update.checkpoint = true;
            self.checkpoint_at = now;
            self.checkpoint_bytes = downloaded;
        }

        update
    }
}
