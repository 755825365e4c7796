//! Per-activation stop signal carrying why the transfer must stop.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::status::TaskStatus;

/// Why a transfer was asked to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StopReason {
    /// Keep the partial file; the task becomes `Paused(prior)`.
    Pause { prior: TaskStatus },
    /// Discard the partial file; the task becomes `Failed`.
    Cancel,
}

/// Cancellation token plus the first stop reason requested.
#[derive(Debug, Clone, Default)]
pub(crate) struct StopSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Requests a stop. Returns false if a reason was already recorded.
    pub(crate) fn stop(&self, reason: StopReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn reason(&self) -> Option<&StopReason> {
        self.reason.get()
    }

    /// Completes once a stop was requested.
    pub(crate) async fn stopped(&self) {
        self.token.cancelled().await;
    }
}
