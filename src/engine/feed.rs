//! Live, filtered view of the task list.

use std::sync::Weak;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use super::{EngineEvent, EngineInner, TaskSelector};
use crate::task::TaskView;

/// Stream of task snapshots returned by [`DownloadEngine::watch`](super::DownloadEngine::watch).
///
/// The first call to [`next`](Self::next) yields the current snapshot; each
/// later call waits for the next change. Snapshots may be coalesced when
/// changes arrive faster than they are read.
pub struct TaskFeed {
    engine: Weak<EngineInner>,
    events: broadcast::Receiver<EngineEvent>,
    shutdown: CancellationToken,
    selector: TaskSelector,
    primed: bool,
}

impl TaskFeed {
    pub(super) fn new(
        engine: Weak<EngineInner>,
        events: broadcast::Receiver<EngineEvent>,
        shutdown: CancellationToken,
        selector: TaskSelector,
    ) -> Self {
        Self {
            engine,
            events,
            shutdown,
            selector,
            primed: false,
        }
    }

    /// Waits for the next snapshot. Returns `None` once the engine is gone
    /// or shut down.
    pub async fn next(&mut self) -> Option<Vec<TaskView>> {
        if !self.primed {
            self.primed = true;
            return self.snapshot();
        }
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return None,
                event = self.events.recv() => match event {
                    Ok(EngineEvent::TasksChanged { .. }) | Err(RecvError::Lagged(_)) => {
                        return self.snapshot();
                    }
                    Ok(EngineEvent::Reevaluate) => {}
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }

    /// The selector this feed filters by.
    #[must_use]
    pub fn selector(&self) -> &TaskSelector {
        &self.selector
    }

    fn snapshot(&self) -> Option<Vec<TaskView>> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        self.engine
            .upgrade()
            .map(|inner| inner.views(&self.selector))
    }
}

impl std::fmt::Debug for TaskFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFeed")
            .field("selector", &self.selector)
            .field("primed", &self.primed)
            .finish_non_exhaustive()
    }
}
