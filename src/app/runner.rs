//! Waits for a set of tasks to settle while drawing their progress.

use std::collections::HashSet;

use resumable_dl::{DownloadEngine, TaskId, TaskSelector, TaskStatus, TaskView};
use tracing::{info, warn};

use super::progress_manager::ProgressManager;

/// How the followed tasks ended.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub paused: usize,
    pub interrupted: bool,
}

impl RunSummary {
    pub(crate) fn success(&self) -> bool {
        self.failed == 0 && !self.interrupted
    }

    fn record(&mut self, task: &TaskView) {
        match &task.status {
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Paused(_) => self.paused += 1,
            TaskStatus::Failed { reason, .. } => {
                warn!(task_id = %task.id, url = %task.url, reason = %reason, "Download failed");
                self.failed += 1;
            }
            TaskStatus::Cancelled => self.failed += 1,
            _ => {}
        }
    }
}

/// Nothing more will happen to a task in this state without user action.
fn is_settled(status: &TaskStatus) -> bool {
    status.is_finite()
}

/// Follows `ids` until each is completed, failed or paused.
///
/// Ctrl-C pauses the followed tasks so a later `rdl resume` continues them.
pub(crate) async fn follow(
    engine: &DownloadEngine,
    ids: &HashSet<TaskId>,
    show_progress: bool,
) -> RunSummary {
    let mut summary = RunSummary::default();
    if ids.is_empty() {
        return summary;
    }

    let mut progress = ProgressManager::new(show_progress);
    let mut feed = engine.watch(TaskSelector::All);
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        let snapshot = tokio::select! {
            _ = &mut interrupt, if !summary.interrupted => {
                info!("Interrupted, pausing downloads");
                summary.interrupted = true;
                for id in ids {
                    engine.pause(&TaskSelector::id(id.clone()));
                }
                continue;
            }
            snapshot = feed.next() => snapshot,
        };
        let Some(tasks) = snapshot else {
            break;
        };

        let targets: Vec<&TaskView> = tasks.iter().filter(|t| ids.contains(&t.id)).collect();
        for task in &targets {
            progress.update(task);
        }
        if targets.iter().all(|t| is_settled(&t.status)) {
            for task in &targets {
                summary.record(task);
            }
            break;
        }
    }

    progress.finish();
    info!(
        completed = summary.completed,
        failed = summary.failed,
        paused = summary.paused,
        "Download complete"
    );
    summary
}
