//! Progress UI (one bar per task) for download runs.

use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use resumable_dl::{TaskId, TaskStatus, TaskView};

const BAR_TEMPLATE: &str =
    "{msg:30!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} eta {eta}";

/// Tracks one progress bar per task and keeps it in sync with snapshots.
pub(crate) struct ProgressManager {
    multi: MultiProgress,
    bars: HashMap<TaskId, ProgressBar>,
    style: ProgressStyle,
}

impl ProgressManager {
    /// With `visible` false, bars are tracked but never drawn.
    pub(crate) fn new(visible: bool) -> Self {
        let target = if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: HashMap::new(),
            style,
        }
    }

    /// Applies one task snapshot to its bar.
    pub(crate) fn update(&mut self, task: &TaskView) {
        let bar = self
            .bars
            .entry(task.id.clone())
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(task.total_bytes));
                bar.set_style(self.style.clone());
                bar
            });
        if bar.is_finished() {
            return;
        }
        if task.total_bytes > 0 {
            bar.set_length(task.total_bytes);
        }
        bar.set_position(task.downloaded_bytes);

        match &task.status {
            TaskStatus::Completed => bar.finish_with_message(format!("{} done", task.title)),
            TaskStatus::Failed { reason, .. } => {
                bar.abandon_with_message(format!("{} failed: {reason}", task.title));
            }
            TaskStatus::Paused(_) => bar.abandon_with_message(format!("{} paused", task.title)),
            TaskStatus::Cancelled => {
                bar.abandon_with_message(format!("{} cancelled", task.title));
            }
            _ => bar.set_message(task.title.clone()),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self, id: &TaskId) -> bool {
        self.bars.get(id).is_some_and(ProgressBar::is_finished)
    }

    /// Stops drawing; bars still running are left as they are.
    pub(crate) fn finish(&self) {
        for bar in self.bars.values().filter(|bar| !bar.is_finished()) {
            bar.abandon();
        }
    }
}
