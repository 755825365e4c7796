//! List command handler: print stored tasks.

use resumable_dl::{DownloadEngine, TaskStatus, TaskView};

use super::selector_for;
use crate::cli::TagFilter;

pub fn run_list_command(engine: &DownloadEngine, filter: &TagFilter) {
    let tasks = engine.tasks_matching(&selector_for(filter.tag.as_deref()));
    if tasks.is_empty() {
        println!("No tasks.");
        return;
    }
    for task in &tasks {
        println!("{}", render_row(task));
    }
}

fn render_row(task: &TaskView) -> String {
    let progress = if task.total_bytes > 0 {
        format!("{:>5.1}%", task.progress_percent())
    } else {
        format!("{:>6}", "-")
    };
    let tag = task
        .tag
        .as_deref()
        .map(|tag| format!(" [{tag}]"))
        .unwrap_or_default();
    format!(
        "{}  {:<24}  {progress}  {}{tag}",
        task.id,
        status_label(&task.status),
        task.dir.join(&task.filename).display(),
    )
}

/// Short human label; the full history chain is only in the database.
fn status_label(status: &TaskStatus) -> String {
    match status {
        TaskStatus::Initial => "new".to_string(),
        TaskStatus::Queued(_) => "queued".to_string(),
        TaskStatus::Running => "running".to_string(),
        TaskStatus::PostProcessing => "finishing".to_string(),
        TaskStatus::Paused(_) => "paused".to_string(),
        TaskStatus::Completed => "completed".to_string(),
        TaskStatus::Cancelled => "cancelled".to_string(),
        TaskStatus::Failed { reason, .. } => format!("failed: {reason}"),
        TaskStatus::Unknown => "unknown".to_string(),
    }
}
