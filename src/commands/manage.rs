//! Remove and clear command handlers.

use resumable_dl::{DownloadEngine, TaskId, TaskSelector};
use tracing::warn;

pub fn run_remove_command(engine: &DownloadEngine, ids: &[String]) -> usize {
    let mut removed = 0;
    for id in ids {
        match engine.remove(&TaskSelector::id(TaskId::from(id.as_str()))) {
            0 => warn!(task_id = %id, "No task with this id"),
            n => removed += n,
        }
    }
    println!("Removed {removed} task(s).");
    removed
}

pub fn run_clear_command(engine: &DownloadEngine) -> usize {
    let removed = engine.clear();
    println!("Removed {removed} task(s).");
    removed
}
