//! CLI command handlers.

mod get;
mod list;
mod manage;

pub use get::{run_get_command, run_resume_command, run_retry_command};
pub use list::run_list_command;
pub use manage::{run_clear_command, run_remove_command};

use resumable_dl::TaskSelector;

/// `--tag` narrows a command to one tag; without it every task is selected.
fn selector_for(tag: Option<&str>) -> TaskSelector {
    tag.map_or(TaskSelector::All, TaskSelector::tag)
}
