//! Runtime pieces shared by the command handlers.

pub(crate) mod progress_manager;
pub(crate) mod runner;
