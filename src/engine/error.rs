//! Error types for engine operations.

use thiserror::Error;

use crate::db::DbError;
use crate::download::DownloadError;
use crate::repository::RepositoryError;
use crate::task::TaskId;

/// Errors returned by [`DownloadEngine`](super::DownloadEngine).
#[derive(Debug, Error)]
pub enum EngineError {
    /// A task with the same id is already managed.
    #[error(
        "task already exists: {id}\n  Suggestion: Resume or retry the existing task, or remove it first"
    )]
    DuplicateTask {
        /// The conflicting id.
        id: TaskId,
    },

    /// The concurrency bound is outside 1..=100.
    #[error("invalid concurrency {value}: must be between 1 and 100")]
    InvalidConcurrency {
        /// The rejected value.
        value: usize,
    },

    /// Another configuration value is out of range.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// Loading tasks failed.
    #[error("failed to load tasks: {0}")]
    Repository(#[from] RepositoryError),

    /// Opening the database failed.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The default transport could not be built.
    #[error("failed to build HTTP client: {0}")]
    Transport(#[from] DownloadError),
}
