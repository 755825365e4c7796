//! Persistence seam for task records.
//!
//! The engine depends on [`TaskRepository`] only. Two implementations ship
//! with the crate: [`SqliteTaskRepository`] for durable storage and
//! [`MemoryTaskRepository`] for tests and ephemeral runs.
//!
//! Listeners are never persisted; loaded tasks come back with an empty one.

mod error;
mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use error::{RepositoryError, RepositoryErrorKind};
pub use memory::MemoryTaskRepository;
pub use sqlite::SqliteTaskRepository;

use crate::task::{Task, TaskId};

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Data-access contract for stored tasks.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Looks up one task.
    async fn find(&self, id: &TaskId) -> Result<Option<Task>>;

    /// Stores a task, replacing any row with the same id.
    async fn insert(&self, task: &Task) -> Result<()>;

    /// Stores many tasks atomically.
    async fn batch_insert(&self, tasks: &[Task]) -> Result<()>;

    /// Overwrites an existing task.
    ///
    /// Returns [`RepositoryError::NotFound`] when no row has the id.
    async fn update(&self, task: &Task) -> Result<()>;

    /// Overwrites many tasks atomically; ids with no row are skipped.
    async fn batch_update(&self, tasks: &[Task]) -> Result<()>;

    /// Deletes one task. Deleting a missing id is not an error.
    async fn remove(&self, id: &TaskId) -> Result<()>;

    /// Deletes the given tasks and returns how many rows went away.
    async fn remove_by_ids(&self, ids: &[TaskId]) -> Result<u64>;

    /// Deletes every task.
    async fn remove_all(&self) -> Result<u64>;

    /// Returns every task, oldest first.
    async fn get_all(&self) -> Result<Vec<Task>>;

    /// Updates only the byte counter and modification time.
    async fn update_progress(
        &self,
        id: &TaskId,
        downloaded_bytes: u64,
        last_modified_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Deletes tasks not modified in the last `days` days.
    async fn remove_older_than(&self, days: u32) -> Result<u64>;
}

/// Cut-off instant for [`TaskRepository::remove_older_than`].
pub(crate) fn retention_cutoff(days: u32) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::days(i64::from(days))
}
