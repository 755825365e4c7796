//! Resumable download-task engine.
//!
//! This library keeps a persistent list of HTTP download tasks and runs them
//! with a bounded number of concurrent transfers. Transfers stream into a
//! `.part` file and resume from where they stopped, using `Range` requests
//! validated with the server's `ETag`.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`status`] - Task lifecycle states and their persisted encoding
//! - [`task`] - The task record, its builder and lifecycle hooks
//! - [`repository`] - Persistence seam with SQLite and in-memory backends
//! - [`db`] - Database connection and schema management
//! - [`download`] - HTTP transport and the single-task transfer executor
//! - [`engine`] - Queue coordinator: admission, pause/resume/cancel, live views
//! - [`retry`] - Backoff policy shared by transport and persistence retries

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod db;
pub mod download;
pub mod engine;
pub mod repository;
pub mod retry;
pub mod status;
pub mod task;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use db::{Database, DbError};
pub use download::{DownloadError, HttpClient, HttpTransport, TransferRequest, TransferResponse};
pub use engine::{
    DownloadEngine, EngineConfig, EngineError, EngineEvent, TaskFeed, TaskSelector,
};
pub use repository::{
    MemoryTaskRepository, RepositoryError, SqliteTaskRepository, TaskRepository,
};
pub use retry::{FailureType, RetryDecision, RetryPolicy};
pub use status::TaskStatus;
pub use task::{DownloadListener, NewTask, RenamePolicy, Task, TaskError, TaskId, TaskView};
