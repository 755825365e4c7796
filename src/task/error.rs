//! Validation errors for new tasks.

use thiserror::Error;

/// Reasons a [`NewTask`](super::NewTask) cannot become a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The source URL is empty.
    #[error("task URL must not be empty")]
    EmptyUrl,

    /// The source URL cannot be parsed or is not HTTP(S).
    #[error("invalid task URL {url}: {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The destination filename is empty.
    #[error("task filename must not be empty")]
    EmptyFilename,

    /// The destination filename is a path rather than a single name.
    #[error(
        "invalid task filename '{filename}'\n  Suggestion: Pass a plain file name and put directories in the destination directory"
    )]
    InvalidFilename {
        /// The rejected filename.
        filename: String,
    },
}
