//! Resumable HTTP transfers streamed to disk.
//!
//! This module moves the bytes of one task at a time from an
//! [`HttpTransport`] into a `.part` file next to the destination, resuming
//! from the stored offset with `Range`/`If-Range` requests and finalising the
//! file with a rename.
//!
//! # Features
//!
//! - Streaming transfers in 8 KiB slices (memory use independent of file size)
//! - Resume with validator check; fresh restart when the server's `ETag`
//!   changed or the range cannot be satisfied
//! - Cooperative pause/cancel at chunk boundaries
//! - Throttled progress checkpoints (64 KiB and 300 ms)
//! - Collision handling for the final file ([`RenamePolicy`](crate::task::RenamePolicy))
//!
//! The executor and dispatcher are internal; the engine drives them.
//!
//! # Example
//!
//! ```no_run
//! use resumable_dl::download::{HttpClient, HttpTransport, TransferRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new();
//! let response = client
//!     .get(TransferRequest {
//!         url: "https://example.com/big.iso".to_string(),
//!         headers: vec![("Range".to_string(), "bytes=1048576-".to_string())],
//!         connect_timeout: None,
//!         request_timeout: None,
//!     })
//!     .await?;
//! println!("resumed: {}", response.is_partial_content());
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
pub(crate) mod dispatcher;
mod error;
pub(crate) mod executor;
pub mod paths;
pub(crate) mod progress;
pub(crate) mod signal;
mod transport;

pub use client::{DEFAULT_USER_AGENT, HttpClient};
pub use error::DownloadError;
pub use paths::{filename_from_url, sanitize_filename};
pub use transport::{
    BodyStream, ContentRange, HttpTransport, TransferRequest, TransferResponse,
};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
