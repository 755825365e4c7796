//! Constants for the download module (chunking, checkpoint cadence, timeouts).

use std::time::Duration;

/// Largest slice written to disk between progress updates (8 KiB).
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Suffix appended to the destination filename while a transfer is in progress.
pub const TEMP_SUFFIX: &str = ".part";

/// Secondary suffix used when a stale temp file cannot be deleted.
pub const FALLBACK_TEMP_SUFFIX: &str = ".1.part";

/// Minimum spacing between throughput samples.
pub const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_millis(300);

/// Minimum spacing between persisted checkpoints.
pub const CHECKPOINT_MIN_INTERVAL: Duration = Duration::from_millis(300);

/// Minimum progress between persisted checkpoints (64 KiB).
pub const CHECKPOINT_MIN_BYTES: u64 = 64 * 1024;

/// Default time allowed until response headers arrive (20 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 20;
