//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod fake_transport;
#[path = "../../src/test_support/socket_guard.rs"]
pub mod socket_guard;

use std::time::Duration;

use resumable_dl::{DownloadEngine, TaskId, TaskStatus};

/// Upper bound for any single wait in these tests.
pub const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Waits until the task's status satisfies `done`, panicking after [`WAIT_LIMIT`].
pub async fn wait_for_status(
    engine: &DownloadEngine,
    id: &TaskId,
    done: impl Fn(&TaskStatus) -> bool,
) -> TaskStatus {
    let mut events = engine.events();
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            let status = engine.status(id);
            if done(&status) {
                return status;
            }
            tokio::select! {
                _ = events.recv() => {}
                () = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting on {id}; status {}", engine.status(id)))
}

pub async fn wait_completed(engine: &DownloadEngine, id: &TaskId) {
    wait_for_status(engine, id, |s| *s == TaskStatus::Completed).await;
}

pub async fn wait_paused(engine: &DownloadEngine, id: &TaskId) -> TaskStatus {
    wait_for_status(engine, id, |s| matches!(s, TaskStatus::Paused(_))).await
}
