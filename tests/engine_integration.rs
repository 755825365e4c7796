//! Integration tests for the download engine.
//!
//! These drive full task lifecycles through an in-process scripted
//! transport, so pause and cancel land at exact byte offsets.

mod support;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use resumable_dl::{
    Database, DownloadEngine, DownloadError, DownloadListener, EngineConfig, MemoryTaskRepository,
    NewTask, SqliteTaskRepository, Task, TaskRepository, TaskSelector, TaskStatus,
};
use support::fake_transport::ScriptedTransport;
use support::{WAIT_LIMIT, wait_completed, wait_for_status, wait_paused};
use tempfile::TempDir;

const TEN_MIB: usize = 10 * 1024 * 1024;
const FOUR_MIB: u64 = 4 * 1024 * 1024;

fn config(max_concurrent: usize) -> EngineConfig {
    EngineConfig::default()
        .with_max_concurrent(max_concurrent)
        .with_tick_interval(Duration::from_millis(100))
}

fn new_task(dir: &Path, name: &str) -> Task {
    NewTask::new(format!("https://files.example.com/{name}"), dir, name)
        .build()
        .unwrap()
}

async fn start_engine(
    transport: &Arc<ScriptedTransport>,
    max_concurrent: usize,
) -> (DownloadEngine, Arc<MemoryTaskRepository>) {
    let repository = Arc::new(MemoryTaskRepository::new());
    let engine = DownloadEngine::start(
        config(max_concurrent),
        repository.clone(),
        transport.clone(),
    )
    .await
    .unwrap();
    (engine, repository)
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).unwrap().len()
}

// ==================== Pause / Resume Tests ====================

#[tokio::test]
async fn test_pause_at_four_mib_then_resume_completes_file() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::with_size(TEN_MIB);
    let (engine, _) = start_engine(&transport, 1).await;
    let hold = transport.hold_at(FOUR_MIB);

    let id = engine.enqueue(new_task(dir.path(), "big.iso"), None).unwrap();
    hold.reached().await;

    assert_eq!(engine.pause(&TaskSelector::id(id.clone())), 1);
    let paused = wait_paused(&engine, &id).await;
    assert_eq!(paused, TaskStatus::paused(TaskStatus::Running));
    assert_eq!(paused.encode(), "Paused:Running");
    assert_eq!(file_len(&dir.path().join("big.iso.part")), FOUR_MIB);
    assert_eq!(engine.task(&id).unwrap().downloaded_bytes, FOUR_MIB);

    assert_eq!(engine.resume(&TaskSelector::id(id.clone()), None), 1);
    wait_completed(&engine, &id).await;

    let resumed = transport.last_request();
    assert_eq!(resumed.header("Range"), Some("bytes=4194304-"));
    assert_eq!(resumed.header("If-Range"), Some("\"v1\""));

    let final_path = dir.path().join("big.iso");
    assert_eq!(file_len(&final_path), 10_485_760);
    assert_eq!(std::fs::read(&final_path).unwrap(), transport.content().as_ref());
    assert!(!dir.path().join("big.iso.part").exists());
    assert_eq!(engine.status(&id), TaskStatus::Completed);
}

#[tokio::test]
async fn test_validator_change_restarts_from_zero() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::with_size(TEN_MIB);
    let (engine, _) = start_engine(&transport, 1).await;
    let hold = transport.hold_at(FOUR_MIB);

    let id = engine.enqueue(new_task(dir.path(), "big.iso"), None).unwrap();
    hold.reached().await;
    engine.pause(&TaskSelector::All);
    wait_paused(&engine, &id).await;

    transport.set_etag(Some("\"v2\""));
    engine.resume(&TaskSelector::All, None);
    wait_completed(&engine, &id).await;

    let resumed = transport.last_request();
    assert_eq!(resumed.header("If-Range"), Some("\"v1\""));
    let final_path = dir.path().join("big.iso");
    assert_eq!(file_len(&final_path), TEN_MIB as u64);
    assert_eq!(std::fs::read(&final_path).unwrap(), transport.content().as_ref());
    let view = engine.task(&id).unwrap();
    assert_eq!(view.downloaded_bytes, TEN_MIB as u64);
    assert_eq!(view.total_bytes, TEN_MIB as u64);
}

#[tokio::test]
async fn test_server_without_ranges_restarts_after_pause() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::with_size(1024 * 1024);
    transport.set_ranges(false);
    let (engine, _) = start_engine(&transport, 1).await;
    let hold = transport.hold_at(256 * 1024);

    let id = engine.enqueue(new_task(dir.path(), "a.bin"), None).unwrap();
    hold.reached().await;
    engine.pause(&TaskSelector::All);
    wait_paused(&engine, &id).await;

    engine.resume(&TaskSelector::All, None);
    wait_completed(&engine, &id).await;

    assert_eq!(
        std::fs::read(dir.path().join("a.bin")).unwrap(),
        transport.content().as_ref()
    );
}

// ==================== Cancel Tests ====================

#[tokio::test]
async fn test_cancel_running_task_deletes_temp_and_fails() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::with_size(TEN_MIB);
    let (engine, _) = start_engine(&transport, 1).await;
    let hold = transport.hold_at(FOUR_MIB);
    let cancelled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&cancelled);
    let listener = DownloadListener::new().on_cancelled(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let id = engine
        .enqueue(new_task(dir.path(), "big.iso"), Some(listener))
        .unwrap();
    hold.reached().await;
    assert!(dir.path().join("big.iso.part").exists());

    assert_eq!(engine.cancel(&TaskSelector::id(id.clone())), 1);
    let status = wait_for_status(&engine, &id, |s| matches!(s, TaskStatus::Failed { .. })).await;

    match status {
        TaskStatus::Failed { reason, last } => {
            assert_eq!(reason, "task cancelled");
            assert_eq!(*last, TaskStatus::Running);
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert!(!dir.path().join("big.iso.part").exists());
    assert!(!dir.path().join("big.iso").exists());
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
}

// ==================== Scheduling Tests ====================

#[tokio::test]
async fn test_second_task_waits_for_first_with_bound_one() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::with_size(512 * 1024);
    let (engine, _) = start_engine(&transport, 1).await;
    let hold = transport.hold_at(128 * 1024);

    let a = engine.enqueue(new_task(dir.path(), "a.bin"), None).unwrap();
    let b = engine.enqueue(new_task(dir.path(), "b.bin"), None).unwrap();
    hold.reached().await;

    assert_eq!(engine.status(&a), TaskStatus::Running);
    assert!(engine.status(&b).is_waiting());
    assert_eq!(transport.requests().len(), 1);

    hold.release();
    wait_completed(&engine, &a).await;
    wait_completed(&engine, &b).await;

    let urls: Vec<String> = transport.requests().into_iter().map(|r| r.url).collect();
    assert_eq!(
        urls,
        vec![
            "https://files.example.com/a.bin".to_string(),
            "https://files.example.com/b.bin".to_string()
        ]
    );
}

#[tokio::test]
async fn test_processing_tasks_never_exceed_bound() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::with_size(300 * 1024);
    let (engine, _) = start_engine(&transport, 2).await;
    let mut feed = engine.watch(TaskSelector::All);
    feed.next().await;

    let tasks = (0..6)
        .map(|i| new_task(dir.path(), &format!("f{i}.bin")))
        .collect();
    engine.enqueue_batch(tasks, None).unwrap();

    tokio::time::timeout(WAIT_LIMIT, async {
        while let Some(snapshot) = feed.next().await {
            let processing = snapshot.iter().filter(|t| t.status.is_processing()).count();
            assert!(processing <= 2, "{processing} tasks processing at once");
            if snapshot.iter().all(|t| t.status == TaskStatus::Completed) {
                break;
            }
        }
    })
    .await
    .unwrap();
    assert!(engine.in_flight() <= 2);
}

// ==================== Failure Tests ====================

#[tokio::test]
async fn test_http_error_fails_task_and_fires_hook() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::with_size(1024);
    transport.fail_with_status(Some(404));
    let (engine, _) = start_engine(&transport, 1).await;
    let seen = Arc::new(std::sync::Mutex::new(None));
    let slot = Arc::clone(&seen);
    let listener = DownloadListener::new().on_failed(move |_, error| {
        *slot.lock().unwrap() = error.status();
    });

    let id = engine
        .enqueue(new_task(dir.path(), "missing.bin"), Some(listener))
        .unwrap();
    let status = wait_for_status(&engine, &id, |s| matches!(s, TaskStatus::Failed { .. })).await;

    match status {
        TaskStatus::Failed { reason, .. } => assert!(reason.contains("404"), "{reason}"),
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(*seen.lock().unwrap(), Some(404));
}

#[tokio::test]
async fn test_retry_after_failure_downloads_from_scratch() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::with_size(64 * 1024);
    transport.fail_with_status(Some(503));
    let (engine, _) = start_engine(&transport, 1).await;

    let id = engine.enqueue(new_task(dir.path(), "a.bin"), None).unwrap();
    wait_for_status(&engine, &id, |s| matches!(s, TaskStatus::Failed { .. })).await;

    transport.fail_with_status(None);
    assert_eq!(engine.retry(&TaskSelector::id(id.clone()), None), 1);
    wait_completed(&engine, &id).await;

    assert_eq!(transport.last_request().header("Range"), Some("bytes=0-"));
    assert_eq!(file_len(&dir.path().join("a.bin")), 64 * 1024);
}

// ==================== Listener Tests ====================

#[tokio::test]
async fn test_listener_hooks_fire_through_lifecycle() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::with_size(2 * 1024 * 1024);
    let (engine, _) = start_engine(&transport, 1).await;
    let started = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let (s, c) = (Arc::clone(&started), Arc::clone(&completed));
    let listener = DownloadListener::new()
        .on_start(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        })
        .on_completed(move |task| {
            assert_eq!(task.status, TaskStatus::PostProcessing);
            c.fetch_add(1, Ordering::SeqCst);
        });

    let id = engine
        .enqueue(new_task(dir.path(), "a.bin"), Some(listener))
        .unwrap();
    wait_completed(&engine, &id).await;

    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

// ==================== Persistence Tests ====================

#[tokio::test]
async fn test_paused_task_survives_restart_and_resumes() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("tasks.db");
    let transport = ScriptedTransport::with_size(TEN_MIB);

    let id = {
        let repository = Arc::new(SqliteTaskRepository::new(Database::new(&db_path).await.unwrap()));
        let engine = DownloadEngine::start(config(1), repository, transport.clone())
            .await
            .unwrap();
        let hold = transport.hold_at(FOUR_MIB);
        let id = engine.enqueue(new_task(dir.path(), "big.iso"), None).unwrap();
        hold.reached().await;
        engine.shutdown().await;
        assert_eq!(engine.status(&id), TaskStatus::paused(TaskStatus::Running));
        id
    };

    let repository = Arc::new(SqliteTaskRepository::new(Database::new(&db_path).await.unwrap()));
    let stored = repository.find(&id).await.unwrap().unwrap();
    assert_eq!(stored.status.encode(), "Paused:Running");
    assert_eq!(stored.downloaded_bytes, FOUR_MIB);

    let engine = DownloadEngine::start(config(1), repository, transport.clone())
        .await
        .unwrap();
    assert_eq!(engine.resume(&TaskSelector::All, None), 1);
    wait_completed(&engine, &id).await;

    assert_eq!(transport.last_request().header("Range"), Some("bytes=4194304-"));
    assert_eq!(file_len(&dir.path().join("big.iso")), TEN_MIB as u64);
}

#[tokio::test]
async fn test_completed_status_is_persisted() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::with_size(100 * 1024);
    let (engine, repository) = start_engine(&transport, 1).await;

    let id = engine.enqueue(new_task(dir.path(), "a.bin"), None).unwrap();
    wait_completed(&engine, &id).await;
    engine.flush().await;

    let stored = repository.find(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.downloaded_bytes, 100 * 1024);
    assert_eq!(stored.total_bytes, 100 * 1024);
}

#[tokio::test]
async fn test_remove_running_task_deletes_row_and_partial_file() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::with_size(TEN_MIB);
    let (engine, repository) = start_engine(&transport, 1).await;
    let hold = transport.hold_at(FOUR_MIB);

    let id = engine.enqueue(new_task(dir.path(), "big.iso"), None).unwrap();
    hold.reached().await;

    assert_eq!(engine.remove(&TaskSelector::id(id.clone())), 1);
    assert_eq!(engine.status(&id), TaskStatus::Unknown);

    tokio::time::timeout(WAIT_LIMIT, async {
        while engine.in_flight() != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    engine.flush().await;

    assert!(repository.find(&id).await.unwrap().is_none());
    assert!(!dir.path().join("big.iso.part").exists());
}

#[tokio::test]
async fn test_failed_hook_receives_download_error() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::with_size(1024);
    transport.fail_with_status(Some(500));
    let (engine, _) = start_engine(&transport, 1).await;
    let kind = Arc::new(std::sync::Mutex::new(String::new()));
    let slot = Arc::clone(&kind);
    let listener = DownloadListener::new().on_failed(move |_, error| {
        if let DownloadError::HttpStatus { status, .. } = error {
            *slot.lock().unwrap() = format!("http {status}");
        }
    });

    let id = engine
        .enqueue(new_task(dir.path(), "a.bin"), Some(listener))
        .unwrap();
    wait_for_status(&engine, &id, |s| matches!(s, TaskStatus::Failed { .. })).await;

    assert_eq!(*kind.lock().unwrap(), "http 500");
}
