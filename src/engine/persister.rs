//! Background writer that applies repository operations in order.
//!
//! Callers never wait on the database: operations go through an unbounded
//! channel to a single worker task, which applies them one at a time. A
//! transient failure (busy or locked database) is retried with backoff; any
//! other failure is logged and the operation dropped, so the in-memory state
//! stays authoritative until the next successful write.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::repository::{RepositoryError, TaskRepository};
use crate::retry::{RetryDecision, RetryPolicy, classify_repository_error};
use crate::task::{Task, TaskId};

enum WriteOp {
    Insert(Box<Task>),
    BatchInsert(Vec<Task>),
    Update(Box<Task>),
    BatchUpdate(Vec<Task>),
    RemoveByIds(Vec<TaskId>),
    RemoveAll,
    Flush(oneshot::Sender<()>),
}

impl WriteOp {
    fn label(&self) -> &'static str {
        match self {
            Self::Insert(_) => "insert",
            Self::BatchInsert(_) => "batch_insert",
            Self::Update(_) => "update",
            Self::BatchUpdate(_) => "batch_update",
            Self::RemoveByIds(_) => "remove_by_ids",
            Self::RemoveAll => "remove_all",
            Self::Flush(_) => "flush",
        }
    }
}

impl std::fmt::Debug for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Handle for queueing writes; clones share one worker.
#[derive(Debug, Clone)]
pub(crate) struct Persister {
    sender: mpsc::UnboundedSender<WriteOp>,
}

impl Persister {
    /// Starts the worker. It exits once every handle is dropped.
    pub(crate) fn spawn(
        repository: Arc<dyn TaskRepository>,
        policy: RetryPolicy,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_writer(receiver, repository, policy));
        (Self { sender }, worker)
    }

    pub(crate) fn insert(&self, task: Task) {
        self.send(WriteOp::Insert(Box::new(task)));
    }

    pub(crate) fn batch_insert(&self, tasks: Vec<Task>) {
        if !tasks.is_empty() {
            self.send(WriteOp::BatchInsert(tasks));
        }
    }

    pub(crate) fn update(&self, task: Task) {
        self.send(WriteOp::Update(Box::new(task)));
    }

    pub(crate) fn batch_update(&self, tasks: Vec<Task>) {
        if !tasks.is_empty() {
            self.send(WriteOp::BatchUpdate(tasks));
        }
    }

    pub(crate) fn remove_by_ids(&self, ids: Vec<TaskId>) {
        if !ids.is_empty() {
            self.send(WriteOp::RemoveByIds(ids));
        }
    }

    pub(crate) fn remove_all(&self) {
        self.send(WriteOp::RemoveAll);
    }

    /// Waits until every operation queued before this call was applied.
    pub(crate) async fn flush(&self) {
        let (done, finished) = oneshot::channel();
        if self.sender.send(WriteOp::Flush(done)).is_ok() {
            let _ = finished.await;
        }
    }

    fn send(&self, op: WriteOp) {
        if let Err(rejected) = self.sender.send(op) {
            warn!(op = rejected.0.label(), "persistence worker stopped; write dropped");
        }
    }
}

async fn run_writer(
    mut receiver: mpsc::UnboundedReceiver<WriteOp>,
    repository: Arc<dyn TaskRepository>,
    policy: RetryPolicy,
) {
    while let Some(op) = receiver.recv().await {
        if let WriteOp::Flush(done) = op {
            let _ = done.send(());
            continue;
        }
        apply_with_retry(repository.as_ref(), &policy, &op).await;
    }
    debug!("persistence worker stopped");
}

async fn apply_with_retry(repository: &dyn TaskRepository, policy: &RetryPolicy, op: &WriteOp) {
    let mut attempt = 1;
    loop {
        let Err(err) = apply(repository, op).await else {
            return;
        };
        // An update racing a removal is expected, not a failure.
        if matches!(err, RepositoryError::NotFound(_)) {
            debug!(op = op.label(), error = %err, "task gone before write");
            return;
        }
        match policy.should_retry(classify_repository_error(&err), attempt) {
            RetryDecision::Retry {
                delay,
                attempt: next,
            } => {
                warn!(op = op.label(), error = %err, attempt, delay_ms = delay.as_millis(), "persistence failed, retrying");
                tokio::time::sleep(delay).await;
                attempt = next;
            }
            RetryDecision::DoNotRetry { reason } => {
                error!(op = op.label(), error = %err, %reason, "persistence failed, write dropped");
                return;
            }
        }
    }
}

async fn apply(repository: &dyn TaskRepository, op: &WriteOp) -> Result<(), RepositoryError> {
    match op {
        WriteOp::Insert(task) => repository.insert(task).await,
        WriteOp::BatchInsert(tasks) => repository.batch_insert(tasks).await,
        WriteOp::Update(task) => repository.update(task).await,
        WriteOp::BatchUpdate(tasks) => repository.batch_update(tasks).await,
        WriteOp::RemoveByIds(ids) => repository.remove_by_ids(ids).await.map(|_| ()),
        WriteOp::RemoveAll => repository.remove_all().await.map(|_| ()),
        WriteOp::Flush(_) => Ok(()),
    }
}
