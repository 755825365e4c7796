//! Queue coordinator: the public face of the crate.
//!
//! [`DownloadEngine`] owns the authoritative task list and keeps at most
//! `max_concurrent` transfers running. Every change to the list is published
//! as an [`EngineEvent`]; a background admission loop reacts to each event
//! with one rebalance step:
//!
//! - more transfers in flight than allowed: pause one running task
//! - fewer in flight than allowed and a queued task exists: start the first one
//!
//! A periodic tick publishes [`EngineEvent::Reevaluate`] so status changes
//! made outside the engine's own operations still get picked up, and mirrors
//! the progress of running tasks to the repository.
//!
//! # Example
//!
//! ```no_run
//! use resumable_dl::{DownloadEngine, EngineConfig, NewTask, TaskSelector};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = DownloadEngine::with_sqlite(EngineConfig::default(), "rdl.db".as_ref()).await?;
//! let task = NewTask::new("https://example.com/big.iso", "/tmp/downloads", "big.iso").build()?;
//! let id = engine.enqueue(task, None)?;
//!
//! engine.wait_idle().await;
//! println!("{id}: {}", engine.status(&id));
//! engine.pause(&TaskSelector::All);
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod feed;
pub(crate) mod notifier;
pub(crate) mod persister;
mod selector;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use config::{DEFAULT_MAX_CONCURRENT, DEFAULT_TICK_INTERVAL, EngineConfig, MAX_CONCURRENT_LIMIT};
pub use error::EngineError;
pub use feed::TaskFeed;
pub use notifier::EngineEvent;
pub use selector::TaskSelector;

use crate::db::Database;
use crate::download::dispatcher::Dispatcher;
use crate::download::executor::{CANCELLED_REASON, TransferDefaults};
use crate::download::paths::{fallback_temp_path, temp_path};
use crate::download::{HttpClient, HttpTransport};
use crate::repository::{MemoryTaskRepository, SqliteTaskRepository, TaskRepository};
use crate::status::TaskStatus;
use crate::task::{DownloadListener, Task, TaskHandle, TaskId, TaskView, lock_task};
use config::validate_concurrency;
use notifier::ChangeNotifier;
use persister::Persister;

/// Capacity of the event channel; slower subscribers see `Lagged` and resync.
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct EngineState {
    tasks: Vec<TaskHandle>,
    in_flight: usize,
    max_concurrent: usize,
    /// `in_flight` as seen by the previous tick.
    last_in_flight: usize,
}

impl EngineState {
    fn find(&self, id: &TaskId) -> Option<&TaskHandle> {
        self.tasks.iter().find(|handle| lock_task(handle).id == *id)
    }

    fn selected(&self, selector: &TaskSelector) -> Vec<TaskHandle> {
        let mut selected = Vec::new();
        for handle in &self.tasks {
            if selector.matches(&lock_task(handle)) {
                selected.push(Arc::clone(handle));
                if selector.is_single() {
                    break;
                }
            }
        }
        selected
    }
}

pub(crate) struct EngineInner {
    state: Mutex<EngineState>,
    dispatcher: Arc<Dispatcher>,
    persister: Persister,
    notifier: ChangeNotifier,
    shutdown: CancellationToken,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl EngineInner {
    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn views(&self, selector: &TaskSelector) -> Vec<TaskView> {
        let state = self.lock_state();
        state
            .tasks
            .iter()
            .filter_map(|handle| {
                let task = lock_task(handle);
                selector.matches(&task).then(|| task.view())
            })
            .collect()
    }

    /// One admission step.
    fn rebalance(self: &Arc<Self>) {
        let mut state = self.lock_state();
        if state.in_flight > state.max_concurrent {
            // Activations already asked to stop still count as in flight
            // until they return; only stop more if the active ones exceed
            // the bound on their own.
            if self.dispatcher.in_flight_count() <= state.max_concurrent {
                return;
            }
            let victim = state.tasks.iter().find(|handle| {
                let task = lock_task(handle);
                task.status == TaskStatus::Running && self.dispatcher.is_in_flight(&task.id)
            });
            if let Some(handle) = victim {
                debug!(
                    in_flight = state.in_flight,
                    max = state.max_concurrent,
                    "over concurrency bound, pausing a transfer"
                );
                self.dispatcher.request_pause(handle);
            }
            return;
        }
        if state.in_flight >= state.max_concurrent {
            return;
        }

        let Some(handle) = state
            .tasks
            .iter()
            .find(|handle| lock_task(handle).status.is_waiting())
            .cloned()
        else {
            return;
        };

        let snapshot = {
            let mut task = lock_task(&handle);
            task.status = TaskStatus::Running;
            task.touch();
            task.clone()
        };
        state.in_flight += 1;
        info!(task_id = %snapshot.id, in_flight = state.in_flight, "starting transfer");

        let weak = Arc::downgrade(self);
        self.dispatcher.start(handle, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_transfer_finished();
            }
        });
        drop(state);

        self.persister.update(snapshot);
        self.notifier.changed();
        self.notifier.reevaluate();
    }

    fn on_transfer_finished(&self) {
        {
            let mut state = self.lock_state();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.notifier.reevaluate();
    }

    /// Persists running tasks while transfers are (or just were) active.
    fn tick(&self) {
        let snapshots = {
            let mut state = self.lock_state();
            let active = state.in_flight != 0 || state.last_in_flight != 0;
            state.last_in_flight = state.in_flight;
            if active {
                state
                    .tasks
                    .iter()
                    .filter_map(|handle| {
                        let task = lock_task(handle);
                        task.status.is_processing().then(|| task.clone())
                    })
                    .collect()
            } else {
                Vec::new()
            }
        };
        self.persister.batch_update(snapshots);
        self.notifier.reevaluate();
    }

    fn is_idle(&self) -> bool {
        let state = self.lock_state();
        state.in_flight == 0
            && state.tasks.iter().all(|handle| {
                let task = lock_task(handle);
                !task.status.is_waiting() && !task.status.is_processing()
            })
    }
}

/// Handle to a running download engine. Clones share the same engine.
///
/// Background work stops when the last clone is dropped or
/// [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct DownloadEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for DownloadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("DownloadEngine")
            .field("tasks", &state.tasks.len())
            .field("in_flight", &state.in_flight)
            .field("max_concurrent", &state.max_concurrent)
            .finish()
    }
}

impl DownloadEngine {
    /// Loads stored tasks and starts the scheduler.
    ///
    /// Tasks stored as queued, running or post-processing cannot have a
    /// live transfer after a restart; they are demoted to `Paused` wrapping
    /// their stored status and written back before anything runs.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the configuration is invalid or the
    /// stored tasks cannot be loaded.
    #[instrument(skip_all, fields(max_concurrent = config.max_concurrent))]
    pub async fn start(
        config: EngineConfig,
        repository: Arc<dyn TaskRepository>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let mut loaded = repository.get_all().await?;
        let mut demoted = Vec::new();
        for task in &mut loaded {
            if task.status.is_pauseable() {
                let stale = std::mem::take(&mut task.status);
                task.status = TaskStatus::paused(stale);
                task.speed = 0;
                task.eta_secs = 0;
                demoted.push(task.clone());
            }
        }
        if !demoted.is_empty() {
            info!(count = demoted.len(), "demoting stale in-progress tasks to paused");
            repository.batch_update(&demoted).await?;
        }
        info!(tasks = loaded.len(), "loaded stored tasks");

        let (persister, _worker) = Persister::spawn(repository, config.persistence_retry_policy());
        let notifier = ChangeNotifier::new(EVENT_CAPACITY);
        let defaults = TransferDefaults {
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
        };
        let dispatcher = Arc::new(Dispatcher::new(
            transport,
            persister.clone(),
            notifier.clone(),
            defaults,
        ));

        let inner = Arc::new(EngineInner {
            state: Mutex::new(EngineState {
                tasks: loaded
                    .into_iter()
                    .map(|task| Arc::new(Mutex::new(task)))
                    .collect(),
                in_flight: 0,
                max_concurrent: config.max_concurrent,
                last_in_flight: 0,
            }),
            dispatcher,
            persister,
            notifier,
            shutdown: CancellationToken::new(),
        });

        let events = inner.notifier.subscribe();
        tokio::spawn(admission_loop(
            Arc::downgrade(&inner),
            events,
            inner.shutdown.clone(),
        ));
        tokio::spawn(tick_loop(
            Arc::downgrade(&inner),
            config.tick_interval,
            inner.shutdown.clone(),
        ));
        inner.notifier.reevaluate();

        Ok(Self { inner })
    }

    /// Starts an engine over a SQLite file with the reqwest transport.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the database cannot be opened, the HTTP
    /// client cannot be built, or [`start`](Self::start) fails.
    pub async fn with_sqlite(config: EngineConfig, db_path: &Path) -> Result<Self, EngineError> {
        let db = Database::new(db_path).await?;
        let repository = Arc::new(SqliteTaskRepository::new(db));
        let transport = Self::default_transport(&config)?;
        Self::start(config, repository, transport).await
    }

    /// Starts an engine that forgets everything on exit.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the HTTP client cannot be built or the
    /// configuration is invalid.
    pub async fn in_memory(config: EngineConfig) -> Result<Self, EngineError> {
        let transport = Self::default_transport(&config)?;
        Self::start(config, Arc::new(MemoryTaskRepository::new()), transport).await
    }

    fn default_transport(config: &EngineConfig) -> Result<Arc<dyn HttpTransport>, EngineError> {
        let client = HttpClient::with_user_agent(&config.user_agent)?
            .with_retry(config.request_retry_policy());
        Ok(Arc::new(client))
    }

    // ==================== Mutations ====================

    /// Queues a task. `listener`, when given, replaces the task's own.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateTask`] if a task with the same id is
    /// already managed; the existing task is left untouched.
    pub fn enqueue(
        &self,
        task: Task,
        listener: Option<DownloadListener>,
    ) -> Result<TaskId, EngineError> {
        self.enqueue_batch(vec![task], listener)
            .map(|mut ids| ids.remove(0))
    }

    /// Queues several tasks. Either all are accepted or none.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateTask`] for the first id that is
    /// already managed or repeated within `tasks`.
    pub fn enqueue_batch(
        &self,
        tasks: Vec<Task>,
        listener: Option<DownloadListener>,
    ) -> Result<Vec<TaskId>, EngineError> {
        let mut state = self.inner.lock_state();
        let mut seen = HashSet::new();
        for task in &tasks {
            if !seen.insert(task.id.clone()) || state.find(&task.id).is_some() {
                warn!(task_id = %task.id, "rejecting duplicate task");
                return Err(EngineError::DuplicateTask {
                    id: task.id.clone(),
                });
            }
        }

        let mut ids = Vec::with_capacity(tasks.len());
        let mut stored = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            task.status = TaskStatus::queued(std::mem::take(&mut task.status));
            task.touch();
            if let Some(listener) = &listener {
                task.set_listener(listener.clone());
            }
            debug!(task_id = %task.id, url = %task.url, "task queued");
            ids.push(task.id.clone());
            stored.push(task.clone());
            state.tasks.push(Arc::new(Mutex::new(task)));
        }
        drop(state);

        if stored.len() == 1 {
            self.inner.persister.insert(stored.remove(0));
        } else {
            self.inner.persister.batch_insert(stored);
        }
        self.inner.notifier.changed();
        Ok(ids)
    }

    /// Pauses selected tasks and returns how many were affected.
    ///
    /// Queued tasks pause immediately; running ones stop at their next chunk
    /// boundary and keep their partial file.
    pub fn pause(&self, selector: &TaskSelector) -> usize {
        let mut affected = 0;
        let mut paused = Vec::new();
        {
            let state = self.inner.lock_state();
            for handle in state.selected(selector) {
                let mut task = lock_task(&handle);
                if task.status.is_waiting() {
                    let current = std::mem::take(&mut task.status);
                    task.status = TaskStatus::paused(current);
                    task.touch();
                    paused.push(task.clone());
                    affected += 1;
                } else if task.status.is_processing() {
                    drop(task);
                    if self.inner.dispatcher.request_pause(&handle) {
                        affected += 1;
                    }
                }
            }
        }
        self.commit(paused, |listener, view| listener.paused(view));
        affected
    }

    /// Moves selected paused tasks back to the queue.
    ///
    /// `listener`, when given, replaces each task's listener. Fires
    /// `on_resumed` for every task resumed.
    pub fn resume(&self, selector: &TaskSelector, listener: Option<DownloadListener>) -> usize {
        let mut resumed = Vec::new();
        {
            let state = self.inner.lock_state();
            for handle in state.selected(selector) {
                let mut task = lock_task(&handle);
                if !matches!(task.status, TaskStatus::Paused(_)) {
                    continue;
                }
                let current = std::mem::take(&mut task.status);
                task.status = TaskStatus::queued(current);
                task.touch();
                if let Some(listener) = &listener {
                    task.set_listener(listener.clone());
                }
                resumed.push(task.clone());
            }
        }
        let count = resumed.len();
        self.commit(resumed, |listener, view| listener.resumed(view));
        count
    }

    /// Cancels selected tasks and returns how many were affected.
    ///
    /// Queued and paused tasks fail immediately with their partial file
    /// removed; running ones stop at their next chunk boundary.
    pub fn cancel(&self, selector: &TaskSelector) -> usize {
        let mut affected = 0;
        let mut cancelled = Vec::new();
        {
            let state = self.inner.lock_state();
            for handle in state.selected(selector) {
                let mut task = lock_task(&handle);
                if matches!(task.status, TaskStatus::Queued(_) | TaskStatus::Paused(_)) {
                    let current = std::mem::take(&mut task.status);
                    task.status = TaskStatus::failed(CANCELLED_REASON, current);
                    task.speed = 0;
                    task.eta_secs = 0;
                    task.touch();
                    cancelled.push(task.clone());
                    affected += 1;
                } else if task.status.is_processing() {
                    drop(task);
                    if self.inner.dispatcher.request_cancel(&handle) {
                        affected += 1;
                    }
                }
            }
        }
        discard_temp_files(partial_files(&cancelled));
        self.commit(cancelled, |listener, view| listener.cancelled(view));
        affected
    }

    /// Restarts selected failed tasks from scratch.
    ///
    /// `listener`, when given, replaces each task's listener.
    pub fn retry(&self, selector: &TaskSelector, listener: Option<DownloadListener>) -> usize {
        let mut regenerated = Vec::new();
        {
            let state = self.inner.lock_state();
            for handle in state.selected(selector) {
                let mut task = lock_task(&handle);
                if matches!(task.status, TaskStatus::Failed { .. }) {
                    task.regenerate(listener.clone());
                    debug!(task_id = %task.id, "task regenerated");
                    regenerated.push(task.clone());
                }
            }
        }
        let count = regenerated.len();
        self.commit(regenerated, |_, _| {});
        count
    }

    /// Removes selected tasks from the engine and the repository.
    ///
    /// Running transfers are cancelled first; partial files are deleted.
    pub fn remove(&self, selector: &TaskSelector) -> usize {
        let removed: Vec<Task> = {
            let mut state = self.inner.lock_state();
            let selected = state.selected(selector);
            for handle in &selected {
                self.inner.dispatcher.request_cancel(handle);
            }
            let ids: HashSet<TaskId> = selected.iter().map(|h| lock_task(h).id.clone()).collect();
            state.tasks.retain(|handle| !ids.contains(&lock_task(handle).id));
            selected.iter().map(|h| lock_task(h).clone()).collect()
        };
        if removed.is_empty() {
            return 0;
        }
        info!(count = removed.len(), "removing tasks");
        self.discard_idle_temp_files(&removed);
        self.inner
            .persister
            .remove_by_ids(removed.iter().map(|t| t.id.clone()).collect());
        self.inner.notifier.changed();
        removed.len()
    }

    /// Cancels everything and empties the engine and the repository.
    pub fn clear(&self) -> usize {
        let removed: Vec<Task> = {
            let mut state = self.inner.lock_state();
            for handle in &state.tasks {
                self.inner.dispatcher.request_cancel(handle);
            }
            let drained: Vec<TaskHandle> = state.tasks.drain(..).collect();
            drained.iter().map(|h| lock_task(h).clone()).collect()
        };
        info!(count = removed.len(), "clearing all tasks");
        self.discard_idle_temp_files(&removed);
        self.inner.persister.remove_all();
        self.inner.notifier.changed();
        removed.len()
    }

    /// Changes the concurrency bound. Lowering it pauses surplus transfers.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] outside 1..=100.
    pub fn set_max_concurrent(&self, max_concurrent: usize) -> Result<(), EngineError> {
        validate_concurrency(max_concurrent)?;
        self.inner.lock_state().max_concurrent = max_concurrent;
        info!(max_concurrent, "concurrency bound changed");
        self.inner.notifier.reevaluate();
        Ok(())
    }

    // ==================== Observation ====================

    /// Current status of a task, or [`TaskStatus::Unknown`] if not managed.
    #[must_use]
    pub fn status(&self, id: &TaskId) -> TaskStatus {
        let state = self.inner.lock_state();
        state
            .find(id)
            .map_or(TaskStatus::Unknown, |handle| lock_task(handle).status.clone())
    }

    #[must_use]
    pub fn task(&self, id: &TaskId) -> Option<TaskView> {
        let state = self.inner.lock_state();
        state.find(id).map(|handle| lock_task(handle).view())
    }

    /// Snapshot of every task in list order.
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskView> {
        self.inner.views(&TaskSelector::All)
    }

    #[must_use]
    pub fn tasks_matching(&self, selector: &TaskSelector) -> Vec<TaskView> {
        self.inner.views(selector)
    }

    /// Live view of the selected tasks.
    #[must_use]
    pub fn watch(&self, selector: TaskSelector) -> TaskFeed {
        TaskFeed::new(
            Arc::downgrade(&self.inner),
            self.inner.notifier.subscribe(),
            self.inner.shutdown.clone(),
            selector,
        )
    }

    /// Raw change notifications.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.notifier.subscribe()
    }

    /// Transfers started and not yet returned.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.lock_state().in_flight
    }

    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.inner.lock_state().max_concurrent
    }

    // ==================== Lifecycle ====================

    /// Resolves once every write queued so far has reached the repository.
    pub async fn flush(&self) {
        self.inner.persister.flush().await;
    }

    /// Waits until no task is queued or transferring.
    pub async fn wait_idle(&self) {
        let mut events = self.inner.notifier.subscribe();
        while !self.inner.is_idle() {
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            }
        }
    }

    /// Stops scheduling, pauses running transfers so a later start can
    /// resume them, waits for them to return and flushes pending writes.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut events = self.inner.notifier.subscribe();
        {
            let state = self.inner.lock_state();
            for handle in &state.tasks {
                self.inner.dispatcher.request_pause(handle);
            }
        }
        while self.in_flight() != 0 {
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
        self.flush().await;
        info!("engine shut down");
    }

    /// Persists `tasks`, publishes the change, then fires `hook` for each
    /// one with no locks held.
    fn commit(&self, tasks: Vec<Task>, hook: impl Fn(&DownloadListener, &TaskView)) {
        if tasks.is_empty() {
            return;
        }
        let views: Vec<(DownloadListener, TaskView)> = tasks
            .iter()
            .map(|t| (t.listener().clone(), t.view()))
            .collect();
        self.inner.persister.batch_update(tasks);
        self.inner.notifier.changed();
        for (listener, view) in &views {
            hook(listener, view);
        }
    }

    /// Deletes partial files of removed tasks that had no live transfer;
    /// cancelled transfers clean up after themselves.
    fn discard_idle_temp_files(&self, removed: &[Task]) {
        discard_temp_files(partial_files(
            removed.iter().filter(|t| !t.status.is_processing()),
        ));
    }
}

/// Both names an activation may have written a task's bytes to.
fn partial_files<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Vec<PathBuf> {
    tasks
        .into_iter()
        .flat_map(|t| {
            [
                temp_path(&t.dir, &t.filename),
                fallback_temp_path(&t.dir, &t.filename),
            ]
        })
        .collect()
}

fn discard_temp_files(paths: Vec<PathBuf>) {
    if paths.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for path in paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "removed partial file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial file"),
            }
        }
    });
}

async fn admission_loop(
    engine: Weak<EngineInner>,
    mut events: broadcast::Receiver<EngineEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    let Some(inner) = engine.upgrade() else { break };
                    inner.rebalance();
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!("admission loop stopped");
}

async fn tick_loop(
    engine: Weak<EngineInner>,
    period: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let Some(inner) = engine.upgrade() else { break };
                inner.tick();
            }
        }
    }
    debug!("tick loop stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Notify;

    use crate::task::NewTask;
    use crate::test_support::stub_transport::{StubTransport, response};

    fn serving(body: &'static [u8]) -> Arc<StubTransport> {
        StubTransport::new(move |_| response(200, body))
    }

    /// Never answers.
    fn hanging() -> Arc<StubTransport> {
        StubTransport::gated(Arc::new(Notify::new()), |_| response(200, b""))
    }

    fn task(dir: &Path, name: &str) -> Task {
        NewTask::new(format!("https://example.com/{name}"), dir, name)
            .build()
            .unwrap()
    }

    async fn engine_with(
        transport: Arc<StubTransport>,
        max_concurrent: usize,
    ) -> (DownloadEngine, Arc<MemoryTaskRepository>) {
        let repository = Arc::new(MemoryTaskRepository::new());
        let config = EngineConfig::default()
            .with_max_concurrent(max_concurrent)
            .with_tick_interval(Duration::from_millis(50));
        let engine = DownloadEngine::start(config, repository.clone(), transport)
            .await
            .unwrap();
        (engine, repository)
    }

    async fn wait_for(engine: &DownloadEngine, mut done: impl FnMut(&DownloadEngine) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut events = engine.events();
            while !done(engine) {
                let _ = events.recv().await;
            }
        })
        .await
        .unwrap();
    }

    // ==================== Enqueue Tests ====================

    #[tokio::test]
    async fn test_enqueue_runs_task_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, repository) = engine_with(serving(b"hello"), 2).await;

        let id = engine.enqueue(task(dir.path(), "a.txt"), None).unwrap();
        tokio::time::timeout(Duration::from_secs(5), engine.wait_idle())
            .await
            .unwrap();
        engine.flush().await;

        assert_eq!(engine.status(&id), TaskStatus::Completed);
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"hello");
        let stored = repository.find(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(hanging(), 1).await;

        let id = engine.enqueue(task(dir.path(), "a.bin"), None).unwrap();
        let before = engine.task(&id).unwrap();
        let err = engine.enqueue(task(dir.path(), "a.bin"), None).unwrap_err();

        assert!(matches!(err, EngineError::DuplicateTask { id: dup } if dup == id));
        assert_eq!(engine.tasks().len(), 1);
        assert_eq!(engine.task(&id).unwrap().created_at, before.created_at);
    }

    #[tokio::test]
    async fn test_enqueue_batch_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(hanging(), 1).await;

        let err = engine
            .enqueue_batch(
                vec![task(dir.path(), "a.bin"), task(dir.path(), "a.bin")],
                None,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateTask { .. }));
        assert!(engine.tasks().is_empty());

        let ids = engine
            .enqueue_batch(
                vec![task(dir.path(), "a.bin"), task(dir.path(), "b.bin")],
                None,
            )
            .unwrap();
        assert_eq!(ids.len(), 2);
    }

    // ==================== Scheduling Tests ====================

    #[tokio::test]
    async fn test_bound_admits_only_one_task() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(hanging(), 1).await;

        let a = engine.enqueue(task(dir.path(), "a.bin"), None).unwrap();
        let b = engine.enqueue(task(dir.path(), "b.bin"), None).unwrap();
        wait_for(&engine, |e| e.status(&a) == TaskStatus::Running).await;

        assert!(engine.status(&b).is_waiting());
        assert_eq!(engine.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_raising_bound_admits_waiting_task() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(hanging(), 1).await;

        engine.enqueue(task(dir.path(), "a.bin"), None).unwrap();
        let b = engine.enqueue(task(dir.path(), "b.bin"), None).unwrap();
        wait_for(&engine, |e| e.in_flight() == 1).await;

        engine.set_max_concurrent(2).unwrap();
        wait_for(&engine, |e| e.status(&b) == TaskStatus::Running).await;
        assert_eq!(engine.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_lowering_bound_pauses_surplus() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(hanging(), 2).await;

        engine
            .enqueue_batch(vec![task(dir.path(), "a.bin"), task(dir.path(), "b.bin")], None)
            .unwrap();
        wait_for(&engine, |e| e.in_flight() == 2).await;

        engine.set_max_concurrent(1).unwrap();
        wait_for(&engine, |e| e.in_flight() == 1).await;

        let paused = engine
            .tasks()
            .into_iter()
            .filter(|t| matches!(t.status, TaskStatus::Paused(_)))
            .count();
        assert_eq!(paused, 1);
    }

    #[tokio::test]
    async fn test_set_max_concurrent_rejects_out_of_range() {
        let (engine, _) = engine_with(hanging(), 1).await;
        assert!(matches!(
            engine.set_max_concurrent(0),
            Err(EngineError::InvalidConcurrency { value: 0 })
        ));
        assert!(engine.set_max_concurrent(101).is_err());
        assert_eq!(engine.max_concurrent(), 1);
    }

    // ==================== Selector Operation Tests ====================

    #[tokio::test]
    async fn test_pause_and_resume_queued_task() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(hanging(), 1).await;
        let resumed = Arc::new(AtomicUsize::new(0));

        let a = engine.enqueue(task(dir.path(), "a.bin"), None).unwrap();
        let b = engine.enqueue(task(dir.path(), "b.bin"), None).unwrap();
        wait_for(&engine, |e| e.status(&a) == TaskStatus::Running).await;

        assert_eq!(engine.pause(&TaskSelector::id(b.clone())), 1);
        assert!(matches!(engine.status(&b), TaskStatus::Paused(_)));

        let counter = Arc::clone(&resumed);
        let listener = DownloadListener::new().on_resumed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(engine.resume(&TaskSelector::All, Some(listener)), 1);
        assert!(engine.status(&b).is_waiting());
        assert_eq!(resumed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_task_fails_it() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(hanging(), 1).await;

        let a = engine.enqueue(task(dir.path(), "a.bin"), None).unwrap();
        let b = engine.enqueue(task(dir.path(), "b.bin"), None).unwrap();
        wait_for(&engine, |e| e.status(&a) == TaskStatus::Running).await;

        assert_eq!(engine.cancel(&TaskSelector::id(b.clone())), 1);
        match engine.status(&b) {
            TaskStatus::Failed { reason, last } => {
                assert_eq!(reason, CANCELLED_REASON);
                assert!(last.is_waiting());
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_regenerates_failed_task() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(hanging(), 1).await;

        let a = engine.enqueue(task(dir.path(), "a.bin"), None).unwrap();
        let b = engine.enqueue(task(dir.path(), "b.bin"), None).unwrap();
        wait_for(&engine, |e| e.status(&a) == TaskStatus::Running).await;
        engine.cancel(&TaskSelector::id(b.clone()));

        assert_eq!(engine.retry(&TaskSelector::All, None), 1);
        assert!(engine.status(&b).is_waiting());
        assert_eq!(engine.task(&b).unwrap().downloaded_bytes, 0);
    }

    #[tokio::test]
    async fn test_retry_from_failure_hook_restarts_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let transport = StubTransport::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                response(404, b"missing")
            } else {
                response(200, b"second try")
            }
        });
        let (engine, _) = engine_with(Arc::clone(&transport), 2).await;
        let retrier = engine.clone();
        let listener = DownloadListener::new().on_failed(move |view, _| {
            retrier.retry(&TaskSelector::id(view.id.clone()), None);
        });

        let id = engine.enqueue(task(dir.path(), "a.bin"), Some(listener)).unwrap();
        wait_for(&engine, |e| e.status(&id) == TaskStatus::Completed).await;
        wait_for(&engine, |e| e.in_flight() == 0).await;

        assert_eq!(transport.requests().len(), 2);
        assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), b"second try");
    }

    async fn wait_until_gone(paths: &[PathBuf]) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while paths.iter().any(|p| p.exists()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_queued_task_deletes_both_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(hanging(), 1).await;

        let a = engine.enqueue(task(dir.path(), "a.bin"), None).unwrap();
        wait_for(&engine, |e| e.status(&a) == TaskStatus::Running).await;
        let partials = [
            temp_path(dir.path(), "b.bin"),
            fallback_temp_path(dir.path(), "b.bin"),
        ];
        for path in &partials {
            std::fs::write(path, b"partial").unwrap();
        }
        let b = engine.enqueue(task(dir.path(), "b.bin"), None).unwrap();

        assert_eq!(engine.cancel(&TaskSelector::id(b)), 1);
        wait_until_gone(&partials).await;
    }

    #[tokio::test]
    async fn test_remove_paused_task_deletes_fallback_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(hanging(), 1).await;

        let a = engine.enqueue(task(dir.path(), "a.bin"), None).unwrap();
        let b = engine.enqueue(task(dir.path(), "b.bin"), None).unwrap();
        wait_for(&engine, |e| e.status(&a) == TaskStatus::Running).await;
        assert_eq!(engine.pause(&TaskSelector::id(b.clone())), 1);
        let fallback = fallback_temp_path(dir.path(), "b.bin");
        std::fs::write(&fallback, b"partial").unwrap();

        assert_eq!(engine.remove(&TaskSelector::id(b)), 1);
        wait_until_gone(&[fallback]).await;
    }

    #[tokio::test]
    async fn test_remove_by_tag_deletes_from_repository() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, repository) = engine_with(hanging(), 1).await;

        let tagged = NewTask::new("https://example.com/t.bin", dir.path(), "t.bin")
            .tag("isos")
            .build()
            .unwrap();
        engine.enqueue(task(dir.path(), "a.bin"), None).unwrap();
        engine.enqueue(tagged, None).unwrap();
        engine.flush().await;

        assert_eq!(engine.remove(&TaskSelector::tag("isos")), 1);
        engine.flush().await;

        assert_eq!(engine.tasks().len(), 1);
        assert_eq!(repository.len().await, 1);
    }

    #[tokio::test]
    async fn test_clear_empties_engine_and_repository() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, repository) = engine_with(hanging(), 1).await;

        engine
            .enqueue_batch(vec![task(dir.path(), "a.bin"), task(dir.path(), "b.bin")], None)
            .unwrap();
        wait_for(&engine, |e| e.in_flight() == 1).await;

        assert_eq!(engine.clear(), 2);
        wait_for(&engine, |e| e.in_flight() == 0).await;
        engine.flush().await;

        assert!(engine.tasks().is_empty());
        assert!(repository.is_empty().await);
    }

    #[tokio::test]
    async fn test_status_of_unknown_task() {
        let (engine, _) = engine_with(hanging(), 1).await;
        assert_eq!(engine.status(&TaskId::from("missing")), TaskStatus::Unknown);
        assert!(engine.task(&TaskId::from("missing")).is_none());
    }

    // ==================== Lifecycle Tests ====================

    #[tokio::test]
    async fn test_start_demotes_stale_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(MemoryTaskRepository::new());
        let mut running = task(dir.path(), "a.bin");
        running.status = TaskStatus::Running;
        let mut queued = task(dir.path(), "b.bin");
        queued.status = TaskStatus::queued(TaskStatus::Initial);
        let mut done = task(dir.path(), "c.bin");
        done.status = TaskStatus::Completed;
        repository
            .batch_insert(&[running.clone(), queued.clone(), done.clone()])
            .await
            .unwrap();

        let transport = hanging();
        let engine = DownloadEngine::start(
            EngineConfig::default(),
            repository.clone(),
            transport.clone(),
        )
        .await
        .unwrap();

        assert_eq!(
            engine.status(&running.id),
            TaskStatus::paused(TaskStatus::Running)
        );
        assert_eq!(
            engine.status(&queued.id),
            TaskStatus::paused(TaskStatus::queued(TaskStatus::Initial))
        );
        assert_eq!(engine.status(&done.id), TaskStatus::Completed);
        let stored = repository.find(&running.id).await.unwrap().unwrap();
        assert_eq!(stored.status.encode(), "Paused:Running");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let result = DownloadEngine::start(
            EngineConfig::default().with_max_concurrent(0),
            Arc::new(MemoryTaskRepository::new()),
            hanging(),
        )
        .await;
        assert!(matches!(result, Err(EngineError::InvalidConcurrency { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_pauses_running_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, repository) = engine_with(hanging(), 1).await;

        let a = engine.enqueue(task(dir.path(), "a.bin"), None).unwrap();
        wait_for(&engine, |e| e.status(&a) == TaskStatus::Running).await;

        tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
            .await
            .unwrap();

        assert_eq!(engine.status(&a), TaskStatus::paused(TaskStatus::Running));
        let stored = repository.find(&a).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::paused(TaskStatus::Running));
    }

    #[tokio::test]
    async fn test_watch_yields_snapshot_then_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(hanging(), 1).await;
        let mut feed = engine.watch(TaskSelector::tag("isos"));

        assert_eq!(feed.next().await.unwrap().len(), 0);

        let tagged = NewTask::new("https://example.com/t.bin", dir.path(), "t.bin")
            .tag("isos")
            .build()
            .unwrap();
        engine.enqueue(tagged, None).unwrap();
        let snapshot = tokio::time::timeout(Duration::from_secs(5), feed.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.len(), 1);

        engine.shutdown().await;
        assert!(feed.next().await.is_none());
    }
}
