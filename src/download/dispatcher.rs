//! Starts transfer executors and routes pause/cancel requests to them.
//!
//! The dispatcher keeps two registries keyed by task id:
//!
//! - `in_flight`: the current activation of each running task
//! - `draining`: activations that were asked to stop but have not returned
//!
//! A new activation of a task whose previous activation has not returned
//! (stopped, or still registered while it finishes) waits for the old one
//! to finish, so two executors never write the same temp file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use super::executor::{TransferDefaults, TransferExecutor};
use super::signal::{StopReason, StopSignal};
use super::transport::HttpTransport;
use crate::engine::notifier::ChangeNotifier;
use crate::engine::persister::Persister;
use crate::status::TaskStatus;
use crate::task::{TaskHandle, TaskId, lock_task};

#[derive(Debug, Clone)]
struct Activation {
    generation: u64,
    signal: StopSignal,
    finished: CancellationToken,
}

#[derive(Debug, Default)]
struct Registry {
    in_flight: HashMap<TaskId, Activation>,
    draining: HashMap<TaskId, Activation>,
}

impl Registry {
    /// Forgets `generation` of `id` in both maps, leaving newer activations alone.
    fn release(&mut self, id: &TaskId, generation: u64) {
        if self
            .in_flight
            .get(id)
            .is_some_and(|a| a.generation == generation)
        {
            self.in_flight.remove(id);
        }
        if self
            .draining
            .get(id)
            .is_some_and(|a| a.generation == generation)
        {
            self.draining.remove(id);
        }
    }
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock_registry(registry: &SharedRegistry) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct Dispatcher {
    transport: Arc<dyn HttpTransport>,
    persister: Persister,
    notifier: ChangeNotifier,
    defaults: TransferDefaults,
    registry: SharedRegistry,
    generation: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn new(
        transport: Arc<dyn HttpTransport>,
        persister: Persister,
        notifier: ChangeNotifier,
        defaults: TransferDefaults,
    ) -> Self {
        Self {
            transport,
            persister,
            notifier,
            defaults,
            registry: SharedRegistry::default(),
            generation: AtomicU64::new(0),
        }
    }

    /// Spawns an executor for `task`; `on_complete` runs once it has returned.
    ///
    /// `on_complete` always runs on a spawned task, never inline, so callers
    /// may hold their own locks while calling `start`.
    pub(crate) fn start<F>(&self, task: TaskHandle, on_complete: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let id = lock_task(&task).id.clone();
        let activation = Activation {
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            signal: StopSignal::new(),
            finished: CancellationToken::new(),
        };

        let predecessor = {
            let mut registry = lock_registry(&self.registry);
            // Still registered: its executor is finishing (a retry from a
            // failure hook lands here) or it was started twice.
            if let Some(current) = registry.in_flight.remove(&id) {
                debug!(
                    task_id = %id,
                    generation = current.generation,
                    "previous activation still registered, queueing behind it"
                );
                registry.draining.insert(id.clone(), current);
            }
            registry.in_flight.insert(id.clone(), activation.clone());
            registry.draining.get(&id).map(|a| a.finished.clone())
        };

        let executor = TransferExecutor::new(
            Arc::clone(&task),
            Arc::clone(&self.transport),
            self.persister.clone(),
            self.notifier.clone(),
            self.defaults,
            activation.signal.clone(),
        );
        let registry = Arc::clone(&self.registry);
        let persister = self.persister.clone();
        let notifier = self.notifier.clone();
        let span = info_span!("activation", task_id = %id, generation = activation.generation);

        tokio::spawn(
            async move {
                if let Some(previous) = predecessor {
                    debug!("waiting for previous activation to drain");
                    previous.cancelled().await;
                }
                match tokio::spawn(executor.run().in_current_span()).await {
                    Ok(outcome) => debug!(?outcome, "activation finished"),
                    Err(join_error) => {
                        handle_executor_join_error(&task, &persister, &notifier, &join_error);
                    }
                }
                activation.finished.cancel();
                lock_registry(&registry).release(&id, activation.generation);
                on_complete();
            }
            .instrument(span),
        );
    }

    /// Asks a running activation to pause. Returns false if none is running.
    pub(crate) fn request_pause(&self, task: &TaskHandle) -> bool {
        let (id, status) = {
            let t = lock_task(task);
            (t.id.clone(), t.status.clone())
        };
        if !status.is_processing() {
            return false;
        }
        self.stop(&id, StopReason::Pause { prior: status })
    }

    /// Asks a running activation to cancel. Returns false if none is running.
    pub(crate) fn request_cancel(&self, task: &TaskHandle) -> bool {
        let id = {
            let t = lock_task(task);
            if !t.status.is_processing() {
                return false;
            }
            t.id.clone()
        };
        self.stop(&id, StopReason::Cancel)
    }

    pub(crate) fn is_in_flight(&self, id: &TaskId) -> bool {
        lock_registry(&self.registry).in_flight.contains_key(id)
    }

    /// Activations that were started and not yet asked to stop.
    pub(crate) fn in_flight_count(&self) -> usize {
        lock_registry(&self.registry).in_flight.len()
    }

    fn stop(&self, id: &TaskId, reason: StopReason) -> bool {
        let mut registry = lock_registry(&self.registry);
        let Some(activation) = registry.in_flight.remove(id) else {
            return false;
        };
        debug!(task_id = %id, ?reason, "stopping transfer");
        activation.signal.stop(reason);
        registry.draining.insert(id.clone(), activation);
        true
    }
}

/// Records a panicked executor as a failed task.
fn handle_executor_join_error(
    task: &TaskHandle,
    persister: &Persister,
    notifier: &ChangeNotifier,
    join_error: &JoinError,
) {
    let reason = if join_error.is_panic() {
        "task panicked"
    } else {
        "task aborted"
    };
    warn!(error = %join_error, reason, "transfer executor did not return");
    let snapshot = {
        let mut t = lock_task(task);
        let current = std::mem::take(&mut t.status);
        t.status = TaskStatus::failed(format!("{reason}: {join_error}"), current);
        t.speed = 0;
        t.eta_secs = 0;
        t.touch();
        t.clone()
    };
    persister.update(snapshot);
    notifier.changed();
}
