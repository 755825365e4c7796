//! Per-task lifecycle hooks.
//!
//! Hooks receive a [`TaskView`] snapshot, never the live record, so they can
//! run arbitrary code without holding the task lock.

use std::fmt;
use std::sync::Arc;

use super::TaskView;
use crate::download::DownloadError;

type TaskHook = Arc<dyn Fn(&TaskView) + Send + Sync>;
type ProgressHook = Arc<dyn Fn(&TaskView, f32) + Send + Sync>;
type FailureHook = Arc<dyn Fn(&TaskView, &DownloadError) + Send + Sync>;

/// Set of optional callbacks fired as a task moves through its lifecycle.
///
/// A transfer captures a clone of the listener when it starts; replacing a
/// task's listener affects the next activation only.
///
/// # Example
///
/// ```
/// use resumable_dl::task::DownloadListener;
///
/// let listener = DownloadListener::new()
///     .on_progress(|task, percent| println!("{}: {percent:.1}%", task.title))
///     .on_completed(|task| println!("{} done", task.title));
/// assert!(listener.has_hooks());
/// ```
#[derive(Clone, Default)]
pub struct DownloadListener {
    on_start: Option<TaskHook>,
    on_progress: Option<ProgressHook>,
    on_completed: Option<TaskHook>,
    on_paused: Option<TaskHook>,
    on_resumed: Option<TaskHook>,
    on_failed: Option<FailureHook>,
    on_cancelled: Option<TaskHook>,
}

impl DownloadListener {
    /// Creates a listener with no hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_start(mut self, hook: impl Fn(&TaskView) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(hook));
        self
    }

    /// Fired at each persisted checkpoint with the percent complete.
    #[must_use]
    pub fn on_progress(mut self, hook: impl Fn(&TaskView, f32) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(hook));
        self
    }

    /// Fired while the task is `PostProcessing`, after the file is in place.
    #[must_use]
    pub fn on_completed(mut self, hook: impl Fn(&TaskView) + Send + Sync + 'static) -> Self {
        self.on_completed = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_paused(mut self, hook: impl Fn(&TaskView) + Send + Sync + 'static) -> Self {
        self.on_paused = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_resumed(mut self, hook: impl Fn(&TaskView) + Send + Sync + 'static) -> Self {
        self.on_resumed = Some(Arc::new(hook));
        self
    }

    /// Fired on transport, protocol or file-system failure with the cause.
    #[must_use]
    pub fn on_failed(
        mut self,
        hook: impl Fn(&TaskView, &DownloadError) + Send + Sync + 'static,
    ) -> Self {
        self.on_failed = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_cancelled(mut self, hook: impl Fn(&TaskView) + Send + Sync + 'static) -> Self {
        self.on_cancelled = Some(Arc::new(hook));
        self
    }

    /// Returns true if at least one hook is set.
    #[must_use]
    pub fn has_hooks(&self) -> bool {
        self.on_start.is_some()
            || self.on_progress.is_some()
            || self.on_completed.is_some()
            || self.on_paused.is_some()
            || self.on_resumed.is_some()
            || self.on_failed.is_some()
            || self.on_cancelled.is_some()
    }

    pub(crate) fn started(&self, task: &TaskView) {
        if let Some(hook) = &self.on_start {
            hook(task);
        }
    }

    pub(crate) fn progressed(&self, task: &TaskView, percent: f32) {
        if let Some(hook) = &self.on_progress {
            hook(task, percent);
        }
    }

    pub(crate) fn completed(&self, task: &TaskView) {
        if let Some(hook) = &self.on_completed {
            hook(task);
        }
    }

    pub(crate) fn paused(&self, task: &TaskView) {
        if let Some(hook) = &self.on_paused {
            hook(task);
        }
    }

    pub(crate) fn resumed(&self, task: &TaskView) {
        if let Some(hook) = &self.on_resumed {
            hook(task);
        }
    }

    pub(crate) fn failed(&self, task: &TaskView, error: &DownloadError) {
        if let Some(hook) = &self.on_failed {
            hook(task, error);
        }
    }

    pub(crate) fn cancelled(&self, task: &TaskView) {
        if let Some(hook) = &self.on_cancelled {
            hook(task);
        }
    }
}

impl fmt::Debug for DownloadListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadListener")
            .field("on_start", &self.on_start.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .field("on_completed", &self.on_completed.is_some())
            .field("on_paused", &self.on_paused.is_some())
            .field("on_resumed", &self.on_resumed.is_some())
            .field("on_failed", &self.on_failed.is_some())
            .field("on_cancelled", &self.on_cancelled.is_some())
            .finish()
    }
}
