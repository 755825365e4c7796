//! Broadcast of task-list changes and scheduler wake-ups.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

/// Events published by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// Some task changed; `version` increases with every change.
    TasksChanged { version: u64 },
    /// The scheduler should re-check admission.
    Reevaluate,
}

/// Cloneable publisher of [`EngineEvent`]s.
///
/// Sending never blocks; with no subscribers events are dropped.
#[derive(Debug, Clone)]
pub(crate) struct ChangeNotifier {
    version: Arc<AtomicU64>,
    sender: broadcast::Sender<EngineEvent>,
}

impl ChangeNotifier {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            version: Arc::new(AtomicU64::new(0)),
            sender,
        }
    }

    /// Publishes a task-list change.
    pub(crate) fn changed(&self) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.sender.send(EngineEvent::TasksChanged { version });
    }

    /// Asks the scheduler to run another admission step.
    pub(crate) fn reevaluate(&self) {
        let _ = self.sender.send(EngineEvent::Reevaluate);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_versions_increase() {
        let notifier = ChangeNotifier::new(16);
        let mut rx = notifier.subscribe();

        notifier.changed();
        notifier.reevaluate();
        notifier.changed();

        assert_eq!(rx.recv().await.unwrap(), EngineEvent::TasksChanged { version: 1 });
        assert_eq!(rx.recv().await.unwrap(), EngineEvent::Reevaluate);
        assert_eq!(rx.recv().await.unwrap(), EngineEvent::TasksChanged { version: 2 });
        assert_eq!(notifier.version(), 2);
    }

    #[test]
    fn test_send_without_subscribers_is_ignored() {
        let notifier = ChangeNotifier::new(4);
        notifier.changed();
        notifier.reevaluate();
        assert_eq!(notifier.version(), 1);
    }
}
