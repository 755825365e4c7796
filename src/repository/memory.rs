//! In-memory task repository for tests and ephemeral runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{RepositoryError, Result, TaskRepository, retention_cutoff};
use crate::task::{DownloadListener, Task, TaskId};

/// Volatile task storage. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryTaskRepository {
    tasks: RwLock<BTreeMap<TaskId, Task>>,
}

impl MemoryTaskRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

/// Stored copies carry no hooks, like rows read back from a database.
fn detached(task: &Task) -> Task {
    let mut copy = task.clone();
    copy.listener = DownloadListener::default();
    copy
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn find(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn insert(&self, task: &Task) -> Result<()> {
        self.tasks
            .write()
            .await
            .insert(task.id.clone(), detached(task));
        Ok(())
    }

    async fn batch_insert(&self, tasks: &[Task]) -> Result<()> {
        let mut stored = self.tasks.write().await;
        for task in tasks {
            stored.insert(task.id.clone(), detached(task));
        }
        Ok(())
    }

    async fn update(&self, task: &Task) -> Result<()> {
        match self.tasks.write().await.get_mut(&task.id) {
            Some(slot) => {
                *slot = detached(task);
                Ok(())
            }
            None => Err(RepositoryError::NotFound(task.id.clone())),
        }
    }

    async fn batch_update(&self, tasks: &[Task]) -> Result<()> {
        let mut stored = self.tasks.write().await;
        for task in tasks {
            if let Some(slot) = stored.get_mut(&task.id) {
                *slot = detached(task);
            }
        }
        Ok(())
    }

    async fn remove(&self, id: &TaskId) -> Result<()> {
        self.tasks.write().await.remove(id);
        Ok(())
    }

    async fn remove_by_ids(&self, ids: &[TaskId]) -> Result<u64> {
        let mut stored = self.tasks.write().await;
        let removed = ids.iter().filter(|id| stored.remove(*id).is_some()).count();
        Ok(removed as u64)
    }

    async fn remove_all(&self) -> Result<u64> {
        let mut stored = self.tasks.write().await;
        let removed = stored.len() as u64;
        stored.clear();
        Ok(removed)
    }

    async fn get_all(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    async fn update_progress(
        &self,
        id: &TaskId,
        downloaded_bytes: u64,
        last_modified_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut stored = self.tasks.write().await;
        let task = stored
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))?;
        task.downloaded_bytes = downloaded_bytes;
        task.last_modified_at = last_modified_at;
        Ok(())
    }

    async fn remove_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = retention_cutoff(days);
        let mut stored = self.tasks.write().await;
        let before = stored.len();
        stored.retain(|_, task| task.last_modified_at >= cutoff);
        Ok((before - stored.len()) as u64)
    }
}
