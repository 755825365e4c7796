//! SQLite-backed task repository.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};
use tracing::{debug, instrument};

use super::{RepositoryError, Result, TaskRepository, retention_cutoff};
use crate::db::Database;
use crate::status::TaskStatus;
use crate::task::{DownloadListener, RenamePolicy, Task, TaskId};

const SELECT_COLUMNS: &str = "task_id, title, url, etag, tag, headers, dir_path, filename, \
     rename_policy, total_bytes, downloaded_bytes, created_at, last_modified_at, speed, \
     eta_secs, related_entity_id, connect_timeout_ms, request_timeout_ms, status";

const UPSERT_SQL: &str = r"
    INSERT OR REPLACE INTO tasks (
        title, url, etag, tag, headers, dir_path, filename, rename_policy,
        total_bytes, downloaded_bytes, created_at, last_modified_at, speed, eta_secs,
        related_entity_id, connect_timeout_ms, request_timeout_ms, status, task_id
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
";

const UPDATE_SQL: &str = r"
    UPDATE tasks SET
        title = ?, url = ?, etag = ?, tag = ?, headers = ?, dir_path = ?, filename = ?,
        rename_policy = ?, total_bytes = ?, downloaded_bytes = ?, created_at = ?,
        last_modified_at = ?, speed = ?, eta_secs = ?, related_entity_id = ?,
        connect_timeout_ms = ?, request_timeout_ms = ?, status = ?
    WHERE task_id = ?
";

/// Binds a [`TaskRecord`] in column order, with `task_id` last.
macro_rules! bind_record {
    ($query:expr, $record:expr) => {{
        let record = $record;
        $query
            .bind(record.title)
            .bind(record.url)
            .bind(record.etag)
            .bind(record.tag)
            .bind(record.headers)
            .bind(record.dir_path)
            .bind(record.filename)
            .bind(record.rename_policy)
            .bind(record.total_bytes)
            .bind(record.downloaded_bytes)
            .bind(record.created_at)
            .bind(record.last_modified_at)
            .bind(record.speed)
            .bind(record.eta_secs)
            .bind(record.related_entity_id)
            .bind(record.connect_timeout_ms)
            .bind(record.request_timeout_ms)
            .bind(record.status)
            .bind(record.task_id)
    }};
}

/// Task storage in the `tasks` table of a [`Database`].
#[derive(Debug, Clone)]
pub struct SqliteTaskRepository {
    db: Database,
}

impl SqliteTaskRepository {
    /// Wraps an open database whose migrations have run.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self), fields(task_id = %id))]
    async fn find(&self, id: &TaskId) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks WHERE task_id = ?"
        ))
        .bind(id.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        row.map(Task::try_from).transpose()
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn insert(&self, task: &Task) -> Result<()> {
        let record = TaskRecord::from_task(task)?;
        bind_record!(sqlx::query(UPSERT_SQL), record)
            .execute(self.db.pool())
            .await?;
        debug!("task stored");
        Ok(())
    }

    #[instrument(skip(self, tasks), fields(count = tasks.len()))]
    async fn batch_insert(&self, tasks: &[Task]) -> Result<()> {
        let records = tasks
            .iter()
            .map(TaskRecord::from_task)
            .collect::<Result<Vec<_>>>()?;
        let mut tx = self.db.pool().begin().await?;
        for record in records {
            bind_record!(sqlx::query(UPSERT_SQL), record)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn update(&self, task: &Task) -> Result<()> {
        let record = TaskRecord::from_task(task)?;
        let result = bind_record!(sqlx::query(UPDATE_SQL), record)
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(task.id.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self, tasks), fields(count = tasks.len()))]
    async fn batch_update(&self, tasks: &[Task]) -> Result<()> {
        let records = tasks
            .iter()
            .map(TaskRecord::from_task)
            .collect::<Result<Vec<_>>>()?;
        let mut tx = self.db.pool().begin().await?;
        for record in records {
            bind_record!(sqlx::query(UPDATE_SQL), record)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn remove(&self, id: &TaskId) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE task_id = ?")
            .bind(id.as_str())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn remove_by_ids(&self, ids: &[TaskId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM tasks WHERE task_id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(")");
        let result = builder.build().execute(self.db.pool()).await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn remove_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tasks")
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn get_all(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks ORDER BY created_at ASC, rowid ASC"
        ))
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter().map(Task::try_from).collect()
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn update_progress(
        &self,
        id: &TaskId,
        downloaded_bytes: u64,
        last_modified_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tasks SET downloaded_bytes = ?, last_modified_at = ? WHERE task_id = ?",
        )
        .bind(to_db_int(downloaded_bytes))
        .bind(last_modified_at.timestamp_millis())
        .bind(id.as_str())
        .execute(self.db.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = retention_cutoff(days).timestamp_millis();
        let result = sqlx::query("DELETE FROM tasks WHERE last_modified_at < ?")
            .bind(cutoff)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

/// Owned column values of one task, ready to bind.
struct TaskRecord {
    task_id: String,
    title: String,
    url: String,
    etag: String,
    tag: Option<String>,
    headers: String,
    dir_path: String,
    filename: String,
    rename_policy: &'static str,
    total_bytes: i64,
    downloaded_bytes: i64,
    created_at: i64,
    last_modified_at: i64,
    speed: i64,
    eta_secs: i64,
    related_entity_id: Option<String>,
    connect_timeout_ms: Option<i64>,
    request_timeout_ms: Option<i64>,
    status: String,
}

impl TaskRecord {
    fn from_task(task: &Task) -> Result<Self> {
        let headers = serde_json::to_string(&task.headers)
            .map_err(|e| RepositoryError::corrupt(task.id.as_str(), format!("headers: {e}")))?;
        Ok(Self {
            task_id: task.id.to_string(),
            title: task.title.clone(),
            url: task.url.clone(),
            etag: task.etag.clone(),
            tag: task.tag.clone(),
            headers,
            dir_path: task.dir.to_string_lossy().into_owned(),
            filename: task.filename.clone(),
            rename_policy: task.rename_policy.as_str(),
            total_bytes: to_db_int(task.total_bytes),
            downloaded_bytes: to_db_int(task.downloaded_bytes),
            created_at: task.created_at.timestamp_millis(),
            last_modified_at: task.last_modified_at.timestamp_millis(),
            speed: to_db_int(task.speed),
            eta_secs: to_db_int(task.eta_secs),
            related_entity_id: task.related_entity_id.clone(),
            connect_timeout_ms: task.connect_timeout.map(duration_to_ms),
            request_timeout_ms: task.request_timeout.map(duration_to_ms),
            status: task.status.encode(),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    title: String,
    url: String,
    etag: String,
    tag: Option<String>,
    headers: String,
    dir_path: String,
    filename: String,
    rename_policy: String,
    total_bytes: i64,
    downloaded_bytes: i64,
    created_at: i64,
    last_modified_at: i64,
    speed: i64,
    eta_secs: i64,
    related_entity_id: Option<String>,
    connect_timeout_ms: Option<i64>,
    request_timeout_ms: Option<i64>,
    status: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = RepositoryError;

    fn try_from(row: TaskRow) -> Result<Self> {
        let headers: BTreeMap<String, String> = serde_json::from_str(&row.headers)
            .map_err(|e| RepositoryError::corrupt(&row.task_id, format!("headers: {e}")))?;
        let rename_policy: RenamePolicy = row
            .rename_policy
            .parse()
            .map_err(|e: String| RepositoryError::corrupt(&row.task_id, e))?;
        let created_at = from_epoch_ms(&row.task_id, row.created_at)?;
        let last_modified_at = from_epoch_ms(&row.task_id, row.last_modified_at)?;

        Ok(Self {
            id: TaskId::from(row.task_id),
            title: row.title,
            url: row.url,
            etag: row.etag,
            tag: row.tag,
            headers,
            dir: PathBuf::from(row.dir_path),
            filename: row.filename,
            rename_policy,
            total_bytes: from_db_int(row.total_bytes),
            downloaded_bytes: from_db_int(row.downloaded_bytes),
            created_at,
            last_modified_at,
            speed: from_db_int(row.speed),
            eta_secs: from_db_int(row.eta_secs),
            related_entity_id: row.related_entity_id,
            connect_timeout: row.connect_timeout_ms.map(ms_to_duration),
            request_timeout: row.request_timeout_ms.map(ms_to_duration),
            status: TaskStatus::decode(&row.status),
            listener: DownloadListener::default(),
        })
    }
}

fn to_db_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn duration_to_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn ms_to_duration(ms: i64) -> Duration {
    Duration::from_millis(from_db_int(ms))
}

fn from_epoch_ms(task_id: &str, ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| RepositoryError::corrupt(task_id, format!("timestamp out of range: {ms}")))
}
