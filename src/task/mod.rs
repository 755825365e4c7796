//! Download task records.
//!
//! A [`Task`] is the mutable record of one download: where it comes from,
//! where it goes, how far it got and what state it is in. Tasks are created
//! through [`NewTask`], which validates the request and derives a stable
//! [`TaskId`] from the source URL and destination, so the same request always
//! maps to the same task.
//!
//! # Example
//!
//! ```
//! use resumable_dl::task::NewTask;
//!
//! let task = NewTask::new("https://example.com/big.iso", "/tmp/downloads", "big.iso")
//!     .tag("isos")
//!     .header("Authorization", "Bearer token")
//!     .build()
//!     .unwrap();
//! assert_eq!(task.title, "big.iso");
//! assert_eq!(task.id.as_str().len(), 32);
//! ```

mod error;
pub mod listener;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

pub use error::TaskError;
pub use listener::DownloadListener;

use crate::status::TaskStatus;

/// Shared, lockable task record. Locks are held only for field access, never across I/O.
pub type TaskHandle = Arc<Mutex<Task>>;

/// Locks a task handle, recovering the guard if a hook panicked while holding it.
pub(crate) fn lock_task(handle: &TaskHandle) -> MutexGuard<'_, Task> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Content-derived task identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Derives the id from source URL, destination directory and filename.
    ///
    /// The id is the first 16 bytes of a SHA-256 digest, hex encoded.
    #[must_use]
    pub fn derive(url: &str, dir: &Path, filename: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update(b"/");
        hasher.update(dir.to_string_lossy().as_bytes());
        hasher.update(b"/");
        hasher.update(filename.as_bytes());
        let digest = hasher.finalize();
        let hex = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
        Self(hex)
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// What to do when the destination file already exists at finalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenamePolicy {
    /// Replace the existing file.
    #[default]
    Overwrite,
    /// Keep the existing file and write `name_2.ext`, `name_3.ext`, ...
    AppendIndex,
}

impl RenamePolicy {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::AppendIndex => "append_index",
        }
    }
}

impl fmt::Display for RenamePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenamePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "overwrite" | "DEFAULT" => Ok(Self::Overwrite),
            "append_index" | "APPEND_INDEX" => Ok(Self::AppendIndex),
            _ => Err(format!("invalid rename policy: {s}")),
        }
    }
}

/// One download and its progress.
#[derive(Debug, Clone)]
pub struct Task {
    /// Stable content-derived identifier.
    pub id: TaskId,
    /// Display title (defaults to the filename).
    pub title: String,
    /// Source URL.
    pub url: String,
    /// Validator (`ETag`) from the last response; empty until known.
    pub(crate) etag: String,
    /// Optional grouping tag used by bulk operations.
    pub tag: Option<String>,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
    /// Destination directory.
    pub dir: PathBuf,
    /// Destination filename.
    pub filename: String,
    /// Collision handling for the final file.
    pub rename_policy: RenamePolicy,
    /// Total size in bytes; 0 while unknown.
    pub total_bytes: u64,
    /// Bytes written to the temporary file so far.
    pub downloaded_bytes: u64,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task record last changed.
    pub last_modified_at: DateTime<Utc>,
    /// Most recent throughput sample in bytes per second.
    pub speed: u64,
    /// Estimated seconds remaining.
    pub eta_secs: u64,
    /// Link to an external entity owned by the caller.
    pub related_entity_id: Option<String>,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) request_timeout: Option<Duration>,
    /// Lifecycle status.
    pub status: TaskStatus,
    pub(crate) listener: DownloadListener,
}

impl Task {
    /// Final path of the downloaded file.
    #[must_use]
    pub fn destination(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }

    /// Stored validator token (`ETag`), empty until the first response.
    #[must_use]
    pub fn validator(&self) -> &str {
        &self.etag
    }

    /// Percent complete, 0 when the total size is unknown.
    #[must_use]
    pub fn progress_percent(&self) -> f32 {
        percent(self.downloaded_bytes, self.total_bytes)
    }

    /// Zeroes speed, downloaded bytes and ETA.
    pub fn reset_progress(&mut self) {
        self.speed = 0;
        self.downloaded_bytes = 0;
        self.eta_secs = 0;
    }

    /// Marks the record as modified now.
    pub fn touch(&mut self) {
        self.last_modified_at = Utc::now();
    }

    /// Replaces the listener used by the next activation.
    pub fn set_listener(&mut self, listener: DownloadListener) {
        self.listener = listener;
    }

    /// Listener for the next activation.
    #[must_use]
    pub fn listener(&self) -> &DownloadListener {
        &self.listener
    }

    /// Per-task timeout overrides `(connect, request)`.
    #[must_use]
    pub fn timeouts(&self) -> (Option<Duration>, Option<Duration>) {
        (self.connect_timeout, self.request_timeout)
    }

    /// Resets the task into a fresh queued download, keeping its identity.
    pub(crate) fn regenerate(&mut self, listener: Option<DownloadListener>) {
        let now = Utc::now();
        self.reset_progress();
        self.total_bytes = 0;
        self.etag.clear();
        self.created_at = now;
        self.last_modified_at = now;
        self.status = TaskStatus::queued(std::mem::take(&mut self.status));
        if let Some(listener) = listener {
            self.listener = listener;
        }
    }

    /// Read-only projection for observers.
    #[must_use]
    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            title: self.title.clone(),
            url: self.url.clone(),
            tag: self.tag.clone(),
            headers: self.headers.clone(),
            dir: self.dir.clone(),
            filename: self.filename.clone(),
            rename_policy: self.rename_policy,
            total_bytes: self.total_bytes,
            downloaded_bytes: self.downloaded_bytes,
            created_at: self.created_at,
            last_modified_at: self.last_modified_at,
            speed: self.speed,
            eta_secs: self.eta_secs,
            related_entity_id: self.related_entity_id.clone(),
            status: self.status.clone(),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task {{ id: {}, url: {}, status: {} }}",
            self.id, self.url, self.status
        )
    }
}

/// Observer-facing snapshot of a task, without validator, timeouts or hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub title: String,
    pub url: String,
    pub tag: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub dir: PathBuf,
    pub filename: String,
    pub rename_policy: RenamePolicy,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub speed: u64,
    pub eta_secs: u64,
    pub related_entity_id: Option<String>,
    pub status: TaskStatus,
}

impl TaskView {
    /// Percent complete, 0 when the total size is unknown.
    #[must_use]
    pub fn progress_percent(&self) -> f32 {
        percent(self.downloaded_bytes, self.total_bytes)
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(downloaded: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (downloaded as f32 * 100.0) / total as f32
}

/// Request for a new task; validated by [`NewTask::build`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub url: String,
    pub dir: PathBuf,
    pub filename: String,
    pub title: Option<String>,
    pub tag: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Sent as `User-Agent` unless `headers` already has one.
    pub user_agent: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub related_entity_id: Option<String>,
    pub rename_policy: RenamePolicy,
    pub listener: DownloadListener,
}

impl NewTask {
    /// Starts a request with every optional field unset.
    #[must_use]
    pub fn new(url: impl Into<String>, dir: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dir: dir.into(),
            filename: filename.into(),
            title: None,
            tag: None,
            headers: BTreeMap::new(),
            user_agent: None,
            connect_timeout: None,
            request_timeout: None,
            related_entity_id: None,
            rename_policy: RenamePolicy::default(),
            listener: DownloadListener::default(),
        }
    }

    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn related_entity_id(mut self, id: impl Into<String>) -> Self {
        self.related_entity_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn rename_policy(mut self, policy: RenamePolicy) -> Self {
        self.rename_policy = policy;
        self
    }

    #[must_use]
    pub fn listener(mut self, listener: DownloadListener) -> Self {
        self.listener = listener;
        self
    }

    /// Validates the request and builds an `Initial` task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] for an empty or non-HTTP URL, or an empty or
    /// path-like filename.
    pub fn build(self) -> Result<Task, TaskError> {
        let url = self.url.trim().to_string();
        if url.is_empty() {
            return Err(TaskError::EmptyUrl);
        }
        let parsed = Url::parse(&url).map_err(|source| TaskError::InvalidUrl {
            url: url.clone(),
            reason: source.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TaskError::InvalidUrl {
                url,
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        validate_filename(&self.filename)?;

        let mut headers = self.headers;
        if let Some(user_agent) = self.user_agent.filter(|ua| !ua.is_empty()) {
            let has_user_agent = headers
                .keys()
                .any(|name| name.eq_ignore_ascii_case("user-agent"));
            if !has_user_agent {
                headers.insert("User-Agent".to_string(), user_agent);
            }
        }

        let now = Utc::now();
        Ok(Task {
            id: TaskId::derive(&url, &self.dir, &self.filename),
            title: self
                .title
                .filter(|title| !title.is_empty())
                .unwrap_or_else(|| self.filename.clone()),
            url,
            etag: String::new(),
            tag: self.tag,
            headers,
            dir: self.dir,
            filename: self.filename,
            rename_policy: self.rename_policy,
            total_bytes: 0,
            downloaded_bytes: 0,
            created_at: now,
            last_modified_at: now,
            speed: 0,
            eta_secs: 0,
            related_entity_id: self.related_entity_id,
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            status: TaskStatus::Initial,
            listener: self.listener,
        })
    }
}

fn validate_filename(filename: &str) -> Result<(), TaskError> {
    if filename.trim().is_empty() {
        return Err(TaskError::EmptyFilename);
    }
    let mut components = Path::new(filename).components();
    let single_normal = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    if !single_normal || filename.contains(['/', '\\']) {
        return Err(TaskError::InvalidFilename {
            filename: filename.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request() -> NewTask {
        NewTask::new("https://example.com/file.bin", "/tmp/dl", "file.bin")
    }

    // ==================== Identity Tests ====================

    #[test]
    fn test_task_id_is_deterministic() {
        let a = request().build().unwrap();
        let b = request().tag("other").build().unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.as_str().len(), 32);
        assert!(a.id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_task_id_differs_per_destination() {
        let a = request().build().unwrap();
        let b = NewTask::new("https://example.com/file.bin", "/tmp/dl", "copy.bin")
            .build()
            .unwrap();
        let c = NewTask::new("https://example.com/file.bin", "/tmp/other", "file.bin")
            .build()
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_build_rejects_empty_url() {
        let result = NewTask::new("  ", "/tmp", "a.bin").build();
        assert!(matches!(result, Err(TaskError::EmptyUrl)));
    }

    #[test]
    fn test_build_rejects_unparseable_and_non_http_urls() {
        assert!(matches!(
            NewTask::new("not a url", "/tmp", "a.bin").build(),
            Err(TaskError::InvalidUrl { .. })
        ));
        assert!(matches!(
            NewTask::new("ftp://example.com/a.bin", "/tmp", "a.bin").build(),
            Err(TaskError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_build_rejects_bad_filenames() {
        for name in ["", "   ", "..", ".", "a/b.bin", "..\\evil"] {
            let result = NewTask::new("https://example.com/x", "/tmp", name).build();
            assert!(result.is_err(), "filename {name:?} should be rejected");
        }
    }

    #[test]
    fn test_build_defaults() {
        let task = request().build().unwrap();
        assert_eq!(task.title, "file.bin");
        assert_eq!(task.status, TaskStatus::Initial);
        assert_eq!(task.total_bytes, 0);
        assert_eq!(task.downloaded_bytes, 0);
        assert!(task.validator().is_empty());
        assert_eq!(task.rename_policy, RenamePolicy::Overwrite);
        assert_eq!(task.destination(), PathBuf::from("/tmp/dl/file.bin"));
    }

    #[test]
    fn test_user_agent_added_only_when_absent() {
        let task = request().user_agent("agent/1").build().unwrap();
        assert_eq!(task.headers.get("User-Agent").map(String::as_str), Some("agent/1"));

        let task = request()
            .header("user-agent", "custom")
            .user_agent("agent/1")
            .build()
            .unwrap();
        assert_eq!(task.headers.len(), 1);
        assert_eq!(task.headers.get("user-agent").map(String::as_str), Some("custom"));
    }

    // ==================== Progress Tests ====================

    #[test]
    fn test_progress_percent_and_reset() {
        let mut task = request().build().unwrap();
        assert!(task.progress_percent().abs() < f32::EPSILON);
        task.total_bytes = 200;
        task.downloaded_bytes = 50;
        task.speed = 10;
        task.eta_secs = 15;
        assert!((task.progress_percent() - 25.0).abs() < f32::EPSILON);

        task.reset_progress();
        assert_eq!(task.downloaded_bytes, 0);
        assert_eq!(task.speed, 0);
        assert_eq!(task.eta_secs, 0);
        assert_eq!(task.total_bytes, 200);
    }

    #[test]
    fn test_regenerate_produces_fresh_queued_task() {
        let mut task = request().build().unwrap();
        task.etag = "\"v1\"".to_string();
        task.total_bytes = 100;
        task.downloaded_bytes = 40;
        task.status = TaskStatus::failed("boom", TaskStatus::Running);
        let id = task.id.clone();

        task.regenerate(None);

        assert_eq!(task.id, id);
        assert_eq!(task.downloaded_bytes, 0);
        assert_eq!(task.total_bytes, 0);
        assert!(task.validator().is_empty());
        assert_eq!(
            task.status,
            TaskStatus::queued(TaskStatus::failed("boom", TaskStatus::Running))
        );
    }

    #[test]
    fn test_view_excludes_private_fields() {
        let mut task = request().tag("t").build().unwrap();
        task.etag = "secret".to_string();
        let view = task.view();
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("secret"));
        assert_eq!(view.tag.as_deref(), Some("t"));
        assert_eq!(view.status, TaskStatus::Initial);
    }

    #[test]
    fn test_rename_policy_parses_legacy_names() {
        assert_eq!("DEFAULT".parse::<RenamePolicy>().unwrap(), RenamePolicy::Overwrite);
        assert_eq!(
            "append_index".parse::<RenamePolicy>().unwrap(),
            RenamePolicy::AppendIndex
        );
        assert!("other".parse::<RenamePolicy>().is_err());
    }
}
