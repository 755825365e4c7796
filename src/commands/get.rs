//! Get, resume and retry: commands that start transfers and wait for them.

use std::collections::HashSet;

use anyhow::{Context, Result};
use resumable_dl::download::filename_from_url;
use resumable_dl::{DownloadEngine, NewTask, TaskId, TaskSelector, TaskStatus};
use tracing::{debug, info, warn};
use url::Url;

use super::selector_for;
use crate::app::runner::{RunSummary, follow};
use crate::cli::{GetArgs, TagFilter};

/// Enqueues each URL, or picks up the existing task for it, and waits.
pub async fn run_get_command(
    engine: &DownloadEngine,
    args: &GetArgs,
    show_progress: bool,
) -> Result<RunSummary> {
    tokio::fs::create_dir_all(&args.output_dir)
        .await
        .with_context(|| format!("cannot create {}", args.output_dir.display()))?;
    let output_dir = tokio::fs::canonicalize(&args.output_dir).await?;

    let mut ids = HashSet::new();
    let mut fresh = Vec::new();
    for raw in &args.urls {
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(error) => {
                warn!(url = %raw, %error, "Skipped invalid URL");
                continue;
            }
        };
        let mut request = NewTask::new(url.as_str(), &output_dir, filename_from_url(&url));
        if let Some(tag) = &args.tag {
            request = request.tag(tag.clone());
        }
        let task = match request.build() {
            Ok(task) => task,
            Err(error) => {
                warn!(url = %raw, %error, "Skipped invalid URL");
                continue;
            }
        };
        if !ids.insert(task.id.clone()) {
            continue;
        }

        let selector = TaskSelector::id(task.id.clone());
        match engine.status(&task.id) {
            TaskStatus::Unknown => fresh.push(task),
            TaskStatus::Paused(_) => {
                info!(task_id = %task.id, "Resuming earlier download");
                engine.resume(&selector, None);
            }
            TaskStatus::Failed { .. } => {
                info!(task_id = %task.id, "Restarting failed download");
                engine.retry(&selector, None);
            }
            TaskStatus::Completed => {
                info!(task_id = %task.id, file = %task.destination().display(), "Already downloaded");
            }
            status => debug!(task_id = %task.id, %status, "Task already active"),
        }
    }

    if ids.is_empty() {
        info!("No valid URLs found in input");
        return Ok(RunSummary::default());
    }
    engine.enqueue_batch(fresh, None)?;
    Ok(follow(engine, &ids, show_progress).await)
}

/// Resumes paused tasks and waits for them.
pub async fn run_resume_command(
    engine: &DownloadEngine,
    filter: &TagFilter,
    show_progress: bool,
) -> Result<RunSummary> {
    let selector = selector_for(filter.tag.as_deref());
    let ids = ids_where(engine, &selector, |status| {
        matches!(status, TaskStatus::Paused(_))
    });
    if ids.is_empty() {
        info!("Nothing to resume");
        return Ok(RunSummary::default());
    }
    let resumed = engine.resume(&selector, None);
    info!(count = resumed, "Resuming downloads");
    Ok(follow(engine, &ids, show_progress).await)
}

/// Restarts failed tasks from scratch and waits for them.
pub async fn run_retry_command(
    engine: &DownloadEngine,
    filter: &TagFilter,
    show_progress: bool,
) -> Result<RunSummary> {
    let selector = selector_for(filter.tag.as_deref());
    let ids = ids_where(engine, &selector, |status| {
        matches!(status, TaskStatus::Failed { .. })
    });
    if ids.is_empty() {
        info!("Nothing to retry");
        return Ok(RunSummary::default());
    }
    let retried = engine.retry(&selector, None);
    info!(count = retried, "Retrying downloads");
    Ok(follow(engine, &ids, show_progress).await)
}

fn ids_where(
    engine: &DownloadEngine,
    selector: &TaskSelector,
    keep: impl Fn(&TaskStatus) -> bool,
) -> HashSet<TaskId> {
    engine
        .tasks_matching(selector)
        .into_iter()
        .filter(|task| keep(&task.status))
        .map(|task| task.id)
        .collect()
}
