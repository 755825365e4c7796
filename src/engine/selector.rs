//! Task selection for bulk operations and live views.

use std::fmt;
use std::sync::Arc;

use crate::task::{Task, TaskId};

type TagPredicate = Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>;

/// Which tasks an operation applies to.
#[derive(Clone)]
pub enum TaskSelector {
    /// The task with this id.
    Id(TaskId),
    /// Tasks whose tag equals this one.
    Tag(String),
    /// Tasks whose tag (possibly absent) satisfies the predicate.
    TagMatches(TagPredicate),
    /// Every task.
    All,
}

impl TaskSelector {
    #[must_use]
    pub fn id(id: impl Into<TaskId>) -> Self {
        Self::Id(id.into())
    }

    #[must_use]
    pub fn tag(tag: impl Into<String>) -> Self {
        Self::Tag(tag.into())
    }

    #[must_use]
    pub fn tag_matches(predicate: impl Fn(Option<&str>) -> bool + Send + Sync + 'static) -> Self {
        Self::TagMatches(Arc::new(predicate))
    }

    /// Returns true if `task` is selected.
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        match self {
            Self::Id(id) => task.id == *id,
            Self::Tag(tag) => task.tag.as_deref() == Some(tag.as_str()),
            Self::TagMatches(predicate) => predicate(task.tag.as_deref()),
            Self::All => true,
        }
    }

    /// An id selects at most one task.
    pub(crate) fn is_single(&self) -> bool {
        matches!(self, Self::Id(_))
    }
}

impl fmt::Debug for TaskSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => f.debug_tuple("Id").field(id).finish(),
            Self::Tag(tag) => f.debug_tuple("Tag").field(tag).finish(),
            Self::TagMatches(_) => f.write_str("TagMatches(..)"),
            Self::All => f.write_str("All"),
        }
    }
}

impl From<TaskId> for TaskSelector {
    fn from(id: TaskId) -> Self {
        Self::Id(id)
    }
}
