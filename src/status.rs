//! Task lifecycle status and its persisted string encoding.
//!
//! Several variants carry the status they replaced so that pause, resume and
//! retry can restore the earlier context:
//!
//! ```text
//! Initial ─► Queued(Initial) ─► Running ─► PostProcessing ─► Completed
//!                                  │
//!                                  ├─► Paused(Running) ─► Queued(Paused(Running)) ─► ...
//!                                  └─► Failed(reason, Running)
//! ```
//!
//! The persisted form is a colon-delimited chain, e.g. `Paused:Queued:Initial`
//! or `Failed:<reason>:Queued:Initial`. Colons and backslashes inside a failure
//! reason are backslash-escaped so the chain always decodes back to the same
//! value.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

/// Maximum number of wrapped history levels kept by the wrapping constructors.
pub const MAX_HISTORY_DEPTH: usize = 4;

const SEPARATOR: char = ':';
const ESCAPE: char = '\\';

/// Status of a download task.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TaskStatus {
    /// Built but never enqueued.
    #[default]
    Initial,
    /// Waiting for a transfer slot.
    Queued(Box<TaskStatus>),
    /// A transfer executor is streaming the body.
    Running,
    /// Body fully received; finalising the file and running completion hooks.
    PostProcessing,
    /// Stopped in a resumable state.
    Paused(Box<TaskStatus>),
    /// File finalised at its destination.
    Completed,
    /// Stopped by the caller without error.
    Cancelled,
    /// Stopped with an error or a hard cancel.
    Failed {
        /// Human-readable failure reason.
        reason: String,
        /// Status the task was in when it failed.
        last: Box<TaskStatus>,
    },
    /// Unrecognised persisted value.
    Unknown,
}

impl TaskStatus {
    /// Wraps `previous` in `Queued`, flattening history beyond [`MAX_HISTORY_DEPTH`].
    #[must_use]
    pub fn queued(previous: TaskStatus) -> Self {
        Self::Queued(Box::new(previous.capped(MAX_HISTORY_DEPTH - 1)))
    }

    /// Wraps `previous` in `Paused`, flattening history beyond [`MAX_HISTORY_DEPTH`].
    #[must_use]
    pub fn paused(previous: TaskStatus) -> Self {
        Self::Paused(Box::new(previous.capped(MAX_HISTORY_DEPTH - 1)))
    }

    /// Wraps `previous` in `Failed`, flattening history beyond [`MAX_HISTORY_DEPTH`].
    #[must_use]
    pub fn failed(reason: impl Into<String>, previous: TaskStatus) -> Self {
        Self::Failed {
            reason: reason.into(),
            last: Box::new(previous.capped(MAX_HISTORY_DEPTH - 1)),
        }
    }

    /// `Running` or `PostProcessing`.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        matches!(self, Self::Running | Self::PostProcessing)
    }

    /// `Queued`.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Queued(_))
    }

    /// `Queued`, `Running` or `PostProcessing`.
    #[must_use]
    pub fn is_pauseable(&self) -> bool {
        matches!(self, Self::Queued(_) | Self::Running | Self::PostProcessing)
    }

    /// `Completed`, `Cancelled`, `Failed` or `Paused`.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Failed { .. } | Self::Paused(_)
        )
    }

    /// `Completed` or `Cancelled`.
    #[must_use]
    pub fn is_success_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Returns the wrapped prior status for `Queued`, `Paused` and `Failed`.
    #[must_use]
    pub fn last_status(&self) -> Option<&TaskStatus> {
        match self {
            Self::Queued(last) | Self::Paused(last) | Self::Failed { last, .. } => Some(last),
            _ => None,
        }
    }

    /// Number of wrapped history levels below this status.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.last_status().map_or(0, |last| 1 + last.depth())
    }

    /// Returns the innermost non-wrapping status of the chain.
    #[must_use]
    pub fn root(&self) -> &TaskStatus {
        match self.last_status() {
            Some(last) => last.root(),
            None => self,
        }
    }

    /// Keeps at most `levels` wrappers; the cut-off part collapses to its root.
    fn capped(self, levels: usize) -> Self {
        if levels == 0 {
            return self.root().clone();
        }
        match self {
            Self::Queued(last) => Self::Queued(Box::new(last.capped(levels - 1))),
            Self::Paused(last) => Self::Paused(Box::new(last.capped(levels - 1))),
            Self::Failed { reason, last } => Self::Failed {
                reason,
                last: Box::new(last.capped(levels - 1)),
            },
            leaf => leaf,
        }
    }

    /// Encodes the status as its colon-delimited chain.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::new();
        self.write_chain(&mut out);
        out
    }

    fn write_chain(&self, out: &mut String) {
        match self {
            Self::Initial => out.push_str("Initial"),
            Self::Running => out.push_str("Running"),
            Self::PostProcessing => out.push_str("PostProcessing"),
            Self::Completed => out.push_str("Completed"),
            Self::Cancelled => out.push_str("Cancelled"),
            Self::Unknown => out.push_str("Unknown"),
            Self::Queued(last) => {
                out.push_str("Queued:");
                last.write_chain(out);
            }
            Self::Paused(last) => {
                out.push_str("Paused:");
                last.write_chain(out);
            }
            Self::Failed { reason, last } => {
                out.push_str("Failed:");
                escape_reason(reason, out);
                out.push(SEPARATOR);
                last.write_chain(out);
            }
        }
    }

    /// Decodes a colon-delimited chain. Unrecognised input maps to [`TaskStatus::Unknown`].
    #[must_use]
    pub fn decode(encoded: &str) -> Self {
        let segments = split_segments(encoded);
        let refs: Vec<&str> = segments.iter().map(String::as_str).collect();
        parse_chain(&refs).unwrap_or_else(|| {
            debug!(status = %encoded, "unrecognised task status, treating as Unknown");
            Self::Unknown
        })
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for TaskStatus {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::decode(s))
    }
}

impl Serialize for TaskStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Ok(Self::decode(&encoded))
    }
}

fn escape_reason(reason: &str, out: &mut String) {
    for c in reason.chars() {
        if c == SEPARATOR || c == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(c);
    }
}

/// Splits on unescaped separators; escape sequences are kept verbatim.
fn split_segments(encoded: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = encoded.chars();
    while let Some(c) = chars.next() {
        match c {
            ESCAPE => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            SEPARATOR => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

fn unescape_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        if c == ESCAPE {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parses a complete chain; every segment must be consumed.
fn parse_chain(segments: &[&str]) -> Option<TaskStatus> {
    let (head, rest) = segments.split_first()?;
    let leaf = match *head {
        "Initial" => Some(TaskStatus::Initial),
        "Running" => Some(TaskStatus::Running),
        "PostProcessing" => Some(TaskStatus::PostProcessing),
        "Completed" => Some(TaskStatus::Completed),
        "Cancelled" => Some(TaskStatus::Cancelled),
        "Unknown" => Some(TaskStatus::Unknown),
        _ => None,
    };
    if let Some(leaf) = leaf {
        return rest.is_empty().then_some(leaf);
    }

    match *head {
        "Queued" => parse_chain(rest).map(|last| TaskStatus::Queued(Box::new(last))),
        "Paused" => parse_chain(rest).map(|last| TaskStatus::Paused(Box::new(last))),
        "Failed" => {
            // Legacy rows carry unescaped reasons; the reason takes the shortest
            // prefix that leaves a complete chain behind it.
            (1..rest.len()).find_map(|split| {
                let last = parse_chain(&rest[split..])?;
                let reason = rest[..split]
                    .iter()
                    .map(|segment| unescape_segment(segment))
                    .collect::<Vec<_>>()
                    .join(":");
                Some(TaskStatus::Failed {
                    reason,
                    last: Box::new(last),
                })
            })
        }
        _ => None,
    }
}
