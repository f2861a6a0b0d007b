// Data models shared by the scheduler, workers and the merge queue

pub mod state_machine;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

fn default_priority() -> u32 {
    100
}

/// Lifecycle status of a backlog item inside one run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Ready,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

/// One unit of backlog work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub item_type: String,
    /// 0 is the highest priority
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default, alias = "dependencies", alias = "blocked_by")]
    pub blocked_by: BTreeSet<String>,
    /// Files the item is expected to modify
    #[serde(default, alias = "file_hints", alias = "files")]
    pub file_hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: ItemStatus,
}

impl WorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            item_type: "task".to_string(),
            priority: default_priority(),
            blocked_by: BTreeSet::new(),
            file_hints: Vec::new(),
            description: None,
            status: ItemStatus::Pending,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn blocked_by<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_by.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.file_hints.extend(files.into_iter().map(Into::into));
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

/// Why an item ended up failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    MergeConflict { files: Vec<String> },
    NoEvidence,
    ExecutorExit { code: Option<i32> },
    Workspace { message: String },
    Merge { message: String },
}

impl FailureReason {
    pub fn is_merge_conflict(&self) -> bool {
        matches!(self, FailureReason::MergeConflict { .. })
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::MergeConflict { files } if files.is_empty() => {
                write!(f, "merge_conflict")
            }
            FailureReason::MergeConflict { files } => {
                write!(f, "merge_conflict ({})", files.join(", "))
            }
            FailureReason::NoEvidence => write!(f, "no_evidence"),
            FailureReason::ExecutorExit { code: Some(code) } => {
                write!(f, "executor_exit (code {})", code)
            }
            FailureReason::ExecutorExit { code: None } => {
                write!(f, "executor_exit (killed by signal)")
            }
            FailureReason::Workspace { message } => write!(f, "workspace: {}", message),
            FailureReason::Merge { message } => write!(f, "merge: {}", message),
        }
    }
}

/// Final outcome of an item for this run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Completed,
    Failed { reason: FailureReason },
    /// Stopped by shutdown; not a failure, returns to pending on resume
    Interrupted,
    Blocked { unmet: Vec<String> },
    /// Filtered out by the include/exclude lists
    Skipped,
}

impl ItemOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemOutcome::Completed | ItemOutcome::Failed { .. })
    }
}

/// An item that can never become ready in this run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockedItem {
    pub id: String,
    pub unmet: Vec<String>,
    pub in_cycle: bool,
}
