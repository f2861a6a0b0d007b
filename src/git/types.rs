//! Git data types and structures
//!
//! Contains all shared types used across git operations

use serde::{Deserialize, Serialize};

/// Represents a git branch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub is_head: bool,
    pub commit_id: String,
}

/// Represents a git commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: String,
    pub short_id: String,
    pub message: String,
    pub author: String,
    pub timestamp: i64,
}

/// Represents a git worktree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub name: String,
    pub path: String,
    pub branch: Option<String>,
}

/// Outcome of integrating one branch into another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IntegrationResult {
    UpToDate,
    FastForward { tip: String },
    Merged { commit: String },
    /// The merge was rolled back; `files` were conflicted
    Conflict { files: Vec<String> },
    /// Nothing was touched; tracked files in the checkout have local edits
    DirtyCheckout { paths: Vec<String> },
}

/// Outcome of replaying a branch onto a new base
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RebaseResult {
    /// Branch already contains the base
    UpToDate,
    Rebased { new_tip: String, replayed: usize },
    /// Rebase aborted; `commit` is the source commit that failed to apply
    Conflict { commit: String, files: Vec<String> },
}
