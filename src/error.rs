//! Errors that stop a whole run
//!
//! Item-level problems are `FailureReason` values and never end up here.

use std::path::PathBuf;
use thiserror::Error;

use crate::parallel::workspace::WorkspaceError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to load backlog: {0}")]
    Backlog(String),

    #[error("Run state at {path:?} is corrupt: {message}")]
    CorruptState { path: PathBuf, message: String },

    #[error("Another run holds the lock at {path:?}")]
    RunLocked { path: PathBuf },

    #[error(
        "Found {} workspace(s) left by an earlier run ({}); choose a pending-work disposition: attempt-merge, clean-and-discard or ignore-and-reuse",
        .items.len(),
        .items.join(", ")
    )]
    UnresolvedOrphans { items: Vec<String> },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
