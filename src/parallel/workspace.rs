//! Isolated per-item workspaces
//!
//! The orchestration core only talks to `WorkspaceBackend`; the git worktree
//! implementation lives in `git_workspace`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::config::PendingWorkDisposition;
use crate::models::WorkItem;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<String> for WorkspaceError {
    fn from(message: String) -> Self {
        WorkspaceError::Other(message)
    }
}

/// An isolated execution environment bound to one item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub item_id: String,
    pub branch: String,
    pub path: PathBuf,
    /// Integration-branch commit the workspace was created from
    pub baseline: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Fresh,
    /// Keep a leftover workspace for the same item if one exists
    ReuseExisting,
}

/// Classification of a workspace found at startup
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrphanState {
    Empty,
    InProgress,
    CompletedUnmerged,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrphanWorkspace {
    pub workspace: Workspace,
    pub state: OrphanState,
    /// Commits on the workspace branch missing from the integration branch
    pub ahead: usize,
    pub behind: usize,
    pub dirty: bool,
}

/// Backend-specific workspace operations.
///
/// Implementations must be safe to call from worker threads.
pub trait WorkspaceBackend: Send + Sync {
    /// Branch a workspace off the current integration head
    fn create(&self, item: &WorkItem, mode: CreateMode) -> Result<Workspace, WorkspaceError>;

    /// Remove the workspace, keeping its branch
    fn destroy(&self, workspace: &Workspace) -> Result<(), WorkspaceError>;

    /// Remove the workspace and its branch
    fn discard(&self, workspace: &Workspace) -> Result<(), WorkspaceError>;

    /// Enumerate workspaces that currently exist
    fn scan(&self) -> Result<Vec<Workspace>, WorkspaceError>;

    fn classify(&self, workspace: &Workspace) -> Result<OrphanWorkspace, WorkspaceError>;

    /// True when the workspace differs from its baseline
    fn has_changes(&self, workspace: &Workspace) -> Result<bool, WorkspaceError>;

    /// Persist all work in the workspace and mark it complete
    fn seal(&self, workspace: &Workspace) -> Result<(), WorkspaceError>;

    /// Where a workspace for `item` would live, without creating anything
    fn preview(&self, item: &WorkItem) -> Workspace;
}

/// Result of applying a pending-work disposition
#[derive(Debug, Default)]
pub struct DispositionReport {
    /// Sealed workspaces whose branches should be merged
    pub to_merge: Vec<Workspace>,
    pub discarded: Vec<String>,
    pub reused: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Owns the backend plus the per-run reuse decisions
pub struct WorkspaceManager {
    backend: Arc<dyn WorkspaceBackend>,
    reuse: HashSet<String>,
}

impl WorkspaceManager {
    pub fn new(backend: Arc<dyn WorkspaceBackend>) -> Self {
        Self {
            backend,
            reuse: HashSet::new(),
        }
    }

    /// Reuse the leftover workspace of `item_id` on its next dispatch
    pub fn mark_reuse(&mut self, item_id: &str) {
        self.reuse.insert(item_id.to_string());
    }

    /// How the next workspace for `item_id` should be created; a reuse
    /// decision is consumed by the first dispatch
    pub fn creation_mode(&mut self, item_id: &str) -> CreateMode {
        if self.reuse.remove(item_id) {
            CreateMode::ReuseExisting
        } else {
            CreateMode::Fresh
        }
    }

    pub fn destroy(&self, workspace: &Workspace) {
        if let Err(e) = self.backend.destroy(workspace) {
            log::warn!(
                "[Workspace] Failed to destroy workspace {} for {}: {}",
                workspace.id,
                workspace.item_id,
                e
            );
        }
    }

    /// Find leftover workspaces, skipping items in `known` (for example
    /// merges that are already queued from the persisted state)
    pub fn scan_orphans(&self, known: &HashSet<String>) -> Result<Vec<OrphanWorkspace>, WorkspaceError> {
        let mut orphans = Vec::new();
        for workspace in self.backend.scan()? {
            if known.contains(&workspace.item_id) {
                continue;
            }
            let orphan = self.backend.classify(&workspace)?;
            log::info!(
                "[Workspace] Found leftover workspace {} for {} ({:?}, {} ahead, dirty: {})",
                orphan.workspace.id,
                orphan.workspace.item_id,
                orphan.state,
                orphan.ahead,
                orphan.dirty
            );
            orphans.push(orphan);
        }
        orphans.sort_by(|a, b| a.workspace.item_id.cmp(&b.workspace.item_id));
        Ok(orphans)
    }

    /// Apply the operator's choice to every orphan
    pub fn apply_disposition(
        &mut self,
        orphans: Vec<OrphanWorkspace>,
        disposition: PendingWorkDisposition,
    ) -> DispositionReport {
        let mut report = DispositionReport::default();

        for orphan in orphans {
            let item_id = orphan.workspace.item_id.clone();
            let result = match disposition {
                PendingWorkDisposition::AttemptMerge => match orphan.state {
                    OrphanState::Empty => self.backend.discard(&orphan.workspace).map(|_| {
                        report.discarded.push(item_id.clone());
                    }),
                    OrphanState::InProgress | OrphanState::CompletedUnmerged => {
                        self.backend.seal(&orphan.workspace).map(|_| {
                            report.to_merge.push(orphan.workspace.clone());
                        })
                    }
                },
                PendingWorkDisposition::CleanAndDiscard => {
                    self.backend.discard(&orphan.workspace).map(|_| {
                        report.discarded.push(item_id.clone());
                    })
                }
                PendingWorkDisposition::IgnoreAndReuse => {
                    self.reuse.insert(item_id.clone());
                    report.reused.push(item_id.clone());
                    Ok(())
                }
            };

            if let Err(e) = result {
                log::warn!("[Workspace] Could not apply {:?} to {}: {}", disposition, item_id, e);
                report.failed.push((item_id, e.to_string()));
            }
        }

        log::info!(
            "[Workspace] Disposition {:?}: {} to merge, {} discarded, {} reused, {} failed",
            disposition,
            report.to_merge.len(),
            report.discarded.len(),
            report.reused.len(),
            report.failed.len()
        );

        report
    }
}
