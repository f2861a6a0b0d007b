//! Worktree management for GitManager
//!
//! Contains methods for creating, listing, and removing worktrees

use git2::{BranchType, Error as GitError, Repository, Worktree, WorktreeAddOptions, WorktreePruneOptions};
use std::path::{Path, PathBuf};

use crate::git::types::WorktreeInfo;
use crate::git::GitManager;

/// Worktree names cannot contain '/', branch names like "ralph-parallel/us-1"
/// would otherwise create nested directories under .git/worktrees/
pub fn worktree_name_for_branch(branch: &str) -> String {
    branch.replace('/', "-")
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => {
            a.to_string_lossy().trim_end_matches('/') == b.to_string_lossy().trim_end_matches('/')
        }
    }
}

impl GitManager {
    /// Create a worktree for an existing branch
    pub fn create_worktree(&self, branch: &str, path: &Path) -> Result<WorktreeInfo, GitError> {
        let branch_ref = self.repo.find_branch(branch, BranchType::Local)?;

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(branch_ref.get()));

        let worktree_name = worktree_name_for_branch(branch);
        let worktree = self.repo.worktree(&worktree_name, path, Some(&opts))?;

        self.worktree_to_info(&worktree)
    }

    /// List all worktrees
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError> {
        let worktrees = self.repo.worktrees()?;

        let mut result = Vec::new();
        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                result.push(self.worktree_to_info(&worktree)?);
            }
        }

        Ok(result)
    }

    /// Remove a worktree by path, deleting its working directory
    pub fn remove_worktree(&self, path: &Path) -> Result<(), GitError> {
        let worktrees = self.repo.worktrees()?;

        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                if same_path(worktree.path(), path) {
                    let mut opts = WorktreePruneOptions::new();
                    opts.valid(true).working_tree(true);
                    worktree.prune(Some(&mut opts))?;
                    return Ok(());
                }
            }
        }

        Err(GitError::from_str(&format!(
            "Worktree not found: {}",
            path.display()
        )))
    }

    /// Prune orphaned worktrees (where the physical directory no longer exists)
    /// This cleans up stale entries in .git/worktrees/
    pub fn prune_orphaned_worktrees(&self) -> Result<u32, GitError> {
        let worktrees = self.repo.worktrees()?;
        let mut pruned_count = 0;

        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                let worktree_path = worktree.path();
                if !worktree_path.exists() {
                    log::info!(
                        "[Git] Pruning orphaned worktree '{}' (path {:?} no longer exists)",
                        name,
                        worktree_path
                    );
                    if let Err(e) = worktree.prune(None) {
                        log::warn!("[Git] Failed to prune worktree '{}': {}", name, e);
                    } else {
                        pruned_count += 1;
                    }
                }
            }
        }

        Ok(pruned_count)
    }

    /// Administrative directory of a worktree (`.git/worktrees/<name>`).
    /// Files placed here are invisible to the worktree's status and diffs.
    pub fn worktree_admin_dir(&self, name: &str) -> PathBuf {
        self.repo.commondir().join("worktrees").join(name)
    }

    pub(crate) fn worktree_to_info(&self, worktree: &Worktree) -> Result<WorktreeInfo, GitError> {
        let name = worktree.name().unwrap_or("").to_string();
        let path = worktree.path().to_string_lossy().to_string();

        let branch = Repository::open(worktree.path())
            .ok()
            .and_then(|wt_repo| {
                let head = wt_repo.head().ok()?;
                if head.is_branch() {
                    head.shorthand().map(|s| s.to_string())
                } else {
                    None
                }
            });

        Ok(WorktreeInfo {
            name,
            path,
            branch,
        })
    }
}
