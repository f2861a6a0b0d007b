//! Branch operations for GitManager
//!
//! Contains methods for creating, deleting and checking out branches

use git2::{Branch, BranchType, Error as GitError, Oid};

use crate::git::types::BranchInfo;
use crate::git::GitManager;

impl GitManager {
    /// Create a new branch from a specific commit
    pub fn create_branch_from_commit(
        &self,
        name: &str,
        commit_id: &str,
        force: bool,
    ) -> Result<BranchInfo, GitError> {
        let oid = Oid::from_str(commit_id)?;
        let commit = self.repo.find_commit(oid)?;

        let branch = self.repo.branch(name, &commit, force)?;

        self.branch_to_info(&branch)
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        self.repo.find_branch(name, BranchType::Local).is_ok()
    }

    /// Delete a branch
    pub fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        let mut branch = self.repo.find_branch(name, BranchType::Local)?;
        branch.delete()?;
        Ok(())
    }

    /// Get the current branch
    pub fn get_current_branch(&self) -> Result<BranchInfo, GitError> {
        let head = self.repo.head()?;

        if !head.is_branch() {
            return Err(GitError::from_str("HEAD is not a branch"));
        }

        let branch = Branch::wrap(head);
        self.branch_to_info(&branch)
    }

    /// Checkout a branch
    pub fn checkout_branch(&self, name: &str) -> Result<(), GitError> {
        let obj = self.repo.revparse_single(&format!("refs/heads/{}", name))?;

        self.repo.checkout_tree(&obj, None)?;
        self.repo.set_head(&format!("refs/heads/{}", name))?;

        Ok(())
    }

    pub(crate) fn branch_to_info(&self, branch: &Branch) -> Result<BranchInfo, GitError> {
        let name = branch.name()?.unwrap_or("").to_string();
        let is_head = branch.is_head();
        let commit_id = branch.get().peel_to_commit()?.id().to_string();

        Ok(BranchInfo {
            name,
            is_head,
            commit_id,
        })
    }

    /// Get the default branch name for this repository.
    ///
    /// Resolution order:
    /// 1. Current HEAD branch (if HEAD points to a branch)
    /// 2. First existing common default branch ("main", "master")
    /// 3. Fallback to "main"
    pub fn get_default_branch_name(&self) -> String {
        if let Ok(head) = self.repo.head() {
            if head.is_branch() {
                if let Some(name) = head.shorthand() {
                    return name.to_string();
                }
            }
        }

        for name in &["main", "master"] {
            if self.repo.find_branch(name, BranchType::Local).is_ok() {
                return (*name).to_string();
            }
        }

        "main".to_string()
    }
}
