//! Core GitManager implementation
//!
//! Contains the GitManager struct and its basic operations

use git2::{BranchType, Error as GitError, Oid, Repository, Signature};
use std::path::{Path, PathBuf};

/// Git manager for repository operations
pub struct GitManager {
    pub(crate) repo: Repository,
}

impl GitManager {
    /// Create a new GitManager for the given repository (or worktree) path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, GitError> {
        let repo = Repository::open(path)?;
        Ok(Self { repo })
    }

    /// Get the repository path (the .git directory, or the worktree admin dir)
    pub fn repo_path(&self) -> PathBuf {
        self.repo.path().to_path_buf()
    }

    /// Resolve the commit a local branch points at
    pub fn branch_tip(&self, branch: &str) -> Result<Oid, GitError> {
        let branch_ref = self.repo.find_branch(branch, BranchType::Local)?;
        Ok(branch_ref.get().peel_to_commit()?.id())
    }

    /// Signature from git config, falling back to a fixed identity
    pub(crate) fn signature(&self) -> Result<Signature<'static>, GitError> {
        self.repo
            .signature()
            .or_else(|_| Signature::now("Ralph UI", "ralph@example.com"))
    }
}
