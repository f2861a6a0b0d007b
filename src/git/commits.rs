//! Commit operations for GitManager
//!
//! Contains methods for staging and creating commits

use git2::{Error as GitError, IndexAddOption};

use crate::git::types::CommitInfo;
use crate::git::GitManager;

impl GitManager {
    /// Stage all files, including deletions
    pub fn stage_all(&self) -> Result<(), GitError> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        Ok(())
    }

    /// Commit the current index on top of HEAD
    pub fn create_commit(&self, message: &str) -> Result<CommitInfo, GitError> {
        let signature = self.signature()?;

        let mut index = self.repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;

        let parent_commit = self.repo.head()?.peel_to_commit()?;

        let oid = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &[&parent_commit],
        )?;

        let commit = self.repo.find_commit(oid)?;
        Ok(commit_to_info(&commit))
    }

    /// Stage everything and commit it; returns None when there was nothing to commit
    pub fn commit_all(&self, message: &str) -> Result<Option<CommitInfo>, GitError> {
        if !self.has_uncommitted_changes()? {
            return Ok(None);
        }
        self.stage_all()?;
        self.create_commit(message).map(Some)
    }
}

pub(crate) fn commit_to_info(commit: &git2::Commit) -> CommitInfo {
    let id = commit.id().to_string();
    CommitInfo {
        short_id: id.chars().take(7).collect(),
        id,
        message: commit.message().unwrap_or("").to_string(),
        author: commit.author().name().unwrap_or("").to_string(),
        timestamp: commit.time().seconds(),
    }
}
