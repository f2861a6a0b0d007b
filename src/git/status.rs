//! Working tree inspection for GitManager

use git2::{DiffOptions, Error as GitError, Oid, StatusOptions};

use crate::git::GitManager;

impl GitManager {
    /// Paths that differ from HEAD in the index or working tree, untracked
    /// files included
    pub fn dirty_paths(&self) -> Result<Vec<String>, GitError> {
        self.status_paths(true)
    }

    /// Tracked paths with staged or unstaged edits
    pub fn tracked_changes(&self) -> Result<Vec<String>, GitError> {
        self.status_paths(false)
    }

    fn status_paths(&self, untracked: bool) -> Result<Vec<String>, GitError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(untracked)
            .recurse_untracked_dirs(untracked)
            .include_ignored(false);

        let statuses = self.repo.statuses(Some(&mut opts))?;
        Ok(statuses
            .iter()
            .filter_map(|entry| entry.path().map(str::to_string))
            .collect())
    }

    pub fn has_uncommitted_changes(&self) -> Result<bool, GitError> {
        Ok(!self.dirty_paths()?.is_empty())
    }

    /// True when the working tree (committed or not) differs from `commit_id`.
    /// Ignored files do not count.
    pub fn has_changes_since(&self, commit_id: &str) -> Result<bool, GitError> {
        let baseline = self.repo.find_commit(Oid::from_str(commit_id)?)?;
        let tree = baseline.tree()?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);

        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&tree), Some(&mut opts))?;
        Ok(diff.deltas().len() > 0)
    }
}
