//! Rebase and branch comparison for GitManager
//!
//! Rebases run in memory so neither the main checkout nor the branch's
//! worktree is touched until the result is known to be clean.

use git2::{Error as GitError, RebaseOptions};

use crate::git::merge::conflicted_paths;
use crate::git::types::RebaseResult;
use crate::git::GitManager;

impl GitManager {
    /// Replay `branch` onto the tip of `onto` and move `branch` to the result.
    /// On the first conflicting commit the rebase is aborted and the branch is
    /// left untouched.
    pub fn rebase_onto(&self, branch: &str, onto: &str) -> Result<RebaseResult, GitError> {
        let branch_tip = self.branch_tip(branch)?;
        let onto_tip = self.branch_tip(onto)?;

        if self.repo.merge_base(branch_tip, onto_tip)? == onto_tip {
            return Ok(RebaseResult::UpToDate);
        }

        let branch_annotated = self.repo.find_annotated_commit(branch_tip)?;
        let onto_annotated = self.repo.find_annotated_commit(onto_tip)?;

        let mut opts = RebaseOptions::new();
        opts.inmemory(true);

        let mut rebase = self.repo.rebase(
            Some(&branch_annotated),
            Some(&onto_annotated),
            None,
            Some(&mut opts),
        )?;

        let signature = self.signature()?;
        let mut new_tip = onto_tip;
        let mut replayed = 0;

        while let Some(op) = rebase.next() {
            let source_commit = op?.id();

            let index = rebase.inmemory_index()?;
            if index.has_conflicts() {
                let files = conflicted_paths(&index)?;
                rebase.abort()?;
                log::info!(
                    "[GitManager] Rebase of {} onto {} conflicts at {} ({:?})",
                    branch,
                    onto,
                    source_commit,
                    files
                );
                return Ok(RebaseResult::Conflict {
                    commit: source_commit.to_string(),
                    files,
                });
            }

            // An empty replay (change already upstream) is skipped
            match rebase.commit(None, &signature, None) {
                Ok(oid) => {
                    new_tip = oid;
                    replayed += 1;
                }
                Err(e) if e.code() == git2::ErrorCode::Applied => {}
                Err(e) => {
                    rebase.abort()?;
                    return Err(e);
                }
            }
        }

        rebase.finish(None)?;

        self.repo.reference(
            &format!("refs/heads/{}", branch),
            new_tip,
            true,
            &format!("rebase {} onto {}", branch, onto),
        )?;

        log::info!(
            "[GitManager] Rebased {} onto {} ({} commit(s) replayed)",
            branch,
            onto,
            replayed
        );

        Ok(RebaseResult::Rebased {
            new_tip: new_tip.to_string(),
            replayed,
        })
    }

    /// Commits `branch` has that `base` lacks, and vice versa
    pub fn ahead_behind(&self, branch: &str, base: &str) -> Result<(usize, usize), GitError> {
        let branch_tip = self.branch_tip(branch)?;
        let base_tip = self.branch_tip(base)?;
        self.repo.graph_ahead_behind(branch_tip, base_tip)
    }

    /// Hard-reset the checked-out branch to its current ref target.
    /// Used after a branch was moved underneath a worktree.
    pub fn reset_to_branch_tip(&self, branch: &str) -> Result<(), GitError> {
        let tip = self.branch_tip(branch)?;
        let commit = self.repo.find_commit(tip)?;
        self.repo
            .reset(commit.as_object(), git2::ResetType::Hard, None)
    }
}
