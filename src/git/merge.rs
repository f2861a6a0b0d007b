//! Integration of item branches into the integration branch

use git2::{build::CheckoutBuilder, AnnotatedCommit, BranchType, Commit, Error as GitError, Index};

use crate::git::types::IntegrationResult;
use crate::git::GitManager;

/// Paths of all conflicted entries in an index
pub(crate) fn conflicted_paths(index: &Index) -> Result<Vec<String>, GitError> {
    let mut files = Vec::new();
    for conflict in index.conflicts()?.flatten() {
        if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
            files.push(String::from_utf8_lossy(&entry.path).to_string());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn safe_checkout() -> CheckoutBuilder<'static> {
    let mut checkout = CheckoutBuilder::new();
    checkout.safe().overwrite_ignored(false);
    checkout
}

impl GitManager {
    /// Bring `source` into `target` in the main checkout.
    ///
    /// Refuses to touch a checkout whose tracked files have local edits.
    /// Checkouts are safe, so an untracked file in the way fails the
    /// integration instead of being overwritten. A conflicted merge is
    /// rolled back before returning, as is a failed one.
    pub fn integrate_branch(
        &self,
        source: &str,
        target: &str,
    ) -> Result<IntegrationResult, GitError> {
        let paths = self.tracked_changes()?;
        if !paths.is_empty() {
            log::warn!(
                "[GitManager] Not integrating {}: main checkout has local edits in {:?}",
                source,
                paths
            );
            return Ok(IntegrationResult::DirtyCheckout { paths });
        }

        self.integrate_clean(source, target).map_err(|e| {
            if let Err(restore) = self.restore_head() {
                log::warn!("[GitManager] Failed to restore checkout: {}", restore);
            }
            e
        })
    }

    fn integrate_clean(&self, source: &str, target: &str) -> Result<IntegrationResult, GitError> {
        self.checkout_branch(target)?;

        let source_commit = self
            .repo
            .find_branch(source, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        let annotated = self.repo.find_annotated_commit(source_commit.id())?;
        let (analysis, _) = self.repo.merge_analysis(&[&annotated])?;

        if analysis.is_up_to_date() {
            log::debug!("[GitManager] {} already contains {}", target, source);
            return Ok(IntegrationResult::UpToDate);
        }

        if analysis.is_fast_forward() {
            self.fast_forward(target, &source_commit)?;
            log::info!("[GitManager] Fast-forwarded {} to {}", target, source);
            return Ok(IntegrationResult::FastForward {
                tip: source_commit.id().to_string(),
            });
        }

        match self.merge_commit(source, target, &source_commit, &annotated)? {
            Some(commit) => {
                log::info!("[GitManager] Merged {} into {} as {}", source, target, commit);
                Ok(IntegrationResult::Merged { commit })
            }
            None => {
                let files = conflicted_paths(&self.repo.index()?)?;
                log::warn!("[GitManager] Merging {} conflicts on {:?}", source, files);
                self.restore_head()?;
                Ok(IntegrationResult::Conflict { files })
            }
        }
    }

    /// Update the working tree first so a blocked checkout leaves the ref alone
    fn fast_forward(&self, target: &str, to: &Commit) -> Result<(), GitError> {
        self.repo
            .checkout_tree(to.as_object(), Some(&mut safe_checkout()))?;
        let mut reference = self.repo.find_reference(&format!("refs/heads/{}", target))?;
        reference.set_target(to.id(), "ralph-parallel: fast-forward")?;
        Ok(())
    }

    /// Returns None when the merge left conflicts in the index.
    fn merge_commit(
        &self,
        source: &str,
        target: &str,
        source_commit: &Commit,
        annotated: &AnnotatedCommit,
    ) -> Result<Option<String>, GitError> {
        self.repo
            .merge(&[annotated], None, Some(&mut safe_checkout()))?;

        let mut index = self.repo.index()?;
        if index.has_conflicts() {
            return Ok(None);
        }

        let tree = self.repo.find_tree(index.write_tree()?)?;
        let head = self.repo.head()?.peel_to_commit()?;
        let signature = self.signature()?;
        let commit = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &format!("Integrate {} into {}", source, target),
            &tree,
            &[&head, source_commit],
        )?;
        self.repo.cleanup_state()?;
        Ok(Some(commit.to_string()))
    }

    /// Drop any in-progress merge and reset tracked files to HEAD.
    /// Only called once `integrate_branch` has seen a clean checkout.
    fn restore_head(&self) -> Result<(), GitError> {
        let head = self.repo.head()?.peel_to_commit()?;
        self.repo
            .reset(head.as_object(), git2::ResetType::Hard, None)?;
        self.repo.cleanup_state()
    }
}
