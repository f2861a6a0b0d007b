//! Git implementation of the merge backend

use std::path::{Path, PathBuf};

use crate::git::{GitManager, IntegrationResult, RebaseResult};
use crate::parallel::merge::{IntegrateOutcome, MergeBackend, MergeRequest, SyncOutcome};

pub struct GitMergeBackend {
    project_path: PathBuf,
}

impl GitMergeBackend {
    pub fn new(project_path: &Path) -> Self {
        Self {
            project_path: project_path.to_path_buf(),
        }
    }

    fn git(&self) -> Result<GitManager, String> {
        GitManager::new(&self.project_path)
            .map_err(|e| format!("Failed to open git repository: {}", e))
    }
}

impl MergeBackend for GitMergeBackend {
    fn sync(&self, request: &MergeRequest) -> Result<SyncOutcome, String> {
        let git = self.git()?;
        let result = git
            .rebase_onto(&request.source_ref, &request.target_ref)
            .map_err(|e| format!("Failed to rebase {}: {}", request.source_ref, e))?;

        match result {
            RebaseResult::UpToDate => Ok(SyncOutcome::UpToDate),
            RebaseResult::Rebased { .. } => {
                // The branch moved underneath its worktree
                if request.workspace.path.exists() {
                    GitManager::new(&request.workspace.path)
                        .and_then(|wt| wt.reset_to_branch_tip(&request.source_ref))
                        .map_err(|e| {
                            format!(
                                "Failed to refresh workspace {:?}: {}",
                                request.workspace.path, e
                            )
                        })?;
                }
                Ok(SyncOutcome::Synced)
            }
            RebaseResult::Conflict { commit, files } => Ok(SyncOutcome::Conflict { commit, files }),
        }
    }

    fn integrate(&self, request: &MergeRequest) -> Result<IntegrateOutcome, String> {
        let git = self.git()?;
        let result = git
            .integrate_branch(&request.source_ref, &request.target_ref)
            .map_err(|e| format!("Failed to merge {}: {}", request.source_ref, e))?;

        match result {
            IntegrationResult::UpToDate => Ok(IntegrateOutcome::Merged { commit: None }),
            IntegrationResult::FastForward { tip } => Ok(IntegrateOutcome::Merged { commit: Some(tip) }),
            IntegrationResult::Merged { commit } => Ok(IntegrateOutcome::Merged {
                commit: Some(commit),
            }),
            IntegrationResult::Conflict { files } => Ok(IntegrateOutcome::Conflict { files }),
            IntegrationResult::DirtyCheckout { paths } => Err(format!(
                "Main checkout {:?} has uncommitted changes in {}; commit or stash them before merging",
                self.project_path,
                paths.join(", ")
            )),
        }
    }
}
