//! Git operations using git2-rs
//!
//! This module provides git functionality organized into focused submodules:
//! - `manager` - Core GitManager struct and basic operations
//! - `branches` - Branch operations (create, delete, checkout)
//! - `worktrees` - Worktree management (add, remove, list, prune)
//! - `commits` - Staging and commit creation
//! - `merge` - Merge and conflict handling
//! - `rebase` - In-memory rebase and ahead/behind comparison
//! - `status` - Status and file tracking operations
//! - `types` - Shared data structures

mod branches;
mod commits;
mod manager;
mod merge;
mod rebase;
mod status;
#[cfg(test)]
mod tests;
mod types;
mod worktrees;

pub use manager::GitManager;
pub use worktrees::worktree_name_for_branch;

pub use types::{BranchInfo, CommitInfo, IntegrationResult, RebaseResult, WorktreeInfo};
