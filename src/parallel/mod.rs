//! Parallel execution of backlog items
//!
//! - `graph` / `contention` - dependency waves and file-contention refinement
//! - `queue` - ready queue ordered by priority
//! - `workspace` / `git_workspace` - isolated per-item workspaces
//! - `executor` / `verify` / `pool` - running and checking items
//! - `merge` / `git_merge` - serialized integration of finished work
//! - `state` - persisted run state and run lock
//! - `orchestrator` - the driving loop
//! - `summary` - end-of-run and simulation reports

pub mod contention;
pub mod executor;
pub mod git_merge;
pub mod git_workspace;
pub mod graph;
pub mod merge;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod state;
pub mod summary;
pub mod verify;
pub mod workspace;

use std::sync::{Arc, Mutex};

/// Guards the integration branch. Held while branching a new workspace off
/// the integration head and for the whole of each merge attempt.
pub type IntegrationLock = Arc<Mutex<()>>;

pub use contention::refine_waves_for_contention;
pub use graph::DependencyGraph;
pub use orchestrator::Orchestrator;
pub use summary::{RunSummary, SimulationPlan};
