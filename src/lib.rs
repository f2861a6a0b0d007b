// Clippy allows for reasonable defaults
#![allow(clippy::too_many_arguments)] // Constructors often need many params
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::field_reassign_with_default)] // Builder pattern is clearer
#![allow(clippy::collapsible_if)] // Separate ifs can be more readable

// Module declarations
pub mod backlog;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod file_storage;
mod git;
pub mod models;
pub mod parallel;
pub mod shutdown;
mod utils;

pub use backlog::{BacklogSource, FileBacklog};
pub use config::{ConfigManager, ConfigOverrides, OrchestratorConfig, PendingWorkDisposition};
pub use context::RunContext;
pub use error::OrchestratorError;
pub use models::*;
pub use parallel::{Orchestrator, RunSummary, SimulationPlan};
