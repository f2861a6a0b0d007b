//! Per-run context handed to every component

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::config::OrchestratorConfig;
use crate::file_storage::get_parallel_dir;
use crate::shutdown::ShutdownState;

/// Everything that used to be process-wide: config, project location, run
/// identity and the shutdown flag. Lives exactly as long as one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: OrchestratorConfig,
    pub project_path: PathBuf,
    pub execution_id: String,
    pub shutdown: ShutdownState,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(config: OrchestratorConfig, project_path: &Path, shutdown: ShutdownState) -> Self {
        Self {
            config,
            project_path: project_path.to_path_buf(),
            execution_id: uuid::Uuid::new_v4().to_string(),
            shutdown,
            started_at: Utc::now(),
        }
    }

    /// Executor output for this run
    pub fn log_dir(&self) -> PathBuf {
        get_parallel_dir(&self.project_path)
            .join("logs")
            .join(&self.execution_id)
    }
}
