//! Configuration for parallel runs
//!
//! Reads and writes .ralph-ui/parallel.yaml for project-specific settings,
//! then layers command-line overrides on top.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// What to do with workspaces left behind by an earlier run.
///
/// There is intentionally no default: a run that finds leftovers without a
/// configured disposition stops and asks the operator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PendingWorkDisposition {
    AttemptMerge,
    CleanAndDiscard,
    IgnoreAndReuse,
}

impl FromStr for PendingWorkDisposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "attempt-merge" | "merge" => Ok(Self::AttemptMerge),
            "clean-and-discard" | "clean" | "discard" => Ok(Self::CleanAndDiscard),
            "ignore-and-reuse" | "ignore" | "reuse" => Ok(Self::IgnoreAndReuse),
            other => Err(format!(
                "Unknown pending-work disposition '{}' (expected attempt-merge, clean-and-discard or ignore-and-reuse)",
                other
            )),
        }
    }
}

/// How the external task executor is launched
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub completion_marker: String,
    /// Only the last N output lines are searched for the marker
    pub marker_tail_lines: usize,
    /// Workspace-relative files that count as plan evidence
    pub plan_artifacts: Vec<String>,
    /// Output lines matching any of these count as plan evidence
    pub plan_patterns: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec!["--print".to_string()],
            env: HashMap::new(),
            completion_marker: "<promise>COMPLETE</promise>".to_string(),
            marker_tail_lines: 50,
            plan_artifacts: vec!["PLAN.md".to_string(), ".ralph-ui/plan.md".to_string()],
            plan_patterns: vec![r"(?i)^\s*plan (written|saved|created)\b".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    /// Branch completed work is merged into; current branch when unset
    pub integration_branch: Option<String>,
    pub max_workers: usize,
    pub timeout_per_item_secs: u64,
    pub sequential_first: bool,
    /// Items with priority <= this value are critical
    pub critical_priority: u32,
    pub max_merge_retries: u32,
    pub merge_backoff_ms: u64,
    /// Rebase conflicts on one source commit before switching to merge
    pub rebase_conflict_threshold: u32,
    pub sequential_merge_retry: bool,
    pub resume: bool,
    pub pending_work: Option<PendingWorkDisposition>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub simulate: bool,
    pub poll_interval_ms: u64,
    pub state_save_interval_secs: u64,
    pub shutdown_grace_secs: u64,
    pub kill_grace_secs: u64,
    pub branch_prefix: String,
    pub worktree_root: String,
    /// Files copied from the project into every workspace
    pub aux_files: Vec<String>,
    pub executor: ExecutorConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            integration_branch: None,
            max_workers: 3,
            timeout_per_item_secs: 3600,
            sequential_first: false,
            critical_priority: 0,
            max_merge_retries: 3,
            merge_backoff_ms: 500,
            rebase_conflict_threshold: 1,
            sequential_merge_retry: true,
            resume: false,
            pending_work: None,
            include: Vec::new(),
            exclude: Vec::new(),
            simulate: false,
            poll_interval_ms: 250,
            state_save_interval_secs: 5,
            shutdown_grace_secs: 30,
            kill_grace_secs: 5,
            branch_prefix: "ralph-parallel".to_string(),
            worktree_root: ".worktrees/parallel".to_string(),
            aux_files: Vec::new(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn timeout_per_item(&self) -> Duration {
        Duration::from_secs(self.timeout_per_item_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn state_save_interval(&self) -> Duration {
        Duration::from_secs(self.state_save_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn merge_backoff(&self) -> Duration {
        Duration::from_millis(self.merge_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("maxWorkers must be at least 1".to_string());
        }
        if self.timeout_per_item_secs == 0 {
            return Err("timeoutPerItemSecs must be greater than 0".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("pollIntervalMs must be greater than 0".to_string());
        }
        if self.rebase_conflict_threshold == 0 {
            return Err("rebaseConflictThreshold must be at least 1".to_string());
        }
        if self.executor.program.trim().is_empty() {
            return Err("executor.program must not be empty".to_string());
        }
        Ok(())
    }
}

/// Configuration file manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager for a project
    pub fn new(project_path: &Path) -> Self {
        Self {
            config_path: project_path.join(".ralph-ui").join("parallel.yaml"),
        }
    }

    /// Use an explicit config file instead of the project default
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Read config from file, returning defaults if not found
    pub fn read(&self) -> Result<OrchestratorConfig, String> {
        if !self.config_path.exists() {
            return Ok(OrchestratorConfig::default());
        }

        let content = std::fs::read_to_string(&self.config_path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        serde_yaml::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))
    }

    pub fn write(&self, config: &OrchestratorConfig) -> Result<(), String> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        let content = serde_yaml::to_string(config)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| format!("Failed to write config file: {}", e))
    }

    /// Initialize config with defaults if it doesn't exist
    pub fn initialize(&self) -> Result<OrchestratorConfig, String> {
        if self.exists() {
            return self.read();
        }

        let config = OrchestratorConfig::default();
        self.write(&config)?;
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

/// Command-line values that take precedence over the config file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub integration_branch: Option<String>,
    pub max_workers: Option<usize>,
    pub timeout_per_item_secs: Option<u64>,
    pub sequential_first: bool,
    pub max_merge_retries: Option<u32>,
    pub resume: bool,
    pub pending_work: Option<PendingWorkDisposition>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub simulate: bool,
    pub executor_program: Option<String>,
}

/// Merge config values with command-line overrides.
/// Flags can only switch boolean settings on; lists extend the file's lists.
pub fn merge_overrides(file_config: &OrchestratorConfig, overrides: ConfigOverrides) -> OrchestratorConfig {
    let mut config = file_config.clone();

    if let Some(branch) = overrides.integration_branch {
        config.integration_branch = Some(branch);
    }
    if let Some(max_workers) = overrides.max_workers {
        config.max_workers = max_workers;
    }
    if let Some(timeout) = overrides.timeout_per_item_secs {
        config.timeout_per_item_secs = timeout;
    }
    if let Some(retries) = overrides.max_merge_retries {
        config.max_merge_retries = retries;
    }
    if let Some(disposition) = overrides.pending_work {
        config.pending_work = Some(disposition);
    }
    if let Some(program) = overrides.executor_program {
        config.executor.program = program;
    }

    config.sequential_first |= overrides.sequential_first;
    config.resume |= overrides.resume;
    config.simulate |= overrides.simulate;
    config.include.extend(overrides.include);
    config.exclude.extend(overrides.exclude);

    config
}
