//! Persisted run state
//!
//! `.ralph-ui/parallel/run-state.json` is the only durable record of a run.
//! It is replaced atomically and written at a bounded cadence.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::OrchestratorError;
use crate::file_storage::{get_parallel_dir, init_parallel_dir, write_json};
use crate::models::FailureReason;
use crate::parallel::merge::{MergeRequest, MergeStrategy};
use crate::parallel::workspace::Workspace;

pub const RUN_STATE_VERSION: u32 = 1;
const RUN_STATE_FILE: &str = "run-state.json";
const RUN_LOCK_FILE: &str = "run.lock";

/// A merge that had not finished when the state was written
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingMerge {
    pub item_id: String,
    pub workspace: Workspace,
    pub strategy: MergeStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_conflict_commit: Option<String>,
}

impl PendingMerge {
    pub fn from_request(request: &MergeRequest) -> Self {
        Self {
            item_id: request.item_id.clone(),
            workspace: request.workspace.clone(),
            strategy: request.strategy,
            last_conflict_commit: request.last_conflict_commit.clone(),
        }
    }

    pub fn into_request(self, target_ref: &str) -> MergeRequest {
        let mut request = MergeRequest::new(self.workspace, target_ref);
        request.strategy = self.strategy;
        request.last_conflict_commit = self.last_conflict_commit;
        request
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RunState {
    pub version: u32,
    pub execution_id: String,
    pub completed: BTreeSet<String>,
    pub failed: BTreeMap<String, FailureReason>,
    /// Items that were running when the state was written
    pub in_progress: BTreeSet<String>,
    pub pending_merges: Vec<PendingMerge>,
    pub timestamp: DateTime<Utc>,
}

impl RunState {
    pub fn new(execution_id: &str) -> Self {
        Self {
            version: RUN_STATE_VERSION,
            execution_id: execution_id.to_string(),
            completed: BTreeSet::new(),
            failed: BTreeMap::new(),
            in_progress: BTreeSet::new(),
            pending_merges: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_settled(&self, id: &str) -> bool {
        self.completed.contains(id) || self.failed.contains_key(id)
    }
}

pub struct RunStateStore {
    path: PathBuf,
}

impl RunStateStore {
    pub fn new(project_path: &Path) -> Self {
        Self {
            path: get_parallel_dir(project_path).join(RUN_STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing state is not an error; unreadable state is fatal
    pub fn load(&self) -> Result<Option<RunState>, OrchestratorError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state: RunState =
            serde_json::from_str(&content).map_err(|e| OrchestratorError::CorruptState {
                path: self.path.clone(),
                message: e.to_string(),
            })?;

        if state.version != RUN_STATE_VERSION {
            return Err(OrchestratorError::CorruptState {
                path: self.path.clone(),
                message: format!(
                    "unsupported version {} (expected {})",
                    state.version, RUN_STATE_VERSION
                ),
            });
        }

        log::info!(
            "[RunState] Loaded state from run {} ({} completed, {} failed, {} in progress, {} pending merges)",
            state.execution_id,
            state.completed.len(),
            state.failed.len(),
            state.in_progress.len(),
            state.pending_merges.len()
        );
        Ok(Some(state))
    }

    pub fn save(&self, state: &RunState) -> Result<(), OrchestratorError> {
        write_json(&self.path, state).map_err(OrchestratorError::Storage)?;
        log::debug!("[RunState] Saved state to {:?}", self.path);
        Ok(())
    }
}

/// Limits how often state is written
#[derive(Debug)]
pub struct Checkpointer {
    interval: Duration,
    last_save: Option<Instant>,
    dirty: bool,
}

impl Checkpointer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_save: None,
            dirty: false,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_due(&self) -> bool {
        self.dirty
            && self
                .last_save
                .map_or(true, |last| last.elapsed() >= self.interval)
    }

    pub fn saved(&mut self) {
        self.dirty = false;
        self.last_save = Some(Instant::now());
    }
}

/// Exclusive lock preventing two runs on the same project.
/// Released when dropped.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(project_path: &Path) -> Result<Self, OrchestratorError> {
        let dir = init_parallel_dir(project_path).map_err(OrchestratorError::Storage)?;
        let path = dir.join(RUN_LOCK_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(OrchestratorError::RunLocked { path });
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("[RunState] Failed to release run lock {:?}: {}", self.path, e);
        }
    }
}
