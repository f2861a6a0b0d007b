//! Outcome verification
//!
//! An executor exiting cleanly proves nothing on its own. Each verifier looks
//! for one kind of evidence that real work happened; the chain tries them in
//! order and the first one that finds evidence wins.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ExecutorConfig;
use crate::models::FailureReason;
use crate::parallel::workspace::{Workspace, WorkspaceBackend};

/// What the executor left behind
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// None when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub output: String,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Evidence {
    CompletionMarker,
    PlanArtifact,
    Diff,
}

pub trait Verifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Some(evidence) when this verifier is convinced the item was done
    fn verify(&self, workspace: &Workspace, result: &ExecutionResult) -> Option<Evidence>;
}

/// Looks for the completion promise near the end of the output. Earlier
/// lines are ignored so echoed prompts cannot trigger it.
pub struct CompletionMarker {
    marker: String,
    tail_lines: usize,
}

impl CompletionMarker {
    pub fn new(marker: &str, tail_lines: usize) -> Self {
        Self {
            marker: marker.to_string(),
            tail_lines,
        }
    }

    pub fn check(&self, output: &str) -> bool {
        if self.marker.is_empty() {
            return false;
        }
        let lines: Vec<&str> = output.lines().collect();
        let start = lines.len().saturating_sub(self.tail_lines);
        lines[start..].iter().any(|line| line.contains(&self.marker))
    }
}

impl Verifier for CompletionMarker {
    fn name(&self) -> &'static str {
        "completion_marker"
    }

    fn verify(&self, _workspace: &Workspace, result: &ExecutionResult) -> Option<Evidence> {
        self.check(&result.output).then_some(Evidence::CompletionMarker)
    }
}

/// Evidence that the executor produced a plan: a known artifact touched after
/// the workspace was created, or an output line announcing one
pub struct PlanArtifact {
    artifacts: Vec<String>,
    patterns: Vec<Regex>,
}

impl PlanArtifact {
    pub fn new(artifacts: &[String], patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    log::warn!("[Verify] Ignoring invalid plan pattern '{}': {}", p, e);
                    None
                }
            })
            .collect();
        Self {
            artifacts: artifacts.to_vec(),
            patterns,
        }
    }

    fn artifact_touched(&self, workspace: &Workspace) -> bool {
        self.artifacts.iter().any(|rel| {
            let modified = std::fs::metadata(workspace.path.join(rel)).and_then(|m| m.modified());
            match modified {
                Ok(time) => DateTime::<Utc>::from(time) > workspace.created_at,
                Err(_) => false,
            }
        })
    }

    fn output_announces_plan(&self, output: &str) -> bool {
        output
            .lines()
            .any(|line| self.patterns.iter().any(|re| re.is_match(line)))
    }
}

impl Verifier for PlanArtifact {
    fn name(&self) -> &'static str {
        "plan_artifact"
    }

    fn verify(&self, workspace: &Workspace, result: &ExecutionResult) -> Option<Evidence> {
        (self.artifact_touched(workspace) || self.output_announces_plan(&result.output))
            .then_some(Evidence::PlanArtifact)
    }
}

/// Any difference between the workspace and its baseline
pub struct DiffEvidence {
    backend: Arc<dyn WorkspaceBackend>,
}

impl DiffEvidence {
    pub fn new(backend: Arc<dyn WorkspaceBackend>) -> Self {
        Self { backend }
    }
}

impl Verifier for DiffEvidence {
    fn name(&self) -> &'static str {
        "diff"
    }

    fn verify(&self, workspace: &Workspace, _result: &ExecutionResult) -> Option<Evidence> {
        match self.backend.has_changes(workspace) {
            Ok(true) => Some(Evidence::Diff),
            Ok(false) => None,
            Err(e) => {
                log::warn!(
                    "[Verify] Could not diff workspace for {}: {}",
                    workspace.item_id,
                    e
                );
                None
            }
        }
    }
}

pub struct VerificationChain {
    verifiers: Vec<Box<dyn Verifier>>,
}

impl VerificationChain {
    pub fn new(verifiers: Vec<Box<dyn Verifier>>) -> Self {
        Self { verifiers }
    }

    /// Marker, then plan artifacts, then diff
    pub fn standard(config: &ExecutorConfig, backend: Arc<dyn WorkspaceBackend>) -> Self {
        Self::new(vec![
            Box::new(CompletionMarker::new(
                &config.completion_marker,
                config.marker_tail_lines,
            )),
            Box::new(PlanArtifact::new(&config.plan_artifacts, &config.plan_patterns)),
            Box::new(DiffEvidence::new(backend)),
        ])
    }

    /// A non-zero exit fails the item without consulting any verifier
    pub fn verify(
        &self,
        workspace: &Workspace,
        result: &ExecutionResult,
    ) -> Result<Evidence, FailureReason> {
        if !result.succeeded() {
            return Err(FailureReason::ExecutorExit {
                code: result.exit_code,
            });
        }

        for verifier in &self.verifiers {
            if let Some(evidence) = verifier.verify(workspace, result) {
                log::debug!(
                    "[Verify] {} verified by {}",
                    workspace.item_id,
                    verifier.name()
                );
                return Ok(evidence);
            }
        }

        Err(FailureReason::NoEvidence)
    }
}
