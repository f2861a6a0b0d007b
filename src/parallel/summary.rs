//! End-of-run summary and dry-run plan

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::models::{BlockedItem, ItemOutcome};
use crate::parallel::workspace::OrphanWorkspace;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_FAILURES: i32 = 2;
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub execution_id: String,
    pub integration_branch: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Items without an entry were never attempted (interrupted runs only)
    pub outcomes: BTreeMap<String, ItemOutcome>,
    pub total_items: usize,
    pub blocked: Vec<BlockedItem>,
    pub cycles: Vec<Vec<String>>,
    pub interrupted: bool,
    pub strategy_switches: usize,
}

impl RunSummary {
    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.outcomes.values().filter(|o| pred(o)).count()
    }

    pub fn completed_count(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Completed))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed { .. }))
    }

    pub fn interrupted_count(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Interrupted))
    }

    pub fn blocked_count(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Blocked { .. }))
    }

    pub fn skipped_count(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Skipped))
    }

    pub fn pending_count(&self) -> usize {
        self.total_items.saturating_sub(self.outcomes.len())
    }

    /// Failed share of attempted items; interrupted items are not attempts
    pub fn failure_rate(&self) -> f64 {
        let attempted = self.completed_count() + self.failed_count();
        if attempted == 0 {
            return 0.0;
        }
        self.failed_count() as f64 / attempted as f64
    }

    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            EXIT_INTERRUPTED
        } else if self.failed_count() > 0 || self.blocked_count() > 0 {
            EXIT_FAILURES
        } else {
            EXIT_OK
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = (self.finished_at - self.started_at).num_seconds();
        writeln!(
            f,
            "Run {} on {} ({}s){}",
            self.execution_id,
            self.integration_branch,
            elapsed,
            if self.interrupted { " - interrupted" } else { "" }
        )?;
        writeln!(
            f,
            "  completed: {}  failed: {}  interrupted: {}  blocked: {}  skipped: {}  pending: {}",
            self.completed_count(),
            self.failed_count(),
            self.interrupted_count(),
            self.blocked_count(),
            self.skipped_count(),
            self.pending_count()
        )?;
        writeln!(f, "  failure rate: {:.1}%", self.failure_rate() * 100.0)?;

        for (id, outcome) in &self.outcomes {
            match outcome {
                ItemOutcome::Failed { reason } => writeln!(f, "  failed  {}: {}", id, reason)?,
                ItemOutcome::Interrupted => writeln!(f, "  interrupted  {}", id)?,
                _ => {}
            }
        }

        for cycle in &self.cycles {
            writeln!(f, "  cycle: {}", cycle.join(" -> "))?;
        }
        for item in &self.blocked {
            writeln!(
                f,
                "  blocked  {} waiting on [{}]{}",
                item.id,
                item.unmet.join(", "),
                if item.in_cycle { " (dependency cycle)" } else { "" }
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlannedWorkspace {
    pub item_id: String,
    pub branch: String,
    pub path: PathBuf,
}

/// What a run would do, computed without touching any workspace or branch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationPlan {
    pub integration_branch: String,
    /// Dependency layering of the whole backlog
    pub waves: Vec<Vec<String>>,
    /// Remaining work, split for file contention
    pub refined_waves: Vec<Vec<String>>,
    pub cycles: Vec<Vec<String>>,
    pub blocked: Vec<BlockedItem>,
    pub skipped: Vec<String>,
    pub already_completed: Vec<String>,
    pub pending_merges: Vec<String>,
    pub workspaces: Vec<PlannedWorkspace>,
    pub orphans: Vec<OrphanWorkspace>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureReason;

    fn summary(outcomes: &[(&str, ItemOutcome)], interrupted: bool) -> RunSummary {
        RunSummary {
            execution_id: "run".to_string(),
            integration_branch: "main".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcomes: outcomes
                .iter()
                .map(|(id, o)| (id.to_string(), o.clone()))
                .collect(),
            total_items: outcomes.len() + 1,
            blocked: vec![],
            cycles: vec![],
            interrupted,
            strategy_switches: 0,
        }
    }

    #[test]
    fn test_failure_rate_ignores_interrupted() {
        let s = summary(
            &[
                ("A", ItemOutcome::Completed),
                ("B", ItemOutcome::Failed { reason: FailureReason::Timeout }),
                ("C", ItemOutcome::Interrupted),
                ("D", ItemOutcome::Interrupted),
            ],
            true,
        );
        assert_eq!(s.failure_rate(), 0.5);
        assert_eq!(s.interrupted_count(), 2);
        assert_eq!(s.pending_count(), 1);
        assert_eq!(s.exit_code(), EXIT_INTERRUPTED);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(summary(&[("A", ItemOutcome::Completed)], false).exit_code(), EXIT_OK);
        assert_eq!(
            summary(&[("A", ItemOutcome::Blocked { unmet: vec!["B".into()] })], false).exit_code(),
            EXIT_FAILURES
        );
    }

    #[test]
    fn test_display_lists_failures_and_blocked() {
        let mut s = summary(
            &[(
                "B",
                ItemOutcome::Failed {
                    reason: FailureReason::MergeConflict { files: vec!["x".into()] },
                },
            )],
            false,
        );
        s.blocked.push(BlockedItem {
            id: "C".into(),
            unmet: vec!["B".into()],
            in_cycle: false,
        });

        let text = s.to_string();
        assert!(text.contains("failed  B: merge_conflict (x)"));
        assert!(text.contains("blocked  C waiting on [B]"));
    }
}
