//! Merge coordination
//!
//! Finished work is integrated one request at a time, in arrival order. Each
//! attempt holds the integration lock; backoff between retries does not.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::models::FailureReason;
use crate::parallel::workspace::Workspace;
use crate::parallel::IntegrationLock;
use crate::utils::lock_mutex_recover;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Rebase onto the integration head, then fast-forward
    #[default]
    Rebase,
    /// Merge commit straight into the integration branch
    Merge,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    #[default]
    Queued,
    Pulling,
    Merging,
    Retry,
    Merged,
    Failed,
}

impl fmt::Display for MergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MergeState::Queued => "queued",
            MergeState::Pulling => "pulling",
            MergeState::Merging => "merging",
            MergeState::Retry => "retry",
            MergeState::Merged => "merged",
            MergeState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid merge transition from {from} to {to}")]
pub struct MergeTransitionError {
    pub from: MergeState,
    pub to: MergeState,
}

impl MergeState {
    pub fn can_transition(self, to: MergeState) -> bool {
        use MergeState::*;
        matches!(
            (self, to),
            (Queued, Pulling)
                | (Queued, Merging)
                | (Pulling, Merging)
                | (Pulling, Retry)
                | (Pulling, Failed)
                | (Merging, Merged)
                | (Merging, Retry)
                | (Merging, Failed)
                | (Retry, Pulling)
                | (Retry, Merging)
                | (Retry, Failed)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(self, MergeState::Merged | MergeState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub item_id: String,
    pub source_ref: String,
    pub target_ref: String,
    pub retry_count: u32,
    pub strategy: MergeStrategy,
    pub state: MergeState,
    pub last_conflict_commit: Option<String>,
    pub workspace: Workspace,
}

impl MergeRequest {
    pub fn new(workspace: Workspace, target_ref: &str) -> Self {
        Self {
            item_id: workspace.item_id.clone(),
            source_ref: workspace.branch.clone(),
            target_ref: target_ref.to_string(),
            retry_count: 0,
            strategy: MergeStrategy::default(),
            state: MergeState::Queued,
            last_conflict_commit: None,
            workspace,
        }
    }

    /// Fresh attempt budget, keeping what was learned about conflicts
    pub fn requeue(mut self) -> Self {
        self.retry_count = 0;
        self.state = MergeState::Queued;
        self
    }

    pub fn transition(&mut self, to: MergeState) -> Result<(), MergeTransitionError> {
        if !self.state.can_transition(to) {
            return Err(MergeTransitionError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// Bounded retries with exponential backoff and jitter
#[derive(Debug, Clone)]
pub struct MergeRetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl MergeRetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            max_backoff: Duration::from_secs(30),
        }
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let delay = self
            .base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);

        let jitter_ms = (self.base_backoff.as_millis() / 2) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Counts rebase conflicts per source commit across all merges of a run
#[derive(Debug, Default)]
pub struct ConflictTracker {
    threshold: u32,
    counts: HashMap<String, u32>,
    switched: HashSet<String>,
}

impl ConflictTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            ..Default::default()
        }
    }

    /// Returns the conflict count for `commit` after recording this one
    pub fn record(&mut self, commit: &str) -> u32 {
        let count = self.counts.entry(commit.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn prefers_merge(&self, commit: &str) -> bool {
        self.counts.get(commit).copied().unwrap_or(0) >= self.threshold
    }

    /// True only the first time a switch is announced for `commit`
    pub fn announce_switch(&mut self, commit: &str) -> bool {
        self.switched.insert(commit.to_string())
    }

    pub fn switch_count(&self) -> usize {
        self.switched.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    UpToDate,
    Synced,
    Conflict { commit: String, files: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrateOutcome {
    Merged { commit: Option<String> },
    Conflict { files: Vec<String> },
}

/// VCS side of a merge. Callers hold the integration lock.
pub trait MergeBackend: Send + Sync {
    /// Bring the source up to date with the target (rebase)
    fn sync(&self, request: &MergeRequest) -> Result<SyncOutcome, String>;

    /// Integrate the source into the target; a conflicting merge must be
    /// aborted before returning
    fn integrate(&self, request: &MergeRequest) -> Result<IntegrateOutcome, String>;
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Transition(#[from] MergeTransitionError),

    #[error("{0}")]
    Backend(String),
}

enum Attempt {
    Merged { commit: Option<String> },
    Conflict { files: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { commit: Option<String> },
    Failed { reason: FailureReason },
}

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub item_id: String,
    pub outcome: MergeOutcome,
    pub request: MergeRequest,
}

/// Runs merge requests to completion. Shared between the coordinator's
/// queue and sequential retries.
pub struct MergeRunner {
    backend: Arc<dyn MergeBackend>,
    lock: IntegrationLock,
    policy: MergeRetryPolicy,
    tracker: Mutex<ConflictTracker>,
}

impl MergeRunner {
    pub fn new(
        backend: Arc<dyn MergeBackend>,
        lock: IntegrationLock,
        policy: MergeRetryPolicy,
        rebase_conflict_threshold: u32,
    ) -> Self {
        Self {
            backend,
            lock,
            policy,
            tracker: Mutex::new(ConflictTracker::new(rebase_conflict_threshold)),
        }
    }

    pub fn strategy_switches(&self) -> usize {
        lock_mutex_recover(&self.tracker).switch_count()
    }

    /// Attempt `request` until it merges or its retries run out. Blocks.
    pub fn execute(&self, mut request: MergeRequest) -> MergeReport {
        loop {
            let attempt = {
                let _guard = lock_mutex_recover(&self.lock);
                self.attempt(&mut request)
            };

            let outcome = match attempt {
                Ok(Attempt::Merged { commit }) => {
                    log::info!(
                        "[MergeCoordinator] Merged {} into {} ({} retries)",
                        request.item_id,
                        request.target_ref,
                        request.retry_count
                    );
                    MergeOutcome::Merged { commit }
                }
                Ok(Attempt::Conflict { files }) => {
                    if self.policy.should_retry(request.retry_count) {
                        request.retry_count += 1;
                        let delay = self.policy.backoff(request.retry_count);
                        log::info!(
                            "[MergeCoordinator] Conflict merging {} (attempt {}), retrying in {:?} with {:?}",
                            request.item_id,
                            request.retry_count,
                            delay,
                            request.strategy
                        );
                        thread::sleep(delay);
                        continue;
                    }

                    log::warn!(
                        "[MergeCoordinator] Giving up on {} after {} retries; conflicting files: {:?}",
                        request.item_id,
                        request.retry_count,
                        files
                    );
                    request.state = MergeState::Failed;
                    MergeOutcome::Failed {
                        reason: FailureReason::MergeConflict { files },
                    }
                }
                Err(e) => {
                    log::error!("[MergeCoordinator] Merge of {} failed: {}", request.item_id, e);
                    request.state = MergeState::Failed;
                    MergeOutcome::Failed {
                        reason: FailureReason::Merge {
                            message: e.to_string(),
                        },
                    }
                }
            };

            return MergeReport {
                item_id: request.item_id.clone(),
                outcome,
                request,
            };
        }
    }

    fn attempt(&self, request: &mut MergeRequest) -> Result<Attempt, AttemptError> {
        if let Some(commit) = &request.last_conflict_commit {
            if lock_mutex_recover(&self.tracker).prefers_merge(commit) {
                request.strategy = MergeStrategy::Merge;
            }
        }

        if request.strategy == MergeStrategy::Rebase {
            request.transition(MergeState::Pulling)?;
            let synced = self.backend.sync(request).map_err(AttemptError::Backend)?;
            if let SyncOutcome::Conflict { commit, files } = synced {
                self.record_rebase_conflict(request, &commit);
                request.last_conflict_commit = Some(commit);
                request.transition(MergeState::Retry)?;
                return Ok(Attempt::Conflict { files });
            }
        }

        request.transition(MergeState::Merging)?;
        match self.backend.integrate(request).map_err(AttemptError::Backend)? {
            IntegrateOutcome::Merged { commit } => {
                request.transition(MergeState::Merged)?;
                Ok(Attempt::Merged { commit })
            }
            IntegrateOutcome::Conflict { files } => {
                request.transition(MergeState::Retry)?;
                Ok(Attempt::Conflict { files })
            }
        }
    }

    fn record_rebase_conflict(&self, request: &mut MergeRequest, commit: &str) {
        let mut tracker = lock_mutex_recover(&self.tracker);
        let count = tracker.record(commit);
        if tracker.prefers_merge(commit) {
            request.strategy = MergeStrategy::Merge;
            if tracker.announce_switch(commit) {
                log::info!(
                    "[MergeCoordinator] Commit {} conflicted on rebase {} time(s); switching {} to merge strategy",
                    commit,
                    count,
                    request.item_id
                );
            }
        }
    }
}

struct ActiveMerge {
    item_id: String,
    handle: JoinHandle<MergeReport>,
}

/// FIFO queue of merge requests with at most one job in flight
pub struct MergeCoordinator {
    runner: Arc<MergeRunner>,
    queue: VecDeque<MergeRequest>,
    active: Option<ActiveMerge>,
    snapshot: Option<MergeRequest>,
    halted: bool,
}

impl MergeCoordinator {
    pub fn new(runner: MergeRunner) -> Self {
        Self {
            runner: Arc::new(runner),
            queue: VecDeque::new(),
            active: None,
            snapshot: None,
            halted: false,
        }
    }

    /// Let the active job finish but start no new ones
    pub fn halt(&mut self) {
        if !self.halted && !self.queue.is_empty() {
            log::info!(
                "[MergeCoordinator] Halting with {} merge(s) still queued",
                self.queue.len()
            );
        }
        self.halted = true;
    }

    pub fn has_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn runner(&self) -> Arc<MergeRunner> {
        Arc::clone(&self.runner)
    }

    pub fn enqueue(&mut self, mut request: MergeRequest) {
        if request.state.is_final() {
            request = request.requeue();
        }
        log::info!(
            "[MergeCoordinator] Queued {} ({} ahead)",
            request.item_id,
            self.queue.len() + usize::from(self.active.is_some())
        );
        self.queue.push_back(request);
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len() + usize::from(self.active.is_some())
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.active.as_ref().is_some_and(|a| a.item_id == item_id)
            || self.queue.iter().any(|r| r.item_id == item_id)
    }

    /// Requests not yet merged, active one first, as they were queued
    pub fn pending_requests(&self) -> Vec<MergeRequest> {
        self.snapshot
            .iter()
            .cloned()
            .chain(self.queue.iter().cloned())
            .collect()
    }

    /// Collect the finished job, if any, and start the next one.
    /// Starting requires a tokio runtime.
    pub async fn poll(&mut self) -> Vec<MergeReport> {
        let mut reports = Vec::new();

        if self.active.as_ref().is_some_and(|a| a.handle.is_finished()) {
            if let Some(active) = self.active.take() {
                let request = self.snapshot.take();
                match active.handle.await {
                    Ok(report) => reports.push(report),
                    Err(e) => {
                        log::error!("[MergeCoordinator] Merge job for {} panicked: {}", active.item_id, e);
                        if let Some(request) = request {
                            reports.push(MergeReport {
                                item_id: active.item_id,
                                outcome: MergeOutcome::Failed {
                                    reason: FailureReason::Merge {
                                        message: format!("merge job panicked: {}", e),
                                    },
                                },
                                request,
                            });
                        }
                    }
                }
            }
        }

        self.start_next();
        reports
    }

    fn start_next(&mut self) {
        if self.active.is_some() || self.halted {
            return;
        }
        let Some(request) = self.queue.pop_front() else {
            return;
        };

        let runner = Arc::clone(&self.runner);
        let item_id = request.item_id.clone();
        self.snapshot = Some(request.clone());
        let handle = tokio::task::spawn_blocking(move || runner.execute(request));
        self.active = Some(ActiveMerge { item_id, handle });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::workspace::testing::workspace_for;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted backend: each item gets a list of sync and integrate results,
    /// consumed in order; once exhausted the last one repeats
    #[derive(Default)]
    struct ScriptedBackend {
        syncs: Mutex<HashMap<String, VecDeque<SyncOutcome>>>,
        integrates: Mutex<HashMap<String, VecDeque<IntegrateOutcome>>>,
        calls: Mutex<Vec<(String, &'static str, MergeStrategy)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedBackend {
        fn script_sync(&self, id: &str, outcomes: Vec<SyncOutcome>) {
            self.syncs.lock().unwrap().insert(id.to_string(), outcomes.into());
        }

        fn script_integrate(&self, id: &str, outcomes: Vec<IntegrateOutcome>) {
            self.integrates.lock().unwrap().insert(id.to_string(), outcomes.into());
        }

        fn next<T: Clone>(map: &Mutex<HashMap<String, VecDeque<T>>>, id: &str, fallback: T) -> T {
            let mut map = map.lock().unwrap();
            match map.get_mut(id) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
                Some(queue) => queue.front().cloned().unwrap_or(fallback),
                None => fallback,
            }
        }

        fn enter(&self, request: &MergeRequest, op: &'static str) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap()
                .push((request.item_id.clone(), op, request.strategy));
            thread::sleep(self.delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        fn integrate_order(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, op, _)| *op == "integrate")
                .map(|(id, _, _)| id.clone())
                .collect()
        }
    }

    impl MergeBackend for ScriptedBackend {
        fn sync(&self, request: &MergeRequest) -> Result<SyncOutcome, String> {
            self.enter(request, "sync");
            Ok(Self::next(&self.syncs, &request.item_id, SyncOutcome::Synced))
        }

        fn integrate(&self, request: &MergeRequest) -> Result<IntegrateOutcome, String> {
            self.enter(request, "integrate");
            Ok(Self::next(
                &self.integrates,
                &request.item_id,
                IntegrateOutcome::Merged { commit: None },
            ))
        }
    }

    fn runner(backend: Arc<ScriptedBackend>, max_retries: u32, threshold: u32) -> MergeRunner {
        MergeRunner::new(
            backend,
            Arc::new(Mutex::new(())),
            MergeRetryPolicy::new(max_retries, Duration::from_millis(1)),
            threshold,
        )
    }

    fn request(id: &str) -> MergeRequest {
        MergeRequest::new(workspace_for(id), "main")
    }

    fn conflict(commit: &str) -> SyncOutcome {
        SyncOutcome::Conflict {
            commit: commit.to_string(),
            files: vec!["x".to_string()],
        }
    }

    #[test]
    fn test_state_machine_transitions() {
        let mut req = request("A");
        assert!(req.transition(MergeState::Merged).is_err());
        req.transition(MergeState::Pulling).unwrap();
        req.transition(MergeState::Retry).unwrap();
        req.transition(MergeState::Merging).unwrap();
        req.transition(MergeState::Merged).unwrap();
        assert!(req.state.is_final());

        let err = req.transition(MergeState::Merging).unwrap_err();
        assert_eq!(
            err,
            MergeTransitionError {
                from: MergeState::Merged,
                to: MergeState::Merging
            }
        );
    }

    #[test]
    fn test_clean_merge() {
        let backend = Arc::new(ScriptedBackend::default());
        let report = runner(backend.clone(), 3, 1).execute(request("A"));

        assert_eq!(report.outcome, MergeOutcome::Merged { commit: None });
        assert_eq!(report.request.state, MergeState::Merged);
        assert_eq!(report.request.retry_count, 0);
    }

    #[test]
    fn test_rebase_conflict_falls_back_to_merge() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.script_sync("B", vec![conflict("c1")]);
        let runner = runner(backend.clone(), 3, 1);

        let report = runner.execute(request("B"));

        assert_eq!(report.outcome, MergeOutcome::Merged { commit: None });
        assert_eq!(report.request.strategy, MergeStrategy::Merge);
        assert_eq!(report.request.retry_count, 1);
        assert_eq!(report.request.last_conflict_commit.as_deref(), Some("c1"));
        let calls = backend.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("B".to_string(), "sync", MergeStrategy::Rebase),
                ("B".to_string(), "integrate", MergeStrategy::Merge),
            ]
        );
    }

    #[test]
    fn test_strategy_switch_waits_for_threshold_and_is_announced_once() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.script_sync("B", vec![conflict("c1")]);
        backend.script_sync("C", vec![conflict("c1")]);
        let runner = runner(backend.clone(), 5, 2);

        let report = runner.execute(request("B"));
        assert_eq!(report.outcome, MergeOutcome::Merged { commit: None });
        assert_eq!(report.request.retry_count, 2);
        assert_eq!(runner.strategy_switches(), 1);

        // A later request hitting the same commit goes straight to merge
        let mut later = request("C");
        later.last_conflict_commit = Some("c1".to_string());
        let report = runner.execute(later);
        assert_eq!(report.request.retry_count, 0);
        assert_eq!(report.request.strategy, MergeStrategy::Merge);
        assert_eq!(runner.strategy_switches(), 1);
    }

    #[test]
    fn test_retries_are_bounded() {
        for max_retries in 0..4 {
            let backend = Arc::new(ScriptedBackend::default());
            backend.script_integrate(
                "A",
                vec![IntegrateOutcome::Conflict {
                    files: vec!["src/lib.rs".to_string()],
                }],
            );

            let report = runner(backend.clone(), max_retries, 1).execute(request("A"));

            assert_eq!(
                report.outcome,
                MergeOutcome::Failed {
                    reason: FailureReason::MergeConflict {
                        files: vec!["src/lib.rs".to_string()]
                    }
                }
            );
            assert_eq!(report.request.retry_count, max_retries);
            assert_eq!(report.request.state, MergeState::Failed);
            assert_eq!(backend.integrate_order().len() as u32, max_retries + 1);
        }
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = MergeRetryPolicy {
            max_retries: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let third = policy.backoff(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(450));
        assert!(policy.backoff(10) <= Duration::from_millis(550));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn test_only_one_merge_at_a_time() {
        let backend = Arc::new(ScriptedBackend {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let runner = Arc::new(runner(backend.clone(), 1, 1));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let runner = Arc::clone(&runner);
                thread::spawn(move || runner.execute(request(&format!("item-{}", i))))
            })
            .collect();
        for handle in handles {
            let report = handle.join().unwrap();
            assert!(matches!(report.outcome, MergeOutcome::Merged { .. }));
        }

        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(backend.integrate_order().len(), 6);
    }

    #[tokio::test]
    async fn test_coordinator_merges_in_arrival_order() {
        let backend = Arc::new(ScriptedBackend::default());
        let mut coordinator = MergeCoordinator::new(runner(backend.clone(), 1, 1));

        for id in ["C", "A", "B"] {
            coordinator.enqueue(request(id));
        }
        assert_eq!(coordinator.pending_count(), 3);

        let mut merged = Vec::new();
        while !coordinator.is_idle() {
            for report in coordinator.poll().await {
                merged.push(report.item_id);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(merged, vec!["C", "A", "B"]);
        assert_eq!(backend.integrate_order(), vec!["C", "A", "B"]);
    }

    #[tokio::test]
    async fn test_pending_requests_include_active() {
        let backend = Arc::new(ScriptedBackend {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let mut coordinator = MergeCoordinator::new(runner(backend, 1, 1));
        coordinator.enqueue(request("A"));
        coordinator.enqueue(request("B"));

        let reports = coordinator.poll().await;
        assert!(reports.is_empty());
        assert!(coordinator.contains("A"));

        let pending: Vec<String> = coordinator
            .pending_requests()
            .into_iter()
            .map(|r| r.item_id)
            .collect();
        assert_eq!(pending, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_halt_keeps_queue() {
        let backend = Arc::new(ScriptedBackend::default());
        let mut coordinator = MergeCoordinator::new(runner(backend.clone(), 1, 1));
        coordinator.enqueue(request("A"));
        coordinator.halt();

        coordinator.poll().await;
        assert!(!coordinator.has_active());
        assert_eq!(coordinator.pending_count(), 1);
        assert!(backend.integrate_order().is_empty());
    }
}
