//! Parallel Orchestrator
//!
//! Drives one run: plans waves from the dependency graph, dispatches ready
//! items to the worker pool, feeds verified work to the merge coordinator and
//! unblocks dependents as merges land. The loop is single-threaded and polls;
//! blocking work happens on the worker and merge jobs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;

use crate::backlog::BacklogSource;
use crate::config::{OrchestratorConfig, PendingWorkDisposition};
use crate::context::RunContext;
use crate::error::OrchestratorError;
use crate::events::{CompletionEvent, CompletionSink, LogSink};
use crate::file_storage::init_parallel_dir;
use crate::git::GitManager;
use crate::models::state_machine::{is_active_state, is_terminal_state, transition_state};
use crate::models::{BlockedItem, FailureReason, ItemOutcome, ItemStatus, WorkItem};
use crate::parallel::contention::{footprints_overlap, refine_waves_for_contention};
use crate::parallel::executor::{CommandExecutor, TaskExecutor};
use crate::parallel::git_merge::GitMergeBackend;
use crate::parallel::git_workspace::GitWorktreeBackend;
use crate::parallel::graph::DependencyGraph;
use crate::parallel::merge::{
    MergeBackend, MergeCoordinator, MergeOutcome, MergeReport, MergeRequest, MergeRetryPolicy,
    MergeRunner,
};
use crate::parallel::pool::{WorkerContext, WorkerOutcome, WorkerPool, WorkerReport};
use crate::parallel::queue::{ItemFilter, ReadyQueue};
use crate::parallel::state::{Checkpointer, PendingMerge, RunLock, RunState, RunStateStore};
use crate::parallel::summary::{PlannedWorkspace, RunSummary, SimulationPlan};
use crate::parallel::verify::VerificationChain;
use crate::parallel::workspace::{Workspace, WorkspaceBackend, WorkspaceManager};
use crate::parallel::IntegrationLock;
use crate::shutdown::ShutdownPhase;

/// Pluggable collaborators of a run
pub struct Components {
    pub integration_branch: String,
    pub lock: IntegrationLock,
    pub workspaces: Arc<dyn WorkspaceBackend>,
    pub executor: Arc<dyn TaskExecutor>,
    pub merges: Arc<dyn MergeBackend>,
    pub sink: Arc<dyn CompletionSink>,
}

impl Components {
    /// Git worktrees, the configured executor command and git merges
    pub fn git(config: &OrchestratorConfig, project_path: &Path) -> Result<Self, OrchestratorError> {
        let git = GitManager::new(project_path)?;
        let integration_branch = match &config.integration_branch {
            Some(branch) => {
                if !git.branch_exists(branch) {
                    return Err(OrchestratorError::Config(format!(
                        "Integration branch '{}' does not exist",
                        branch
                    )));
                }
                branch.clone()
            }
            None => match git.get_current_branch() {
                Ok(branch) => branch.name,
                Err(e) => {
                    let fallback = git.get_default_branch_name();
                    log::warn!(
                        "[Orchestrator] Cannot read the current branch ({}), integrating into {}",
                        e,
                        fallback
                    );
                    fallback
                }
            },
        };

        let lock: IntegrationLock = Arc::new(Mutex::new(()));
        Ok(Self {
            workspaces: Arc::new(GitWorktreeBackend::new(
                project_path,
                &integration_branch,
                config,
                Arc::clone(&lock),
            )),
            executor: Arc::new(CommandExecutor::new(config.executor.clone())),
            merges: Arc::new(GitMergeBackend::new(project_path)),
            sink: Arc::new(LogSink),
            integration_branch,
            lock,
        })
    }
}

pub struct Orchestrator {
    ctx: RunContext,
    items: Vec<WorkItem>,
    components: Components,
}

impl Orchestrator {
    pub fn new(ctx: RunContext, backlog: &dyn BacklogSource) -> Result<Self, OrchestratorError> {
        ctx.config.validate().map_err(OrchestratorError::Config)?;
        let items = backlog
            .load()
            .map_err(|e| OrchestratorError::Backlog(format!("{:#}", e)))?;
        let components = Components::git(&ctx.config, &ctx.project_path)?;
        Ok(Self::with_components(ctx, items, components))
    }

    pub fn with_components(ctx: RunContext, items: Vec<WorkItem>, components: Components) -> Self {
        Self {
            ctx,
            items,
            components,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn CompletionSink>) -> Self {
        self.components.sink = sink;
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn integration_branch(&self) -> &str {
        &self.components.integration_branch
    }

    fn filter(&self) -> ItemFilter {
        ItemFilter::new(
            self.ctx.config.include.iter().cloned(),
            self.ctx.config.exclude.iter().cloned(),
        )
    }

    /// Plan without mutating any workspace, branch or state file
    pub fn simulate(&self) -> Result<SimulationPlan, OrchestratorError> {
        let graph = DependencyGraph::build(&self.items);
        let filter = self.filter();

        let resumed = if self.ctx.config.resume {
            RunStateStore::new(&self.ctx.project_path).load()?
        } else {
            None
        };

        let mut completed: HashSet<String> = self
            .items
            .iter()
            .filter(|item| item.status == ItemStatus::Completed)
            .map(|item| item.id.clone())
            .collect();
        let mut settled = completed.clone();
        let mut pending_merges = Vec::new();
        if let Some(state) = &resumed {
            completed.extend(state.completed.iter().cloned());
            settled.extend(state.completed.iter().cloned());
            settled.extend(state.failed.keys().cloned());
            pending_merges = state.pending_merges.iter().map(|m| m.item_id.clone()).collect();
        }

        let waves = graph.get_execution_waves();
        let remaining: Vec<Vec<String>> = waves
            .iter()
            .map(|wave| {
                wave.iter()
                    .filter(|id| filter.allows(id) && !settled.contains(*id))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|wave| !wave.is_empty())
            .collect();
        let refined_waves = refine_waves_for_contention(&remaining, &file_hints(&self.items));

        let by_id: HashMap<&str, &WorkItem> =
            self.items.iter().map(|item| (item.id.as_str(), item)).collect();
        let workspaces = refined_waves
            .iter()
            .flatten()
            .filter_map(|id| by_id.get(id.as_str()))
            .map(|item| {
                let preview = self.components.workspaces.preview(item);
                PlannedWorkspace {
                    item_id: item.id.clone(),
                    branch: preview.branch,
                    path: preview.path,
                }
            })
            .collect();

        let manager = WorkspaceManager::new(Arc::clone(&self.components.workspaces));
        let known: HashSet<String> = resumed
            .as_ref()
            .map(|s| {
                s.in_progress
                    .iter()
                    .cloned()
                    .chain(s.pending_merges.iter().map(|m| m.item_id.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let orphans = manager.scan_orphans(&known).unwrap_or_else(|e| {
            log::warn!("[Orchestrator] Orphan scan failed: {}", e);
            Vec::new()
        });

        Ok(SimulationPlan {
            integration_branch: self.components.integration_branch.clone(),
            waves,
            refined_waves,
            cycles: graph.detect_cycles(),
            blocked: graph.permanently_blocked(&completed),
            skipped: self
                .items
                .iter()
                .filter(|item| !filter.allows(&item.id))
                .map(|item| item.id.clone())
                .collect(),
            already_completed: completed.into_iter().collect::<BTreeSet<_>>().into_iter().collect(),
            pending_merges,
            workspaces,
            orphans,
        })
    }

    /// Execute the backlog until it drains or shutdown is requested
    pub async fn run(&self) -> Result<RunSummary, OrchestratorError> {
        let run_lock = RunLock::acquire(&self.ctx.project_path)?;
        init_parallel_dir(&self.ctx.project_path).map_err(OrchestratorError::Storage)?;

        log::info!(
            "[Orchestrator] Starting run {} (lock {:?}) on {} with {} item(s), max {} worker(s)",
            self.ctx.execution_id,
            run_lock.path(),
            self.components.integration_branch,
            self.items.len(),
            self.ctx.config.max_workers
        );

        let mut run = RunLoop::start(self)?;
        run.drive().await?;
        let summary = run.finish();
        drop(run_lock);
        summary
    }
}

/// Hint map used for contention checks
fn file_hints(items: &[WorkItem]) -> HashMap<String, Vec<String>> {
    items
        .iter()
        .map(|item| (item.id.clone(), item.file_hints.clone()))
        .collect()
}

/// Mutable state of one run
struct RunLoop<'a> {
    orch: &'a Orchestrator,
    config: &'a OrchestratorConfig,
    graph: DependencyGraph,
    items: BTreeMap<String, WorkItem>,
    hints: HashMap<String, Vec<String>>,
    queue: ReadyQueue,
    pool: WorkerPool,
    merges: MergeCoordinator,
    workspaces: WorkspaceManager,
    store: RunStateStore,
    state: RunState,
    checkpointer: Checkpointer,
    completed: HashSet<String>,
    outcomes: BTreeMap<String, ItemOutcome>,
    cycles: Vec<Vec<String>>,
    /// Members of the current wave that have not settled yet
    wave: BTreeSet<String>,
    wave_number: usize,
    /// Critical items dispatched under sequential-first that have not settled
    critical: BTreeSet<String>,
    /// Merge-conflict failures of the current wave, retried one at a time
    escalations: Vec<MergeRequest>,
    drain_started: Option<Instant>,
    drain_expired: bool,
    forced: bool,
}

impl<'a> RunLoop<'a> {
    fn start(orch: &'a Orchestrator) -> Result<Self, OrchestratorError> {
        let ctx = &orch.ctx;
        let config = &ctx.config;
        let components = &orch.components;

        let graph = DependencyGraph::build(&orch.items);
        let cycles = if graph.has_cycles() {
            graph.detect_cycles()
        } else {
            Vec::new()
        };
        for cycle in &cycles {
            log::warn!(
                "[Orchestrator] Dependency cycle: {} (these items will not run)",
                cycle.join(" -> ")
            );
        }
        log::info!(
            "[Orchestrator] Planned {} dependency wave(s)",
            graph.get_execution_waves().len()
        );

        let store = RunStateStore::new(&ctx.project_path);
        let resumed = if config.resume { store.load()? } else { None };

        let verifier =
            VerificationChain::standard(&config.executor, Arc::clone(&components.workspaces));
        let pool = WorkerPool::new(
            config.max_workers,
            WorkerContext {
                backend: Arc::clone(&components.workspaces),
                executor: Arc::clone(&components.executor),
                verifier: Arc::new(verifier),
                timeout: config.timeout_per_item(),
                kill_grace: config.kill_grace(),
                log_dir: ctx.log_dir(),
            },
        );
        let merges = MergeCoordinator::new(MergeRunner::new(
            Arc::clone(&components.merges),
            Arc::clone(&components.lock),
            MergeRetryPolicy::new(config.max_merge_retries, config.merge_backoff()),
            config.rebase_conflict_threshold,
        ));

        let mut run = Self {
            orch,
            config,
            // Backlog statuses other than completed carry no meaning for a new run
            items: orch
                .items
                .iter()
                .map(|item| {
                    let mut item = item.clone();
                    if item.status != ItemStatus::Completed {
                        item.status = ItemStatus::Pending;
                    }
                    (item.id.clone(), item)
                })
                .collect(),
            hints: file_hints(&orch.items),
            graph,
            queue: ReadyQueue::new(orch.filter()),
            pool,
            merges,
            workspaces: WorkspaceManager::new(Arc::clone(&components.workspaces)),
            store,
            state: RunState::new(&ctx.execution_id),
            checkpointer: Checkpointer::new(config.state_save_interval()),
            completed: HashSet::new(),
            outcomes: BTreeMap::new(),
            cycles,
            wave: BTreeSet::new(),
            wave_number: 0,
            critical: BTreeSet::new(),
            escalations: Vec::new(),
            drain_started: None,
            drain_expired: false,
            forced: false,
        };

        for item in &orch.items {
            if item.status == ItemStatus::Completed {
                run.completed.insert(item.id.clone());
                run.outcomes.insert(item.id.clone(), ItemOutcome::Completed);
            } else if !run.queue.allows(&item.id) {
                run.outcomes.insert(item.id.clone(), ItemOutcome::Skipped);
            }
        }

        let known = match resumed {
            Some(previous) => run.restore(previous),
            None => HashSet::new(),
        };

        run.resolve_orphans(&known)?;
        run.checkpointer.mark_dirty();
        Ok(run)
    }

    /// Carry settled items and pending merges over from an earlier run.
    /// Returns the ids whose workspaces are already accounted for.
    fn restore(&mut self, previous: RunState) -> HashSet<String> {
        let mut known = HashSet::new();
        // An item recorded as running and as settled was settled last
        let interrupted: Vec<String> = previous
            .in_progress
            .iter()
            .filter(|id| !previous.is_settled(id))
            .cloned()
            .collect();

        for id in &previous.completed {
            self.completed.insert(id.clone());
            if let Some(item) = self.items.get_mut(id) {
                item.status = ItemStatus::Completed;
                self.outcomes.insert(id.clone(), ItemOutcome::Completed);
            }
        }
        for (id, reason) in &previous.failed {
            if let Some(item) = self.items.get_mut(id) {
                if is_terminal_state(item.status) {
                    continue;
                }
                item.status = ItemStatus::Failed;
                self.outcomes
                    .insert(id.clone(), ItemOutcome::Failed { reason: reason.clone() });
            }
        }
        self.state.completed = previous.completed;
        self.state.failed = previous.failed;

        // Interrupted items start over as pending, in their old workspace
        for id in interrupted {
            log::info!("[Orchestrator] {} was interrupted last run, returning to pending", id);
            self.workspaces.mark_reuse(&id);
            known.insert(id);
        }

        for pending in previous.pending_merges {
            known.insert(pending.item_id.clone());
            if self.completed.contains(&pending.item_id) {
                continue;
            }
            self.set_status(&pending.item_id, ItemStatus::InProgress);
            self.merges
                .enqueue(pending.into_request(&self.orch.components.integration_branch));
        }

        known
    }

    fn resolve_orphans(&mut self, known: &HashSet<String>) -> Result<(), OrchestratorError> {
        let orphans = self.workspaces.scan_orphans(known)?;
        if orphans.is_empty() {
            return Ok(());
        }

        let Some(disposition) = self.config.pending_work else {
            return Err(OrchestratorError::UnresolvedOrphans {
                items: orphans.iter().map(|o| o.workspace.item_id.clone()).collect(),
            });
        };

        // Leftover branches of items this run will never merge are dropped
        let (stray, orphans): (Vec<_>, Vec<_>) = orphans.into_iter().partition(|o| {
            let id = &o.workspace.item_id;
            disposition == PendingWorkDisposition::AttemptMerge
                && (!self.items.contains_key(id) || self.completed.contains(id))
        });
        if !stray.is_empty() {
            log::info!(
                "[Orchestrator] Discarding {} leftover workspace(s) with nothing left to merge",
                stray.len()
            );
            let report = self
                .workspaces
                .apply_disposition(stray, PendingWorkDisposition::CleanAndDiscard);
            for (id, message) in report.failed {
                log::warn!("[Orchestrator] Leftover workspace of {} stays behind: {}", id, message);
            }
        }

        let report = self.workspaces.apply_disposition(orphans, disposition);
        for (id, message) in report.failed {
            // An item whose leftover workspace is in limbo must not get a fresh one
            if self.items.contains_key(&id) && !self.outcomes.contains_key(&id) {
                self.record_failure(&id, FailureReason::Workspace { message }, true);
            }
        }
        for workspace in report.to_merge {
            let id = workspace.item_id.clone();
            if self.merges.contains(&id) {
                continue;
            }
            self.outcomes.remove(&id);
            self.set_status(&id, ItemStatus::InProgress);
            self.merges.enqueue(MergeRequest::new(
                workspace,
                &self.orch.components.integration_branch,
            ));
        }
        Ok(())
    }

    async fn drive(&mut self) -> Result<(), OrchestratorError> {
        let poll_interval = self.config.poll_interval();

        loop {
            for report in self.pool.poll().await {
                self.on_worker_report(report);
            }
            for report in self.merges.poll().await {
                self.on_merge_report(report);
            }

            let phase = self.orch.ctx.shutdown.phase();
            if phase == ShutdownPhase::Running {
                if self.queue.is_empty() && self.pool.is_idle() && self.merges.is_idle() {
                    self.escalate().await;
                    if self.orch.ctx.shutdown.phase() == ShutdownPhase::Running
                        && self.queue.is_empty()
                        && !self.plan_next_wave()
                    {
                        break;
                    }
                }
                if self.orch.ctx.shutdown.phase() == ShutdownPhase::Running {
                    self.dispatch();
                }
            } else {
                self.handle_shutdown();
                let merges_settled = self.merges.is_idle()
                    || self.forced
                    || (self.drain_expired && !self.merges.has_active());
                if self.pool.is_idle() && merges_settled {
                    break;
                }
            }

            if self.checkpointer.is_due() {
                self.save()?;
            }

            tokio::time::sleep(poll_interval).await;
        }

        Ok(())
    }

    fn handle_shutdown(&mut self) {
        if self.drain_started.is_none() {
            log::info!(
                "[Orchestrator] Draining: {} worker(s) running, {} merge(s) pending, {} item(s) not dispatched",
                self.pool.active_count(),
                self.merges.pending_count(),
                self.queue.len()
            );
            self.drain_started = Some(Instant::now());
        }
        let started = self.drain_started.unwrap_or_else(Instant::now);
        self.checkpointer.mark_dirty();

        if self.orch.ctx.shutdown.is_force_requested() && !self.forced {
            self.forced = true;
            self.pool.cancel_all(true);
            self.merges.halt();
        } else if !self.drain_expired && started.elapsed() >= self.config.shutdown_grace() {
            log::warn!(
                "[Orchestrator] Drain grace of {:?} expired, cancelling workers",
                self.config.shutdown_grace()
            );
            self.drain_expired = true;
            self.pool.cancel_all(false);
            self.merges.halt();
        }
    }

    fn is_critical(&self, id: &str) -> bool {
        self.config.sequential_first
            && self
                .graph
                .priority(id)
                .is_some_and(|p| p <= self.config.critical_priority)
    }

    fn is_candidate(&self, id: &str) -> bool {
        !self.completed.contains(id)
            && !self.outcomes.contains_key(id)
            && !self.queue.is_dispatched(id)
            && !self.merges.contains(id)
            && self.queue.allows(id)
    }

    /// Start the next wave from everything that is ready now. Returns false
    /// when nothing is left to run.
    fn plan_next_wave(&mut self) -> bool {
        let ready: Vec<String> = self
            .graph
            .get_ready_items(&self.completed)
            .into_iter()
            .filter(|id| self.is_candidate(id))
            .collect();
        if ready.is_empty() {
            return false;
        }

        let sub_waves = refine_waves_for_contention(&[ready.clone()], &self.hints);
        let Some(wave) = sub_waves.into_iter().next() else {
            return false;
        };

        self.wave_number += 1;
        log::info!(
            "[Orchestrator] Wave {}: {} ({} ready item(s) deferred for file contention)",
            self.wave_number,
            wave.join(", "),
            ready.len() - wave.len()
        );

        for id in &wave {
            let priority = self.graph.priority(id).unwrap_or(u32::MAX);
            self.queue.push(id, priority);
            self.set_status(id, ItemStatus::Ready);
        }
        self.wave = wave.into_iter().collect();
        true
    }

    /// Queue dependents of `id` that became ready and do not contend with
    /// anything still unsettled in the current wave
    fn extend_wave(&mut self, id: &str) {
        let mut dependents: Vec<String> = self.graph.dependents(id).cloned().collect();
        self.graph.sort_by_priority(&mut dependents);

        for dependent in dependents {
            if !self.is_candidate(&dependent) || self.queue.queued_ids().contains(&dependent) {
                continue;
            }
            if !self
                .graph
                .blockers(&dependent)
                .all(|b| self.completed.contains(b))
            {
                continue;
            }

            let hints = self.hints.get(&dependent).cloned().unwrap_or_default();
            let contends = self.wave.iter().any(|member| {
                self.hints
                    .get(member)
                    .is_some_and(|other| footprints_overlap(&hints, other))
            });
            if contends {
                log::debug!(
                    "[Orchestrator] {} is ready but contends with the current wave, deferring",
                    dependent
                );
                continue;
            }

            log::info!(
                "[Orchestrator] {} unblocked by {}, joining wave {}",
                dependent,
                id,
                self.wave_number
            );
            let priority = self.graph.priority(&dependent).unwrap_or(u32::MAX);
            self.queue.push(&dependent, priority);
            self.set_status(&dependent, ItemStatus::Ready);
            self.wave.insert(dependent);
        }
    }

    fn dispatch(&mut self) {
        while self.pool.available_slots() > 0 {
            let Some(next) = self.queue.peek().map(str::to_string) else {
                break;
            };

            if self.config.sequential_first {
                if !self.critical.is_empty() {
                    break;
                }
                if self.is_critical(&next) && !(self.pool.is_idle() && self.merges.is_idle()) {
                    break;
                }
            }

            let Some(id) = self.queue.pop() else {
                break;
            };
            let Some(item) = self.items.get(&id).cloned() else {
                continue;
            };

            if self.is_critical(&id) {
                log::info!("[Orchestrator] Running critical item {} on its own", id);
                self.critical.insert(id.clone());
            }

            let mode = self.workspaces.creation_mode(&id);
            match self.pool.dispatch(item, mode) {
                Ok(()) => {
                    self.set_status(&id, ItemStatus::InProgress);
                    self.state.in_progress.insert(id);
                    self.checkpointer.mark_dirty();
                }
                Err(e) => {
                    log::error!("[Orchestrator] Failed to dispatch {}: {}", id, e);
                    self.record_failure(&id, FailureReason::Workspace { message: e }, true);
                }
            }
        }
    }

    fn on_worker_report(&mut self, report: WorkerReport) {
        let id = report.item_id.clone();
        self.state.in_progress.remove(&id);
        self.checkpointer.mark_dirty();

        match report.outcome {
            WorkerOutcome::Verified { .. } => match report.workspace {
                Some(workspace) => {
                    self.merges.enqueue(MergeRequest::new(
                        workspace,
                        &self.orch.components.integration_branch,
                    ));
                }
                None => self.record_failure(
                    &id,
                    FailureReason::Workspace {
                        message: "verified item has no workspace".to_string(),
                    },
                    true,
                ),
            },
            WorkerOutcome::Failed { reason } => self.record_failure(&id, reason, true),
            WorkerOutcome::Interrupted => {
                self.set_status(&id, ItemStatus::Pending);
                self.outcomes.insert(id.clone(), ItemOutcome::Interrupted);
                self.state.in_progress.insert(id.clone());
                self.settle(&id);
            }
        }
    }

    fn on_merge_report(&mut self, report: MergeReport) {
        self.checkpointer.mark_dirty();
        match report.outcome {
            MergeOutcome::Merged { .. } => self.complete(&report.item_id, &report.request.workspace),
            MergeOutcome::Failed { reason } => {
                let escalate = reason.is_merge_conflict()
                    && self.config.sequential_merge_retry
                    && !self.orch.ctx.shutdown.is_shutdown_requested();
                self.record_failure(&report.item_id, reason, !escalate);
                if escalate {
                    self.escalations.push(report.request);
                }
            }
        }
    }

    /// Retry this wave's merge conflicts one at a time against the new head
    async fn escalate(&mut self) {
        if self.escalations.is_empty() {
            return;
        }
        let requests = std::mem::take(&mut self.escalations);
        log::info!(
            "[Orchestrator] Retrying {} conflicted merge(s) sequentially",
            requests.len()
        );

        for request in requests {
            let id = request.item_id.clone();
            if self.orch.ctx.shutdown.is_shutdown_requested() {
                self.notify(&id);
                continue;
            }

            self.set_status(&id, ItemStatus::InProgress);
            let runner = self.merges.runner();
            let request = request.requeue();
            match tokio::task::spawn_blocking(move || runner.execute(request)).await {
                Ok(report) => match report.outcome {
                    MergeOutcome::Merged { .. } => {
                        log::info!("[Orchestrator] Sequential retry merged {}", id);
                        self.complete(&id, &report.request.workspace);
                    }
                    MergeOutcome::Failed { reason } => self.record_failure(&id, reason, true),
                },
                Err(e) => {
                    log::error!("[Orchestrator] Sequential merge of {} panicked: {}", id, e);
                    self.notify(&id);
                }
            }
            self.checkpointer.mark_dirty();
        }
    }

    /// Move an item along its lifecycle; disallowed moves are logged and ignored
    fn set_status(&mut self, id: &str, to: ItemStatus) {
        let Some(item) = self.items.get_mut(id) else {
            return;
        };
        match transition_state(item.status, to) {
            Ok(status) => item.status = status,
            Err(e) => log::warn!("[Orchestrator] {}: {}", id, e),
        }
    }

    fn settle(&mut self, id: &str) {
        self.wave.remove(id);
        self.critical.remove(id);
    }

    fn complete(&mut self, id: &str, workspace: &Workspace) {
        self.set_status(id, ItemStatus::Completed);
        self.completed.insert(id.to_string());
        self.state.completed.insert(id.to_string());
        self.state.failed.remove(id);
        self.state.in_progress.remove(id);
        self.outcomes.insert(id.to_string(), ItemOutcome::Completed);
        self.workspaces.destroy(workspace);
        self.settle(id);
        self.notify(id);
        self.checkpointer.mark_dirty();

        if self.orch.ctx.shutdown.phase() == ShutdownPhase::Running {
            self.extend_wave(id);
        }
    }

    fn record_failure(&mut self, id: &str, reason: FailureReason, notify: bool) {
        log::warn!("[Orchestrator] {} failed: {}", id, reason);
        self.set_status(id, ItemStatus::Failed);
        self.state.failed.insert(id.to_string(), reason.clone());
        self.state.in_progress.remove(id);
        self.outcomes
            .insert(id.to_string(), ItemOutcome::Failed { reason });
        self.settle(id);
        if notify {
            self.notify(id);
        }
    }

    fn notify(&self, id: &str) {
        // The sink only hears about completed and failed items
        let Some(outcome) = self.outcomes.get(id).filter(|o| o.is_terminal()).cloned() else {
            return;
        };
        let item = self
            .items
            .get(id)
            .cloned()
            .unwrap_or_else(|| WorkItem::new(id));
        self.orch
            .components
            .sink
            .notify(CompletionEvent::new(item, outcome));
    }

    fn save(&mut self) -> Result<(), OrchestratorError> {
        self.state.execution_id = self.orch.ctx.execution_id.clone();
        self.state.in_progress.extend(self.pool.running_ids());
        self.state.pending_merges = self
            .merges
            .pending_requests()
            .iter()
            .map(PendingMerge::from_request)
            .collect();
        self.state.timestamp = Utc::now();
        self.store.save(&self.state)?;
        self.checkpointer.saved();
        Ok(())
    }

    fn finish(mut self) -> Result<RunSummary, OrchestratorError> {
        let interrupted = self.orch.ctx.shutdown.is_shutdown_requested();
        for request in std::mem::take(&mut self.escalations) {
            self.notify(&request.item_id);
        }
        self.save()?;

        let permanently_blocked: HashSet<String> = self
            .graph
            .permanently_blocked(&self.completed)
            .into_iter()
            .map(|b| b.id)
            .collect();

        let mut blocked: Vec<BlockedItem> = Vec::new();
        for (id, item) in &self.items {
            // Queued, running or awaiting merge
            if is_active_state(item.status) || item.status == ItemStatus::Ready {
                continue;
            }
            if self.outcomes.contains_key(id)
                || self.completed.contains(id)
                || self.state.in_progress.contains(id)
            {
                continue;
            }
            if interrupted && !permanently_blocked.contains(id) {
                continue;
            }
            blocked.push(self.graph.blocked_item(id, &self.completed));
        }
        for item in &blocked {
            self.set_status(&item.id, ItemStatus::Blocked);
            self.outcomes.insert(
                item.id.clone(),
                ItemOutcome::Blocked {
                    unmet: item.unmet.clone(),
                },
            );
        }

        let summary = RunSummary {
            execution_id: self.orch.ctx.execution_id.clone(),
            integration_branch: self.orch.components.integration_branch.clone(),
            started_at: self.orch.ctx.started_at,
            finished_at: Utc::now(),
            outcomes: self.outcomes,
            total_items: self.items.len(),
            blocked,
            cycles: self.cycles,
            interrupted,
            strategy_switches: self.merges.runner().strategy_switches(),
        };

        log::info!(
            "[Orchestrator] Run {} finished: {} completed, {} failed, {} interrupted, {} blocked",
            summary.execution_id,
            summary.completed_count(),
            summary.failed_count(),
            summary.interrupted_count(),
            summary.blocked_count()
        );
        Ok(summary)
    }
}
