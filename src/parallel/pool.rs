//! Worker pool
//!
//! Each worker owns one item from workspace creation to verification. Workers
//! run on tokio's blocking pool; the orchestrator polls for finished ones and
//! never waits on a single worker.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::models::{FailureReason, WorkItem};
use crate::parallel::executor::{terminate, TaskExecutor};
use crate::parallel::verify::{Evidence, ExecutionResult, VerificationChain};
use crate::parallel::workspace::{CreateMode, Workspace, WorkspaceBackend};
use crate::utils::item_key;

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Work verified and sealed; ready to merge
    Verified { evidence: Evidence },
    Failed { reason: FailureReason },
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub item_id: String,
    pub outcome: WorkerOutcome,
    pub workspace: Option<Workspace>,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub log_path: PathBuf,
}

/// Everything a worker needs, shared by all workers of a run
pub struct WorkerContext {
    pub backend: Arc<dyn WorkspaceBackend>,
    pub executor: Arc<dyn TaskExecutor>,
    pub verifier: Arc<VerificationChain>,
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub log_dir: PathBuf,
}

struct RunningWorker {
    handle: JoinHandle<WorkerReport>,
    cancel: Arc<AtomicBool>,
    force: Arc<AtomicBool>,
}

pub struct WorkerPool {
    max_workers: usize,
    context: Arc<WorkerContext>,
    workers: BTreeMap<String, RunningWorker>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, context: WorkerContext) -> Self {
        Self {
            max_workers: max_workers.max(1),
            context: Arc::new(context),
            workers: BTreeMap::new(),
        }
    }

    pub fn available_slots(&self) -> usize {
        self.max_workers.saturating_sub(self.workers.len())
    }

    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_idle(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    /// Start a worker for `item`. Must be called from within a tokio runtime.
    pub fn dispatch(&mut self, item: WorkItem, mode: CreateMode) -> Result<(), String> {
        if self.workers.contains_key(&item.id) {
            return Err(format!("Item {} is already running", item.id));
        }
        if self.available_slots() == 0 {
            return Err(format!(
                "Worker pool exhausted: {} active, max {}",
                self.workers.len(),
                self.max_workers
            ));
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let force = Arc::new(AtomicBool::new(false));
        let context = Arc::clone(&self.context);
        let id = item.id.clone();

        log::info!("[WorkerPool] Dispatching {} ({} active)", id, self.workers.len() + 1);

        let handle = {
            let cancel = Arc::clone(&cancel);
            let force = Arc::clone(&force);
            tokio::task::spawn_blocking(move || run_item(&context, item, mode, &cancel, &force))
        };

        self.workers.insert(id, RunningWorker { handle, cancel, force });
        Ok(())
    }

    /// Collect reports from workers that have finished
    pub async fn poll(&mut self) -> Vec<WorkerReport> {
        let finished: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        let mut reports = Vec::with_capacity(finished.len());
        for id in finished {
            let Some(worker) = self.workers.remove(&id) else {
                continue;
            };
            match worker.handle.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    log::error!("[WorkerPool] Worker for {} panicked: {}", id, e);
                    reports.push(WorkerReport {
                        log_path: log_path_for(&self.context.log_dir, &id),
                        item_id: id,
                        outcome: WorkerOutcome::Failed {
                            reason: FailureReason::Workspace {
                                message: format!("worker panicked: {}", e),
                            },
                        },
                        workspace: None,
                        exit_code: None,
                        duration: Duration::ZERO,
                    });
                }
            }
        }
        reports
    }

    /// Ask every running worker to stop. With `force` the executor is killed
    /// without a grace period.
    pub fn cancel_all(&self, force: bool) {
        for (id, worker) in &self.workers {
            log::info!("[WorkerPool] Cancelling {}{}", id, if force { " (forced)" } else { "" });
            if force {
                worker.force.store(true, Ordering::SeqCst);
            }
            worker.cancel.store(true, Ordering::SeqCst);
        }
    }
}

pub fn log_path_for(log_dir: &Path, item_id: &str) -> PathBuf {
    log_dir.join(format!("{}.log", item_key(item_id)))
}

fn run_item(
    context: &WorkerContext,
    item: WorkItem,
    mode: CreateMode,
    cancel: &AtomicBool,
    force: &AtomicBool,
) -> WorkerReport {
    let started = Instant::now();
    let log_path = log_path_for(&context.log_dir, &item.id);

    let report = |outcome: WorkerOutcome, workspace: Option<Workspace>, exit_code: Option<i32>| {
        WorkerReport {
            item_id: item.id.clone(),
            outcome,
            workspace,
            exit_code,
            duration: started.elapsed(),
            log_path: log_path.clone(),
        }
    };
    let failed = |reason: FailureReason| WorkerOutcome::Failed { reason };

    let workspace = match context.backend.create(&item, mode) {
        Ok(workspace) => workspace,
        Err(e) => {
            log::warn!("[WorkerPool] Workspace creation failed for {}: {}", item.id, e);
            return report(
                failed(FailureReason::Workspace {
                    message: e.to_string(),
                }),
                None,
                None,
            );
        }
    };

    if cancel.load(Ordering::SeqCst) {
        return report(WorkerOutcome::Interrupted, Some(workspace), None);
    }

    let mut child = match context.executor.spawn(&item, &workspace, &log_path) {
        Ok(child) => child,
        Err(e) => {
            log::warn!("[WorkerPool] {}", e);
            release(context, &workspace);
            return report(failed(FailureReason::ExecutorExit { code: None }), None, None);
        }
    };

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                log::warn!("[WorkerPool] Lost track of executor for {}: {}", item.id, e);
                terminate(&mut child, Duration::ZERO);
                release(context, &workspace);
                return report(failed(FailureReason::ExecutorExit { code: None }), None, None);
            }
        }

        if cancel.load(Ordering::SeqCst) {
            let grace = if force.load(Ordering::SeqCst) {
                Duration::ZERO
            } else {
                context.kill_grace
            };
            terminate(&mut child, grace);
            log::info!("[WorkerPool] {} interrupted", item.id);
            return report(WorkerOutcome::Interrupted, Some(workspace), None);
        }

        if started.elapsed() >= context.timeout {
            log::warn!(
                "[WorkerPool] {} exceeded its {:?} limit, terminating",
                item.id,
                context.timeout
            );
            terminate(&mut child, context.kill_grace);
            // Workspace stays for the next orphan scan
            return report(failed(FailureReason::Timeout), Some(workspace), None);
        }

        thread::sleep(CHILD_POLL_INTERVAL);
    };

    let result = ExecutionResult {
        exit_code: status.code(),
        output: std::fs::read(&log_path)
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
            .unwrap_or_default(),
    };

    match context.verifier.verify(&workspace, &result) {
        Ok(evidence) => match context.backend.seal(&workspace) {
            Ok(()) => {
                log::info!(
                    "[WorkerPool] {} finished in {:.1}s ({:?})",
                    item.id,
                    started.elapsed().as_secs_f64(),
                    evidence
                );
                report(WorkerOutcome::Verified { evidence }, Some(workspace), result.exit_code)
            }
            Err(e) => {
                log::warn!("[WorkerPool] Failed to seal workspace for {}: {}", item.id, e);
                report(
                    failed(FailureReason::Workspace {
                        message: e.to_string(),
                    }),
                    Some(workspace),
                    result.exit_code,
                )
            }
        },
        Err(reason) => {
            log::warn!("[WorkerPool] {} failed: {}", item.id, reason);
            release(context, &workspace);
            report(failed(reason), None, result.exit_code)
        }
    }
}

fn release(context: &WorkerContext, workspace: &Workspace) {
    if let Err(e) = context.backend.destroy(workspace) {
        log::warn!(
            "[WorkerPool] Failed to release workspace for {}: {}",
            workspace.item_id,
            e
        );
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::parallel::workspace::testing::MemoryBackend;
    use anyhow::Result;
    use std::fs::File;
    use std::process::{Child, Command, Stdio};
    use tempfile::TempDir;

    /// Runs a per-item shell snippet, ignoring the workspace path
    struct ScriptExecutor {
        scripts: BTreeMap<String, String>,
    }

    impl TaskExecutor for ScriptExecutor {
        fn spawn(&self, item: &WorkItem, _workspace: &Workspace, log_path: &Path) -> Result<Child> {
            std::fs::create_dir_all(log_path.parent().unwrap())?;
            let out = File::create(log_path)?;
            let script = self.scripts.get(&item.id).cloned().unwrap_or_default();
            Ok(Command::new("sh")
                .args(["-c", &script])
                .stdout(Stdio::from(out.try_clone()?))
                .stderr(Stdio::from(out))
                .spawn()?)
        }
    }

    fn pool(
        dir: &TempDir,
        backend: Arc<MemoryBackend>,
        scripts: &[(&str, &str)],
        timeout: Duration,
    ) -> WorkerPool {
        let executor = ScriptExecutor {
            scripts: scripts
                .iter()
                .map(|(id, s)| (id.to_string(), s.to_string()))
                .collect(),
        };
        let verifier = VerificationChain::standard(&ExecutorConfig::default(), backend.clone());
        WorkerPool::new(
            2,
            WorkerContext {
                backend,
                executor: Arc::new(executor),
                verifier: Arc::new(verifier),
                timeout,
                kill_grace: Duration::from_millis(200),
                log_dir: dir.path().to_path_buf(),
            },
        )
    }

    async fn drain(pool: &mut WorkerPool) -> BTreeMap<String, WorkerReport> {
        let mut reports = BTreeMap::new();
        while !pool.is_idle() {
            for report in pool.poll().await {
                reports.insert(report.item_id.clone(), report);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        reports
    }

    #[tokio::test]
    async fn test_verified_and_failed_items() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::default());
        let mut pool = pool(
            &dir,
            backend.clone(),
            &[
                ("A", "echo working; echo '<promise>COMPLETE</promise>'"),
                ("B", "echo broken; exit 3"),
            ],
            Duration::from_secs(30),
        );

        pool.dispatch(WorkItem::new("A"), CreateMode::Fresh).unwrap();
        pool.dispatch(WorkItem::new("B"), CreateMode::Fresh).unwrap();
        assert_eq!(pool.available_slots(), 0);
        assert!(pool.dispatch(WorkItem::new("C"), CreateMode::Fresh).is_err());

        let reports = drain(&mut pool).await;

        assert_eq!(
            reports["A"].outcome,
            WorkerOutcome::Verified {
                evidence: Evidence::CompletionMarker
            }
        );
        assert!(reports["A"].workspace.is_some());
        assert_eq!(
            reports["B"].outcome,
            WorkerOutcome::Failed {
                reason: FailureReason::ExecutorExit { code: Some(3) }
            }
        );
        assert!(reports["B"].log_path.exists());

        assert_eq!(backend.snapshot(|s| s.sealed.clone()), vec!["A"]);
        assert_eq!(backend.snapshot(|s| s.destroyed.clone()), vec!["B"]);
    }

    #[tokio::test]
    async fn test_no_evidence_fails() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::default());
        let mut pool = pool(&dir, backend, &[("A", "echo nothing to see")], Duration::from_secs(30));

        pool.dispatch(WorkItem::new("A"), CreateMode::Fresh).unwrap();
        let reports = drain(&mut pool).await;
        assert_eq!(
            reports["A"].outcome,
            WorkerOutcome::Failed {
                reason: FailureReason::NoEvidence
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_kills_executor_and_keeps_workspace() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::default());
        let mut pool = pool(&dir, backend.clone(), &[("A", "sleep 30")], Duration::from_millis(300));

        let started = Instant::now();
        pool.dispatch(WorkItem::new("A"), CreateMode::Fresh).unwrap();
        let reports = drain(&mut pool).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(
            reports["A"].outcome,
            WorkerOutcome::Failed {
                reason: FailureReason::Timeout
            }
        );
        assert!(backend.snapshot(|s| s.destroyed.is_empty()));
        assert!(backend.snapshot(|s| s.live.contains_key("A")));
    }

    #[tokio::test]
    async fn test_cancel_reports_interrupted() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::default());
        let mut pool = pool(&dir, backend, &[("A", "sleep 30")], Duration::from_secs(60));

        pool.dispatch(WorkItem::new("A"), CreateMode::Fresh).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        pool.cancel_all(true);

        let reports = drain(&mut pool).await;
        assert_eq!(reports["A"].outcome, WorkerOutcome::Interrupted);
    }

    #[tokio::test]
    async fn test_workspace_failure_is_item_failure() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::default());
        backend
            .state
            .lock()
            .unwrap()
            .fail_create
            .insert("A".to_string());
        let mut pool = pool(&dir, backend, &[], Duration::from_secs(5));

        pool.dispatch(WorkItem::new("A"), CreateMode::Fresh).unwrap();
        let reports = drain(&mut pool).await;
        assert!(matches!(
            reports["A"].outcome,
            WorkerOutcome::Failed {
                reason: FailureReason::Workspace { .. }
            }
        ));
    }
}
