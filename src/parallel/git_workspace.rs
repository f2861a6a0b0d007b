//! Git worktree workspaces
//!
//! Every item gets its own branch `ralph-parallel/<key>` and worktree under
//! `<project>/.worktrees/parallel/<key>`, where the key is the item id made
//! ref-safe plus a digest of the raw id. Bookkeeping files live in the
//! worktree's admin directory (`.git/worktrees/<name>/`) so they never show
//! up in the item's diff.

use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::OrchestratorConfig;
use crate::file_storage::{atomic_write, ensure_dir, read_json};
use crate::git::{worktree_name_for_branch, GitManager};
use crate::models::WorkItem;
use crate::parallel::workspace::{
    CreateMode, OrphanState, OrphanWorkspace, Workspace, WorkspaceBackend, WorkspaceError,
};
use crate::parallel::IntegrationLock;
use crate::utils::{item_key, lock_mutex_recover};

const METADATA_FILE: &str = "ralph-item.json";
const COMPLETE_MARKER: &str = "ralph-complete";

pub struct GitWorktreeBackend {
    project_path: PathBuf,
    integration_branch: String,
    branch_prefix: String,
    worktree_root: PathBuf,
    aux_files: Vec<String>,
    lock: IntegrationLock,
}

impl GitWorktreeBackend {
    pub fn new(
        project_path: &Path,
        integration_branch: &str,
        config: &OrchestratorConfig,
        lock: IntegrationLock,
    ) -> Self {
        Self {
            project_path: project_path.to_path_buf(),
            integration_branch: integration_branch.to_string(),
            branch_prefix: config.branch_prefix.clone(),
            worktree_root: project_path.join(&config.worktree_root),
            aux_files: config.aux_files.clone(),
            lock,
        }
    }

    fn git(&self) -> Result<GitManager, WorkspaceError> {
        Ok(GitManager::new(&self.project_path)?)
    }

    fn branch_for(&self, item_id: &str) -> String {
        format!("{}/{}", self.branch_prefix, item_key(item_id))
    }

    fn path_for(&self, item_id: &str) -> PathBuf {
        self.worktree_root.join(item_key(item_id))
    }

    fn admin_dir(&self, git: &GitManager, workspace: &Workspace) -> PathBuf {
        git.worktree_admin_dir(&worktree_name_for_branch(&workspace.branch))
    }

    fn is_managed(&self, path: &Path) -> bool {
        let root = self
            .worktree_root
            .canonicalize()
            .unwrap_or_else(|_| self.worktree_root.clone());
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        path.starts_with(&root)
    }

    /// Keep the worktree root out of the main checkout's status
    fn ensure_root(&self) -> Result<(), WorkspaceError> {
        ensure_dir(&self.worktree_root)?;
        let gitignore = self.worktree_root.join(".gitignore");
        if !gitignore.exists() {
            fs::write(&gitignore, "*\n")?;
        }
        Ok(())
    }

    /// Copy untracked helper files (env files, local config) into the
    /// workspace and hide them from its diff.
    fn sync_aux_files(&self, git: &GitManager, workspace_path: &Path) -> Result<(), WorkspaceError> {
        if self.aux_files.is_empty() {
            return Ok(());
        }

        let mut copied = Vec::new();
        for rel in &self.aux_files {
            let source = self.project_path.join(rel);
            if !source.exists() {
                log::debug!("[Workspace] Aux file {} does not exist, skipping", rel);
                continue;
            }

            for entry in WalkDir::new(&source).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = match entry.path().strip_prefix(&self.project_path) {
                    Ok(relative) => relative.to_path_buf(),
                    Err(_) => continue,
                };
                let target = workspace_path.join(&relative);
                if target.exists() {
                    continue;
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &target)?;
                copied.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }

        if copied.is_empty() {
            return Ok(());
        }

        let info_dir = git.repo_path().join("info");
        fs::create_dir_all(&info_dir)?;
        let exclude_path = info_dir.join("exclude");
        let existing = fs::read_to_string(&exclude_path).unwrap_or_default();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&exclude_path)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file)?;
        }
        for path in &copied {
            let pattern = format!("/{}", path);
            if !existing.lines().any(|line| line == pattern) {
                writeln!(file, "{}", pattern)?;
            }
        }

        log::debug!(
            "[Workspace] Copied {} aux file(s) into {:?}",
            copied.len(),
            workspace_path
        );
        Ok(())
    }

    fn write_metadata(&self, git: &GitManager, workspace: &Workspace) -> Result<(), WorkspaceError> {
        let admin = self.admin_dir(git, workspace);
        let content = serde_json::to_string_pretty(workspace)
            .map_err(|e| WorkspaceError::Other(format!("Failed to serialize workspace: {}", e)))?;
        atomic_write(&admin.join(METADATA_FILE), &content)?;
        Ok(())
    }

    fn reuse_existing(&self, git: &GitManager, item: &WorkItem) -> Option<Workspace> {
        let path = self.path_for(&item.id);
        if !path.join(".git").exists() {
            return None;
        }
        let branch = self.branch_for(&item.id);
        let admin = git.worktree_admin_dir(&worktree_name_for_branch(&branch));
        match read_json::<Workspace>(&admin.join(METADATA_FILE)) {
            Ok(workspace) => Some(workspace),
            Err(e) => {
                log::warn!(
                    "[Workspace] Cannot reuse workspace for {} ({}), recreating",
                    item.id,
                    e
                );
                None
            }
        }
    }

    fn remove(&self, git: &GitManager, workspace: &Workspace) {
        if let Err(e) = git.remove_worktree(&workspace.path) {
            log::debug!("[Workspace] Worktree {:?} not registered: {}", workspace.path, e);
        }
        if workspace.path.exists() {
            if let Err(e) = fs::remove_dir_all(&workspace.path) {
                log::warn!(
                    "[Workspace] Failed to remove workspace directory {:?}: {}",
                    workspace.path,
                    e
                );
            }
        }
    }
}

impl WorkspaceBackend for GitWorktreeBackend {
    fn create(&self, item: &WorkItem, mode: CreateMode) -> Result<Workspace, WorkspaceError> {
        let _guard = lock_mutex_recover(&self.lock);
        let git = self.git()?;

        if mode == CreateMode::ReuseExisting {
            if let Some(workspace) = self.reuse_existing(&git, item) {
                log::info!(
                    "[Workspace] Reusing workspace for {} at {:?}",
                    item.id,
                    workspace.path
                );
                return Ok(workspace);
            }
        }

        let branch = self.branch_for(&item.id);
        let path = self.path_for(&item.id);

        if path.exists() {
            log::warn!("[Workspace] Removing stale workspace at {:?}", path);
            if git.remove_worktree(&path).is_err() {
                fs::remove_dir_all(&path)?;
            }
        }

        if let Err(e) = git.prune_orphaned_worktrees() {
            log::warn!("[Workspace] Failed to prune orphaned worktrees: {}", e);
        }

        self.ensure_root()?;

        let baseline = git.branch_tip(&self.integration_branch)?.to_string();
        git.create_branch_from_commit(&branch, &baseline, true)?;
        git.create_worktree(&branch, &path)?;

        let workspace = Workspace {
            id: worktree_name_for_branch(&branch),
            item_id: item.id.clone(),
            branch,
            path,
            baseline,
            created_at: Utc::now(),
        };

        self.sync_aux_files(&git, &workspace.path)?;
        self.write_metadata(&git, &workspace)?;

        log::info!(
            "[Workspace] Created workspace for {} at {:?} on branch {}",
            item.id,
            workspace.path,
            workspace.branch
        );

        Ok(workspace)
    }

    fn destroy(&self, workspace: &Workspace) -> Result<(), WorkspaceError> {
        let git = self.git()?;
        self.remove(&git, workspace);
        log::info!("[Workspace] Released workspace for {}", workspace.item_id);
        Ok(())
    }

    fn discard(&self, workspace: &Workspace) -> Result<(), WorkspaceError> {
        let git = self.git()?;
        self.remove(&git, workspace);
        if git.branch_exists(&workspace.branch) {
            git.delete_branch(&workspace.branch)?;
        }
        log::info!(
            "[Workspace] Discarded workspace and branch {} for {}",
            workspace.branch,
            workspace.item_id
        );
        Ok(())
    }

    fn scan(&self) -> Result<Vec<Workspace>, WorkspaceError> {
        let git = self.git()?;
        let mut found = Vec::new();

        for info in git.list_worktrees()? {
            let path = PathBuf::from(&info.path);
            if !self.is_managed(&path) || !path.exists() {
                continue;
            }

            let admin = git.worktree_admin_dir(&info.name);
            let workspace = match read_json::<Workspace>(&admin.join(METADATA_FILE)) {
                Ok(workspace) => workspace,
                Err(_) => {
                    let Some(branch) = info.branch.clone() else {
                        log::warn!("[Workspace] Skipping detached worktree {:?}", path);
                        continue;
                    };
                    // Without metadata the raw id is lost; the key stands in
                    log::warn!("[Workspace] No metadata for worktree {:?}", path);
                    let item_id = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| info.name.clone());
                    Workspace {
                        id: info.name.clone(),
                        item_id,
                        branch,
                        path,
                        baseline: git.branch_tip(&self.integration_branch)?.to_string(),
                        created_at: Utc::now(),
                    }
                }
            };
            found.push(workspace);
        }

        Ok(found)
    }

    fn classify(&self, workspace: &Workspace) -> Result<OrphanWorkspace, WorkspaceError> {
        let git = self.git()?;
        let (ahead, behind) = git.ahead_behind(&workspace.branch, &self.integration_branch)?;
        let dirty = GitManager::new(&workspace.path)?.has_uncommitted_changes()?;
        let sealed = self.admin_dir(&git, workspace).join(COMPLETE_MARKER).exists();

        let state = if ahead == 0 && !dirty {
            OrphanState::Empty
        } else if sealed && !dirty {
            OrphanState::CompletedUnmerged
        } else {
            OrphanState::InProgress
        };

        Ok(OrphanWorkspace {
            workspace: workspace.clone(),
            state,
            ahead,
            behind,
            dirty,
        })
    }

    fn has_changes(&self, workspace: &Workspace) -> Result<bool, WorkspaceError> {
        let git = GitManager::new(&workspace.path)?;
        Ok(git.has_changes_since(&workspace.baseline)?)
    }

    fn seal(&self, workspace: &Workspace) -> Result<(), WorkspaceError> {
        let worktree_git = GitManager::new(&workspace.path)?;
        let message = format!("ralph-parallel: complete {}", workspace.item_id);
        if let Some(commit) = worktree_git.commit_all(&message)? {
            log::info!(
                "[Workspace] Committed remaining changes for {} ({})",
                workspace.item_id,
                commit.short_id
            );
        }

        let git = self.git()?;
        let marker = self.admin_dir(&git, workspace).join(COMPLETE_MARKER);
        atomic_write(&marker, &Utc::now().to_rfc3339())?;
        Ok(())
    }

    fn preview(&self, item: &WorkItem) -> Workspace {
        let branch = self.branch_for(&item.id);
        Workspace {
            id: worktree_name_for_branch(&branch),
            item_id: item.id.clone(),
            branch,
            path: self.path_for(&item.id),
            baseline: String::new(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{Repository, Signature};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn setup_repo() -> (TempDir, String) {
        let temp_dir = TempDir::new().unwrap();
        let repo = Repository::init(temp_dir.path()).unwrap();
        let sig = Signature::now("Test User", "test@example.com").unwrap();
        fs::write(temp_dir.path().join("README.md"), "# test\n").unwrap();
        let tree_id = {
            let mut index = repo.index().unwrap();
            index.add_path(Path::new("README.md")).unwrap();
            index.write().unwrap();
            index.write_tree().unwrap()
        };
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();

        let branch = GitManager::new(temp_dir.path())
            .unwrap()
            .get_default_branch_name();
        (temp_dir, branch)
    }

    fn backend(dir: &Path, branch: &str, config: &OrchestratorConfig) -> GitWorktreeBackend {
        GitWorktreeBackend::new(dir, branch, config, Arc::new(Mutex::new(())))
    }

    #[test]
    fn test_create_and_destroy_workspace() {
        let (temp_dir, branch) = setup_repo();
        let backend = backend(temp_dir.path(), &branch, &OrchestratorConfig::default());

        let workspace = backend.create(&WorkItem::new("US-1"), CreateMode::Fresh).unwrap();
        assert_eq!(workspace.branch, format!("ralph-parallel/{}", item_key("US-1")));
        assert!(workspace.branch.starts_with("ralph-parallel/us-1-"));
        assert!(workspace.path.join("README.md").exists());
        assert!(!backend.has_changes(&workspace).unwrap());

        // The main checkout stays clean
        let main = GitManager::new(temp_dir.path()).unwrap();
        assert!(!main.has_uncommitted_changes().unwrap());

        backend.destroy(&workspace).unwrap();
        assert!(!workspace.path.exists());
        assert!(main.branch_exists(&workspace.branch));
    }

    #[test]
    fn test_preview_matches_create() {
        let (temp_dir, branch) = setup_repo();
        let backend = backend(temp_dir.path(), &branch, &OrchestratorConfig::default());

        let item = WorkItem::new("US 2");
        let preview = backend.preview(&item);
        assert!(!preview.path.exists());

        let created = backend.create(&item, CreateMode::Fresh).unwrap();
        assert_eq!(preview.branch, created.branch);
        assert_eq!(preview.path, created.path);
    }

    #[test]
    fn test_scan_and_classify_orphans() {
        let (temp_dir, branch) = setup_repo();
        let backend = backend(temp_dir.path(), &branch, &OrchestratorConfig::default());

        let empty = backend.create(&WorkItem::new("A"), CreateMode::Fresh).unwrap();
        let working = backend.create(&WorkItem::new("B"), CreateMode::Fresh).unwrap();
        let done = backend.create(&WorkItem::new("C"), CreateMode::Fresh).unwrap();

        fs::write(working.path.join("b.txt"), "partial").unwrap();
        fs::write(done.path.join("c.txt"), "finished").unwrap();
        assert!(backend.has_changes(&done).unwrap());
        backend.seal(&done).unwrap();

        let mut scanned = backend.scan().unwrap();
        scanned.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        let ids: Vec<&str> = scanned.iter().map(|w| w.item_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);

        assert_eq!(backend.classify(&empty).unwrap().state, OrphanState::Empty);
        let in_progress = backend.classify(&working).unwrap();
        assert_eq!(in_progress.state, OrphanState::InProgress);
        assert!(in_progress.dirty);
        let completed = backend.classify(&done).unwrap();
        assert_eq!(completed.state, OrphanState::CompletedUnmerged);
        assert_eq!(completed.ahead, 1);
    }

    #[test]
    fn test_ids_that_sanitize_alike_get_separate_workspaces() {
        let (temp_dir, branch) = setup_repo();
        let backend = backend(temp_dir.path(), &branch, &OrchestratorConfig::default());

        let dotted = backend.create(&WorkItem::new("US-1.1"), CreateMode::Fresh).unwrap();
        let dashed = backend.create(&WorkItem::new("US-1-1"), CreateMode::Fresh).unwrap();
        let upper = backend.create(&WorkItem::new("Task"), CreateMode::Fresh).unwrap();
        let lower = backend.create(&WorkItem::new("task"), CreateMode::Fresh).unwrap();

        assert_ne!(dotted.branch, dashed.branch);
        assert_ne!(dotted.path, dashed.path);
        assert_ne!(upper.branch, lower.branch);
        assert_ne!(upper.path, lower.path);

        fs::write(dotted.path.join("dotted.txt"), "x").unwrap();
        let mut scanned: Vec<(String, PathBuf)> = backend
            .scan()
            .unwrap()
            .into_iter()
            .map(|w| (w.item_id, w.path))
            .collect();
        scanned.sort();
        assert_eq!(scanned.len(), 4);
        assert!(scanned.contains(&("US-1.1".to_string(), dotted.path.clone())));
        assert!(scanned.contains(&("US-1-1".to_string(), dashed.path.clone())));

        assert_eq!(backend.classify(&dotted).unwrap().state, OrphanState::InProgress);
        assert_eq!(backend.classify(&dashed).unwrap().state, OrphanState::Empty);
    }

    #[test]
    fn test_discard_deletes_branch() {
        let (temp_dir, branch) = setup_repo();
        let backend = backend(temp_dir.path(), &branch, &OrchestratorConfig::default());

        let workspace = backend.create(&WorkItem::new("A"), CreateMode::Fresh).unwrap();
        backend.discard(&workspace).unwrap();

        let main = GitManager::new(temp_dir.path()).unwrap();
        assert!(!main.branch_exists(&workspace.branch));
        assert!(backend.scan().unwrap().is_empty());
    }

    #[test]
    fn test_reuse_keeps_existing_work() {
        let (temp_dir, branch) = setup_repo();
        let backend = backend(temp_dir.path(), &branch, &OrchestratorConfig::default());

        let first = backend.create(&WorkItem::new("A"), CreateMode::Fresh).unwrap();
        fs::write(first.path.join("wip.txt"), "keep me").unwrap();

        let reused = backend.create(&WorkItem::new("A"), CreateMode::ReuseExisting).unwrap();
        assert_eq!(reused, first);
        assert!(reused.path.join("wip.txt").exists());

        let fresh = backend.create(&WorkItem::new("A"), CreateMode::Fresh).unwrap();
        assert!(!fresh.path.join("wip.txt").exists());
    }

    #[test]
    fn test_aux_files_are_copied_and_excluded() {
        let (temp_dir, branch) = setup_repo();
        fs::write(temp_dir.path().join(".env.local"), "TOKEN=1").unwrap();

        let config = OrchestratorConfig {
            aux_files: vec![".env.local".to_string()],
            ..Default::default()
        };
        let backend = backend(temp_dir.path(), &branch, &config);

        let workspace = backend.create(&WorkItem::new("A"), CreateMode::Fresh).unwrap();
        assert!(workspace.path.join(".env.local").exists());
        assert!(!backend.has_changes(&workspace).unwrap());
    }
}
