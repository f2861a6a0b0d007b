//! Tests for GitManager

use crate::git::{GitManager, IntegrationResult, RebaseResult};
use git2::{Repository, Signature};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn setup_test_repo() -> (TempDir, GitManager) {
    let temp_dir = TempDir::new().unwrap();
    let repo_path = temp_dir.path();

    let repo = Repository::init(repo_path).unwrap();

    let sig = Signature::now("Test User", "test@example.com").unwrap();
    let tree_id = {
        let mut index = repo.index().unwrap();
        fs::write(repo_path.join("test.txt"), "line\n").unwrap();
        index.add_path(Path::new("test.txt")).unwrap();
        index.write().unwrap();
        index.write_tree().unwrap()
    };

    let tree = repo.find_tree(tree_id).unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
        .unwrap();

    let manager = GitManager::new(repo_path).unwrap();
    (temp_dir, manager)
}

/// Check out `branch`, write a file, commit, and return to `back_to`
fn commit_on_branch(
    manager: &GitManager,
    dir: &Path,
    branch: &str,
    back_to: &str,
    file: &str,
    content: &str,
) {
    manager.checkout_branch(branch).unwrap();
    fs::write(dir.join(file), content).unwrap();
    manager
        .commit_all(&format!("{} on {}", file, branch))
        .unwrap()
        .unwrap();
    manager.checkout_branch(back_to).unwrap();
}

fn head_commit(manager: &GitManager) -> String {
    manager.get_current_branch().unwrap().commit_id
}

#[test]
fn test_default_branch_name() {
    let (_temp_dir, manager) = setup_test_repo();

    let name = manager.get_default_branch_name();
    assert!(name == "main" || name == "master");
    assert_eq!(manager.get_current_branch().unwrap().name, name);
}

#[test]
fn test_create_and_delete_branch_from_commit() {
    let (_temp_dir, manager) = setup_test_repo();
    let head = head_commit(&manager);

    let branch = manager
        .create_branch_from_commit("ralph-parallel/a", &head, false)
        .unwrap();
    assert_eq!(branch.commit_id, head);
    assert!(!branch.is_head);
    assert!(manager.branch_exists("ralph-parallel/a"));

    manager.delete_branch("ralph-parallel/a").unwrap();
    assert!(!manager.branch_exists("ralph-parallel/a"));
}

#[test]
fn test_worktree_lifecycle() {
    let (temp_dir, manager) = setup_test_repo();
    let head = head_commit(&manager);
    manager
        .create_branch_from_commit("ralph-parallel/wt", &head, false)
        .unwrap();

    let path = temp_dir.path().join(".worktrees").join("wt");
    let info = manager.create_worktree("ralph-parallel/wt", &path).unwrap();
    assert_eq!(info.name, "ralph-parallel-wt");
    assert_eq!(info.branch.as_deref(), Some("ralph-parallel/wt"));
    assert!(path.join("test.txt").exists());
    assert!(manager.worktree_admin_dir(&info.name).exists());

    let listed = manager.list_worktrees().unwrap();
    assert!(listed.iter().any(|w| w.name == "ralph-parallel-wt"));

    manager.remove_worktree(&path).unwrap();
    assert!(!path.exists());
    assert!(manager.list_worktrees().unwrap().is_empty());

    // Branch can be deleted once no worktree has it checked out
    manager.delete_branch("ralph-parallel/wt").unwrap();
}

#[test]
fn test_prune_orphaned_worktrees() {
    let (temp_dir, manager) = setup_test_repo();
    let head = head_commit(&manager);
    manager
        .create_branch_from_commit("gone", &head, false)
        .unwrap();

    let path = temp_dir.path().join("gone-wt");
    manager.create_worktree("gone", &path).unwrap();
    fs::remove_dir_all(&path).unwrap();

    assert_eq!(manager.prune_orphaned_worktrees().unwrap(), 1);
    assert!(manager.list_worktrees().unwrap().is_empty());
}

#[test]
fn test_commit_all_only_when_dirty() {
    let (temp_dir, manager) = setup_test_repo();

    assert!(!manager.has_uncommitted_changes().unwrap());
    assert!(manager.commit_all("nothing").unwrap().is_none());

    fs::write(temp_dir.path().join("new_file.txt"), "New content").unwrap();
    assert!(manager.has_uncommitted_changes().unwrap());

    assert_eq!(manager.dirty_paths().unwrap(), vec!["new_file.txt"]);

    let commit = manager.commit_all("add file").unwrap().unwrap();
    assert_eq!(commit.message, "add file");
    assert_eq!(commit.short_id.len(), 7);
    assert!(!manager.has_uncommitted_changes().unwrap());
}

#[test]
fn test_merge_fast_forward() {
    let (temp_dir, manager) = setup_test_repo();
    let main = manager.get_default_branch_name();
    manager
        .create_branch_from_commit("feature", &head_commit(&manager), false)
        .unwrap();
    commit_on_branch(&manager, temp_dir.path(), "feature", &main, "f.txt", "feature\n");

    let result = manager.integrate_branch("feature", &main).unwrap();
    assert!(matches!(result, IntegrationResult::FastForward { .. }));
    assert!(temp_dir.path().join("f.txt").exists());
    assert_eq!(
        manager.branch_tip(&main).unwrap(),
        manager.branch_tip("feature").unwrap()
    );
}

#[test]
fn test_merge_conflict_and_abort() {
    let (temp_dir, manager) = setup_test_repo();
    let main = manager.get_default_branch_name();
    let base = head_commit(&manager);
    manager.create_branch_from_commit("left", &base, false).unwrap();
    manager.create_branch_from_commit("right", &base, false).unwrap();
    commit_on_branch(&manager, temp_dir.path(), "left", &main, "test.txt", "left side\n");
    commit_on_branch(&manager, temp_dir.path(), "right", &main, "test.txt", "right side change\n");

    assert!(matches!(
        manager.integrate_branch("left", &main).unwrap(),
        IntegrationResult::FastForward { .. }
    ));

    let result = manager.integrate_branch("right", &main).unwrap();
    assert_eq!(
        result,
        IntegrationResult::Conflict {
            files: vec!["test.txt".to_string()]
        }
    );

    assert!(!manager.has_uncommitted_changes().unwrap());
    assert_eq!(
        fs::read_to_string(temp_dir.path().join("test.txt")).unwrap(),
        "left side\n"
    );
}

#[test]
fn test_rebase_onto_clean() {
    let (temp_dir, manager) = setup_test_repo();
    let main = manager.get_default_branch_name();
    manager
        .create_branch_from_commit("feature", &head_commit(&manager), false)
        .unwrap();
    commit_on_branch(&manager, temp_dir.path(), "feature", &main, "feature.txt", "feature\n");
    fs::write(temp_dir.path().join("main.txt"), "main work\n").unwrap();
    manager.commit_all("main work").unwrap();

    assert_eq!(manager.ahead_behind("feature", &main).unwrap(), (1, 1));

    let result = manager.rebase_onto("feature", &main).unwrap();
    assert!(matches!(result, RebaseResult::Rebased { replayed: 1, .. }));
    assert_eq!(manager.ahead_behind("feature", &main).unwrap(), (1, 0));

    let merged = manager.integrate_branch("feature", &main).unwrap();
    assert!(matches!(merged, IntegrationResult::FastForward { .. }));
    assert!(temp_dir.path().join("feature.txt").exists());
    assert!(temp_dir.path().join("main.txt").exists());
}

#[test]
fn test_rebase_up_to_date() {
    let (_temp_dir, manager) = setup_test_repo();
    let main = manager.get_default_branch_name();
    manager
        .create_branch_from_commit("same", &head_commit(&manager), false)
        .unwrap();

    assert_eq!(
        manager.rebase_onto("same", &main).unwrap(),
        RebaseResult::UpToDate
    );
}

#[test]
fn test_rebase_conflict_leaves_branch_and_merge_succeeds() {
    let (temp_dir, manager) = setup_test_repo();
    let main = manager.get_default_branch_name();
    manager
        .create_branch_from_commit("feature", &head_commit(&manager), false)
        .unwrap();

    // Feature changes the line and then restores it; main changes it for real
    commit_on_branch(&manager, temp_dir.path(), "feature", &main, "test.txt", "feature change!\n");
    commit_on_branch(&manager, temp_dir.path(), "feature", &main, "test.txt", "line\n");
    fs::write(temp_dir.path().join("test.txt"), "main change\n").unwrap();
    manager.commit_all("main change").unwrap();

    let feature_tip = manager.branch_tip("feature").unwrap();
    let result = manager.rebase_onto("feature", &main).unwrap();
    match result {
        RebaseResult::Conflict { files, commit } => {
            assert_eq!(files, vec!["test.txt"]);
            assert_ne!(commit, feature_tip.to_string());
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    assert_eq!(manager.branch_tip("feature").unwrap(), feature_tip);

    let merged = manager.integrate_branch("feature", &main).unwrap();
    assert!(matches!(merged, IntegrationResult::Merged { .. }));
    assert_eq!(
        fs::read_to_string(temp_dir.path().join("test.txt")).unwrap(),
        "main change\n"
    );
}

#[test]
fn test_has_changes_since_baseline() {
    let (temp_dir, manager) = setup_test_repo();
    let baseline = manager.branch_tip(&manager.get_default_branch_name()).unwrap().to_string();

    assert!(!manager.has_changes_since(&baseline).unwrap());

    fs::write(temp_dir.path().join("new.txt"), "fresh").unwrap();
    assert!(manager.has_changes_since(&baseline).unwrap());

    manager.commit_all("Add new.txt").unwrap();
    assert!(manager.has_changes_since(&baseline).unwrap());
}
