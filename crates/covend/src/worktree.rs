//! Worktree lifecycle management (spec Section 4.5, fixed layout only —
//! Coven has no provider abstraction, it always uses native git).
//!
//! Each workflow owns exactly one worktree at
//! `{workspace}/.worktrees/{task_id}` on branch `coven/{task_id}`, created
//! by the scheduler before handing off to the engine and destroyed after a
//! successful merge or left in place for inspection after cancellation.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::git;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] git::GitError),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Create the worktree + branch for `task_id`, branching off `base_branch`.
///
/// Idempotent: if the branch already exists (e.g. a crash-restart), it is
/// reused rather than recreated.
pub fn create(workspace_root: &Path, task_id: &str, base_branch: &str) -> Result<PathBuf> {
    git::create_worktree(workspace_root, task_id, base_branch)?;
    Ok(git::worktree_path(workspace_root, task_id))
}

/// The fixed worktree path for `task_id`, without touching the filesystem.
pub fn path_for(workspace_root: &Path, task_id: &str) -> PathBuf {
    git::worktree_path(workspace_root, task_id)
}

/// The fixed per-task branch name.
pub fn branch_for(task_id: &str) -> String {
    git::worktree_branch(task_id)
}

/// Remove the worktree after a successful merge. Best-effort: failures are
/// logged, not propagated — a stranded worktree does not invalidate a
/// completed workflow (spec Section 5, "worktrees... never shared").
pub fn destroy(workspace_root: &Path, task_id: &str) {
    if let Err(err) = git::remove_worktree(workspace_root, task_id) {
        warn!(task_id, %err, "failed to remove worktree after completion");
    }
}

/// Remove a worktree even if it has uncommitted changes, used when rolling
/// back a failed worktree creation or garbage-collecting a cancelled run.
pub fn destroy_force(workspace_root: &Path, task_id: &str) {
    if let Err(err) = git::remove_worktree_force(workspace_root, task_id) {
        warn!(task_id, %err, "failed to force-remove worktree");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .unwrap();
        };
        run(&["init"]);
        run(&["config", "user.email", "test@test.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# test").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);
        dir
    }

    #[test]
    fn create_and_destroy_round_trip() {
        let dir = init_repo();
        let base = git::detect_default_branch(dir.path()).unwrap_or_else(|_| "main".to_string());

        let path = create(dir.path(), "t1", &base).unwrap();
        assert!(path.exists());
        assert_eq!(path, path_for(dir.path(), "t1"));
        assert_eq!(branch_for("t1"), "coven/t1");

        destroy(dir.path(), "t1");
        assert!(!path.exists());
    }
}
