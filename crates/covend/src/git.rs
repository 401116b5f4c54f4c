//! Git operations for workflow worktrees and merges (spec Sections 4.3.1, 4.5).
//!
//! Every workflow owns a worktree fixed at `{workspace}/.worktrees/{task_id}`
//! on a branch named `coven/{task_id}`; there is no configurable path
//! template or merge-strategy choice, so this module is narrower than a
//! general-purpose git wrapper: it only knows how to create/destroy that one
//! worktree shape, preview a merge for human review, and perform the final
//! `--no-ff` merge the scheduler runs on approval.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("merge conflict in: {0:?}")]
    MergeConflict(Vec<String>),
    #[error("dirty working tree: {0}")]
    DirtyWorkingTree(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

fn run(dir: &Path, args: &[&str]) -> Result<std::process::Output> {
    Ok(Command::new("git").args(args).current_dir(dir).output()?)
}

fn ensure_success(output: &std::process::Output, what: &str) -> Result<()> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("{what}: {stderr}")));
    }
    Ok(())
}

/// Branch name used for a task's worktree.
pub fn worktree_branch(task_id: &str) -> String {
    format!("coven/{task_id}")
}

/// Fixed worktree path for a task, per spec Section 4.5.
pub fn worktree_path(workspace_root: &Path, task_id: &str) -> std::path::PathBuf {
    workspace_root.join(".worktrees").join(task_id)
}

/// Detect the default branch: tries the remote's HEAD symref, then `main`,
/// then `master`, defaulting to `main` if none resolve.
pub fn detect_default_branch(workspace_root: &Path) -> Result<String> {
    let output = run(
        workspace_root,
        &["symbolic-ref", "refs/remotes/origin/HEAD"],
    )?;
    if output.status.success() {
        let full_ref = String::from_utf8(output.stdout)
            .map_err(|_| GitError::InvalidUtf8)?
            .trim()
            .to_string();
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    for candidate in ["main", "master"] {
        let check = run(
            workspace_root,
            &["rev-parse", "--verify", &format!("refs/heads/{candidate}")],
        )?;
        if check.status.success() {
            return Ok(candidate.to_string());
        }
    }

    Ok("main".to_string())
}

pub fn repo_name(workspace_root: &Path) -> String {
    workspace_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo")
        .to_string()
}

pub fn branch_exists(workspace_root: &Path, branch: &str) -> Result<bool> {
    let output = run(
        workspace_root,
        &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
    )?;
    Ok(output.status.success())
}

pub fn create_branch(workspace_root: &Path, branch: &str, base: &str) -> Result<()> {
    let output = run(workspace_root, &["branch", branch, base])?;
    ensure_success(&output, &format!("git branch {branch} {base}"))
}

/// Create the fixed worktree + branch for a task, branching off `base_branch`.
pub fn create_worktree(workspace_root: &Path, task_id: &str, base_branch: &str) -> Result<()> {
    let path = worktree_path(workspace_root, task_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GitError::CommandFailed(format!("create worktree parent dir: {e}")))?;
    }

    let branch = worktree_branch(task_id);
    if !branch_exists(workspace_root, &branch)? {
        create_branch(workspace_root, &branch, base_branch)?;
    }

    let output = run(
        workspace_root,
        &["worktree", "add", &path.to_string_lossy(), &branch],
    )?;
    ensure_success(&output, "git worktree add")
}

pub fn remove_worktree(workspace_root: &Path, task_id: &str) -> Result<()> {
    let path = worktree_path(workspace_root, task_id);
    let output = run(
        workspace_root,
        &["worktree", "remove", &path.to_string_lossy()],
    )?;
    ensure_success(&output, "git worktree remove")
}

pub fn remove_worktree_force(workspace_root: &Path, task_id: &str) -> Result<()> {
    let path = worktree_path(workspace_root, task_id);
    let output = run(
        workspace_root,
        &["worktree", "remove", "--force", &path.to_string_lossy()],
    )?;
    ensure_success(&output, "git worktree remove --force")
}

#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: Option<String>,
    pub commit: String,
}

pub fn list_worktrees(workspace_root: &Path) -> Result<Vec<WorktreeInfo>> {
    let output = run(workspace_root, &["worktree", "list", "--porcelain"])?;
    ensure_success(&output, "git worktree list")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut worktrees = Vec::new();
    let mut path: Option<String> = None;
    let mut commit: Option<String> = None;
    let mut branch: Option<String> = None;

    for line in stdout.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            if let (Some(path), Some(commit)) = (path.take(), commit.take()) {
                worktrees.push(WorktreeInfo { path, commit, branch: branch.take() });
            }
            path = Some(p.to_string());
        } else if let Some(c) = line.strip_prefix("HEAD ") {
            commit = Some(c.to_string());
        } else if let Some(b) = line.strip_prefix("branch refs/heads/") {
            branch = Some(b.to_string());
        }
    }
    if let (Some(path), Some(commit)) = (path, commit) {
        worktrees.push(WorktreeInfo { path, commit, branch });
    }
    Ok(worktrees)
}

pub fn is_working_tree_clean(dir: &Path) -> Result<bool> {
    let output = run(dir, &["status", "--porcelain"])?;
    ensure_success(&output, "git status")?;
    let stdout = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(stdout.trim().is_empty())
}

pub fn checkout_branch(dir: &Path, branch: &str) -> Result<()> {
    let output = run(dir, &["checkout", branch])?;
    ensure_success(&output, &format!("git checkout {branch}"))
}

fn has_remote(dir: &Path) -> Result<bool> {
    let output = run(dir, &["remote"])?;
    ensure_success(&output, "git remote")?;
    Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
}

/// One changed file in a merge preview, with line-level stats.
#[derive(Debug, Clone)]
pub struct ChangedFile {
    pub path: String,
    pub additions: u32,
    pub deletions: u32,
}

/// The review material the merge executor attaches to a `pending_merge`
/// workflow (spec Section 4.3.1).
#[derive(Debug, Clone)]
pub struct MergePreview {
    pub diff: String,
    pub changed_files: Vec<ChangedFile>,
    pub conflicts: Vec<String>,
}

/// Build the merge preview for a task's worktree against `base_branch`,
/// without mutating the worktree or the main repo beyond a scoped,
/// always-aborted dry-run merge used purely for conflict detection.
pub fn merge_preview(worktree_path: &Path, base_branch: &str) -> Result<MergePreview> {
    let range = format!("{base_branch}...HEAD");

    let diff_output = run(worktree_path, &["diff", &range])?;
    ensure_success(&diff_output, "git diff")?;
    let diff = String::from_utf8_lossy(&diff_output.stdout).to_string();

    let numstat_output = run(worktree_path, &["diff", "--numstat", &range])?;
    ensure_success(&numstat_output, "git diff --numstat")?;
    let changed_files = String::from_utf8_lossy(&numstat_output.stdout)
        .lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let additions = parts.next()?.parse().ok()?;
            let deletions = parts.next()?.parse().ok()?;
            let path = parts.next()?.to_string();
            Some(ChangedFile { path, additions, deletions })
        })
        .collect();

    let conflicts = detect_merge_conflicts(worktree_path, base_branch)?;

    Ok(MergePreview { diff, changed_files, conflicts })
}

/// Attempt a `--no-commit` merge of `base_branch` into the worktree's
/// checked-out branch purely to enumerate files that would conflict, then
/// unconditionally abort so the worktree is left exactly as it was.
fn detect_merge_conflicts(worktree_path: &Path, base_branch: &str) -> Result<Vec<String>> {
    let merge_output = run(worktree_path, &["merge", "--no-commit", "--no-ff", base_branch])?;

    let conflicts = if !merge_output.status.success() {
        let names = run(worktree_path, &["diff", "--name-only", "--diff-filter=U"])?;
        String::from_utf8_lossy(&names.stdout)
            .lines()
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    // Always undo the dry-run merge: `--no-commit` leaves MERGE_HEAD set
    // whether or not there was a conflict.
    let _ = run(worktree_path, &["merge", "--abort"]);

    Ok(conflicts)
}

/// Perform the scheduler's final merge on `approve-merge` (spec Section
/// 4.3.1): checkout the base branch in the main repo, fast-forward from the
/// remote if one exists, then `merge --no-ff` the task's worktree branch.
/// Conflicts abort the merge and surface the conflicting file list.
pub fn merge_no_ff(workspace_root: &Path, task_id: &str, base_branch: &str) -> Result<()> {
    if !is_working_tree_clean(workspace_root)? {
        return Err(GitError::DirtyWorkingTree(
            "main repository has uncommitted changes".to_string(),
        ));
    }

    checkout_branch(workspace_root, base_branch)?;

    if has_remote(workspace_root)? {
        let pull = run(workspace_root, &["pull", "--ff-only"])?;
        ensure_success(&pull, "git pull --ff-only")?;
    }

    let branch = worktree_branch(task_id);
    let output = run(workspace_root, &["merge", "--no-ff", "--no-edit", &branch])?;
    if output.status.success() {
        return Ok(());
    }

    let names = run(workspace_root, &["diff", "--name-only", "--diff-filter=U"])?;
    let conflicts: Vec<String> = String::from_utf8_lossy(&names.stdout)
        .lines()
        .map(str::to_string)
        .collect();
    let _ = run(workspace_root, &["merge", "--abort"]);

    if conflicts.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("git merge --no-ff {branch}: {stderr}")));
    }
    Err(GitError::MergeConflict(conflicts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git").args(&args).current_dir(dir.path()).output().unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        dir
    }

    #[test]
    fn repo_name_uses_final_path_component() {
        assert_eq!(repo_name(Path::new("/home/user/my-project")), "my-project");
    }

    #[test]
    fn worktree_branch_and_path_are_task_scoped() {
        assert_eq!(worktree_branch("t1"), "coven/t1");
        assert_eq!(
            worktree_path(Path::new("/ws"), "t1"),
            std::path::PathBuf::from("/ws/.worktrees/t1")
        );
    }

    #[test]
    fn is_working_tree_clean_detects_untracked_files() {
        let dir = setup_test_repo();
        assert!(is_working_tree_clean(dir.path()).unwrap());
        std::fs::write(dir.path().join("untracked.txt"), "data").unwrap();
        assert!(!is_working_tree_clean(dir.path()).unwrap());
    }

    #[test]
    fn create_and_remove_worktree_round_trips() {
        let dir = setup_test_repo();
        create_worktree(dir.path(), "t1", "main").unwrap();
        let wt_path = worktree_path(dir.path(), "t1");
        assert!(wt_path.join("README.md").exists());

        remove_worktree_force(dir.path(), "t1").unwrap();
        assert!(!wt_path.exists());
    }

    #[test]
    fn merge_preview_reports_changed_files_with_no_conflicts() {
        let dir = setup_test_repo();
        create_worktree(dir.path(), "t1", "main").unwrap();
        let wt_path = worktree_path(dir.path(), "t1");

        std::fs::write(wt_path.join("feature.txt"), "line one\n").unwrap();
        Command::new("git").args(["add", "."]).current_dir(&wt_path).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "add feature"])
            .current_dir(&wt_path)
            .output()
            .unwrap();

        let preview = merge_preview(&wt_path, "main").unwrap();
        assert!(preview.conflicts.is_empty());
        assert_eq!(preview.changed_files.len(), 1);
        assert_eq!(preview.changed_files[0].path, "feature.txt");
        assert_eq!(preview.changed_files[0].additions, 1);
    }

    #[test]
    fn merge_preview_detects_conflicts() {
        let dir = setup_test_repo();
        create_worktree(dir.path(), "t1", "main").unwrap();
        let wt_path = worktree_path(dir.path(), "t1");

        std::fs::write(wt_path.join("README.md"), "worktree version\n").unwrap();
        Command::new("git").args(["add", "."]).current_dir(&wt_path).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "conflicting change"])
            .current_dir(&wt_path)
            .output()
            .unwrap();

        std::fs::write(dir.path().join("README.md"), "main version\n").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "main change"])
            .current_dir(dir.path())
            .output()
            .unwrap();

        let preview = merge_preview(&wt_path, "main").unwrap();
        assert_eq!(preview.conflicts, vec!["README.md".to_string()]);
        assert!(is_working_tree_clean(&wt_path).unwrap());
    }

    #[test]
    fn merge_no_ff_merges_clean_branch() {
        let dir = setup_test_repo();
        create_worktree(dir.path(), "t1", "main").unwrap();
        let wt_path = worktree_path(dir.path(), "t1");

        std::fs::write(wt_path.join("feature.txt"), "content").unwrap();
        Command::new("git").args(["add", "."]).current_dir(&wt_path).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "add feature"])
            .current_dir(&wt_path)
            .output()
            .unwrap();

        merge_no_ff(dir.path(), "t1", "main").unwrap();
        assert!(dir.path().join("feature.txt").exists());
    }

    #[test]
    fn merge_no_ff_surfaces_conflicts_and_aborts() {
        let dir = setup_test_repo();
        create_worktree(dir.path(), "t1", "main").unwrap();
        let wt_path = worktree_path(dir.path(), "t1");

        std::fs::write(wt_path.join("README.md"), "worktree version\n").unwrap();
        Command::new("git").args(["add", "."]).current_dir(&wt_path).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "conflicting change"])
            .current_dir(&wt_path)
            .output()
            .unwrap();

        std::fs::write(dir.path().join("README.md"), "main version\n").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "main change"])
            .current_dir(dir.path())
            .output()
            .unwrap();

        let err = merge_no_ff(dir.path(), "t1", "main").unwrap_err();
        assert!(matches!(err, GitError::MergeConflict(files) if files == vec!["README.md".to_string()]));
        assert!(is_working_tree_clean(dir.path()).unwrap());
    }
}
