//! Git worktree management for factory workers.
//!
//! Each worker owns an isolated checkout at `<worktree_dir>/worker-<i>`
//! on a dedicated `ralph-factory/worker-<i>` branch. Worktrees share the
//! trunk's object store but have independent working directories, so N
//! agents can edit concurrently without touching the trunk tree.
//!
//! Git serializes worktree mutations with a lock file on the shared
//! object store; this manager serializes its own mutating operations
//! through an internal mutex so concurrent workers do not race it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::git::{self, GitError};

/// Branch namespace for factory workers.
pub const BRANCH_PREFIX: &str = "ralph-factory";

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

/// Information about a single registered worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// Manages the per-worker worktrees of one trunk repository.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            worktree_base: self.worktree_base.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorktreeManager {
    /// Create a manager for `repo_path`. Worktrees land under
    /// `worktree_base`, defaulting to a sibling directory named
    /// `<repo-name>-ralph-worktrees`.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktree_base: Option<PathBuf>,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();
        if !git::is_git_repo(&repo_path) {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        let worktree_base = worktree_base.unwrap_or_else(|| {
            let repo_name = repo_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("repo");
            let base_name = format!("{repo_name}-ralph-worktrees");
            repo_path
                .parent()
                .map(|p| p.join(&base_name))
                .unwrap_or_else(|| PathBuf::from(base_name))
        });

        Ok(Self {
            repo_path,
            worktree_base,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    /// Conventional branch name for a worker.
    pub fn worker_branch(worker_id: usize) -> String {
        format!("{BRANCH_PREFIX}/worker-{worker_id}")
    }

    /// Conventional worktree path for a worker.
    pub fn worker_path(&self, worker_id: usize) -> PathBuf {
        self.worktree_base.join(format!("worker-{worker_id}"))
    }

    /// Create (or recreate) the worktree for a worker.
    ///
    /// Prunes stale refs first and force-deletes any pre-existing branch
    /// so each pool start begins from a clean trunk HEAD. When
    /// `deps_dir` is given (e.g. `node_modules`), the trunk's copy is
    /// symlinked into the worktree; failure there is non-fatal.
    pub fn create_worker_worktree(
        &self,
        worker_id: usize,
        deps_dir: Option<&str>,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let branch = Self::worker_branch(worker_id);
        let path = self.worker_path(worker_id);

        git::git_ok(&self.repo_path, &["worktree", "prune"])?;

        // A leftover worktree from a previous run blocks both the branch
        // delete and the add; remove it first.
        if path.exists() || self.find_by_path(&path).is_ok() {
            self.remove_worktree_locked(&path)?;
        }
        self.delete_branch_locked(&branch)?;

        if !self.worktree_base.exists() {
            std::fs::create_dir_all(&self.worktree_base).map_err(|e| {
                WorktreeError::Git(GitError::Command {
                    message: format!(
                        "failed to create worktree base {}",
                        self.worktree_base.display()
                    ),
                    source: e,
                })
            })?;
        }

        let path_str = path.to_string_lossy();
        git::git_ok(
            &self.repo_path,
            &["worktree", "add", "-b", &branch, path_str.as_ref()],
        )?;

        if let Some(deps) = deps_dir {
            let target = self.repo_path.join(deps);
            let link = path.join(deps);
            if target.exists() && !link.exists() {
                #[cfg(unix)]
                if let Err(e) = std::os::unix::fs::symlink(&target, &link) {
                    tracing::warn!(
                        target = %target.display(),
                        link = %link.display(),
                        error = %e,
                        "dependency symlink failed (non-fatal)"
                    );
                }
            }
        }

        self.find_by_path(&path)
    }

    /// Reset a worker's worktree to the trunk's current HEAD: hard reset
    /// plus a clean of untracked files.
    pub fn reset_to_trunk(&self, worktree_path: &Path) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let trunk_head = git::head_commit(&self.repo_path)?;
        git::git_ok(worktree_path, &["reset", "--hard", &trunk_head])?;
        git::git_ok(worktree_path, &["clean", "-fd"])?;
        Ok(())
    }

    /// Remove one worktree (idempotent).
    pub fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.remove_worktree_locked(path)
    }

    /// Tear down every worker worktree and `ralph-factory/*` branch,
    /// then prune stale refs.
    pub fn cleanup_all(&self, worker_count: usize) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        for worker_id in 0..worker_count {
            let path = self.worker_path(worker_id);
            if let Err(e) = self.remove_worktree_locked(&path) {
                tracing::warn!(path = %path.display(), error = %e, "worktree removal failed during cleanup");
            }
        }
        for branch in self.factory_branches()? {
            if let Err(e) = self.delete_branch_locked(&branch) {
                tracing::warn!(branch = %branch, error = %e, "branch deletion failed during cleanup");
            }
        }
        git::git_ok(&self.repo_path, &["worktree", "prune"])?;
        Ok(())
    }

    /// List all registered worktrees via porcelain output.
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = git::git_ok(&self.repo_path, &["worktree", "list", "--porcelain"])?;
        parse_porcelain_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// All local branches under the factory namespace.
    pub fn factory_branches(&self) -> Result<Vec<String>, WorktreeError> {
        let pattern = format!("{BRANCH_PREFIX}/*");
        let stdout = git::git_stdout(
            &self.repo_path,
            &["branch", "--list", &pattern, "--format=%(refname:short)"],
        )?;
        Ok(stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    fn remove_worktree_locked(&self, path: &Path) -> Result<(), WorktreeError> {
        if self.find_by_path(path).is_err() {
            if path.exists() {
                tracing::warn!(
                    path = %path.display(),
                    "directory exists but is not a registered worktree, removing"
                );
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let path_str = path.to_string_lossy();
        let output = git::run_git(
            &self.repo_path,
            &["worktree", "remove", "--force", path_str.as_ref()],
        )?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(WorktreeError::Git(GitError::Exit {
                command: "worktree remove".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            }));
        }
        Ok(())
    }

    fn delete_branch_locked(&self, branch: &str) -> Result<(), WorktreeError> {
        let output = git::run_git(&self.repo_path, &["branch", "-D", branch])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("not found") {
                return Ok(());
            }
            return Err(WorktreeError::Git(GitError::Exit {
                command: "branch -D".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            }));
        }
        Ok(())
    }

    fn find_by_path(&self, path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let worktrees = self.list_worktrees()?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        for wt in worktrees {
            let wt_canonical = wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone());
            if wt_canonical == canonical {
                return Ok(wt);
            }
        }
        Err(WorktreeError::ParseError(format!(
            "worktree not found at path: {}",
            path.display()
        )))
    }
}

/// Parse `git worktree list --porcelain` output: blank-line separated
/// blocks of `worktree <path>` / `HEAD <sha>` / `branch refs/heads/<n>`.
fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_head: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let (Some(path), Some(head)) = (current_path.take(), current_head.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    branch: current_branch.take(),
                    head_commit: head,
                });
            } else {
                current_path = None;
                current_head = None;
                current_branch = None;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            let branch = rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string();
            current_branch = Some(branch);
        }
        // `bare`, `detached`, `prunable` lines are ignored.
    }

    if let (Some(path), Some(head)) = (current_path, current_head) {
        worktrees.push(WorktreeInfo {
            path,
            branch: current_branch,
            head_commit: head,
        });
    }

    Ok(worktrees)
}
