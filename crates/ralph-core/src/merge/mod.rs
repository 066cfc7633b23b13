//! Merge coordinator: serialized cherry-picks of worker commits onto the
//! trunk.
//!
//! The trunk working tree may hold unstaged updates to task-status files
//! written by the orchestrator; the protocol therefore resets only the
//! index (never the working tree) before each cherry-pick and tolerates
//! the stash dance needed when untracked files would be overwritten.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use crate::git;

/// Outcome of one cherry-pick attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    pub conflict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Retained history row for session logging.
#[derive(Debug, Clone, Serialize)]
pub struct MergeRecord {
    pub task_id: String,
    pub source_commit: String,
    pub outcome: MergeOutcome,
    pub timestamp: DateTime<Utc>,
}

/// Owns the trunk working tree during a cherry-pick.
#[derive(Debug)]
pub struct MergeCoordinator {
    repo_path: PathBuf,
    /// Serializes cherry-picks; at most one in flight.
    lock: AsyncMutex<()>,
    history: Mutex<Vec<MergeRecord>>,
}

impl MergeCoordinator {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            lock: AsyncMutex::new(()),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Cherry-pick a worker commit onto the trunk.
    ///
    /// Serialized through the coordinator's mutex. Returns a conflict
    /// outcome (after aborting) rather than an error when the pick does
    /// not apply cleanly.
    pub async fn cherry_pick(&self, commit_hash: &str, task_id: &str) -> MergeOutcome {
        let _guard = self.lock.lock().await;
        let outcome = self.cherry_pick_locked(commit_hash, task_id);
        self.push_history(MergeRecord {
            task_id: task_id.to_string(),
            source_commit: commit_hash.to_string(),
            outcome: outcome.clone(),
            timestamp: Utc::now(),
        });
        outcome
    }

    /// Every cherry-pick attempted so far, successful or not.
    pub fn history(&self) -> Vec<MergeRecord> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn cherry_pick_locked(&self, commit_hash: &str, task_id: &str) -> MergeOutcome {
        let repo = &self.repo_path;

        // Reset only the index, preserving unstaged working-tree
        // mutations, and clear any cherry-pick left in progress.
        let _ = git::run_git(repo, &["reset", "HEAD"]);
        if self.cherry_pick_in_progress() {
            tracing::warn!(task_id = %task_id, "aborting stale in-progress cherry-pick");
            let _ = git::run_git(repo, &["cherry-pick", "--abort"]);
        }

        let first = match git::run_git(repo, &["cherry-pick", commit_hash]) {
            Ok(output) => output,
            Err(e) => return self.error_outcome(task_id, &e.to_string()),
        };

        let output = if first.status.success() {
            first
        } else {
            let stderr = String::from_utf8_lossy(&first.stderr).to_string();
            if stderr.contains("untracked working tree files would be overwritten") {
                // Stash the obstructions away, retry, then restore them.
                // A conflicted pop is tolerated: the pick itself won.
                tracing::warn!(task_id = %task_id, "untracked files in the way; stashing and retrying");
                let _ = git::run_git(repo, &["add", "-A"]);
                let _ = git::run_git(repo, &["stash"]);
                let _ = git::run_git(repo, &["cherry-pick", "--abort"]);
                let retried = match git::run_git(repo, &["cherry-pick", commit_hash]) {
                    Ok(output) => output,
                    Err(e) => return self.error_outcome(task_id, &e.to_string()),
                };
                let _ = git::run_git(repo, &["stash", "pop"]);
                retried
            } else {
                first
            }
        };

        if output.status.success() {
            return match git::head_commit(repo) {
                Ok(head) => {
                    tracing::info!(task_id = %task_id, commit = %head, "cherry-pick landed on trunk");
                    MergeOutcome {
                        success: true,
                        commit_hash: Some(head),
                        conflict: false,
                        error: None,
                    }
                }
                Err(e) => self.error_outcome(task_id, &e.to_string()),
            };
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let combined = format!("{stdout}\n{stderr}");

        if combined.contains("CONFLICT") || combined.contains("could not apply") {
            tracing::warn!(task_id = %task_id, commit = %commit_hash, "cherry-pick conflict; aborting");
            let _ = git::run_git(repo, &["cherry-pick", "--abort"]);
            return MergeOutcome {
                success: false,
                commit_hash: None,
                conflict: true,
                error: None,
            };
        }

        let _ = git::run_git(repo, &["cherry-pick", "--abort"]);
        self.error_outcome(task_id, combined.trim())
    }

    fn cherry_pick_in_progress(&self) -> bool {
        git::git_stdout(&self.repo_path, &["rev-parse", "--git-path", "CHERRY_PICK_HEAD"])
            .map(|p| self.repo_path.join(p).exists())
            .unwrap_or(false)
    }

    fn error_outcome(&self, task_id: &str, message: &str) -> MergeOutcome {
        tracing::error!(task_id = %task_id, error = %message, "cherry-pick failed");
        MergeOutcome {
            success: false,
            commit_hash: None,
            conflict: false,
            error: Some(message.to_string()),
        }
    }

    fn push_history(&self, record: MergeRecord) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::git_ok;
    use std::path::PathBuf;

    fn create_trunk() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("trunk");
        std::fs::create_dir_all(&repo).unwrap();
        git_ok(&repo, &["init", "-b", "main"]).unwrap();
        git_ok(&repo, &["config", "user.email", "ralph@localhost"]).unwrap();
        git_ok(&repo, &["config", "user.name", "ralph"]).unwrap();
        std::fs::write(repo.join("base.txt"), "base\n").unwrap();
        git_ok(&repo, &["add", "."]).unwrap();
        git_ok(&repo, &["commit", "-m", "initial"]).unwrap();
        (dir, repo)
    }

    /// Commit a change on a side branch and return its hash, leaving the
    /// trunk checked out on main.
    fn commit_on_branch(repo: &Path, branch: &str, file: &str, content: &str) -> String {
        git_ok(repo, &["checkout", "-b", branch]).unwrap();
        std::fs::write(repo.join(file), content).unwrap();
        git_ok(repo, &["add", "-A"]).unwrap();
        git_ok(repo, &["commit", "-m", &format!("edit {file}")]).unwrap();
        let hash = crate::git::head_commit(repo).unwrap();
        git_ok(repo, &["checkout", "main"]).unwrap();
        hash
    }

    #[tokio::test]
    async fn clean_cherry_pick_lands_on_trunk() {
        let (_tmp, repo) = create_trunk();
        let hash = commit_on_branch(&repo, "side", "feature.txt", "feature\n");

        let coordinator = MergeCoordinator::new(&repo);
        let outcome = coordinator.cherry_pick(&hash, "task-1").await;

        assert!(outcome.success, "outcome: {outcome:?}");
        assert!(!outcome.conflict);
        assert_eq!(
            outcome.commit_hash.as_deref(),
            Some(crate::git::head_commit(&repo).unwrap().as_str())
        );
        assert!(repo.join("feature.txt").exists());

        let history = coordinator.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].task_id, "task-1");
    }

    #[tokio::test]
    async fn conflicting_cherry_pick_is_aborted() {
        let (_tmp, repo) = create_trunk();
        // Branch edits base.txt from the original content...
        let hash = commit_on_branch(&repo, "side", "base.txt", "branch version\n");
        // ...while trunk moves the same file somewhere else.
        std::fs::write(repo.join("base.txt"), "trunk version\n").unwrap();
        git_ok(&repo, &["add", "-A"]).unwrap();
        git_ok(&repo, &["commit", "-m", "trunk edit"]).unwrap();
        let trunk_head = crate::git::head_commit(&repo).unwrap();

        let coordinator = MergeCoordinator::new(&repo);
        let outcome = coordinator.cherry_pick(&hash, "task-1").await;

        assert!(!outcome.success);
        assert!(outcome.conflict, "outcome: {outcome:?}");
        // No new trunk commit; the conflicted state was aborted.
        assert_eq!(crate::git::head_commit(&repo).unwrap(), trunk_head);
        assert_eq!(
            std::fs::read_to_string(repo.join("base.txt")).unwrap(),
            "trunk version\n"
        );
    }

    #[tokio::test]
    async fn cherry_pick_succeeds_after_a_conflict() {
        let (_tmp, repo) = create_trunk();
        let conflicting = commit_on_branch(&repo, "side-a", "base.txt", "branch version\n");
        let clean = commit_on_branch(&repo, "side-b", "other.txt", "ok\n");

        std::fs::write(repo.join("base.txt"), "trunk version\n").unwrap();
        git_ok(&repo, &["add", "-A"]).unwrap();
        git_ok(&repo, &["commit", "-m", "trunk edit"]).unwrap();

        let coordinator = MergeCoordinator::new(&repo);
        let first = coordinator.cherry_pick(&conflicting, "task-a").await;
        assert!(first.conflict);

        let second = coordinator.cherry_pick(&clean, "task-b").await;
        assert!(second.success, "outcome: {second:?}");
        assert!(repo.join("other.txt").exists());

        assert_eq!(coordinator.history().len(), 2);
    }

    #[tokio::test]
    async fn unstaged_status_file_edits_survive_cherry_pick() {
        let (_tmp, repo) = create_trunk();
        let hash = commit_on_branch(&repo, "side", "feature.txt", "feature\n");

        // The orchestrator keeps unstaged mutations to a tracked status
        // file in the trunk tree; the pick must not clobber them.
        std::fs::write(repo.join("base.txt"), "status update in flight\n").unwrap();

        let coordinator = MergeCoordinator::new(&repo);
        let outcome = coordinator.cherry_pick(&hash, "task-1").await;
        assert!(outcome.success, "outcome: {outcome:?}");
        assert_eq!(
            std::fs::read_to_string(repo.join("base.txt")).unwrap(),
            "status update in flight\n"
        );
    }

    #[tokio::test]
    async fn untracked_obstruction_is_stashed_and_restored() {
        let (_tmp, repo) = create_trunk();
        let hash = commit_on_branch(&repo, "side", "new-file.txt", "from branch\n");

        // An untracked file at the same path blocks the pick.
        std::fs::write(repo.join("new-file.txt"), "local untracked\n").unwrap();

        let coordinator = MergeCoordinator::new(&repo);
        let outcome = coordinator.cherry_pick(&hash, "task-1").await;

        // Either way the coordinator must not error out with a raw git
        // failure: the stash dance resolves the obstruction.
        assert!(
            outcome.success || outcome.conflict,
            "unexpected outcome: {outcome:?}"
        );
        assert!(repo.join("new-file.txt").exists());
    }
}
