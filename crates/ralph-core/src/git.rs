//! Git plumbing shared by the worktree manager, the merge coordinator,
//! and the validation pipeline. Everything shells out to `git`.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("git command failed: {message}")]
    Command {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// Run a git command in `dir`, returning the raw output regardless of
/// exit status.
pub fn run_git(dir: &Path, args: &[&str]) -> Result<Output, GitError> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| GitError::Command {
            message: format!("failed to run git {}", args.join(" ")),
            source: e,
        })
}

/// Run a git command and fail on a non-zero exit.
pub fn git_ok(dir: &Path, args: &[&str]) -> Result<Output, GitError> {
    let output = run_git(dir, args)?;
    if !output.status.success() {
        return Err(GitError::Exit {
            command: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    Ok(output)
}

/// Run a git command and return trimmed stdout.
pub fn git_stdout(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = git_ok(dir, args)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub fn is_git_repo(dir: &Path) -> bool {
    run_git(dir, &["rev-parse", "--git-dir"])
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn head_commit(dir: &Path) -> Result<String, GitError> {
    git_stdout(dir, &["rev-parse", "HEAD"])
}

pub fn current_branch(dir: &Path) -> Result<String, GitError> {
    // `status --porcelain -b` first line: "## branch...upstream".
    let status = git_stdout(dir, &["status", "--porcelain", "-b"])?;
    let first = status.lines().next().unwrap_or("");
    let branch = first
        .trim_start_matches("## ")
        .split("...")
        .next()
        .unwrap_or("")
        .to_string();
    Ok(branch)
}

/// Paths changed against HEAD: staged, unstaged, and untracked.
pub fn changed_paths(dir: &Path) -> Result<Vec<String>, GitError> {
    let mut paths = Vec::new();
    for args in [
        &["diff", "--name-only"][..],
        &["diff", "--staged", "--name-only"][..],
        &["ls-files", "--others", "--exclude-standard"][..],
    ] {
        let stdout = git_stdout(dir, args)?;
        for line in stdout.lines() {
            let line = line.trim();
            if !line.is_empty() && !paths.contains(&line.to_string()) {
                paths.push(line.to_string());
            }
        }
    }
    Ok(paths)
}

/// Combined staged + unstaged diff against HEAD, for judge prompts.
pub fn diff_vs_head(dir: &Path) -> Result<String, GitError> {
    let unstaged = git_stdout(dir, &["diff"])?;
    let staged = git_stdout(dir, &["diff", "--staged"])?;
    if staged.is_empty() {
        Ok(unstaged)
    } else if unstaged.is_empty() {
        Ok(staged)
    } else {
        Ok(format!("{staged}\n{unstaged}"))
    }
}

/// `git diff --stat` over a revision range; empty string when the range
/// does not resolve (e.g. fewer than N commits).
pub fn diff_stat(dir: &Path, range: &str) -> String {
    run_git(dir, &["diff", "--stat", range])
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_default()
}

/// Any staged, unstaged, or untracked changes?
pub fn has_changes(dir: &Path) -> Result<bool, GitError> {
    let status = git_stdout(dir, &["status", "--porcelain"])?;
    Ok(!status.is_empty())
}

/// Stage everything and commit. Returns the new commit hash, or `None`
/// when there was nothing to commit.
pub fn stage_all_and_commit(dir: &Path, message: &str) -> Result<Option<String>, GitError> {
    git_ok(dir, &["add", "-A"])?;
    if !has_changes(dir)? {
        return Ok(None);
    }
    git_ok(dir, &["commit", "-m", message])?;
    head_commit(dir).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) {
        git_ok(dir, &["init", "-b", "main"]).unwrap();
        git_ok(dir, &["config", "user.email", "ralph@localhost"]).unwrap();
        git_ok(dir, &["config", "user.name", "ralph"]).unwrap();
        std::fs::write(dir.join("README.md"), "# repo\n").unwrap();
        git_ok(dir, &["add", "."]).unwrap();
        git_ok(dir, &["commit", "-m", "initial"]).unwrap();
    }

    #[test]
    fn detects_git_repos() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!is_git_repo(tmp.path()));
        init_repo(tmp.path());
        assert!(is_git_repo(tmp.path()));
    }

    #[test]
    fn head_and_branch_resolve() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());
        let head = head_commit(tmp.path()).unwrap();
        assert_eq!(head.len(), 40);
        assert_eq!(current_branch(tmp.path()).unwrap(), "main");
    }

    #[test]
    fn changed_paths_sees_all_three_kinds() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());

        // Unstaged modification.
        std::fs::write(tmp.path().join("README.md"), "changed\n").unwrap();
        // Staged addition.
        std::fs::write(tmp.path().join("staged.txt"), "s\n").unwrap();
        git_ok(tmp.path(), &["add", "staged.txt"]).unwrap();
        // Untracked file.
        std::fs::write(tmp.path().join("untracked.txt"), "u\n").unwrap();

        let paths = changed_paths(tmp.path()).unwrap();
        assert!(paths.contains(&"README.md".to_string()));
        assert!(paths.contains(&"staged.txt".to_string()));
        assert!(paths.contains(&"untracked.txt".to_string()));
    }

    #[test]
    fn stage_all_and_commit_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());

        // Nothing to commit.
        assert!(stage_all_and_commit(tmp.path(), "noop").unwrap().is_none());

        std::fs::write(tmp.path().join("work.txt"), "done\n").unwrap();
        let hash = stage_all_and_commit(tmp.path(), "task-1: work").unwrap();
        assert!(hash.is_some());
        assert_eq!(hash.unwrap(), head_commit(tmp.path()).unwrap());
        assert!(!has_changes(tmp.path()).unwrap());
    }

    #[test]
    fn diff_stat_is_empty_for_bad_range() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo(tmp.path());
        assert_eq!(diff_stat(tmp.path(), "HEAD~10..HEAD"), "");
    }
}
