//! Shared test fixtures: temp git repositories, fake provider CLI
//! scripts, and PRD file builders.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

/// A temporary git repository with an initial commit.
pub struct TempRepo {
    dir: TempDir,
    repo_path: PathBuf,
}

impl TempRepo {
    /// Initialize a repo on branch `main` with a committed `README.md`.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo_path = dir.path().join("repo");
        std::fs::create_dir_all(&repo_path).expect("failed to create repo dir");

        git(&repo_path, &["init", "-b", "main"]);
        git(&repo_path, &["config", "user.email", "test@ralph.dev"]);
        git(&repo_path, &["config", "user.name", "Ralph Test"]);

        std::fs::write(repo_path.join("README.md"), "# Test repo\n")
            .expect("failed to write README");
        git(&repo_path, &["add", "."]);
        git(&repo_path, &["commit", "-m", "Initial commit"]);

        Self { dir, repo_path }
    }

    pub fn path(&self) -> &Path {
        &self.repo_path
    }

    /// A scratch directory next to the repo (inside the same TempDir).
    pub fn scratch(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(&path).expect("failed to create scratch dir");
        path
    }

    /// Write a file and commit it.
    pub fn commit_file(&self, relative: &str, contents: &str, message: &str) -> String {
        let path = self.repo_path.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent dir");
        }
        std::fs::write(&path, contents).expect("failed to write file");
        git(&self.repo_path, &["add", "-A"]);
        git(&self.repo_path, &["commit", "-m", message]);
        self.head()
    }

    pub fn head(&self) -> String {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.repo_path)
            .output()
            .expect("failed to run git rev-parse");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }
}

impl Default for TempRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Write an executable shell script and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("failed to write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod script");
    }
    path
}

/// A fake provider that emits a Claude-style result line carrying the
/// completion sentinel. `pre_cmd` is a raw shell line run first in the
/// provider's working directory (so factory workers have something to
/// commit).
pub fn fake_provider_success(dir: &Path, name: &str, pre_cmd: Option<&str>) -> PathBuf {
    let pre = match pre_cmd {
        Some(cmd) => format!("{cmd}\n"),
        None => String::new(),
    };
    write_script(
        dir,
        name,
        &format!(
            "{pre}echo '{{\"type\":\"assistant\",\"message\":{{\"content\":[{{\"type\":\"text\",\"text\":\"working\"}}]}}}}'\n\
             echo '{{\"type\":\"result\",\"result\":\"All done. TASK_COMPLETE\"}}'\n"
        ),
    )
}

/// A fake provider that finishes cleanly but never emits the sentinel.
pub fn fake_provider_no_sentinel(dir: &Path, name: &str) -> PathBuf {
    write_script(
        dir,
        name,
        "echo '{\"type\":\"result\",\"result\":\"I made some progress but am not done.\"}'\n",
    )
}

/// A fake provider that reports an upstream rate limit and fails.
pub fn fake_provider_rate_limited(dir: &Path, name: &str) -> PathBuf {
    write_script(
        dir,
        name,
        "echo '{\"type\":\"error\",\"error\":{\"message\":\"rate_limit_error: quota exceeded\"}}'\nexit 1\n",
    )
}

/// A fake provider that appends each prompt (its last argv) to a capture
/// file before succeeding, for asserting on prompt contents.
pub fn fake_provider_capturing(dir: &Path, name: &str, capture_file: &Path) -> PathBuf {
    write_script(
        dir,
        name,
        &format!(
            "for last in \"$@\"; do :; done\n\
             printf '%s\\n---\\n' \"$last\" >> {capture}\n\
             echo '{{\"type\":\"result\",\"result\":\"Done. TASK_COMPLETE\"}}'\n",
            capture = capture_file.display()
        ),
    )
}

/// Serialize a PRD file from `(id, priority, dependencies)` triples.
pub fn write_prd_file(path: &Path, items: &[(&str, &str, &[&str])]) {
    let items: Vec<serde_json::Value> = items
        .iter()
        .map(|(id, priority, deps)| {
            serde_json::json!({
                "id": id,
                "description": format!("task {id}"),
                "priority": priority,
                "dependencies": deps,
            })
        })
        .collect();
    let body = serde_json::json!({
        "project": "fixture",
        "items": items,
    });
    std::fs::write(path, serde_json::to_string_pretty(&body).unwrap())
        .expect("failed to write PRD file");
}
