//! Validation pipeline: affected-package detection plus ordered gates.
//!
//! Gates shell out to per-(package, gate) commands; this module is not a
//! build system. A gate passes iff the command exits zero and, for lint
//! gates, the output reports no errors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::git;
use crate::task::Task;

/// A single validation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDef {
    pub name: &'static str,
    pub priority: u32,
}

/// The gate catalog, ordered by ascending priority at run time.
pub const GATES: &[GateDef] = &[
    GateDef { name: "fast-linter", priority: 10 },
    GateDef { name: "build", priority: 20 },
    GateDef { name: "test", priority: 30 },
    GateDef { name: "lint", priority: 40 },
    GateDef { name: "custom", priority: 50 },
];

/// Result of one gate run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub package: String,
    pub passed: bool,
    /// Wall-clock seconds.
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
}

/// The validation result slot persisted on the task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_gates: Vec<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<GateResult>,
}

/// Maps a repository path prefix to a package name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRule {
    pub path_prefix: String,
    pub package: String,
}

/// Validation pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Explicit affected-package override; short-circuits detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packages_override: Option<Vec<String>>,
    /// Path-prefix rules consulted against changed files.
    #[serde(default)]
    pub path_rules: Vec<PackageRule>,
    /// Keyword -> package matches applied to the task category.
    #[serde(default)]
    pub category_keywords: Vec<(String, String)>,
    #[serde(default = "default_package")]
    pub default_package: String,
    /// Package -> directory (relative to the working tree root).
    #[serde(default)]
    pub package_dirs: HashMap<String, String>,
    /// Package -> gate -> shell command.
    #[serde(default)]
    pub commands: HashMap<String, HashMap<String, String>>,
    #[serde(default = "default_gate_timeout")]
    pub gate_timeout_secs: u64,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub disabled_gates: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_package() -> String {
    "frontend".to_string()
}

fn default_gate_timeout() -> u64 {
    120
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            packages_override: None,
            path_rules: Vec::new(),
            category_keywords: vec![
                ("backend".to_string(), "backend".to_string()),
                ("api".to_string(), "backend".to_string()),
                ("frontend".to_string(), "frontend".to_string()),
                ("ui".to_string(), "frontend".to_string()),
            ],
            default_package: default_package(),
            package_dirs: HashMap::new(),
            commands: HashMap::new(),
            gate_timeout_secs: default_gate_timeout(),
            fail_fast: false,
            disabled_gates: Vec::new(),
        }
    }
}

static VALIDATE_DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"VALIDATE:\s*(?:'([^']+)'|"([^"]+)")"#).expect("static regex")
});

// Lint summary shapes: the generic "found X warnings and Y errors" line
// and the ESLint "✖ N problems (E errors, W warnings)" line.
static FOUND_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"found\s+(\d+)\s+warnings?\s+and\s+(\d+)\s+errors?").expect("static regex")
});
static ESLINT_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+\s+problems?\s+\((\d+)\s+errors?,\s*(\d+)\s+warnings?\)").expect("static regex")
});

/// Extract `VALIDATE: '<command>'` directives from task notes.
pub fn extract_validate_directives(notes: &str) -> Vec<String> {
    VALIDATE_DIRECTIVE_RE
        .captures_iter(notes)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Parse an error count from lint output. `None` when no summary line is
/// present.
pub fn lint_error_count(output: &str) -> Option<u32> {
    let lower = output.to_ascii_lowercase();
    if let Some(caps) = FOUND_SUMMARY_RE.captures(&lower) {
        return caps[2].parse().ok();
    }
    if let Some(caps) = ESLINT_SUMMARY_RE.captures(&lower) {
        return caps[1].parse().ok();
    }
    None
}

/// Runs the ordered gate set for the packages a task touched.
#[derive(Debug, Clone)]
pub struct ValidationPipeline {
    config: ValidationConfig,
}

impl ValidationPipeline {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Affected packages, in detection-priority order:
    /// explicit override, changed paths, category keywords, default.
    pub fn detect_packages(&self, task: &Task, workdir: &Path) -> Vec<String> {
        if let Some(ref packages) = self.config.packages_override {
            return packages.clone();
        }

        if !self.config.path_rules.is_empty() {
            if let Ok(changed) = git::changed_paths(workdir) {
                let mut packages: Vec<String> = Vec::new();
                for path in &changed {
                    for rule in &self.config.path_rules {
                        if path.starts_with(&rule.path_prefix)
                            && !packages.contains(&rule.package)
                        {
                            packages.push(rule.package.clone());
                        }
                    }
                }
                if !packages.is_empty() {
                    return packages;
                }
            }
        }

        if let Some(ref category) = task.category {
            let lower = category.to_ascii_lowercase();
            for (keyword, package) in &self.config.category_keywords {
                if lower.contains(keyword.as_str()) {
                    return vec![package.clone()];
                }
            }
        }

        vec![self.config.default_package.clone()]
    }

    /// Run every enabled gate for every affected package, ascending by
    /// gate priority, and assemble the task's validation result.
    pub async fn run(&self, task: &Task, workdir: &Path, prior_attempts: u32) -> ValidationResults {
        let packages = self.detect_packages(task, workdir);
        let custom_commands: Vec<String> = task
            .notes
            .as_deref()
            .map(extract_validate_directives)
            .unwrap_or_default();

        let mut gates: Vec<GateResult> = Vec::new();
        let mut failed_gates: Vec<String> = Vec::new();

        let mut ordered: Vec<&GateDef> = GATES.iter().collect();
        ordered.sort_by_key(|g| g.priority);

        'packages: for (package_index, package) in packages.iter().enumerate() {
            for gate in &ordered {
                if self.config.disabled_gates.iter().any(|d| d == gate.name) {
                    continue;
                }

                // Custom gates come from the task notes and run only in
                // the first detected package.
                let commands: Vec<String> = if gate.name == "custom" {
                    if package_index == 0 {
                        custom_commands.clone()
                    } else {
                        Vec::new()
                    }
                } else {
                    self.config
                        .commands
                        .get(package)
                        .and_then(|m| m.get(gate.name))
                        .cloned()
                        .into_iter()
                        .collect()
                };

                for command in commands {
                    let result = self
                        .run_gate(gate.name, package, &command, workdir)
                        .await;
                    let passed = result.passed;
                    if !passed {
                        failed_gates.push(format!("{package}:{}", gate.name));
                    }
                    gates.push(result);
                    if !passed && self.config.fail_fast {
                        tracing::warn!(
                            package = %package,
                            gate = gate.name,
                            "gate failed; aborting remaining gates for this package"
                        );
                        continue 'packages;
                    }
                }
            }
        }

        ValidationResults {
            last_run: Some(Utc::now()),
            passed: failed_gates.is_empty(),
            failed_gates,
            attempts: prior_attempts + 1,
            gates,
        }
    }

    /// Run one gate command in its package directory.
    async fn run_gate(
        &self,
        gate: &str,
        package: &str,
        command: &str,
        workdir: &Path,
    ) -> GateResult {
        let started = std::time::Instant::now();
        let timeout = Duration::from_secs(self.config.gate_timeout_secs.max(1));

        let cwd = self.package_dir(package, workdir);
        tracing::info!(package = %package, gate = %gate, command = %command, "running gate");

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .env("CI", "true")
            .env("FORCE_COLOR", "0")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return GateResult {
                    gate: gate.to_string(),
                    package: package.to_string(),
                    passed: false,
                    duration: started.elapsed().as_secs_f64(),
                    output: None,
                    error_summary: Some(format!("failed to spawn gate command: {e}")),
                };
            }
        };

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).into_owned()
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        let waited = tokio::time::timeout(timeout, async {
            let (status, stdout, stderr) = tokio::join!(child.wait(), read_stdout, read_stderr);
            (status, stdout, stderr)
        })
        .await;

        match waited {
            Ok((Ok(status), stdout, stderr)) => {
                let exit_ok = status.success();
                let lint_errors = if gate == "lint" || gate == "fast-linter" {
                    lint_error_count(&stdout).unwrap_or(0)
                } else {
                    0
                };
                let passed = exit_ok && lint_errors == 0;
                let combined = join_output(&stdout, &stderr);
                let error_summary = if passed {
                    None
                } else if lint_errors > 0 {
                    Some(format!("{lint_errors} lint errors reported"))
                } else {
                    Some(summarize_failure(&combined, status.code()))
                };
                GateResult {
                    gate: gate.to_string(),
                    package: package.to_string(),
                    passed,
                    duration: started.elapsed().as_secs_f64(),
                    output: Some(combined),
                    error_summary,
                }
            }
            Ok((Err(e), _, _)) => GateResult {
                gate: gate.to_string(),
                package: package.to_string(),
                passed: false,
                duration: started.elapsed().as_secs_f64(),
                output: None,
                error_summary: Some(format!("failed waiting on gate command: {e}")),
            },
            Err(_) => {
                let _ = child.kill().await;
                GateResult {
                    gate: gate.to_string(),
                    package: package.to_string(),
                    passed: false,
                    duration: started.elapsed().as_secs_f64(),
                    output: None,
                    error_summary: Some(format!("Timed out after {}ms", timeout.as_millis())),
                }
            }
        }
    }

    fn package_dir(&self, package: &str, workdir: &Path) -> PathBuf {
        match self.config.package_dirs.get(package) {
            Some(rel) => workdir.join(rel),
            None => workdir.to_path_buf(),
        }
    }
}

fn join_output(stdout: &str, stderr: &str) -> String {
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (true, true) => String::new(),
        (false, true) => stdout.trim_end().to_string(),
        (true, false) => stderr.trim_end().to_string(),
        (false, false) => format!("{}\n{}", stdout.trim_end(), stderr.trim_end()),
    }
}

/// A short human summary for a failed gate: exit code plus the tail of
/// the output.
fn summarize_failure(output: &str, code: Option<i32>) -> String {
    let tail: Vec<&str> = output.lines().rev().take(5).collect();
    let tail: Vec<&str> = tail.into_iter().rev().collect();
    match code {
        Some(code) => format!("exit {code}: {}", tail.join(" | ")),
        None => format!("killed by signal: {}", tail.join(" | ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline_with(config: ValidationConfig) -> ValidationPipeline {
        ValidationPipeline::new(config)
    }

    fn task_with_category(category: &str) -> Task {
        let mut task = Task::new("t1", "desc");
        task.category = Some(category.to_string());
        task
    }

    #[test]
    fn extract_validate_directives_handles_both_quotes() {
        let notes = "Run checks.\nVALIDATE: 'cargo test'\nand VALIDATE: \"npm run lint\"";
        assert_eq!(
            extract_validate_directives(notes),
            vec!["cargo test".to_string(), "npm run lint".to_string()]
        );
        assert!(extract_validate_directives("no directives here").is_empty());
    }

    #[test]
    fn lint_error_count_parses_both_shapes() {
        assert_eq!(lint_error_count("found 3 warnings and 0 errors"), Some(0));
        assert_eq!(lint_error_count("Found 1 warning and 2 errors"), Some(2));
        assert_eq!(
            lint_error_count("✖ 12 problems (4 errors, 8 warnings)"),
            Some(4)
        );
        assert_eq!(lint_error_count("all clean"), None);
    }

    #[test]
    fn detect_packages_override_wins() {
        let config = ValidationConfig {
            packages_override: Some(vec!["infra".to_string()]),
            ..ValidationConfig::default()
        };
        let pipeline = pipeline_with(config);
        let packages =
            pipeline.detect_packages(&task_with_category("backend"), Path::new("/nonexistent"));
        assert_eq!(packages, vec!["infra"]);
    }

    #[test]
    fn detect_packages_falls_back_to_category_then_default() {
        let pipeline = pipeline_with(ValidationConfig::default());
        // No git repo at this path, so path detection is skipped.
        let packages =
            pipeline.detect_packages(&task_with_category("backend api work"), Path::new("/tmp"));
        assert_eq!(packages, vec!["backend"]);

        let task = Task::new("t2", "desc");
        let packages = pipeline.detect_packages(&task, Path::new("/tmp"));
        assert_eq!(packages, vec!["frontend"]);
    }

    #[test]
    fn detect_packages_from_changed_paths() {
        let tmp = tempfile::tempdir().unwrap();
        crate::git::git_ok(tmp.path(), &["init", "-b", "main"]).unwrap();
        crate::git::git_ok(tmp.path(), &["config", "user.email", "t@t"]).unwrap();
        crate::git::git_ok(tmp.path(), &["config", "user.name", "t"]).unwrap();
        std::fs::write(tmp.path().join("README.md"), "x").unwrap();
        crate::git::git_ok(tmp.path(), &["add", "."]).unwrap();
        crate::git::git_ok(tmp.path(), &["commit", "-m", "init"]).unwrap();

        std::fs::create_dir_all(tmp.path().join("server/src")).unwrap();
        std::fs::write(tmp.path().join("server/src/main.rs"), "fn main() {}").unwrap();

        let config = ValidationConfig {
            path_rules: vec![PackageRule {
                path_prefix: "server/".to_string(),
                package: "backend".to_string(),
            }],
            ..ValidationConfig::default()
        };
        let pipeline = pipeline_with(config);
        let packages = pipeline.detect_packages(&Task::new("t", "d"), tmp.path());
        assert_eq!(packages, vec!["backend"]);
    }

    #[tokio::test]
    async fn passing_and_failing_gates_are_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        let mut commands = HashMap::new();
        commands.insert("backend".to_string(), {
            let mut gates = HashMap::new();
            gates.insert("build".to_string(), "true".to_string());
            gates.insert("test".to_string(), "false".to_string());
            gates
        });
        let config = ValidationConfig {
            packages_override: Some(vec!["backend".to_string()]),
            commands,
            ..ValidationConfig::default()
        };

        let results = pipeline_with(config)
            .run(&Task::new("t", "d"), tmp.path(), 0)
            .await;

        assert!(!results.passed);
        assert_eq!(results.attempts, 1);
        assert_eq!(results.failed_gates, vec!["backend:test".to_string()]);
        assert_eq!(results.gates.len(), 2);
        let build = results.gates.iter().find(|g| g.gate == "build").unwrap();
        assert!(build.passed);
    }

    #[tokio::test]
    async fn gates_run_in_priority_order() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("order.txt");
        let mut gates = HashMap::new();
        gates.insert(
            "lint".to_string(),
            format!("echo lint >> {}", marker.display()),
        );
        gates.insert(
            "build".to_string(),
            format!("echo build >> {}", marker.display()),
        );
        gates.insert(
            "test".to_string(),
            format!("echo test >> {}", marker.display()),
        );
        let mut commands = HashMap::new();
        commands.insert("backend".to_string(), gates);
        let config = ValidationConfig {
            packages_override: Some(vec!["backend".to_string()]),
            commands,
            ..ValidationConfig::default()
        };

        let results = pipeline_with(config)
            .run(&Task::new("t", "d"), tmp.path(), 0)
            .await;
        assert!(results.passed);

        let order = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(order, "build\ntest\nlint\n");
    }

    #[tokio::test]
    async fn fail_fast_aborts_remaining_gates() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("ran.txt");
        let mut gates = HashMap::new();
        gates.insert("build".to_string(), "false".to_string());
        gates.insert(
            "test".to_string(),
            format!("echo test >> {}", marker.display()),
        );
        let mut commands = HashMap::new();
        commands.insert("backend".to_string(), gates);
        let config = ValidationConfig {
            packages_override: Some(vec!["backend".to_string()]),
            commands,
            fail_fast: true,
            ..ValidationConfig::default()
        };

        let results = pipeline_with(config)
            .run(&Task::new("t", "d"), tmp.path(), 0)
            .await;
        assert!(!results.passed);
        assert!(!marker.exists(), "test gate should not have run");
    }

    #[tokio::test]
    async fn custom_gates_come_from_task_notes() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("custom.txt");
        let mut task = Task::new("t", "d");
        task.notes = Some(format!("VALIDATE: 'echo custom >> {}'", marker.display()));

        let config = ValidationConfig {
            packages_override: Some(vec!["backend".to_string()]),
            ..ValidationConfig::default()
        };
        let results = pipeline_with(config).run(&task, tmp.path(), 2).await;

        assert!(results.passed);
        assert_eq!(results.attempts, 3);
        assert!(marker.exists());
        assert!(results.gates.iter().any(|g| g.gate == "custom"));
    }

    #[tokio::test]
    async fn timeout_produces_timed_out_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let mut gates = HashMap::new();
        gates.insert("build".to_string(), "sleep 30".to_string());
        let mut commands = HashMap::new();
        commands.insert("backend".to_string(), gates);
        let config = ValidationConfig {
            packages_override: Some(vec!["backend".to_string()]),
            commands,
            gate_timeout_secs: 1,
            ..ValidationConfig::default()
        };

        let results = pipeline_with(config)
            .run(&Task::new("t", "d"), tmp.path(), 0)
            .await;
        assert!(!results.passed);
        let gate = &results.gates[0];
        assert!(
            gate.error_summary
                .as_deref()
                .unwrap()
                .starts_with("Timed out after"),
            "summary: {:?}",
            gate.error_summary
        );
    }

    #[tokio::test]
    async fn lint_gate_fails_on_reported_errors_despite_exit_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let mut gates = HashMap::new();
        gates.insert(
            "lint".to_string(),
            "echo 'found 0 warnings and 2 errors'".to_string(),
        );
        let mut commands = HashMap::new();
        commands.insert("backend".to_string(), gates);
        let config = ValidationConfig {
            packages_override: Some(vec!["backend".to_string()]),
            commands,
            ..ValidationConfig::default()
        };

        let results = pipeline_with(config)
            .run(&Task::new("t", "d"), tmp.path(), 0)
            .await;
        assert!(!results.passed);
        assert_eq!(results.failed_gates, vec!["backend:lint".to_string()]);
    }
}
