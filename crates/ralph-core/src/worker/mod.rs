//! Factory worker handles and the per-task execution pipeline.
//!
//! `execute_task` is the one pipeline both orchestrators run: build the
//! prompt, invoke the provider, check the completion sentinel, validate,
//! judge. The factory additionally commits the worktree on success so
//! the merge coordinator can cherry-pick the result onto the trunk.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::events::OrchestratorEvent;
use crate::git;
use crate::judge::{self, AggregatedJudgeResult, JudgeContext, JudgeRunOptions};
use crate::learnings;
use crate::limiter::RateLimiter;
use crate::prompt::{self, RetryContext};
use crate::provider::runner::{run_provider, RunnerOptions};
use crate::provider::ProviderConfig;
use crate::session::WorkerSnapshot;
use crate::task::Task;
use crate::validate::{ValidationPipeline, ValidationResults};

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Assigned,
    Running,
    Merging,
    Failed,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Assigned => write!(f, "assigned"),
            Self::Running => write!(f, "running"),
            Self::Merging => write!(f, "merging"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A handle to one isolated worktree. The worker owns its worktree; the
/// pool owns the workers.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: usize,
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub status: WorkerStatus,
    pub current_task_id: Option<String>,
    pub completed_task_ids: Vec<String>,
}

impl Worker {
    pub fn new(id: usize, worktree_path: PathBuf, branch_name: String) -> Self {
        Self {
            id,
            worktree_path,
            branch_name,
            status: WorkerStatus::Idle,
            current_task_id: None,
            completed_task_ids: Vec::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            status: self.status.to_string(),
            current_task_id: self.current_task_id.clone(),
            completed_task_ids: self.completed_task_ids.clone(),
        }
    }
}

/// Why a task attempt did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The provider ran but never emitted the completion sentinel.
    SentinelMissing,
    /// The provider subprocess failed.
    Provider,
    /// One or more validation gates failed.
    Validation,
    /// The judge panel rejected the work.
    Judges,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SentinelMissing => write!(f, "no completion sentinel"),
            Self::Provider => write!(f, "provider failure"),
            Self::Validation => write!(f, "validation failed"),
            Self::Judges => write!(f, "judge panel rejected"),
        }
    }
}

/// Result of one task attempt through the pipeline.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub task_id: String,
    pub success: bool,
    /// Commit extracted from the worktree (factory mode only).
    pub commit_hash: Option<String>,
    pub failure: Option<FailureKind>,
    pub failure_detail: Option<String>,
    /// Whether the provider output carried a rate-limit signal.
    pub rate_limited: bool,
    pub validation: Option<ValidationResults>,
    pub judges: Option<AggregatedJudgeResult>,
    /// The provider's final message.
    pub summary: String,
    /// Wall-clock seconds from dispatch to terminal transition.
    pub duration: f64,
}

impl TaskExecution {
    fn failed(
        task_id: &str,
        kind: FailureKind,
        detail: impl Into<String>,
        rate_limited: bool,
        started: std::time::Instant,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: false,
            commit_hash: None,
            failure: Some(kind),
            failure_detail: Some(detail.into()),
            rate_limited,
            validation: None,
            judges: None,
            summary: String::new(),
            duration: started.elapsed().as_secs_f64(),
        }
    }

    /// The feedback line for the next attempt's prompt.
    pub fn retry_feedback(&self) -> String {
        let gates: Vec<String> = self
            .validation
            .as_ref()
            .map(|v| v.failed_gates.clone())
            .unwrap_or_default();
        let judge_summary = self.judges.as_ref().map(|j| j.summary.as_str());
        match self.failure {
            Some(FailureKind::Provider) => self
                .failure_detail
                .clone()
                .unwrap_or_else(|| "provider failure".to_string()),
            _ => prompt::compose_retry_feedback(&gates, judge_summary),
        }
    }
}

/// Run the full pipeline for one task attempt, rooted at `workdir`.
///
/// With `commit_trailer` set (factory mode), a passing attempt stages
/// everything in the worktree and commits it; the commit hash is handed
/// back for the merge coordinator.
pub async fn execute_task(
    ctx: &ExecutionContext,
    task: &Task,
    provider: &ProviderConfig,
    workdir: &Path,
    retry: Option<&RetryContext>,
    commit_trailer: Option<&str>,
) -> TaskExecution {
    let started = std::time::Instant::now();
    let task_id = task.id.as_str();
    let config = &ctx.config;

    let validation_enabled = config.validation.enabled && !config.skip_validation;
    let pipeline = ValidationPipeline::new(config.validation.clone());
    let packages = if validation_enabled {
        pipeline.detect_packages(task, workdir)
    } else {
        Vec::new()
    };

    // 1. Provider run.
    let task_prompt = prompt::build_task_prompt(task, &packages, retry);
    ctx.events.emit(OrchestratorEvent::ProviderStart {
        task_id: task_id.to_string(),
        provider: provider.kind.to_string(),
        model: provider.model.clone(),
    });

    let runner_options = RunnerOptions {
        timeout: config.provider_timeout(),
        ..RunnerOptions::default()
    };
    let outcome = match run_provider(provider, &task_prompt, workdir, &runner_options).await {
        Ok(outcome) => outcome,
        Err(e) => {
            ctx.events.emit(OrchestratorEvent::ProviderComplete {
                task_id: task_id.to_string(),
                success: false,
                duration: started.elapsed().as_secs_f64(),
            });
            return TaskExecution::failed(
                task_id,
                FailureKind::Provider,
                format!("{e:#}"),
                false,
                started,
            );
        }
    };

    ctx.events.emit(OrchestratorEvent::ProviderComplete {
        task_id: task_id.to_string(),
        success: outcome.success,
        duration: outcome.duration,
    });

    let rate_limited = RateLimiter::is_rate_limited(&outcome.output)
        || outcome
            .error
            .as_deref()
            .is_some_and(RateLimiter::is_rate_limited);

    record_evidence_and_learnings(ctx, task, &outcome.output);

    if !outcome.success {
        return TaskExecution::failed(
            task_id,
            FailureKind::Provider,
            outcome.error.unwrap_or_else(|| "provider failed".to_string()),
            rate_limited,
            started,
        );
    }

    // 2. Completion sentinel.
    if !prompt::is_task_complete(&outcome.output) {
        tracing::warn!(task_id = %task_id, "provider finished without the completion sentinel");
        return TaskExecution::failed(
            task_id,
            FailureKind::SentinelMissing,
            "provider output did not contain TASK_COMPLETE",
            rate_limited,
            started,
        );
    }

    // 3. Validation gates.
    let mut validation = None;
    if validation_enabled {
        ctx.events.emit(OrchestratorEvent::ValidationStart {
            task_id: task_id.to_string(),
        });
        let results = pipeline.run(task, workdir, task.attempts()).await;
        ctx.events.emit(OrchestratorEvent::ValidationComplete {
            task_id: task_id.to_string(),
            passed: results.passed,
        });
        if !results.passed {
            let detail = results.failed_gates.join(", ");
            return TaskExecution {
                task_id: task_id.to_string(),
                success: false,
                commit_hash: None,
                failure: Some(FailureKind::Validation),
                failure_detail: Some(detail),
                rate_limited,
                validation: Some(results),
                judges: None,
                summary: outcome.summary,
                duration: started.elapsed().as_secs_f64(),
            };
        }
        validation = Some(results);
    }

    // 4. Judge panel.
    let mut judges = None;
    if !task.judges.is_empty() {
        ctx.events.emit(OrchestratorEvent::JudgeStart {
            task_id: task_id.to_string(),
        });
        let judge_ctx = JudgeContext {
            task_description: task.description.clone(),
            criteria: task.criteria.clone(),
            diff: git::diff_vs_head(workdir).unwrap_or_default(),
            provider_summary: outcome.summary.clone(),
        };
        let mut judge_options = JudgeRunOptions::new(provider.clone());
        judge_options.timeout = config.judge_timeout();
        let aggregated = judge::run_judges(&task.judges, &judge_ctx, &judge_options, workdir).await;
        ctx.events.emit(OrchestratorEvent::JudgeComplete {
            task_id: task_id.to_string(),
            passed: aggregated.passed,
            overall_score: aggregated.overall_score,
        });
        if !aggregated.passed {
            let detail = aggregated.summary.clone();
            return TaskExecution {
                task_id: task_id.to_string(),
                success: false,
                commit_hash: None,
                failure: Some(FailureKind::Judges),
                failure_detail: Some(detail),
                rate_limited,
                validation,
                judges: Some(aggregated),
                summary: outcome.summary,
                duration: started.elapsed().as_secs_f64(),
            };
        }
        judges = Some(aggregated);
    }

    // 5. Commit extraction (factory mode).
    let mut commit_hash = None;
    if let Some(trailer) = commit_trailer {
        let first_line = outcome.summary.lines().next().unwrap_or("task finished");
        let message = format!("{task_id}: {first_line}\n\n{trailer}");
        match git::stage_all_and_commit(workdir, &message) {
            Ok(Some(hash)) => {
                tracing::info!(task_id = %task_id, commit = %hash, "worker committed task result");
                commit_hash = Some(hash);
            }
            Ok(None) => {
                tracing::info!(task_id = %task_id, "no changes to commit");
            }
            Err(e) => {
                return TaskExecution::failed(
                    task_id,
                    FailureKind::Provider,
                    format!("failed to commit worker changes: {e}"),
                    rate_limited,
                    started,
                );
            }
        }
    }

    TaskExecution {
        task_id: task_id.to_string(),
        success: true,
        commit_hash,
        failure: None,
        failure_detail: None,
        rate_limited,
        validation,
        judges,
        summary: outcome.summary,
        duration: started.elapsed().as_secs_f64(),
    }
}

/// Evidence file plus learnings capture, both best-effort.
fn record_evidence_and_learnings(ctx: &ExecutionContext, task: &Task, output: &str) {
    let evidence_dir = ctx.sessions.dir().join("evidence");
    if std::fs::create_dir_all(&evidence_dir).is_ok() {
        let path = evidence_dir.join(format!("{}-attempt-{}.log", task.id, task.attempts() + 1));
        if let Err(e) = std::fs::write(&path, output) {
            tracing::debug!(path = %path.display(), error = %e, "failed to write evidence file");
        }
    }

    if let Some(ref learnings_path) = ctx.config.learnings_file {
        let file = learnings::LearningsFile::new(learnings_path);
        for entry in learnings::parse_learning_blocks(output) {
            if let Err(e) = file.append_learning(&entry, Some(&task.id)) {
                tracing::debug!(error = %e, "failed to append learning");
            }
        }
    }
}

/// The evidence path `execute_task` writes for a given attempt.
pub fn evidence_path(ctx: &ExecutionContext, task: &Task) -> String {
    ctx.sessions
        .dir()
        .join("evidence")
        .join(format!("{}-attempt-{}.log", task.id, task.attempts() + 1))
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_snapshot_reflects_state() {
        let mut worker = Worker::new(1, PathBuf::from("/wt/worker-1"), "ralph-factory/worker-1".into());
        assert!(worker.is_idle());
        worker.status = WorkerStatus::Running;
        worker.current_task_id = Some("t1".to_string());
        worker.completed_task_ids.push("t0".to_string());

        let snapshot = worker.snapshot();
        assert_eq!(snapshot.id, 1);
        assert_eq!(snapshot.status, "running");
        assert_eq!(snapshot.current_task_id.as_deref(), Some("t1"));
        assert_eq!(snapshot.completed_task_ids, vec!["t0".to_string()]);
    }

    #[test]
    fn retry_feedback_prefers_provider_detail() {
        let started = std::time::Instant::now();
        let exec = TaskExecution::failed("t1", FailureKind::Provider, "exit 9: crash", false, started);
        assert_eq!(exec.retry_feedback(), "exit 9: crash");

        let exec = TaskExecution::failed("t1", FailureKind::SentinelMissing, "no sentinel", false, started);
        assert!(exec.retry_feedback().contains("did not signal completion"));
    }
}
