//! Sequential orchestrator: one task at a time on the main checkout.
//!
//! Each iteration picks the next ready task, runs the provider pipeline,
//! and marks the task complete or returns it to pending. Per-task
//! failures never escape an iteration; only initialization and session
//! I/O errors abort the run.

pub mod factory;

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::resolve_provider;
use crate::context::ExecutionContext;
use crate::events::OrchestratorEvent;
use crate::learnings::LearningsFile;
use crate::prompt::RetryContext;
use crate::task::TaskUpdate;
use crate::worker::{self, TaskExecution};

/// Per-task record in the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub duration: f64,
    pub rate_limited: bool,
}

/// What a run produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub completed: u32,
    pub total_iterations: u32,
    /// Wall-clock seconds for the whole run.
    pub duration: f64,
    pub tasks: Vec<TaskRecord>,
    /// Tasks that exhausted their retry budget, and other surfaced
    /// errors.
    pub errors: Vec<String>,
    /// The run was interrupted by cancellation (SIGINT).
    pub interrupted: bool,
    /// Factory mode: planner satisfied + queues drained.
    pub converged: bool,
    /// Dry-run only: the tasks that would have been dispatched.
    pub planned: Vec<String>,
}

/// Run the sequential loop for up to `config.iterations` iterations.
pub async fn run(ctx: &ExecutionContext, cancel: &CancellationToken) -> Result<RunSummary> {
    let started = std::time::Instant::now();
    let config = &ctx.config;
    let filter = config.filter.clone();
    let mut summary = RunSummary::default();

    if config.dry_run {
        summary.planned = ctx
            .source
            .get_ready_tasks(&filter)
            .into_iter()
            .map(|t| t.id)
            .collect();
        tracing::info!(planned = ?summary.planned, "dry run; nothing dispatched");
        summary.duration = started.elapsed().as_secs_f64();
        return Ok(summary);
    }

    // Failure feedback carried between attempts of the same task.
    let mut retries: HashMap<String, RetryContext> = HashMap::new();

    for iteration in 1..=config.iterations {
        if cancel.is_cancelled() {
            summary.interrupted = true;
            break;
        }

        let Some(task) = ctx.source.get_next_task(&filter) else {
            tracing::info!("no ready tasks left; run finished");
            break;
        };
        summary.total_iterations = iteration;

        ctx.sessions
            .set_iteration(iteration)
            .context("session write failed")?;

        let provider = resolve_provider(
            &config.provider,
            ctx.source.file_provider(&task.id).as_deref(),
            task.provider_override.as_ref(),
        );

        ctx.source
            .mark_in_progress(&task.id)
            .with_context(|| format!("failed to dispatch task {}", task.id))?;
        ctx.sessions
            .start_task(&task.id)
            .context("session write failed")?;
        ctx.events.emit(OrchestratorEvent::TaskStart {
            task_id: task.id.clone(),
        });
        tracing::info!(
            task_id = %task.id,
            iteration,
            provider = %provider.kind,
            model = %provider.model,
            "task dispatched"
        );

        let retry = retries.get(&task.id).cloned();
        let execution =
            worker::execute_task(ctx, &task, &provider, &ctx.repo_root, retry.as_ref(), None)
                .await;

        let (slot_provider, slot_model) = provider.slot();
        if execution.rate_limited {
            ctx.limiter.report_rate_limit(&slot_provider, &slot_model);
        } else {
            ctx.limiter.report_success(&slot_provider, &slot_model);
        }

        if execution.success {
            handle_success(ctx, &task.id, &execution)?;
            retries.remove(&task.id);
            summary.completed += 1;
            summary.tasks.push(TaskRecord {
                task_id: task.id.clone(),
                success: true,
                failure: None,
                duration: execution.duration,
                rate_limited: execution.rate_limited,
            });
        } else {
            handle_failure(ctx, &task.id, &execution)?;
            let attempt = ctx
                .source
                .get_task(&task.id)
                .map(|t| t.attempts())
                .unwrap_or(0);
            retries.insert(
                task.id.clone(),
                RetryContext {
                    attempt,
                    previous_failure: execution.retry_feedback(),
                },
            );
            summary.tasks.push(TaskRecord {
                task_id: task.id.clone(),
                success: false,
                failure: execution.failure.map(|f| f.to_string()),
                duration: execution.duration,
                rate_limited: execution.rate_limited,
            });

            // A rate-limited attempt is not an ordinary failure: wait
            // out the backoff window before the task retries.
            if execution.rate_limited && iteration < config.iterations {
                wait_for_backoff(ctx, &slot_provider, &slot_model, cancel).await;
            }
        }
    }

    summary.duration = started.elapsed().as_secs_f64();
    Ok(summary)
}

/// Mark a task complete, propagate, and record the session update.
fn handle_success(
    ctx: &ExecutionContext,
    task_id: &str,
    execution: &TaskExecution,
) -> Result<()> {
    let task = ctx.source.get_task(task_id);
    let update = TaskUpdate {
        validation_results: execution.validation.clone(),
        judge_results: execution.judges.clone(),
        evidence_path: task.as_ref().map(|t| worker::evidence_path(ctx, t)),
    };
    let unblocked = ctx
        .source
        .mark_complete(task_id, update)
        .with_context(|| format!("failed to complete task {task_id}"))?;
    if !unblocked.is_empty() {
        tracing::info!(task_id = %task_id, unblocked = ?unblocked, "completion unblocked dependents");
    }
    ctx.sessions
        .complete_task(task_id)
        .context("session write failed")?;
    ctx.events.emit(OrchestratorEvent::TaskComplete {
        task_id: task_id.to_string(),
        duration: execution.duration,
    });
    tracing::info!(task_id = %task_id, duration = execution.duration, "task completed");
    Ok(())
}

/// Return a failed task to pending and file the failure.
fn handle_failure(
    ctx: &ExecutionContext,
    task_id: &str,
    execution: &TaskExecution,
) -> Result<()> {
    let reason = execution
        .failure
        .map(|f| f.to_string())
        .unwrap_or_else(|| "unknown failure".to_string());
    tracing::warn!(
        task_id = %task_id,
        reason = %reason,
        detail = ?execution.failure_detail,
        "task attempt failed; returning to pending"
    );

    ctx.source
        .record_failure(task_id, execution.validation.clone())
        .with_context(|| format!("failed to record failure for task {task_id}"))?;
    ctx.events.emit(OrchestratorEvent::TaskFailed {
        task_id: task_id.to_string(),
        reason,
    });

    if let (Some(path), Some(validation)) =
        (ctx.config.learnings_file.as_ref(), execution.validation.as_ref())
    {
        if !validation.failed_gates.is_empty() {
            let file = LearningsFile::new(path);
            if let Err(e) = file.record_validation_failure(task_id, &validation.failed_gates) {
                tracing::debug!(error = %e, "failed to file validation failure");
            }
        }
    }
    Ok(())
}

/// Sleep until the slot's backoff window closes (or cancellation).
async fn wait_for_backoff(
    ctx: &ExecutionContext,
    provider: &str,
    model: &str,
    cancel: &CancellationToken,
) {
    let key = crate::limiter::slot_key(provider, model);
    let backoff = ctx
        .limiter
        .get_status()
        .get(&key)
        .map(|s| s.backoff_seconds)
        .unwrap_or(0.0);
    if backoff <= 0.0 {
        return;
    }
    tracing::info!(slot = %key, backoff_secs = backoff, "waiting out rate-limit backoff");
    tokio::select! {
        _ = tokio::time::sleep(std::time::Duration::from_secs_f64(backoff)) => {}
        _ = cancel.cancelled() => {}
    }
}
