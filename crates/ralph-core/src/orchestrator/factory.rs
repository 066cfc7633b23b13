//! Factory orchestrator: N parallel workers over isolated worktrees.
//!
//! The supervisor loop dispatches ready tasks to idle workers under
//! rate-limiter admission, multiplexes their completions over one mpsc
//! channel, serializes trunk integration through the merge coordinator,
//! and re-enqueues failures with complexity-tier escalation. Task
//! completions reach the source in merge-acceptance order, not in
//! worker-finish order.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{RunSummary, TaskRecord};
use crate::config::{resolve_provider, ComplexityTier};
use crate::context::ExecutionContext;
use crate::events::OrchestratorEvent;
use crate::merge::MergeCoordinator;
use crate::planner::Planner;
use crate::prompt::RetryContext;
use crate::provider::ProviderConfig;
use crate::task::{Task, TaskUpdate};
use crate::worker::{self, TaskExecution, Worker, WorkerStatus};
use crate::worktree::WorktreeManager;

/// Message from a spawned worker task back to the supervisor loop.
struct WorkerDone {
    worker_id: usize,
    slot: (String, String),
    execution: TaskExecution,
}

/// Per-task retry bookkeeping.
#[derive(Debug, Clone)]
struct RetryState {
    attempts: u32,
    tier: ComplexityTier,
    feedback: String,
}

/// Run the factory to convergence (or interruption).
pub async fn run_factory(ctx: &ExecutionContext, cancel: &CancellationToken) -> Result<RunSummary> {
    let started = std::time::Instant::now();
    let config = &ctx.config;
    let filter = config.filter.clone();
    let worker_count = config.factory.workers.max(1);
    let mut summary = RunSummary::default();

    if config.dry_run {
        summary.planned = ctx
            .source
            .get_ready_tasks(&filter)
            .into_iter()
            .map(|t| t.id)
            .collect();
        summary.duration = started.elapsed().as_secs_f64();
        return Ok(summary);
    }

    // Worktree pool setup.
    let worktree_base = config.factory.worktree_dir.as_ref().map(PathBuf::from);
    let manager = WorktreeManager::new(&ctx.repo_root, worktree_base)
        .context("factory requires the repo root to be a git repository")?;
    let mut workers: Vec<Worker> = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        let info = manager
            .create_worker_worktree(worker_id, config.factory.deps_dir.as_deref())
            .with_context(|| format!("failed to create worktree for worker {worker_id}"))?;
        workers.push(Worker::new(
            worker_id,
            info.path,
            WorktreeManager::worker_branch(worker_id),
        ));
    }

    let merge = MergeCoordinator::new(&ctx.repo_root);
    let planner = config.planner.enabled.then(|| Planner::spawn(ctx.clone()));

    let (tx, mut rx) = mpsc::channel::<WorkerDone>(worker_count * 2);
    let mut retry_state: HashMap<String, RetryState> = HashMap::new();
    let mut exhausted: HashSet<String> = HashSet::new();
    let mut in_flight: usize = 0;
    let mut dispatched_total: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            summary.interrupted = true;
            break;
        }

        // Drain finished workers without blocking.
        while let Ok(done) = rx.try_recv() {
            in_flight -= 1;
            handle_completion(
                ctx,
                &merge,
                &mut workers,
                &mut retry_state,
                &mut exhausted,
                &mut summary,
                done,
            )
            .await?;
        }

        let ready: Vec<Task> = ctx
            .source
            .get_ready_tasks(&filter)
            .into_iter()
            .filter(|t| !exhausted.contains(&t.id))
            .collect();

        // Termination checks.
        let planner_satisfied = planner.as_ref().is_some_and(Planner::is_satisfied);
        if in_flight == 0 && ready.is_empty() {
            match &planner {
                Some(_) if planner_satisfied => {
                    summary.converged = true;
                    tracing::info!("factory converged: spec satisfied, queues empty");
                    break;
                }
                Some(_) => {
                    // The planner may still append work; idle-wait.
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                        _ = cancel.cancelled() => {}
                    }
                    continue;
                }
                None => {
                    tracing::info!("factory finished: no ready tasks and no active workers");
                    break;
                }
            }
        }
        if dispatched_total >= config.iterations {
            if in_flight == 0 {
                tracing::info!(dispatched_total, "factory dispatch budget exhausted");
                break;
            }
        } else {
            // Dispatch ready tasks onto idle workers.
            for task in ready {
                if dispatched_total >= config.iterations {
                    break;
                }
                let Some(worker_index) = workers.iter().position(Worker::is_idle) else {
                    break;
                };

                let state = retry_state.get(&task.id);
                let tier = state
                    .map(|s| s.tier)
                    .unwrap_or_else(|| ComplexityTier::initial_for(&task));
                let Some(provider) = select_provider(ctx, &task, tier) else {
                    // Every candidate slot is saturated or backing off;
                    // the task stays queued.
                    continue;
                };

                if let Err(e) = manager.reset_to_trunk(&workers[worker_index].worktree_path) {
                    tracing::error!(worker = worker_index, error = %e, "worktree reset failed");
                    workers[worker_index].status = WorkerStatus::Failed;
                    let (slot_provider, slot_model) = provider.slot();
                    ctx.limiter.release(&slot_provider, &slot_model);
                    continue;
                }

                ctx.source
                    .mark_in_progress(&task.id)
                    .with_context(|| format!("failed to dispatch task {}", task.id))?;

                let worker = &mut workers[worker_index];
                worker.status = WorkerStatus::Running;
                worker.current_task_id = Some(task.id.clone());
                in_flight += 1;
                dispatched_total += 1;

                ctx.events.emit(OrchestratorEvent::WorkerDispatch {
                    worker_id: worker_index,
                    task_id: task.id.clone(),
                });
                tracing::info!(
                    worker = worker_index,
                    task_id = %task.id,
                    tier = ?tier,
                    model = %provider.model,
                    "task dispatched to worker"
                );

                let retry = state.map(|s| RetryContext {
                    attempt: s.attempts,
                    previous_failure: s.feedback.clone(),
                });
                let trailer = format!("Ralph-Factory: worker-{worker_index}");
                let workdir = worker.worktree_path.clone();
                let spawn_ctx = ctx.clone();
                let tx = tx.clone();
                let slot = provider.slot();

                tokio::spawn(async move {
                    let execution = worker::execute_task(
                        &spawn_ctx,
                        &task,
                        &provider,
                        &workdir,
                        retry.as_ref(),
                        Some(&trailer),
                    )
                    .await;
                    let _ = tx
                        .send(WorkerDone {
                            worker_id: worker_index,
                            slot,
                            execution,
                        })
                        .await;
                });
            }
        }

        record_factory_state(ctx, &workers);

        // Nothing left to dispatch this tick: block until any worker
        // completes (or idle-sleep when nothing is running).
        if in_flight > 0 {
            tokio::select! {
                done = rx.recv() => {
                    if let Some(done) = done {
                        in_flight -= 1;
                        handle_completion(
                            ctx,
                            &merge,
                            &mut workers,
                            &mut retry_state,
                            &mut exhausted,
                            &mut summary,
                            done,
                        )
                        .await?;
                    }
                }
                _ = cancel.cancelled() => continue,
            }
        } else {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    // Shutdown: stop the planner, drain active workers, clean worktrees.
    if let Some(planner) = planner {
        planner.stop().await;
    }

    let drain_deadline = tokio::time::Instant::now() + ctx.config.drain_timeout();
    while in_flight > 0 {
        match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
            Ok(Some(done)) => {
                in_flight -= 1;
                handle_completion(
                    ctx,
                    &merge,
                    &mut workers,
                    &mut retry_state,
                    &mut exhausted,
                    &mut summary,
                    done,
                )
                .await?;
            }
            _ => {
                summary.errors.push(format!(
                    "{in_flight} worker(s) unresolved at shutdown (treated as crashed)"
                ));
                break;
            }
        }
    }
    record_factory_state(ctx, &workers);

    if let Err(e) = manager.cleanup_all(worker_count) {
        tracing::warn!(error = %e, "worktree cleanup failed");
    }

    summary.duration = started.elapsed().as_secs_f64();
    Ok(summary)
}

/// Resolve the provider for a task at a tier, then acquire a slot for
/// it. Prefers the tier's model, falling back to the explicitly
/// configured model; returns `None` when no candidate slot admits.
fn select_provider(
    ctx: &ExecutionContext,
    task: &Task,
    tier: ComplexityTier,
) -> Option<ProviderConfig> {
    let resolved = resolve_provider(
        &ctx.config.provider,
        ctx.source.file_provider(&task.id).as_deref(),
        task.provider_override.as_ref(),
    );

    let tier_model = tier.model_for(resolved.kind).to_string();
    let mut candidates = vec![resolved.model.clone()];
    // Escalated work moves up the model ladder unless the task pinned a
    // model explicitly.
    if task
        .provider_override
        .as_ref()
        .and_then(|o| o.model.as_ref())
        .is_none()
        && tier != ComplexityTier::initial_for(task)
    {
        candidates.insert(0, tier_model);
    }

    let provider_name = resolved.kind.to_string();
    for model in candidates {
        if ctx.limiter.try_acquire(&provider_name, &model) {
            let mut provider = resolved.clone();
            provider.model = model;
            return Some(provider);
        }
    }
    None
}

/// Persist worker snapshots and the in-flight task set on the session.
fn record_factory_state(ctx: &ExecutionContext, workers: &[Worker]) {
    let snapshots = workers.iter().map(Worker::snapshot).collect();
    let active: Vec<String> = workers
        .iter()
        .filter_map(|w| w.current_task_id.clone())
        .collect();
    if let Err(e) = ctx.sessions.set_factory_state(snapshots, active) {
        tracing::debug!(error = %e, "failed to persist factory session state");
    }
}

/// Process one worker completion: release the slot, integrate the work
/// through the merge coordinator, and retry or surface failures.
async fn handle_completion(
    ctx: &ExecutionContext,
    merge: &MergeCoordinator,
    workers: &mut [Worker],
    retry_state: &mut HashMap<String, RetryState>,
    exhausted: &mut HashSet<String>,
    summary: &mut RunSummary,
    done: WorkerDone,
) -> Result<()> {
    let WorkerDone {
        worker_id,
        slot: (slot_provider, slot_model),
        execution,
    } = done;
    let task_id = execution.task_id.clone();

    ctx.limiter.release(&slot_provider, &slot_model);
    if execution.rate_limited {
        ctx.limiter.report_rate_limit(&slot_provider, &slot_model);
    } else {
        ctx.limiter.report_success(&slot_provider, &slot_model);
    }

    if execution.success {
        match execution.commit_hash.clone() {
            Some(commit) => {
                workers[worker_id].status = WorkerStatus::Merging;
                let outcome = merge.cherry_pick(&commit, &task_id).await;
                ctx.events.emit(OrchestratorEvent::MergeFinished {
                    task_id: task_id.clone(),
                    success: outcome.success,
                    conflict: outcome.conflict,
                });
                if outcome.success {
                    complete_in_source(ctx, &task_id, &execution)?;
                    finish_worker(workers, worker_id, Some(&task_id));
                    retry_state.remove(&task_id);
                    summary.completed += 1;
                    push_record(summary, &execution, true, None);
                } else if outcome.conflict {
                    tracing::warn!(task_id = %task_id, "merge conflict; re-enqueueing with escalated tier");
                    requeue(
                        ctx,
                        retry_state,
                        exhausted,
                        summary,
                        &task_id,
                        "merge conflict: the commit did not apply onto the trunk",
                        None,
                    )?;
                    finish_worker(workers, worker_id, None);
                    push_record(summary, &execution, false, Some("merge conflict".to_string()));
                } else {
                    let error = outcome
                        .error
                        .unwrap_or_else(|| "merge failed".to_string());
                    requeue(ctx, retry_state, exhausted, summary, &task_id, &error, None)?;
                    finish_worker(workers, worker_id, None);
                    push_record(summary, &execution, false, Some(error));
                }
            }
            None => {
                // Success with no commit: nothing to merge.
                complete_in_source(ctx, &task_id, &execution)?;
                finish_worker(workers, worker_id, Some(&task_id));
                retry_state.remove(&task_id);
                summary.completed += 1;
                push_record(summary, &execution, true, None);
            }
        }
    } else {
        let feedback = execution.retry_feedback();
        requeue(
            ctx,
            retry_state,
            exhausted,
            summary,
            &task_id,
            &feedback,
            execution.validation.clone(),
        )?;
        finish_worker(workers, worker_id, None);
        push_record(
            summary,
            &execution,
            false,
            execution.failure.map(|f| f.to_string()),
        );
    }

    record_factory_state(ctx, workers);
    Ok(())
}

fn complete_in_source(
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
    if let Err(e) = ctx.sessions.complete_task(task_id) {
        tracing::debug!(error = %e, "failed to record session task completion");
    }
    ctx.events.emit(OrchestratorEvent::TaskComplete {
        task_id: task_id.to_string(),
        duration: execution.duration,
    });
    Ok(())
}

/// Return a task to pending with escalated tier, or exhaust it.
fn requeue(
    ctx: &ExecutionContext,
    retry_state: &mut HashMap<String, RetryState>,
    exhausted: &mut HashSet<String>,
    summary: &mut RunSummary,
    task_id: &str,
    feedback: &str,
    validation: Option<crate::validate::ValidationResults>,
) -> Result<()> {
    ctx.source
        .record_failure(task_id, validation)
        .with_context(|| format!("failed to re-enqueue task {task_id}"))?;
    ctx.events.emit(OrchestratorEvent::TaskFailed {
        task_id: task_id.to_string(),
        reason: feedback.to_string(),
    });

    let initial_tier = ctx
        .source
        .get_task(task_id)
        .map(|t| ComplexityTier::initial_for(&t))
        .unwrap_or(ComplexityTier::Low);
    let state = retry_state
        .entry(task_id.to_string())
        .or_insert_with(|| RetryState {
            attempts: 0,
            tier: initial_tier,
            feedback: String::new(),
        });
    state.attempts += 1;
    state.tier = state.tier.escalate();
    state.feedback = feedback.to_string();

    if state.attempts > ctx.config.factory.max_task_retries {
        tracing::error!(
            task_id = %task_id,
            attempts = state.attempts,
            "task exhausted its retry budget; leaving pending"
        );
        exhausted.insert(task_id.to_string());
        summary.errors.push(format!(
            "task {task_id} exhausted {} retries: {feedback}",
            ctx.config.factory.max_task_retries
        ));
    }
    Ok(())
}

fn finish_worker(workers: &mut [Worker], worker_id: usize, completed_task: Option<&str>) {
    let worker = &mut workers[worker_id];
    if let Some(task_id) = completed_task {
        worker.completed_task_ids.push(task_id.to_string());
    }
    worker.current_task_id = None;
    worker.status = WorkerStatus::Idle;
}

fn push_record(
    summary: &mut RunSummary,
    execution: &TaskExecution,
    success: bool,
    failure: Option<String>,
) {
    summary.tasks.push(TaskRecord {
        task_id: execution.task_id.clone(),
        success,
        failure,
        duration: execution.duration,
        rate_limited: execution.rate_limited,
    });
}
