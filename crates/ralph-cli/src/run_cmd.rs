//! The `run`, `factory`, and `resume` commands: build the execution
//! context, drive the orchestrator, and settle the session record.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use ralph_core::context::ExecutionContext;
use ralph_core::git;
use ralph_core::learnings::LearningsFile;
use ralph_core::orchestrator::RunSummary;
use ralph_core::session::SessionManager;
use ralph_core::task::source::{SourceOptions, TaskSource};

use crate::config::ResolvedConfig;
use crate::exit;

/// Which orchestrator the command drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Sequential,
    Factory,
}

/// Run a fresh session. Returns the process exit code.
pub async fn run(resolved: ResolvedConfig, mode: Mode) -> Result<i32> {
    let ctx = build_context(&resolved)?;

    let (branch, commit) = git_state(&ctx.repo_root);
    ctx.sessions
        .create_session(
            serde_json::to_value(ctx.config.as_ref()).unwrap_or_default(),
            &branch,
            &commit,
        )
        .context("failed to create session")?;

    drive(ctx, mode).await
}

/// Resume a crashed session (the given one, or the active one).
pub async fn resume(resolved: ResolvedConfig, session_id: Option<String>, mode: Mode) -> Result<i32> {
    let ctx = build_context(&resolved)?;

    let target = match session_id {
        Some(id) => id,
        None => ctx
            .sessions
            .active_session()
            .map(|s| s.session_id)
            .context("no active session to resume")?,
    };
    let (session, orphaned) = ctx
        .sessions
        .resume_session(&target)
        .with_context(|| format!("failed to resume session {target}"))?;
    println!("Resuming session {}", session.session_id);

    // Hand the orphaned task back to the scheduler.
    if let Some(ref task_id) = orphaned {
        println!("Re-dispatching orphaned task {task_id}");
        ctx.source.release_task(task_id);
    }

    drive(ctx, mode).await
}

/// Run the selected orchestrator under SIGINT cancellation and settle
/// the session afterwards.
async fn drive(ctx: ExecutionContext, mode: Mode) -> Result<i32> {
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; shutting down");
            signal_cancel.cancel();
        }
    });

    let result = match mode {
        Mode::Sequential => ralph_core::run(&ctx, &cancel).await,
        Mode::Factory => ralph_core::run_factory(&ctx, &cancel).await,
    };

    match result {
        Ok(summary) if summary.interrupted => {
            ctx.sessions
                .mark_crashed("interrupted by user (SIGINT)", None)?;
            print_summary(&summary);
            println!("Session left resumable; run `ralph resume` to continue.");
            Ok(exit::ABORTED)
        }
        Ok(summary) => {
            ctx.sessions.complete_session()?;
            file_session_summary(&ctx, &summary);
            print_summary(&summary);
            Ok(exit::SUCCESS)
        }
        Err(e) => {
            // Supervisor-level failure: record the crash and keep the
            // active pointer for resume.
            let _ = ctx.sessions.mark_crashed(&format!("{e:#}"), None);
            Err(e)
        }
    }
}

fn build_context(resolved: &ResolvedConfig) -> Result<ExecutionContext> {
    let repo_root = std::env::current_dir().context("cannot resolve current directory")?;

    let source = TaskSource::initialize(&SourceOptions {
        prd_file: resolved.prd_file.clone(),
        prd_dir: resolved.prd_dir.clone(),
        lenient: resolved.lenient,
    })
    .context("failed to load tasks")?;

    let session_dir = if resolved.session_dir.is_absolute() {
        resolved.session_dir.clone()
    } else {
        repo_root.join(&resolved.session_dir)
    };
    let sessions = SessionManager::new(session_dir).context("failed to open session directory")?;

    Ok(ExecutionContext::new(
        repo_root,
        resolved.run.clone(),
        source,
        sessions,
    ))
}

fn git_state(repo_root: &PathBuf) -> (String, String) {
    let branch = git::current_branch(repo_root).unwrap_or_else(|_| "unknown".to_string());
    let commit = git::head_commit(repo_root).unwrap_or_else(|_| "unknown".to_string());
    (branch, commit)
}

fn file_session_summary(ctx: &ExecutionContext, summary: &RunSummary) {
    let Some(ref path) = ctx.config.learnings_file else {
        return;
    };
    let Some(session) = ctx.sessions.current_session() else {
        return;
    };
    let line = format!(
        "{} of {} iterations completed, {} tasks done in {:.0}s",
        summary.total_iterations, ctx.config.iterations, summary.completed, summary.duration
    );
    let file = LearningsFile::new(path);
    if let Err(e) = file.append_session_summary(&session.session_id, &line) {
        tracing::debug!(error = %e, "failed to append session summary");
    }
}

fn print_summary(summary: &RunSummary) {
    if !summary.planned.is_empty() {
        println!("Dry run; would dispatch:");
        for task_id in &summary.planned {
            println!("  {task_id}");
        }
        return;
    }

    println!(
        "Completed {} task(s) over {} iteration(s) in {:.1}s",
        summary.completed, summary.total_iterations, summary.duration
    );
    for record in &summary.tasks {
        let status = if record.success {
            "ok".to_string()
        } else {
            record
                .failure
                .clone()
                .unwrap_or_else(|| "failed".to_string())
        };
        println!("  {} [{status}] {:.1}s", record.task_id, record.duration);
    }
    for error in &summary.errors {
        eprintln!("error: {error}");
    }
    if summary.converged {
        println!("Factory converged: specification satisfied.");
    }
}
