//! The `status` command: active session plus task-graph counts.

use anyhow::Result;

use ralph_core::session::SessionManager;
use ralph_core::task::source::{SourceOptions, TaskSource};

use crate::config::ResolvedConfig;

pub fn run_status(resolved: &ResolvedConfig) -> Result<()> {
    let repo_root = std::env::current_dir()?;
    let session_dir = if resolved.session_dir.is_absolute() {
        resolved.session_dir.clone()
    } else {
        repo_root.join(&resolved.session_dir)
    };
    let sessions = SessionManager::new(session_dir)?;
    sessions.detect_crashes()?;

    match sessions.active_session() {
        Some(session) => {
            println!("Active session: {}", session.session_id);
            println!("  status:     {}", session.status);
            println!("  started:    {}", session.started_at.to_rfc3339());
            println!("  iteration:  {}", session.current_iteration);
            println!("  completed:  {} task(s)", session.completed_task_count);
            if let Some(ref task) = session.current_task {
                println!("  current:    {task}");
            }
            println!(
                "  git:        {} @ {}",
                session.git_state.branch, session.git_state.commit_hash
            );
            if let Some(ref error) = session.last_error {
                println!("  last error: {}", error.message);
            }
            if let Some(ref workers) = session.workers {
                println!("  workers:");
                for worker in workers {
                    let task = worker.current_task_id.as_deref().unwrap_or("-");
                    println!(
                        "    #{} [{}] current={} done={}",
                        worker.id,
                        worker.status,
                        task,
                        worker.completed_task_ids.len()
                    );
                }
            }
        }
        None => println!("No active session."),
    }

    // Task graph counts, best-effort (status should work even when the
    // PRD is missing).
    let source = TaskSource::initialize(&SourceOptions {
        prd_file: resolved.prd_file.clone(),
        prd_dir: resolved.prd_dir.clone(),
        lenient: true,
    });
    match source {
        Ok(source) => {
            let summary = source.get_summary();
            println!(
                "Tasks: {} total / {} completed / {} pending / {} in progress / {} blocked",
                summary.total,
                summary.completed,
                summary.pending,
                summary.in_progress,
                summary.blocked
            );
            let critical = source.critical_path();
            if critical.len() > 1 {
                println!("Critical path: {}", critical.join(" -> "));
            }
        }
        Err(e) => {
            println!("Tasks: unavailable ({e})");
        }
    }

    Ok(())
}
