//! The `sessions` command: list recorded sessions, optionally cleaning
//! up old ones.

use anyhow::Result;

use ralph_core::session::SessionManager;

use crate::config::ResolvedConfig;

pub fn run_sessions(resolved: &ResolvedConfig, cleanup: bool, days: i64) -> Result<()> {
    let repo_root = std::env::current_dir()?;
    let session_dir = if resolved.session_dir.is_absolute() {
        resolved.session_dir.clone()
    } else {
        repo_root.join(&resolved.session_dir)
    };
    let sessions = SessionManager::new(session_dir)?;

    if cleanup {
        let removed = sessions.cleanup(days)?;
        println!("Removed {} session(s) older than {days} day(s).", removed.len());
        for id in &removed {
            println!("  {id}");
        }
    }

    let entries = sessions.list_sessions()?;
    if entries.is_empty() {
        println!("No sessions recorded.");
        return Ok(());
    }

    println!(
        "{:<10} {:<11} {:<7} started",
        "session", "status", "tasks"
    );
    for entry in entries {
        println!(
            "{:<10} {:<11} {:<7} {}",
            entry.session_id,
            entry.status.to_string(),
            entry.task_count,
            entry.started_at.to_rfc3339()
        );
    }
    Ok(())
}
