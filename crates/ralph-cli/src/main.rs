mod config;
mod run_cmd;
mod sessions_cmd;
mod status_cmd;

use anyhow::Result;
use clap::{Parser, Subcommand};

use config::RunArgs;

/// Process exit codes: 0 success, 1 unrecoverable error, 2 user abort.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const ERROR: i32 = 1;
    pub const ABORTED: i32 = 2;
}

#[derive(Parser)]
#[command(name = "ralph", about = "Autonomous coding orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file at ~/.config/ralph/config.toml
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the sequential orchestrator
    Run {
        #[command(flatten)]
        args: RunArgs,
    },
    /// Resume a crashed session
    Resume {
        /// Session id to resume (defaults to the active session)
        session_id: Option<String>,
        #[command(flatten)]
        args: RunArgs,
        /// Resume in factory mode
        #[arg(long)]
        factory: bool,
    },
    /// Abort the active session
    Abort {
        #[command(flatten)]
        args: RunArgs,
    },
    /// Show the active session and task-graph counts
    Status {
        #[command(flatten)]
        args: RunArgs,
    },
    /// List recorded sessions
    Sessions {
        /// Remove old non-running session files
        #[arg(long)]
        cleanup: bool,
        /// Age threshold for --cleanup, in days
        #[arg(long, default_value_t = 7)]
        days: i64,
        #[command(flatten)]
        args: RunArgs,
    },
    /// Run the parallel factory orchestrator
    Factory {
        #[command(flatten)]
        args: RunArgs,
    },
}

fn cmd_init(force: bool) -> Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }
    config::save_config(&config::starter_config())?;
    println!("Config written to {}", path.display());
    println!("Edit it to point at your provider CLIs, gates, and PRD layout.");
    Ok(())
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Init { force } => {
            cmd_init(force)?;
            Ok(exit::SUCCESS)
        }
        Commands::Run { args } => {
            let resolved = config::resolve(&args)?;
            run_cmd::run(resolved, run_cmd::Mode::Sequential).await
        }
        Commands::Factory { args } => {
            let resolved = config::resolve(&args)?;
            run_cmd::run(resolved, run_cmd::Mode::Factory).await
        }
        Commands::Resume {
            session_id,
            args,
            factory,
        } => {
            let resolved = config::resolve(&args)?;
            let mode = if factory {
                run_cmd::Mode::Factory
            } else {
                run_cmd::Mode::Sequential
            };
            run_cmd::resume(resolved, session_id, mode).await
        }
        Commands::Abort { args } => {
            let resolved = config::resolve(&args)?;
            let repo_root = std::env::current_dir()?;
            let session_dir = if resolved.session_dir.is_absolute() {
                resolved.session_dir.clone()
            } else {
                repo_root.join(&resolved.session_dir)
            };
            let sessions = ralph_core::session::SessionManager::new(session_dir)?;
            match sessions.abort_session(None)? {
                Some(id) => println!("Session {id} aborted."),
                None => println!("No active session to abort."),
            }
            Ok(exit::SUCCESS)
        }
        Commands::Status { args } => {
            let resolved = config::resolve(&args)?;
            status_cmd::run_status(&resolved)?;
            Ok(exit::SUCCESS)
        }
        Commands::Sessions {
            cleanup,
            days,
            args,
        } => {
            let resolved = config::resolve(&args)?;
            sessions_cmd::run_sessions(&resolved, cleanup, days)?;
            Ok(exit::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_with_core_flags() {
        let cli = Cli::try_parse_from([
            "ralph",
            "run",
            "--iterations",
            "5",
            "--prd-file",
            "tasks.json",
            "--filter-category",
            "backend",
            "--filter-priority",
            "high",
            "--skip-validation",
            "--dry-run",
            "--provider",
            "claude",
            "--model",
            "opus",
        ])
        .unwrap();
        let Commands::Run { args } = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.iterations, Some(5));
        assert_eq!(args.prd_file.as_deref(), Some(std::path::Path::new("tasks.json")));
        assert_eq!(args.filter_category.as_deref(), Some("backend"));
        assert_eq!(args.filter_priority.as_deref(), Some("high"));
        assert!(args.skip_validation);
        assert!(args.dry_run);
        assert_eq!(args.provider.as_deref(), Some("claude"));
        assert_eq!(args.model.as_deref(), Some("opus"));
    }

    #[test]
    fn cli_parses_factory_with_workers() {
        let cli = Cli::try_parse_from(["ralph", "factory", "--workers", "4"]).unwrap();
        let Commands::Factory { args } = cli.command else {
            panic!("expected factory command");
        };
        assert_eq!(args.workers, Some(4));
    }

    #[test]
    fn cli_parses_resume_with_optional_session_id() {
        let cli = Cli::try_parse_from(["ralph", "resume", "abc12345"]).unwrap();
        let Commands::Resume { session_id, .. } = cli.command else {
            panic!("expected resume command");
        };
        assert_eq!(session_id.as_deref(), Some("abc12345"));

        let cli = Cli::try_parse_from(["ralph", "resume"]).unwrap();
        let Commands::Resume { session_id, .. } = cli.command else {
            panic!("expected resume command");
        };
        assert!(session_id.is_none());
    }

    #[test]
    fn cli_parses_sessions_cleanup_days() {
        let cli =
            Cli::try_parse_from(["ralph", "sessions", "--cleanup", "--days", "14"]).unwrap();
        let Commands::Sessions { cleanup, days, .. } = cli.command else {
            panic!("expected sessions command");
        };
        assert!(cleanup);
        assert_eq!(days, 14);
    }

    #[test]
    fn cli_rejects_unknown_command() {
        assert!(Cli::try_parse_from(["ralph", "launch"]).is_err());
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            exit::ERROR
        }
    };
    std::process::exit(code);
}
