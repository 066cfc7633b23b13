//! Configuration file management for ralph.
//!
//! A TOML config file at `~/.config/ralph/config.toml` supplies
//! defaults; the resolution chain is CLI flag > env var > config file >
//! built-in default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use ralph_core::config::RunConfig;
use ralph_core::provider::ProviderKind;
use ralph_core::task::Priority;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub factory: FactorySection,
    #[serde(default)]
    pub validation: ValidationSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub planner: PlannerSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProviderSection {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub mode: Option<String>,
    /// Per-provider binary path overrides, e.g. `claude = "/usr/local/bin/claude"`.
    #[serde(default)]
    pub binaries: std::collections::HashMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FactorySection {
    pub workers: Option<usize>,
    pub max_task_retries: Option<u32>,
    pub worktree_dir: Option<String>,
    pub deps_dir: Option<String>,
    /// Slot concurrency ceilings keyed `provider:model`.
    #[serde(default)]
    pub slot_limits: std::collections::HashMap<String, usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ValidationSection {
    pub enabled: Option<bool>,
    pub default_package: Option<String>,
    pub fail_fast: Option<bool>,
    pub gate_timeout_secs: Option<u64>,
    /// package -> gate -> shell command.
    #[serde(default)]
    pub commands: std::collections::HashMap<String, std::collections::HashMap<String, String>>,
    /// path prefix -> package.
    #[serde(default)]
    pub path_rules: std::collections::HashMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SessionSection {
    pub dir: Option<String>,
    pub learnings_file: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PlannerSection {
    pub enabled: Option<bool>,
    pub interval_secs: Option<u64>,
    pub provider: Option<String>,
    pub model: Option<String>,
    /// File whose contents become the planner's spec description.
    pub spec_file: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// The ralph config directory: `$XDG_CONFIG_HOME/ralph` or `~/.config/ralph`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("ralph");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("ralph")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load the config file; missing file yields defaults.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents).context("failed to parse config file")
}

/// Write the config file, creating parent directories as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    let path = config_path();
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))
}

// -----------------------------------------------------------------------
// CLI overrides and resolution
// -----------------------------------------------------------------------

/// The flags shared by `run`, `resume`, and `factory`.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct RunArgs {
    /// Maximum iterations (sequential) or task dispatches (factory)
    #[arg(long)]
    pub iterations: Option<u32>,

    /// Single PRD file to load
    #[arg(long, value_name = "PATH")]
    pub prd_file: Option<PathBuf>,

    /// Directory scanned for *.json PRD files
    #[arg(long, value_name = "PATH")]
    pub prd_dir: Option<PathBuf>,

    /// Only schedule tasks in this category
    #[arg(long, value_name = "STR")]
    pub filter_category: Option<String>,

    /// Only schedule tasks at this priority
    #[arg(long, value_name = "high|medium|low")]
    pub filter_priority: Option<String>,

    /// Skip the validation pipeline
    #[arg(long)]
    pub skip_validation: bool,

    /// Report what would be dispatched without executing
    #[arg(long)]
    pub dry_run: bool,

    /// Provider CLI to drive
    #[arg(long, value_name = "claude|gemini|cursor")]
    pub provider: Option<String>,

    /// Model passed to the provider CLI
    #[arg(long, value_name = "STR")]
    pub model: Option<String>,

    /// Number of parallel workers (factory mode)
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Downgrade unknown dependencies from an error to a blocked task
    #[arg(long)]
    pub lenient: bool,
}

/// Everything the commands need beyond the core `RunConfig`.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub run: RunConfig,
    pub prd_file: Option<PathBuf>,
    pub prd_dir: Option<PathBuf>,
    pub lenient: bool,
    pub session_dir: PathBuf,
}

/// Apply the resolution chain and produce the run configuration.
pub fn resolve(args: &RunArgs) -> Result<ResolvedConfig> {
    let file = load_config()?;
    let mut run = RunConfig::default();

    // Provider: CLI flag > RALPH_PROVIDER env > config file > default.
    let provider_name = args
        .provider
        .clone()
        .or_else(|| std::env::var("RALPH_PROVIDER").ok())
        .or_else(|| file.provider.provider.clone());
    if let Some(name) = provider_name {
        run.provider.kind = name
            .parse::<ProviderKind>()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    let model = args
        .model
        .clone()
        .or_else(|| std::env::var("RALPH_MODEL").ok())
        .or_else(|| file.provider.model.clone());
    if let Some(model) = model {
        run.provider.model = model;
    }
    if let Some(ref mode) = file.provider.mode {
        if let Ok(mode) = mode.parse() {
            run.provider.mode = mode;
        }
    }
    if let Some(binary) = file.provider.binaries.get(&run.provider.kind.to_string()) {
        run.provider.binary = Some(binary.clone());
    }

    // Iterations and filters.
    if let Some(iterations) = args.iterations {
        run.iterations = iterations;
    }
    run.filter.category = args.filter_category.clone();
    if let Some(ref priority) = args.filter_priority {
        let parsed = priority
            .parse::<Priority>()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        run.filter.priority = Some(parsed);
    }
    run.skip_validation = args.skip_validation;
    run.dry_run = args.dry_run;

    // Validation section. RALPH_TARGET_PACKAGE pins the affected-package
    // detection to one package.
    if let Ok(package) = std::env::var("RALPH_TARGET_PACKAGE") {
        if !package.is_empty() {
            run.validation.packages_override = Some(vec![package]);
        }
    }
    if let Some(enabled) = file.validation.enabled {
        run.validation.enabled = enabled;
    }
    if let Some(ref package) = file.validation.default_package {
        run.validation.default_package = package.clone();
    }
    if let Some(fail_fast) = file.validation.fail_fast {
        run.validation.fail_fast = fail_fast;
    }
    if let Some(timeout) = file.validation.gate_timeout_secs {
        run.validation.gate_timeout_secs = timeout;
    }
    run.validation.commands = file.validation.commands.clone();
    run.validation.path_rules = file
        .validation
        .path_rules
        .iter()
        .map(|(prefix, package)| ralph_core::validate::PackageRule {
            path_prefix: prefix.clone(),
            package: package.clone(),
        })
        .collect();

    // Factory section.
    if let Some(workers) = args.workers.or(file.factory.workers) {
        run.factory.workers = workers;
    }
    if let Some(retries) = file.factory.max_task_retries {
        run.factory.max_task_retries = retries;
    }
    run.factory.worktree_dir = file.factory.worktree_dir.clone();
    run.factory.deps_dir = file.factory.deps_dir.clone();
    run.factory.slot_limits = file.factory.slot_limits.clone();

    // Planner section.
    if let Some(enabled) = file.planner.enabled {
        run.planner.enabled = enabled;
    }
    if let Some(interval) = file.planner.interval_secs {
        run.planner.interval_secs = interval;
    }
    if let (Some(provider), model) = (file.planner.provider.clone(), file.planner.model.clone()) {
        if let Ok(kind) = provider.parse::<ProviderKind>() {
            let mut planner_provider = run.provider.clone();
            planner_provider.kind = kind;
            if let Some(model) = model {
                planner_provider.model = model;
            }
            run.planner.provider = Some(planner_provider);
        }
    }
    if let Some(ref spec_file) = file.planner.spec_file {
        run.planner.spec_description = std::fs::read_to_string(spec_file)
            .with_context(|| format!("failed to read planner spec file {spec_file}"))?;
    }

    run.learnings_file = file.session.learnings_file.clone();

    // Session directory: RALPH_SESSION_DIR env > config file > default.
    let session_dir = std::env::var("RALPH_SESSION_DIR")
        .ok()
        .or_else(|| file.session.dir.clone())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".ralph/sessions"));

    Ok(ResolvedConfig {
        run,
        prd_file: args.prd_file.clone(),
        prd_dir: args.prd_dir.clone().or(Some(PathBuf::from("prds"))),
        lenient: args.lenient,
        session_dir,
    })
}

/// Write a starter config file for `ralph init`.
pub fn starter_config() -> ConfigFile {
    ConfigFile {
        provider: ProviderSection {
            provider: Some("claude".to_string()),
            model: Some("sonnet".to_string()),
            mode: Some("agent".to_string()),
            binaries: Default::default(),
        },
        factory: FactorySection {
            workers: Some(3),
            max_task_retries: Some(3),
            ..Default::default()
        },
        validation: ValidationSection {
            enabled: Some(true),
            default_package: Some("frontend".to_string()),
            ..Default::default()
        },
        session: SessionSection {
            dir: Some(".ralph/sessions".to_string()),
            learnings_file: Some("LEARNINGS.md".to_string()),
        },
        planner: PlannerSection {
            enabled: Some(false),
            interval_secs: Some(60),
            ..Default::default()
        },
    }
}
