//! Run configuration: provider defaults, scheduling filters, factory and
//! planner knobs, and the provider-override resolution chain.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provider::{ProviderConfig, ProviderKind};
use crate::task::{ProviderOverride, Task, TaskFilter};
use crate::validate::ValidationConfig;

/// How hard a task is expected to be; drives model selection and is
/// escalated (saturating) on each retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    Low,
    Medium,
    High,
}

impl ComplexityTier {
    /// Initial tier for a task: low-priority work starts on the cheap
    /// tier, everything else in the middle.
    pub fn initial_for(task: &Task) -> Self {
        match task.priority {
            crate::task::Priority::Low => Self::Low,
            _ => Self::Medium,
        }
    }

    /// Bump one tier, saturating at `High`.
    pub fn escalate(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium | Self::High => Self::High,
        }
    }

    /// The model a provider uses at this tier.
    pub fn model_for(self, provider: ProviderKind) -> &'static str {
        match (provider, self) {
            (ProviderKind::Claude, Self::Low) => "haiku",
            (ProviderKind::Claude, Self::Medium) => "sonnet",
            (ProviderKind::Claude, Self::High) => "opus",
            (ProviderKind::Gemini, Self::Low) => "gemini-flash",
            (ProviderKind::Gemini, Self::Medium | Self::High) => "gemini-pro",
            (ProviderKind::Cursor, Self::Low | Self::Medium) => "gpt-5",
            (ProviderKind::Cursor, Self::High) => "gpt-5-high",
        }
    }
}

/// Factory-mode knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Retry budget per task: merge conflicts and pipeline failures both
    /// draw from it. Beyond the cap the task stays pending and is
    /// surfaced as an error in the run summary.
    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// Base directory for worker worktrees; defaults next to the repo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_dir: Option<String>,
    /// Package-dependency directory symlinked into each worktree
    /// (e.g. `node_modules`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deps_dir: Option<String>,
    /// Per-slot concurrency ceilings, keyed `provider:model`.
    #[serde(default)]
    pub slot_limits: std::collections::HashMap<String, usize>,
}

fn default_workers() -> usize {
    3
}

fn default_max_task_retries() -> u32 {
    3
}

fn default_drain_timeout() -> u64 {
    120
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_task_retries: default_max_task_retries(),
            drain_timeout_secs: default_drain_timeout(),
            worktree_dir: None,
            deps_dir: None,
            slot_limits: std::collections::HashMap::new(),
        }
    }
}

/// Planner knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_planner_interval")]
    pub interval_secs: u64,
    /// Provider slot for planner evaluations; defaults to the run
    /// provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConfig>,
    /// The specification the planner evaluates progress against.
    #[serde(default)]
    pub spec_description: String,
}

fn default_planner_interval() -> u64 {
    60
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_planner_interval(),
            provider: None,
            spec_description: String::new(),
        }
    }
}

/// The full run configuration, snapshotted into the session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub provider: ProviderConfig,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default)]
    pub filter: TaskFilter,
    #[serde(default)]
    pub skip_validation: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub factory: FactoryConfig,
    #[serde(default)]
    pub planner: PlannerSettings,
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,
    #[serde(default = "default_judge_timeout")]
    pub judge_timeout_secs: u64,
    /// Learnings markdown file; disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learnings_file: Option<String>,
}

fn default_iterations() -> u32 {
    10
}

fn default_provider_timeout() -> u64 {
    30 * 60
}

fn default_judge_timeout() -> u64 {
    60
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::new(ProviderKind::Claude, "sonnet"),
            iterations: default_iterations(),
            filter: TaskFilter::default(),
            skip_validation: false,
            dry_run: false,
            validation: ValidationConfig::default(),
            factory: FactoryConfig::default(),
            planner: PlannerSettings::default(),
            provider_timeout_secs: default_provider_timeout(),
            judge_timeout_secs: default_judge_timeout(),
            learnings_file: None,
        }
    }
}

impl RunConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_secs(self.judge_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.factory.drain_timeout_secs)
    }
}

/// Resolve the provider for one task: CLI defaults, overridden by the
/// file-level provider string, overridden by the task-level override.
/// Invalid values at any layer are silently ignored in favor of the
/// previous layer.
pub fn resolve_provider(
    base: &ProviderConfig,
    file_provider: Option<&str>,
    task_override: Option<&ProviderOverride>,
) -> ProviderConfig {
    let mut resolved = base.clone();

    if let Some(spec) = file_provider {
        apply_provider_spec(&mut resolved, spec);
    }

    if let Some(task) = task_override {
        if let Some(ref provider) = task.provider {
            match provider.parse::<ProviderKind>() {
                Ok(kind) => {
                    if kind != resolved.kind {
                        resolved.kind = kind;
                        resolved.binary = None;
                    }
                }
                Err(_) => {
                    tracing::debug!(provider = %provider, "ignoring invalid task provider override");
                }
            }
        }
        if let Some(ref model) = task.model {
            if !model.is_empty() {
                resolved.model = model.clone();
            }
        }
        if let Some(ref mode) = task.mode {
            match mode.parse() {
                Ok(mode) => resolved.mode = mode,
                Err(_) => {
                    tracing::debug!(mode = %mode, "ignoring invalid task mode override");
                }
            }
        }
    }

    resolved
}

/// Apply a `provider` or `provider:model` spec string to a config.
fn apply_provider_spec(config: &mut ProviderConfig, spec: &str) {
    let (provider_part, model_part) = match spec.split_once(':') {
        Some((p, m)) => (p, Some(m)),
        None => (spec, None),
    };
    match provider_part.parse::<ProviderKind>() {
        Ok(kind) => {
            if kind != config.kind {
                config.kind = kind;
                config.binary = None;
            }
            if let Some(model) = model_part {
                if !model.is_empty() {
                    config.model = model.to_string();
                }
            }
        }
        Err(_) => {
            tracing::debug!(spec = %spec, "ignoring invalid file provider override");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Priority;

    #[test]
    fn tier_escalation_saturates() {
        assert_eq!(ComplexityTier::Low.escalate(), ComplexityTier::Medium);
        assert_eq!(ComplexityTier::Medium.escalate(), ComplexityTier::High);
        assert_eq!(ComplexityTier::High.escalate(), ComplexityTier::High);
    }

    #[test]
    fn initial_tier_follows_priority() {
        let mut task = Task::new("t", "d");
        task.priority = Priority::Low;
        assert_eq!(ComplexityTier::initial_for(&task), ComplexityTier::Low);
        task.priority = Priority::High;
        assert_eq!(ComplexityTier::initial_for(&task), ComplexityTier::Medium);
    }

    #[test]
    fn tier_models_cover_all_providers() {
        assert_eq!(
            ComplexityTier::High.model_for(ProviderKind::Claude),
            "opus"
        );
        assert_eq!(
            ComplexityTier::Low.model_for(ProviderKind::Gemini),
            "gemini-flash"
        );
        assert_eq!(
            ComplexityTier::Medium.model_for(ProviderKind::Cursor),
            "gpt-5"
        );
    }

    #[test]
    fn resolve_provider_layers_file_then_task() {
        let base = ProviderConfig::new(ProviderKind::Claude, "sonnet");

        // File-level override with model.
        let resolved = resolve_provider(&base, Some("gemini:gemini-pro"), None);
        assert_eq!(resolved.kind, ProviderKind::Gemini);
        assert_eq!(resolved.model, "gemini-pro");

        // Task-level override beats the file level.
        let task_override = ProviderOverride {
            provider: Some("cursor".to_string()),
            model: Some("gpt-5".to_string()),
            mode: Some("plan".to_string()),
        };
        let resolved = resolve_provider(&base, Some("gemini"), Some(&task_override));
        assert_eq!(resolved.kind, ProviderKind::Cursor);
        assert_eq!(resolved.model, "gpt-5");
        assert_eq!(resolved.mode, crate::provider::AgentMode::Plan);
    }

    #[test]
    fn invalid_overrides_are_ignored_in_favor_of_previous() {
        let base = ProviderConfig::new(ProviderKind::Claude, "sonnet");

        let resolved = resolve_provider(&base, Some("not-a-provider"), None);
        assert_eq!(resolved.kind, ProviderKind::Claude);
        assert_eq!(resolved.model, "sonnet");

        let task_override = ProviderOverride {
            provider: Some("bogus".to_string()),
            model: None,
            mode: Some("invalid-mode".to_string()),
        };
        let resolved = resolve_provider(&base, None, Some(&task_override));
        assert_eq!(resolved.kind, ProviderKind::Claude);
        assert_eq!(resolved.mode, crate::provider::AgentMode::Agent);
    }

    #[test]
    fn provider_switch_clears_binary_override() {
        let mut base = ProviderConfig::new(ProviderKind::Claude, "sonnet");
        base.binary = Some("/tmp/fake-claude".to_string());

        let resolved = resolve_provider(&base, Some("gemini"), None);
        assert!(resolved.binary.is_none());

        // Same provider keeps the binary override.
        let resolved = resolve_provider(&base, Some("claude:opus"), None);
        assert_eq!(resolved.binary.as_deref(), Some("/tmp/fake-claude"));
        assert_eq!(resolved.model, "opus");
    }

    #[test]
    fn run_config_serializes_for_session_snapshot() {
        let config = RunConfig::default();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["provider"]["kind"], "claude");
        assert_eq!(value["iterations"], 10);
        let back: RunConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back.factory.workers, 3);
    }
}
