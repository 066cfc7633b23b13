//! Task data model and the PRD file schema.
//!
//! Tasks are loaded from PRD (Product Requirements Document) JSON files,
//! scheduled through the dependency DAG, and written back with their
//! result slots filled. Unknown fields on both tasks and PRD files are
//! preserved verbatim so that files authored by other tools round-trip.

pub mod dag;
pub mod source;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::judge::{AggregatedJudgeResult, JudgeConfig};
use crate::validate::ValidationResults;

/// Scheduling priority. The derived ordering puts `High` first, which is
/// the order tasks are handed out in.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Task lifecycle status.
///
/// A task transitions `pending -> in_progress -> completed` exactly once
/// per successful run. A failed attempt puts it back to `pending`.
/// `blocked` is reserved for tasks whose dependencies can never complete
/// (lenient-mode missing dependencies).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// Per-task provider override. Any field may be omitted; unknown provider
/// or mode strings are ignored at resolution time in favor of the
/// file-level or CLI-level value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// The unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub criteria: Vec<String>,
    /// Free-form notes; may embed `VALIDATE: '<shell command>'` directives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_override: Option<ProviderOverride>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub judges: Vec<JudgeConfig>,
    /// On-disk synonym for `status == completed`; kept in sync on write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passes: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_results: Option<ValidationResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_results: Option<AggregatedJudgeResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Fields this orchestrator does not know about, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
    /// Input order across all loaded PRD files; tie-break for scheduling.
    #[serde(skip)]
    pub ordinal: usize,
    /// Index of the PRD file this task was loaded from.
    #[serde(skip)]
    pub source_file: usize,
}

impl Task {
    /// Minimal constructor used by the planner and by tests.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: description.into(),
            priority: Priority::default(),
            category: None,
            status: TaskStatus::default(),
            dependencies: Vec::new(),
            criteria: Vec::new(),
            notes: None,
            provider_override: None,
            judges: Vec::new(),
            passes: None,
            validation_results: None,
            judge_results: None,
            evidence_path: None,
            completed_at: None,
            extra: serde_json::Map::new(),
            ordinal: 0,
            source_file: 0,
        }
    }

    /// Normalize a freshly-deserialized task: derive a name from the id
    /// when absent and reconcile the `passes`/`status` synonyms.
    pub fn normalize(&mut self) {
        if self.name.is_empty() {
            self.name = self.id.clone();
        }
        if self.passes == Some(true) {
            self.status = TaskStatus::Completed;
        } else if self.status == TaskStatus::Completed {
            self.passes = Some(true);
        }
        // A task persisted mid-run as in_progress was orphaned by a crash;
        // it becomes eligible again.
        if self.status == TaskStatus::InProgress {
            self.status = TaskStatus::Pending;
        }
    }

    /// Current attempt count, taken from the validation result slot.
    pub fn attempts(&self) -> u32 {
        self.validation_results.as_ref().map_or(0, |v| v.attempts)
    }
}

/// The result slots written when a task completes.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub validation_results: Option<ValidationResults>,
    pub judge_results: Option<AggregatedJudgeResult>,
    pub evidence_path: Option<String>,
}

/// Category / priority filters applied to scheduling queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub category: Option<String>,
    pub priority: Option<Priority>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(ref category) = self.category {
            if task.category.as_deref() != Some(category.as_str()) {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if task.priority != priority {
                return false;
            }
        }
        true
    }
}

/// Aggregate task counts, as returned by `TaskSource::get_summary`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub blocked: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
}

/// PRD file metadata block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrdMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// File-level provider override, e.g. `"gemini"` or `"gemini:flash"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A PRD file: the persisted carrier for one category of tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrdFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub items: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PrdMetadata>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
