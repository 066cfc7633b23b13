//! Dynamic planner: a background loop that periodically asks an LLM
//! whether the specification is satisfied, and appends new tasks to
//! close the gaps it finds.
//!
//! The planner is strictly best-effort: a failed invocation, invalid
//! JSON, or missing fields all degrade to "no new tasks". Exactly one
//! evaluation is in flight at a time; the satisfied signal fires once.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::events::OrchestratorEvent;
use crate::git;
use crate::provider::runner::{run_provider, RunnerOptions};
use crate::provider::ProviderConfig;
use crate::task::source::TaskSource;
use crate::task::{Priority, Task};

/// A task proposed by the planner LLM.
#[derive(Debug, Clone, Deserialize)]
pub struct PlannedTask {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl PlannedTask {
    fn into_task(self) -> Task {
        let mut task = Task::new(self.id, self.description);
        task.priority = self.priority;
        task.dependencies = self.dependencies;
        task.criteria = self.acceptance_criteria;
        task.category = Some(self.category.unwrap_or_else(|| "planner".to_string()));
        task
    }
}

/// The strict JSON shape the planner LLM must return.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerEvaluation {
    pub spec_satisfied: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub new_tasks: Vec<PlannedTask>,
}

impl PlannerEvaluation {
    fn empty() -> Self {
        Self {
            spec_satisfied: false,
            reasoning: String::new(),
            new_tasks: Vec::new(),
        }
    }
}

static FENCED_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("static regex")
});

/// Parse the planner response. `None` means the response was unusable;
/// callers treat that the same as an empty evaluation.
pub fn parse_planner_response(text: &str) -> Option<PlannerEvaluation> {
    if let Some(caps) = FENCED_JSON_RE.captures(text) {
        if let Ok(eval) = serde_json::from_str::<PlannerEvaluation>(&caps[1]) {
            return Some(eval);
        }
    }
    serde_json::from_str::<PlannerEvaluation>(text.trim()).ok()
}

/// Build the evaluation prompt: spec description, the completed and
/// pending task lists, and a compact recent-change summary.
pub fn build_planner_prompt(
    spec_description: &str,
    completed: &[Task],
    pending: &[Task],
    change_summary: &str,
) -> String {
    let list = |tasks: &[Task]| -> String {
        if tasks.is_empty() {
            return "(none)".to_string();
        }
        tasks
            .iter()
            .map(|t| format!("- {}: {}", t.id, t.description))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "You are the planner for an autonomous coding run. Evaluate progress \
         against the specification and propose any missing tasks.\n\n\
         ## Specification\n{spec_description}\n\n\
         ## Completed tasks\n{completed}\n\n\
         ## Pending tasks\n{pending}\n\n\
         ## Recent changes\n{change_summary}\n\n\
         Respond with strict JSON only:\n\
         {{\"specSatisfied\": <bool>, \"reasoning\": \"<short>\", \
         \"newTasks\": [{{\"id\": \"...\", \"description\": \"...\", \
         \"priority\": \"high|medium|low\", \"dependencies\": [], \
         \"acceptance_criteria\": []}}]}}\n\
         Do not repeat existing task ids. Return newTasks: [] when nothing is missing.",
        completed = list(completed),
        pending = list(pending),
    )
}

/// One planner evaluation against the current source state. Best-effort:
/// every failure path returns an empty evaluation.
pub async fn evaluate_once(
    ctx: &ExecutionContext,
    provider: &ProviderConfig,
    spec_description: &str,
) -> PlannerEvaluation {
    let tasks = ctx.source.list_tasks();
    let (completed, pending): (Vec<Task>, Vec<Task>) = tasks
        .into_iter()
        .partition(|t| t.status == crate::task::TaskStatus::Completed);

    let change_summary = git::diff_stat(&ctx.repo_root, "HEAD~10..HEAD");
    let prompt = build_planner_prompt(spec_description, &completed, &pending, &change_summary);

    let options = RunnerOptions {
        timeout: Duration::from_secs(120),
        ..RunnerOptions::default()
    };
    match run_provider(provider, &prompt, &ctx.repo_root, &options).await {
        Ok(outcome) if outcome.success => {
            match parse_planner_response(&outcome.summary)
                .or_else(|| parse_planner_response(&outcome.output))
            {
                Some(eval) => eval,
                None => {
                    tracing::warn!("planner returned unparseable JSON; ignoring");
                    PlannerEvaluation::empty()
                }
            }
        }
        Ok(outcome) => {
            tracing::warn!(error = ?outcome.error, "planner invocation failed; ignoring");
            PlannerEvaluation::empty()
        }
        Err(e) => {
            tracing::warn!(error = %e, "planner invocation errored; ignoring");
            PlannerEvaluation::empty()
        }
    }
}

/// Append surviving planner tasks to the source. Collisions are dropped
/// inside the source; returns the count actually added.
pub fn integrate_new_tasks(source: &TaskSource, evaluation: PlannerEvaluation) -> usize {
    if evaluation.new_tasks.is_empty() {
        return 0;
    }
    let tasks: Vec<Task> = evaluation
        .new_tasks
        .into_iter()
        .map(PlannedTask::into_task)
        .collect();
    source.append_tasks(tasks).len()
}

/// Handle to the running planner loop.
pub struct Planner {
    satisfied_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl Planner {
    /// Spawn the periodic evaluation loop.
    pub fn spawn(ctx: ExecutionContext) -> Self {
        let (satisfied_tx, satisfied_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();

        let interval = Duration::from_secs(ctx.config.planner.interval_secs.max(1));
        let provider = ctx
            .config
            .planner
            .provider
            .clone()
            .unwrap_or_else(|| ctx.config.provider.clone());
        let spec_description = ctx.config.planner.spec_description.clone();
        let source = Arc::clone(&ctx.source);
        let events = ctx.events.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Swallow the immediate first tick so evaluations start one
            // interval in.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = loop_cancel.cancelled() => break,
                }

                let evaluation = evaluate_once(&ctx, &provider, &spec_description).await;
                let satisfied = evaluation.spec_satisfied;
                let reasoning = evaluation.reasoning.clone();
                let added = integrate_new_tasks(&source, evaluation);
                if added > 0 {
                    tracing::info!(added, "planner appended new tasks");
                    events.emit(OrchestratorEvent::PlannerTasksAdded { count: added });
                }
                if satisfied && !*satisfied_tx.borrow() {
                    tracing::info!(reasoning = %reasoning, "planner reports spec satisfied");
                    events.emit(OrchestratorEvent::SpecSatisfied);
                    let _ = satisfied_tx.send(true);
                }
            }
        });

        Self {
            satisfied_rx,
            cancel,
            handle,
        }
    }

    /// Has the planner signalled that the spec is satisfied?
    pub fn is_satisfied(&self) -> bool {
        *self.satisfied_rx.borrow()
    }

    /// Stop the loop and wait for the in-flight evaluation to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
