//! Task prompt assembly and the completion sentinel.
//!
//! Both the sequential orchestrator and the factory workers build their
//! prompts here, so the sentinel instruction can never drift between the
//! two paths.

use std::sync::LazyLock;

use regex::Regex;

use crate::task::Task;

/// The literal the provider must emit to signal completion.
pub const TASK_COMPLETE_SENTINEL: &str = "TASK_COMPLETE";

static SENTINEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Accept case and separator variants: TASK_COMPLETE, task complete,
    // Task-Complete.
    Regex::new(r"(?i)task[\s_-]*complete").expect("static regex")
});

/// Context carried into a retry attempt: what went wrong last time.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    pub attempt: u32,
    pub previous_failure: String,
}

/// Build the provider prompt for a task.
///
/// Sections: title, metadata line, description, acceptance criteria,
/// notes, target packages, then the completion instruction. A retry
/// context prepends the prior failure so the agent can correct course.
pub fn build_task_prompt(task: &Task, packages: &[String], retry: Option<&RetryContext>) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(retry) = retry {
        sections.push(format!(
            "This is attempt {} at this task. The previous attempt failed:\n{}\n\
             Fix the underlying problem before finishing.",
            retry.attempt + 1,
            retry.previous_failure
        ));
    }

    sections.push(format!("# Task: {}", task.name));

    let category = task.category.as_deref().unwrap_or("general");
    sections.push(format!(
        "Category: {category} | Priority: {} | Id: {}",
        task.priority, task.id
    ));

    if !task.description.is_empty() {
        sections.push(format!("## Description\n{}", task.description));
    }

    if !task.criteria.is_empty() {
        let bullets: Vec<String> = task.criteria.iter().map(|c| format!("- {c}")).collect();
        sections.push(format!("## Acceptance criteria\n{}", bullets.join("\n")));
    }

    if let Some(ref notes) = task.notes {
        sections.push(format!("## Notes\n{notes}"));
    }

    if !packages.is_empty() {
        sections.push(format!("## Target packages\n{}", packages.join(", ")));
    }

    sections.push(format!(
        "When every acceptance criterion is met and the work is finished, \
         end your final message with the literal {TASK_COMPLETE_SENTINEL}."
    ));

    sections.join("\n\n")
}

/// Did the provider output signal completion? Case-insensitive, with
/// space/underscore/hyphen separators accepted.
pub fn is_task_complete(output: &str) -> bool {
    SENTINEL_RE.is_match(output)
}

/// Compose the failure feedback embedded in the next attempt's prompt.
pub fn compose_retry_feedback(failed_gates: &[String], judge_summary: Option<&str>) -> String {
    let mut parts = Vec::new();
    if !failed_gates.is_empty() {
        parts.push(format!(
            "Validation gates failed: {}",
            failed_gates.join(", ")
        ));
    }
    if let Some(summary) = judge_summary {
        parts.push(format!("Judge panel rejected the work: {summary}"));
    }
    if parts.is_empty() {
        parts.push("The task did not signal completion.".to_string());
    }
    parts.join("\n")
}
