//! Judge aggregator: multi-persona LLM review of completed work.
//!
//! Each judge persona scores the work 0..100 against its own criteria.
//! Judges run in parallel by default; the aggregate passes iff every
//! *required* judge passes its threshold, while non-required judges
//! still pull on the weighted mean.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::provider::runner::{run_provider, RunnerOptions};
use crate::provider::ProviderConfig;

/// Configuration for one judge on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Persona name, looked up in the persona registry.
    pub persona: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_required")]
    pub required: bool,
    /// Optional provider/model override for this judge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_weight() -> f64 {
    1.0
}

fn default_threshold() -> f64 {
    70.0
}

fn default_required() -> bool {
    true
}

impl JudgeConfig {
    pub fn new(persona: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            weight: default_weight(),
            threshold: default_threshold(),
            required: default_required(),
            provider: None,
            model: None,
        }
    }
}

/// A named review role with its own system prompt and criteria.
#[derive(Debug, Clone)]
pub struct Persona {
    pub name: &'static str,
    pub system_prompt: &'static str,
    pub criteria: &'static [&'static str],
}

/// The flat persona catalog, keyed by name.
pub fn persona_registry() -> HashMap<&'static str, Persona> {
    let personas = [
        Persona {
            name: "QA",
            system_prompt: "You are a meticulous QA engineer. Judge whether the change \
                            actually satisfies the acceptance criteria and is covered by tests.",
            criteria: &[
                "every acceptance criterion is demonstrably met",
                "tests cover the changed behavior",
                "no regressions are visible in the diff",
            ],
        },
        Persona {
            name: "Security",
            system_prompt: "You are a security reviewer. Judge the change for unsafe input \
                            handling, secret leakage, and injection risks.",
            criteria: &[
                "no secrets or credentials in the diff",
                "external input is validated",
                "no shell or SQL injection vectors",
            ],
        },
        Persona {
            name: "UX",
            system_prompt: "You are a UX reviewer. Judge user-facing text, error messages, \
                            and interaction flows for clarity.",
            criteria: &[
                "user-facing messages are clear and actionable",
                "failure states are handled gracefully",
            ],
        },
        Persona {
            name: "Architect",
            system_prompt: "You are a software architect. Judge the change for structural \
                            fit, coupling, and consistency with the existing design.",
            criteria: &[
                "the change fits the existing module boundaries",
                "no needless coupling or duplication was introduced",
            ],
        },
        Persona {
            name: "Performance",
            system_prompt: "You are a performance engineer. Judge the change for obvious \
                            hot-path regressions and wasteful resource use.",
            criteria: &[
                "no unbounded loops or allocations on hot paths",
                "I/O is batched or streamed where it matters",
            ],
        },
    ];
    personas.into_iter().map(|p| (p.name, p)).collect()
}

/// One judge's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResult {
    pub score: f64,
    pub passed: bool,
    pub persona: String,
    pub verdict: String,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// The aggregate across all judges on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedJudgeResult {
    pub passed: bool,
    pub overall_score: f64,
    pub results: Vec<JudgeResult>,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

/// What the judge LLM is asked to return.
#[derive(Debug, Clone, Deserialize)]
struct RawVerdict {
    score: f64,
    #[serde(default)]
    verdict: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    suggestions: Option<Vec<String>>,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

/// Everything a judge needs to evaluate a task.
#[derive(Debug, Clone, Default)]
pub struct JudgeContext {
    pub task_description: String,
    pub criteria: Vec<String>,
    /// Code diff of the work under review (worktree or trunk vs HEAD).
    pub diff: String,
    /// The provider's own summary of what it did.
    pub provider_summary: String,
}

static FENCED_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("static regex")
});

/// Build the evaluation prompt for one persona.
pub fn build_judge_prompt(config: &JudgeConfig, ctx: &JudgeContext) -> String {
    let registry = persona_registry();
    let persona = registry.get(config.persona.as_str());
    let system_prompt = persona.map_or(
        "You are a code reviewer. Judge whether the work meets the criteria.",
        |p| p.system_prompt,
    );
    let persona_criteria: Vec<String> = persona
        .map(|p| p.criteria.iter().map(|c| format!("- {c}")).collect())
        .unwrap_or_default();
    let task_criteria: Vec<String> = ctx.criteria.iter().map(|c| format!("- {c}")).collect();

    format!(
        "{system_prompt}\n\n\
         ## Task\n{description}\n\n\
         ## Acceptance criteria\n{task_criteria}\n\n\
         ## Persona criteria\n{persona_criteria}\n\n\
         ## Code diff\n```diff\n{diff}\n```\n\n\
         ## Agent summary\n{summary}\n\n\
         Respond with a fenced JSON object:\n\
         ```json\n\
         {{\"score\": <0-100>, \"verdict\": \"<one line>\", \"reasoning\": \"<why>\", \
         \"suggestions\": [\"...\"], \"confidence\": <0-1>}}\n\
         ```",
        description = ctx.task_description,
        task_criteria = task_criteria.join("\n"),
        persona_criteria = persona_criteria.join("\n"),
        diff = ctx.diff,
        summary = ctx.provider_summary,
    )
}

/// Parse a judge response. Falls back to a keyword heuristic when no
/// parseable JSON is found: approval language maps to 70, everything
/// else to 30.
pub fn parse_judge_response(text: &str, persona: &str, threshold: f64) -> JudgeResult {
    let raw = FENCED_JSON_RE
        .captures(text)
        .and_then(|caps| serde_json::from_str::<RawVerdict>(&caps[1]).ok())
        .or_else(|| serde_json::from_str::<RawVerdict>(text.trim()).ok());

    let (score, verdict, reasoning, suggestions, confidence) = match raw {
        Some(raw) => (
            raw.score.clamp(0.0, 100.0),
            raw.verdict,
            raw.reasoning,
            raw.suggestions,
            raw.confidence.clamp(0.0, 1.0),
        ),
        None => {
            let lower = text.to_ascii_lowercase();
            let approved = lower.contains("approved") || lower.contains("passes");
            let score = if approved { 70.0 } else { 30.0 };
            (
                score,
                if approved { "approved" } else { "rejected" }.to_string(),
                "unparseable judge response; heuristic verdict".to_string(),
                None,
                0.2,
            )
        }
    };

    JudgeResult {
        score,
        passed: score >= threshold,
        persona: persona.to_string(),
        verdict,
        reasoning,
        suggestions,
        confidence,
        timestamp: Utc::now(),
    }
}

/// Weighted aggregation across judge results.
///
/// `passed` iff every required judge passed; non-required judges still
/// contribute to the weighted mean.
pub fn aggregate(results: &[(JudgeConfig, JudgeResult)]) -> AggregatedJudgeResult {
    let total_weight: f64 = results.iter().map(|(c, _)| c.weight).sum();
    let overall_score = if total_weight > 0.0 {
        results
            .iter()
            .map(|(c, r)| c.weight * r.score)
            .sum::<f64>()
            / total_weight
    } else {
        0.0
    };

    let rejected: Vec<&str> = results
        .iter()
        .filter(|(c, r)| c.required && !r.passed)
        .map(|(_, r)| r.persona.as_str())
        .collect();
    let passed = rejected.is_empty();

    let summary = if passed {
        format!(
            "All {} judges passed (avg={overall_score:.1})",
            results.len()
        )
    } else {
        format!("Rejected by: {}", rejected.join(", "))
    };

    AggregatedJudgeResult {
        passed,
        overall_score,
        results: results.iter().map(|(_, r)| r.clone()).collect(),
        summary,
        timestamp: Utc::now(),
    }
}

/// Options for running a judge panel.
#[derive(Debug, Clone)]
pub struct JudgeRunOptions {
    /// Default provider when a judge has no override.
    pub provider: ProviderConfig,
    /// Per-judge hard timeout.
    pub timeout: Duration,
    /// Run judges one at a time instead of fanned out.
    pub sequential: bool,
    /// With sequential execution, stop at the first required failure.
    pub fail_fast: bool,
}

impl JudgeRunOptions {
    pub fn new(provider: ProviderConfig) -> Self {
        Self {
            provider,
            timeout: Duration::from_secs(60),
            sequential: false,
            fail_fast: false,
        }
    }
}

fn judge_provider(config: &JudgeConfig, fallback: &ProviderConfig) -> ProviderConfig {
    let mut provider = fallback.clone();
    if let Some(ref kind) = config.provider {
        if let Ok(kind) = kind.parse() {
            if kind != provider.kind {
                // A provider switch invalidates a binary override meant
                // for the previous provider.
                provider.kind = kind;
                provider.binary = None;
            }
        }
    }
    if let Some(ref model) = config.model {
        provider.model = model.clone();
    }
    provider
}

/// Evaluate one judge. Failures (spawn error, timeout) degrade to a
/// zero-score rejection rather than aborting the panel.
async fn run_one_judge(
    config: &JudgeConfig,
    ctx: &JudgeContext,
    options: &JudgeRunOptions,
    workdir: &Path,
) -> JudgeResult {
    let provider = judge_provider(config, &options.provider);
    let prompt = build_judge_prompt(config, ctx);
    let runner_options = RunnerOptions {
        timeout: options.timeout,
        ..RunnerOptions::default()
    };

    match run_provider(&provider, &prompt, workdir, &runner_options).await {
        Ok(outcome) if outcome.success || !outcome.summary.is_empty() => {
            parse_judge_response(&outcome.summary, &config.persona, config.threshold)
        }
        Ok(outcome) => {
            tracing::warn!(
                persona = %config.persona,
                error = ?outcome.error,
                "judge invocation produced no verdict"
            );
            failed_judge_result(config, "judge produced no output")
        }
        Err(e) => {
            tracing::warn!(persona = %config.persona, error = %e, "judge invocation failed");
            failed_judge_result(config, &format!("judge invocation failed: {e}"))
        }
    }
}

fn failed_judge_result(config: &JudgeConfig, reason: &str) -> JudgeResult {
    JudgeResult {
        score: 0.0,
        passed: false,
        persona: config.persona.clone(),
        verdict: "error".to_string(),
        reasoning: reason.to_string(),
        suggestions: None,
        confidence: 0.0,
        timestamp: Utc::now(),
    }
}

/// Run the full judge panel for a task.
pub async fn run_judges(
    configs: &[JudgeConfig],
    ctx: &JudgeContext,
    options: &JudgeRunOptions,
    workdir: &Path,
) -> AggregatedJudgeResult {
    let mut results: Vec<(JudgeConfig, JudgeResult)> = Vec::with_capacity(configs.len());

    if options.sequential {
        for config in configs {
            let result = run_one_judge(config, ctx, options, workdir).await;
            let required_failure = config.required && !result.passed;
            results.push((config.clone(), result));
            if required_failure && options.fail_fast {
                tracing::info!(persona = %config.persona, "required judge failed; stopping panel");
                break;
            }
        }
    } else {
        let futures: Vec<_> = configs
            .iter()
            .map(|config| run_one_judge(config, ctx, options, workdir))
            .collect();
        let outcomes = futures::future::join_all(futures).await;
        for (config, result) in configs.iter().zip(outcomes) {
            results.push((config.clone(), result));
        }
    }

    aggregate(&results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(persona: &str, score: f64, threshold: f64) -> JudgeResult {
        JudgeResult {
            score,
            passed: score >= threshold,
            persona: persona.to_string(),
            verdict: String::new(),
            reasoning: String::new(),
            suggestions: None,
            confidence: 0.9,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn registry_has_all_five_personas() {
        let registry = persona_registry();
        for name in ["QA", "Security", "UX", "Architect", "Performance"] {
            assert!(registry.contains_key(name), "missing persona {name}");
        }
    }

    #[test]
    fn parse_fenced_json_verdict() {
        let text = r#"Here is my review.
```json
{"score": 85, "verdict": "solid", "reasoning": "meets criteria", "confidence": 0.9}
```"#;
        let result = parse_judge_response(text, "QA", 70.0);
        assert_eq!(result.score, 85.0);
        assert!(result.passed);
        assert_eq!(result.verdict, "solid");
        assert_eq!(result.confidence, 0.9);
    }

    #[test]
    fn parse_bare_json_verdict() {
        let text = r#"{"score": 40, "verdict": "incomplete", "reasoning": "tests missing"}"#;
        let result = parse_judge_response(text, "QA", 70.0);
        assert_eq!(result.score, 40.0);
        assert!(!result.passed);
    }

    #[test]
    fn heuristic_fallback_maps_approval_language() {
        let result = parse_judge_response("The change is approved, ship it.", "QA", 70.0);
        assert_eq!(result.score, 70.0);
        assert!(result.passed);

        let result = parse_judge_response("This needs more work.", "QA", 70.0);
        assert_eq!(result.score, 30.0);
        assert!(!result.passed);
    }

    #[test]
    fn score_is_clamped() {
        let result = parse_judge_response(r#"{"score": 250}"#, "QA", 70.0);
        assert_eq!(result.score, 100.0);
        let result = parse_judge_response(r#"{"score": -5}"#, "QA", 70.0);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn aggregate_requires_all_required_judges() {
        // Scores 60 (required, fails) and 90 (required, passes):
        // aggregate fails with the weighted mean at 75.
        let results = vec![
            (JudgeConfig::new("QA"), result_with("QA", 60.0, 70.0)),
            (
                JudgeConfig::new("Security"),
                result_with("Security", 90.0, 70.0),
            ),
        ];
        let aggregated = aggregate(&results);
        assert!(!aggregated.passed);
        assert_eq!(aggregated.overall_score, 75.0);
        assert_eq!(aggregated.summary, "Rejected by: QA");
    }

    #[test]
    fn aggregate_ignores_non_required_failures_for_pass() {
        let mut advisory = JudgeConfig::new("UX");
        advisory.required = false;
        let results = vec![
            (JudgeConfig::new("QA"), result_with("QA", 80.0, 70.0)),
            (advisory, result_with("UX", 40.0, 70.0)),
        ];
        let aggregated = aggregate(&results);
        assert!(aggregated.passed);
        // The advisory judge still drags the mean down.
        assert_eq!(aggregated.overall_score, 60.0);
        assert!(aggregated.summary.starts_with("All 2 judges passed"));
    }

    #[test]
    fn aggregate_weighted_mean() {
        let mut heavy = JudgeConfig::new("QA");
        heavy.weight = 3.0;
        let results = vec![
            (heavy, result_with("QA", 100.0, 70.0)),
            (
                JudgeConfig::new("Security"),
                result_with("Security", 80.0, 70.0),
            ),
        ];
        let aggregated = aggregate(&results);
        // (3*100 + 1*80) / 4 = 95
        assert_eq!(aggregated.overall_score, 95.0);
        assert!(aggregated.passed);
    }

    #[test]
    fn aggregate_of_empty_panel_passes_vacuously() {
        let aggregated = aggregate(&[]);
        assert!(aggregated.passed);
        assert_eq!(aggregated.overall_score, 0.0);
    }

    #[test]
    fn judge_prompt_contains_all_inputs() {
        let ctx = JudgeContext {
            task_description: "Implement login".to_string(),
            criteria: vec!["tokens expire".to_string()],
            diff: "+ fn login() {}".to_string(),
            provider_summary: "Added login.".to_string(),
        };
        let prompt = build_judge_prompt(&JudgeConfig::new("Security"), &ctx);
        assert!(prompt.contains("security reviewer"));
        assert!(prompt.contains("Implement login"));
        assert!(prompt.contains("- tokens expire"));
        assert!(prompt.contains("+ fn login() {}"));
        assert!(prompt.contains("Added login."));
        assert!(prompt.contains("fenced JSON"));
    }

    #[test]
    fn judge_provider_override_resolves() {
        let fallback = ProviderConfig::new(crate::provider::ProviderKind::Claude, "opus");
        let mut config = JudgeConfig::new("QA");
        config.provider = Some("gemini".to_string());
        config.model = Some("gemini-pro".to_string());
        let provider = judge_provider(&config, &fallback);
        assert_eq!(provider.kind, crate::provider::ProviderKind::Gemini);
        assert_eq!(provider.model, "gemini-pro");

        // Invalid provider override is ignored in favor of the fallback.
        config.provider = Some("nonsense".to_string());
        config.model = None;
        let provider = judge_provider(&config, &fallback);
        assert_eq!(provider.kind, crate::provider::ProviderKind::Claude);
        assert_eq!(provider.model, "opus");
    }
}
