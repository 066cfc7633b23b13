//! Judge panel end-to-end: the judge invocation rides the same provider
//! runner as task execution, and its aggregate gates task completion.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use ralph_core::config::RunConfig;
use ralph_core::context::ExecutionContext;
use ralph_core::session::SessionManager;
use ralph_core::task::source::{single_file, TaskSource};
use ralph_core::task::TaskStatus;
use ralph_test_utils::{write_script, TempRepo};

/// A provider whose result text carries both a fenced judge verdict and
/// the completion sentinel, so one script serves both invocations.
fn scoring_provider(dir: &Path, score: u32) -> std::path::PathBuf {
    let result = format!(
        "Verdict follows\\n```json\\n{{\\\"score\\\": {score}, \\\"verdict\\\": \\\"reviewed\\\", \
         \\\"reasoning\\\": \\\"checked the diff\\\", \\\"confidence\\\": 0.9}}\\n```\\nTASK_COMPLETE"
    );
    // printf keeps the JSON's backslash escapes intact where some /bin/sh
    // echo implementations would expand them.
    write_script(
        dir,
        "provider.sh",
        &format!("printf '%s\\n' '{{\"type\":\"result\",\"result\":\"{result}\"}}'\n"),
    )
}

fn prd_with_judges(path: &Path) {
    let body = serde_json::json!({
        "items": [{
            "id": "j1",
            "description": "work with judges",
            "priority": "high",
            "judges": [
                {"persona": "QA", "threshold": 70, "required": true},
            ],
        }]
    });
    std::fs::write(path, serde_json::to_string_pretty(&body).unwrap()).unwrap();
}

fn build_ctx(repo: &TempRepo, prd_path: &Path, binary: &Path) -> ExecutionContext {
    let mut config = RunConfig::default();
    config.provider.binary = Some(binary.to_string_lossy().into_owned());
    config.validation.enabled = false;
    config.iterations = 1;

    let source = TaskSource::initialize(&single_file(prd_path)).unwrap();
    let sessions = SessionManager::new(repo.scratch("sessions")).unwrap();
    let ctx = ExecutionContext::new(repo.path(), config, source, sessions);
    ctx.sessions
        .create_session(serde_json::json!({}), "main", &repo.head())
        .unwrap();
    ctx
}

#[tokio::test]
async fn passing_judge_panel_completes_the_task() {
    let repo = TempRepo::new();
    let binary = scoring_provider(&repo.scratch("scripts"), 95);
    let prd_path = repo.scratch("prds").join("prd.json");
    prd_with_judges(&prd_path);

    let ctx = build_ctx(&repo, &prd_path, &binary);
    let summary = ralph_core::run(&ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed, 1);
    let task = ctx.source.get_task("j1").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let judges = task.judge_results.expect("aggregated result stored");
    assert!(judges.passed);
    assert_eq!(judges.overall_score, 95.0);
    assert_eq!(judges.results.len(), 1);
    assert_eq!(judges.results[0].persona, "QA");
    assert!(judges.summary.starts_with("All 1 judges passed"));
}

#[tokio::test]
async fn failing_required_judge_returns_task_to_pending() {
    let repo = TempRepo::new();
    let binary = scoring_provider(&repo.scratch("scripts"), 40);
    let prd_path = repo.scratch("prds").join("prd.json");
    prd_with_judges(&prd_path);

    let ctx = build_ctx(&repo, &prd_path, &binary);
    let summary = ralph_core::run(&ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed, 0);
    assert_eq!(
        summary.tasks[0].failure.as_deref(),
        Some("judge panel rejected")
    );

    let task = ctx.source.get_task("j1").unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts(), 1);
}
