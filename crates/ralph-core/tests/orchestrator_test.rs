//! Sequential orchestrator end-to-end tests against fake provider CLIs.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use ralph_core::config::RunConfig;
use ralph_core::context::ExecutionContext;
use ralph_core::session::SessionManager;
use ralph_core::task::source::{single_file, TaskSource};
use ralph_core::task::{TaskFilter, TaskStatus};
use ralph_test_utils::{
    fake_provider_capturing, fake_provider_no_sentinel, fake_provider_rate_limited,
    fake_provider_success, write_prd_file, TempRepo,
};

fn build_ctx(
    repo: &TempRepo,
    prd_path: &Path,
    binary: &Path,
    mutate: impl FnOnce(&mut RunConfig),
) -> ExecutionContext {
    let mut config = RunConfig::default();
    config.provider.binary = Some(binary.to_string_lossy().into_owned());
    config.validation.enabled = false;
    mutate(&mut config);

    let source = TaskSource::initialize(&single_file(prd_path)).unwrap();
    let sessions = SessionManager::new(repo.scratch("sessions")).unwrap();
    let ctx = ExecutionContext::new(repo.path(), config, source, sessions);
    ctx.sessions
        .create_session(serde_json::json!({}), "main", &repo.head())
        .unwrap();
    ctx
}

#[tokio::test]
async fn linear_dag_completes_in_dependency_order() {
    let repo = TempRepo::new();
    let scripts = repo.scratch("scripts");
    let binary = fake_provider_success(&scripts, "provider.sh", None);

    let prd_path = repo.scratch("prds").join("prd.json");
    write_prd_file(
        &prd_path,
        &[
            ("a", "high", &[]),
            ("b", "medium", &["a"]),
            ("c", "medium", &["b"]),
        ],
    );

    let ctx = build_ctx(&repo, &prd_path, &binary, |_| {});
    let summary = ralph_core::run(&ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed, 3);
    let order: Vec<&str> = summary.tasks.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
    assert!(summary.tasks.iter().all(|t| t.success));

    let totals = ctx.source.get_summary();
    assert_eq!(totals.total, 3);
    assert_eq!(totals.completed, 3);
    assert_eq!(totals.pending, 0);
    assert_eq!(totals.blocked, 0);

    // Session record reflects the run.
    let session = ctx.sessions.current_session().unwrap();
    assert_eq!(session.completed_task_count, 3);
}

#[tokio::test]
async fn blocked_dependent_is_never_scheduled() {
    let repo = TempRepo::new();
    let scripts = repo.scratch("scripts");
    // Provider finishes but never signals completion, so `a` keeps
    // failing and `b` stays blocked behind it.
    let binary = fake_provider_no_sentinel(&scripts, "provider.sh");

    let prd_path = repo.scratch("prds").join("prd.json");
    write_prd_file(&prd_path, &[("a", "high", &[]), ("b", "medium", &["a"])]);

    let ctx = build_ctx(&repo, &prd_path, &binary, |c| c.iterations = 2);
    let summary = ralph_core::run(&ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed, 0);
    let picks: Vec<&str> = summary.tasks.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(picks, vec!["a", "a"], "iteration 2 must retry `a`, not pick `b`");

    let ready: Vec<String> = ctx
        .source
        .get_ready_tasks(&TaskFilter::default())
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ready, vec!["a"], "b must never be ready");

    // Attempts carried on the task.
    assert_eq!(ctx.source.get_task("a").unwrap().attempts(), 2);
}

#[tokio::test]
async fn validation_retry_then_pass_counts_attempts() {
    let repo = TempRepo::new();
    let scripts = repo.scratch("scripts");
    let binary = fake_provider_success(&scripts, "provider.sh", None);

    let prd_path = repo.scratch("prds").join("prd.json");
    write_prd_file(&prd_path, &[("x", "high", &[])]);

    // A build gate that fails on first invocation, passes afterwards.
    let marker = repo.scratch("state").join("gate-ran-once");
    let gate_cmd = format!(
        "test -f {marker} || {{ touch {marker}; exit 1; }}",
        marker = marker.display()
    );

    let ctx = build_ctx(&repo, &prd_path, &binary, |c| {
        c.iterations = 3;
        c.validation.enabled = true;
        c.validation.packages_override = Some(vec!["app".to_string()]);
        c.validation
            .commands
            .insert("app".to_string(), {
                let mut gates = std::collections::HashMap::new();
                gates.insert("build".to_string(), gate_cmd);
                gates
            });
    });

    let summary = ralph_core::run(&ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.tasks.len(), 2, "one failed attempt, one pass");
    assert!(!summary.tasks[0].success);
    assert!(summary.tasks[1].success);

    let task = ctx.source.get_task("x").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let validation = task.validation_results.unwrap();
    assert_eq!(validation.attempts, 2);
    assert!(validation.passed);
    assert!(validation.failed_gates.is_empty());
}

#[tokio::test]
async fn rate_limited_attempt_escalates_backoff_and_requeues() {
    let repo = TempRepo::new();
    let scripts = repo.scratch("scripts");
    let binary = fake_provider_rate_limited(&scripts, "provider.sh");

    let prd_path = repo.scratch("prds").join("prd.json");
    write_prd_file(&prd_path, &[("a", "high", &[])]);

    let ctx = build_ctx(&repo, &prd_path, &binary, |c| {
        c.iterations = 1;
        c.provider.model = "opus".to_string();
        c.factory
            .slot_limits
            .insert("claude:opus".to_string(), 1);
    });

    let summary = ralph_core::run(&ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed, 0);
    assert!(summary.tasks[0].rate_limited);

    // The slot is backing off within the first-rung jitter window and
    // denies new acquisitions.
    let status = ctx.limiter.get_status();
    let slot = &status["claude:opus"];
    assert_eq!(slot.consecutive_rate_limits, 1);
    assert!(
        (8.0..=12.0).contains(&slot.backoff_seconds),
        "backoff was {}",
        slot.backoff_seconds
    );
    assert!(!ctx.limiter.try_acquire("claude", "opus"));

    // The task went back to pending for a later retry.
    assert_eq!(ctx.source.get_task("a").unwrap().status, TaskStatus::Pending);
}

#[tokio::test]
async fn task_prompt_carries_the_completion_sentinel() {
    let repo = TempRepo::new();
    let scripts = repo.scratch("scripts");
    let capture = repo.scratch("capture").join("prompts.txt");
    let binary = fake_provider_capturing(&scripts, "provider.sh", &capture);

    let prd_path = repo.scratch("prds").join("prd.json");
    write_prd_file(&prd_path, &[("a", "high", &[])]);

    let ctx = build_ctx(&repo, &prd_path, &binary, |_| {});
    let summary = ralph_core::run(&ctx, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.completed, 1);

    let prompts = std::fs::read_to_string(&capture).unwrap();
    assert!(prompts.contains("# Task: a"));
    assert!(
        prompts.contains("end your final message with the literal TASK_COMPLETE"),
        "prompt missing sentinel instruction: {prompts}"
    );
}

#[tokio::test]
async fn dry_run_dispatches_nothing() {
    let repo = TempRepo::new();
    let scripts = repo.scratch("scripts");
    let binary = fake_provider_success(&scripts, "provider.sh", None);

    let prd_path = repo.scratch("prds").join("prd.json");
    write_prd_file(&prd_path, &[("a", "high", &[]), ("b", "low", &[])]);

    let ctx = build_ctx(&repo, &prd_path, &binary, |c| c.dry_run = true);
    let summary = ralph_core::run(&ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed, 0);
    assert_eq!(summary.planned, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(ctx.source.get_summary().pending, 2);
}

#[tokio::test]
async fn category_filter_limits_scheduling() {
    let repo = TempRepo::new();
    let scripts = repo.scratch("scripts");
    let binary = fake_provider_success(&scripts, "provider.sh", None);

    let prd_path = repo.scratch("prds").join("prd.json");
    std::fs::write(
        &prd_path,
        serde_json::to_string_pretty(&serde_json::json!({
            "items": [
                {"id": "api-1", "description": "api work", "priority": "medium", "category": "backend"},
                {"id": "web-1", "description": "web work", "priority": "high", "category": "frontend"},
            ]
        }))
        .unwrap(),
    )
    .unwrap();

    let ctx = build_ctx(&repo, &prd_path, &binary, |c| {
        c.filter.category = Some("backend".to_string());
    });
    let summary = ralph_core::run(&ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.tasks[0].task_id, "api-1");
    assert_eq!(
        ctx.source.get_task("web-1").unwrap().status,
        TaskStatus::Pending
    );
}
