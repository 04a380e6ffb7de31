mod common;

use std::sync::Arc;

use kiln_core::types::{
    AgentRole, BuildMode, BuildRequest, BuildStatus, RetryStrategy, TaskAction, TaskStatus,
    TaskType,
};
use kiln_harness::mock::{Reply, ScriptedProvider};

use common::{start, tasks_of, test_config, wait_for_terminal, ALL_PROVIDERS, FRONTEND_APP};

// ===========================================================================
// Provider errors
// ===========================================================================

#[tokio::test]
async fn invalid_api_key_fails_without_retry() {
    let mock = Arc::new(
        ScriptedProvider::new(ALL_PROVIDERS)
            .with_default_reply(Reply::api_error("Invalid API key provided")),
    );
    let manager = start(test_config(), &mock);
    let build = manager.create_build(1, BuildRequest::new("app")).await.unwrap();
    manager.start_build(build.id).await.unwrap();

    let failed = wait_for_terminal(&manager, build.id).await;
    assert_eq!(failed.status, BuildStatus::Failed);
    let error = failed.error.clone().unwrap();
    assert!(error.starts_with("Task failed due to a non-retriable provider error"), "{error}");
    assert!(error.contains("Invalid API key provided"));

    assert_eq!(mock.calls_for_role(AgentRole::Lead).len(), 1);
    let plan = tasks_of(&failed, TaskType::Plan)[0];
    assert_eq!(plan.status, TaskStatus::Failed);
    assert_eq!(plan.error_history.len(), 1);
    let lead = failed.agent_by_role(AgentRole::Lead).unwrap();
    assert!(!lead.status.is_available());
}

#[tokio::test]
async fn rate_limit_is_retried_once() {
    let mock = Arc::new(
        ScriptedProvider::new(ALL_PROVIDERS)
            .on_role(
                AgentRole::Lead,
                vec![Reply::api_error("429 Too Many Requests"), Reply::text("Plan: notes app")],
            )
            .on_role(AgentRole::Frontend, vec![Reply::text(FRONTEND_APP)]),
    );
    let manager = start(test_config(), &mock);
    let build = manager.create_build(1, BuildRequest::new("A notes app")).await.unwrap();
    manager.start_build(build.id).await.unwrap();

    let done = wait_for_terminal(&manager, build.id).await;
    assert_eq!(done.status, BuildStatus::Completed, "error: {:?}", done.error);

    let plan = tasks_of(&done, TaskType::Plan)[0];
    assert_eq!(plan.status, TaskStatus::Completed);
    assert_eq!(plan.retry_count, 1);
    assert_eq!(plan.retry_strategy, RetryStrategy::Backoff);
    assert_eq!(plan.error_history.len(), 1);
    assert_eq!(plan.error_history[0].attempt, 1);
    assert!(plan.error_history[0].error.contains("429"));

    let lead_calls = mock.calls_for_role(AgentRole::Lead);
    assert_eq!(lead_calls.len(), 2);
    assert!(lead_calls[1].prompt.contains("429 Too Many Requests"));
}

#[tokio::test]
async fn exhausted_retries_hand_off_to_solver() {
    let mock = Arc::new(
        ScriptedProvider::new(ALL_PROVIDERS)
            .on_role(AgentRole::Backend, vec![Reply::api_error("upstream exploded")])
            .on_role(AgentRole::Frontend, vec![Reply::text(FRONTEND_APP)]),
    );
    let manager = start(test_config(), &mock);
    let request = BuildRequest::new("A notes app").with_mode(BuildMode::Fast);
    let build = manager.create_build(1, request).await.unwrap();
    assert_eq!(build.max_retries, 2);
    manager.start_build(build.id).await.unwrap();

    let done = wait_for_terminal(&manager, build.id).await;
    assert_eq!(done.status, BuildStatus::Completed, "error: {:?}", done.error);

    // One first attempt plus two retries.
    assert_eq!(mock.calls_for_role(AgentRole::Backend).len(), 3);

    let api = tasks_of(&done, TaskType::GenerateApi)[0];
    assert_eq!(api.status, TaskStatus::Cancelled);
    assert!(api.input.recovery_queued);
    let recovery_id = api.input.superseded_by.unwrap();

    let recovery = done.task(recovery_id).unwrap();
    assert_eq!(recovery.task_type, TaskType::Fix);
    assert_eq!(recovery.input.action, Some(TaskAction::SolveBuildFailure));
    assert_eq!(recovery.priority, 99);
    assert_eq!(recovery.status, TaskStatus::Completed);
    assert_eq!(recovery.input.failed_task_id, Some(api.id));
    assert!(recovery
        .input
        .failure_error
        .as_deref()
        .is_some_and(|e| e.contains("upstream exploded")));

    let solver = done.agents[&recovery.assigned_to.unwrap()].role;
    assert_eq!(solver, AgentRole::Solver);
    assert_eq!(mock.calls_for_role(AgentRole::Solver).len(), 1);
}

// ===========================================================================
// Verification and budgets
// ===========================================================================

#[tokio::test]
async fn verification_failure_triggers_corrective_retry() {
    let broken = "// File: src/App.tsx\nexport default function App() {\n  // TODO: render the notes list\n  return null;\n}\n";
    let mock = Arc::new(
        ScriptedProvider::new(ALL_PROVIDERS).on_role(
            AgentRole::Frontend,
            vec![Reply::text(broken), Reply::text(FRONTEND_APP)],
        ),
    );
    let manager = start(test_config(), &mock);
    let build = manager.create_build(1, BuildRequest::new("A notes app")).await.unwrap();
    manager.start_build(build.id).await.unwrap();

    let done = wait_for_terminal(&manager, build.id).await;
    assert_eq!(done.status, BuildStatus::Completed, "error: {:?}", done.error);

    let ui = tasks_of(&done, TaskType::GenerateUi)[0];
    assert_eq!(ui.status, TaskStatus::Completed);
    assert_eq!(ui.retry_count, 1);
    assert_eq!(ui.retry_strategy, RetryStrategy::FixAndRetry);
    assert_eq!(ui.error_history[0].context, "verification");
    assert!(ui
        .input
        .verification_errors
        .iter()
        .any(|e| e.contains("Contains placeholder code 'TODO'")));

    let frontend_calls = mock.calls_for_role(AgentRole::Frontend);
    assert_eq!(frontend_calls.len(), 2);
    assert!(frontend_calls[1].prompt.contains("failed build verification"));
}

#[tokio::test]
async fn request_budget_exhaustion_fails_build() {
    let mut config = test_config();
    config.limits.full.max_requests = 3;
    let mock = Arc::new(ScriptedProvider::new(ALL_PROVIDERS));
    let manager = start(config, &mock);
    let build = manager.create_build(1, BuildRequest::new("app")).await.unwrap();
    assert_eq!(build.max_requests, 3);
    manager.start_build(build.id).await.unwrap();

    let failed = wait_for_terminal(&manager, build.id).await;
    assert_eq!(failed.status, BuildStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("Build budget exceeded (request limit)"));
    assert_eq!(failed.requests_used, 3);
    // Plan, architecture and schema used the budget.
    assert_eq!(mock.total_calls(), 3);
    assert!(failed.all_tasks_terminal());
    assert!(tasks_of(&failed, TaskType::GenerateUi)
        .iter()
        .all(|t| t.status == TaskStatus::Cancelled));
    // The pipeline stopped before the testing and review phases.
    assert!(tasks_of(&failed, TaskType::Test).is_empty());
    assert!(tasks_of(&failed, TaskType::Review).is_empty());
}

// ===========================================================================
// Fix loops and readiness
// ===========================================================================

#[tokio::test]
async fn critical_review_starts_fix_loop() {
    let mock = Arc::new(
        ScriptedProvider::new(ALL_PROVIDERS)
            .on_role(
                AgentRole::Reviewer,
                vec![
                    Reply::text("Critical: SQL injection in the login handler"),
                    Reply::text("Looks good now."),
                ],
            )
            .on_role(AgentRole::Frontend, vec![Reply::text(FRONTEND_APP)]),
    );
    let manager = start(test_config(), &mock);
    let build = manager.create_build(1, BuildRequest::new("A notes app")).await.unwrap();
    manager.start_build(build.id).await.unwrap();

    let done = wait_for_terminal(&manager, build.id).await;
    assert_eq!(done.status, BuildStatus::Completed, "error: {:?}", done.error);

    let with_action = |action| {
        done.tasks
            .iter()
            .filter(|t| t.input.action == Some(action))
            .collect::<Vec<_>>()
    };
    let fixes = with_action(TaskAction::FixReviewIssues);
    assert_eq!(fixes.len(), 1);
    assert_eq!(fixes[0].priority, 95);
    assert_eq!(fixes[0].status, TaskStatus::Completed);
    assert!(fixes[0].input.findings.iter().any(|f| f.contains("injection")));

    let regression = with_action(TaskAction::RegressionTest);
    assert_eq!(regression.len(), 1);
    assert_eq!(regression[0].task_type, TaskType::Test);
    assert_eq!(regression[0].input.trigger_task, Some(fixes[0].id));

    let post_review = with_action(TaskAction::PostFixReview);
    assert_eq!(post_review.len(), 1);
    assert_eq!(post_review[0].task_type, TaskType::Review);
    assert_eq!(mock.calls_for_role(AgentRole::Reviewer).len(), 2);
}

#[tokio::test]
async fn fix_loop_cap_blocks_follow_ups() {
    let mut config = test_config();
    config.recovery.max_fix_loops = 1;
    config.recovery.max_test_fix_loops = 1;
    let mock = Arc::new(
        ScriptedProvider::new(ALL_PROVIDERS)
            .on_role(AgentRole::Testing, vec![Reply::text("2 tests fail: expected 200 got 500")])
            .on_role(AgentRole::Frontend, vec![Reply::text(FRONTEND_APP)]),
    );
    let manager = start(config, &mock);
    let build = manager.create_build(1, BuildRequest::new("A notes app")).await.unwrap();
    manager.start_build(build.id).await.unwrap();

    let done = wait_for_terminal(&manager, build.id).await;
    assert!(done.status.is_terminal());

    let fix_tests = done
        .tasks
        .iter()
        .filter(|t| t.input.action == Some(TaskAction::FixTests))
        .count();
    assert_eq!(fix_tests, 1);
}

#[tokio::test]
async fn missing_frontend_entry_gets_one_recovery_pass() {
    let incomplete = "// File: package.json\n{\"name\":\"notes\",\"scripts\":{\"dev\":\"vite\",\"build\":\"vite build\"},\"dependencies\":{\"react\":\"^18.2.0\",\"react-dom\":\"^18.2.0\"}}\n// File: src/App.tsx\nexport default function App() {\n  return <h1>Notes</h1>;\n}\n";
    let mock = Arc::new(
        ScriptedProvider::new(ALL_PROVIDERS)
            .on_role(AgentRole::Frontend, vec![Reply::text(incomplete)])
            .on_role(AgentRole::Solver, vec![Reply::text("I could not find the entry files.")]),
    );
    let manager = start(test_config(), &mock);
    let build = manager.create_build(1, BuildRequest::new("A notes app")).await.unwrap();
    manager.start_build(build.id).await.unwrap();

    let failed = wait_for_terminal(&manager, build.id).await;
    assert_eq!(failed.status, BuildStatus::Failed);
    assert_eq!(failed.readiness_recovery_attempts, 1);
    let error = failed.error.unwrap();
    assert!(
        error.starts_with("Final output validation failed after repeated recovery"),
        "{error}"
    );
    assert!(error.contains("HTML entry point"));

    let recovery: Vec<_> = failed
        .tasks
        .iter()
        .filter(|t| t.input.action == Some(TaskAction::SolveBuildFailure))
        .collect();
    assert_eq!(recovery.len(), 1);
    assert!(recovery[0].input.validation_errors.len() >= 2);
    assert_eq!(mock.calls_for_role(AgentRole::Solver).len(), 1);
}
