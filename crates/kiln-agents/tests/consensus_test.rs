mod common;

use std::sync::Arc;

use kiln_core::config::EngineConfig;
use kiln_core::types::{
    AgentRole, BuildRequest, BuildStatus, Provider, TaskAction, TaskStatus, TaskType,
};
use kiln_harness::mock::{CallRecord, Reply, ScriptedProvider};

use common::{start, tasks_of, test_config, wait_for_terminal, ALL_PROVIDERS, FRONTEND_APP};

const VOTE_PROMPT: &str = "incident vote";

fn voting_config() -> EngineConfig {
    let mut config = test_config();
    config.consensus.enabled = true;
    config.consensus.timeout_secs = 1;
    config
}

fn vote_calls(mock: &ScriptedProvider) -> Vec<CallRecord> {
    mock.calls()
        .into_iter()
        .filter(|c| c.prompt.contains(VOTE_PROMPT))
        .collect()
}

// ===========================================================================
// Majority decisions
// ===========================================================================

#[tokio::test]
async fn majority_spawn_solver_skips_retries() {
    let mock = Arc::new(
        ScriptedProvider::new(ALL_PROVIDERS)
            .on_prompt(
                VOTE_PROMPT,
                vec![Reply::text("VOTE: spawn_solver\nRATIONALE: the backend agent is stuck")],
            )
            .on_role(AgentRole::Backend, vec![Reply::api_error("upstream exploded")])
            .on_role(AgentRole::Frontend, vec![Reply::text(FRONTEND_APP)]),
    );
    let manager = start(voting_config(), &mock);
    let build = manager.create_build(1, BuildRequest::new("A notes app")).await.unwrap();
    manager.start_build(build.id).await.unwrap();

    let done = wait_for_terminal(&manager, build.id).await;
    assert_eq!(done.status, BuildStatus::Completed, "error: {:?}", done.error);

    // The first failure is voted on, so the backend is never retried.
    assert_eq!(mock.calls_for_role(AgentRole::Backend).len(), 1);
    let votes = vote_calls(&mock);
    assert_eq!(votes.len(), 3);
    assert!(votes
        .iter()
        .all(|c| c.system_prompt.as_deref().is_some_and(|s| s.contains("incident commander"))));

    let api = tasks_of(&done, TaskType::GenerateApi)[0];
    assert_eq!(api.status, TaskStatus::Cancelled);
    assert_eq!(api.retry_count, 1);
    assert_eq!(
        api.input.consensus_decision.as_deref(),
        Some("spawn_solver (claude=spawn_solver, gpt4=spawn_solver, gemini=spawn_solver)")
    );

    let recovery = done.task(api.input.superseded_by.unwrap()).unwrap();
    assert_eq!(recovery.status, TaskStatus::Completed);
    assert_eq!(done.agents[&recovery.assigned_to.unwrap()].role, AgentRole::Solver);
}

#[tokio::test]
async fn timed_out_voter_counts_for_fallback() {
    let mock = Arc::new(
        ScriptedProvider::new(ALL_PROVIDERS)
            .on_prompt_to(
                Provider::Claude,
                VOTE_PROMPT,
                vec![Reply::text("VOTE: abort\nRATIONALE: give up")],
            )
            .on_prompt_to(
                Provider::Gpt4,
                VOTE_PROMPT,
                vec![Reply::text("VOTE: retry_same\nRATIONALE: looks transient")],
            )
            .on_prompt_to(Provider::Gemini, VOTE_PROMPT, vec![Reply::Hang])
            .on_role(
                AgentRole::Backend,
                vec![Reply::api_error("upstream exploded"), Reply::text("ok")],
            )
            .on_role(AgentRole::Frontend, vec![Reply::text(FRONTEND_APP)]),
    );
    let manager = start(voting_config(), &mock);
    let build = manager.create_build(1, BuildRequest::new("A notes app")).await.unwrap();
    manager.start_build(build.id).await.unwrap();

    let done = wait_for_terminal(&manager, build.id).await;
    assert_eq!(done.status, BuildStatus::Completed, "error: {:?}", done.error);

    // Gemini never answers, so its vote is the classifier's retry_same.
    let api = tasks_of(&done, TaskType::GenerateApi)[0];
    assert_eq!(api.status, TaskStatus::Completed);
    assert_eq!(api.retry_count, 1);
    assert_eq!(
        api.input.consensus_decision.as_deref(),
        Some("retry_same (claude=abort, gpt4=retry_same, gemini=retry_same)")
    );
    assert_eq!(mock.calls_for_role(AgentRole::Backend).len(), 2);
    assert!(done
        .tasks
        .iter()
        .all(|t| t.input.action != Some(TaskAction::SolveBuildFailure)));
}

// ===========================================================================
// Non-retriable failures
// ===========================================================================

#[tokio::test]
async fn vote_cannot_retry_non_retriable_error() {
    let mock = Arc::new(
        ScriptedProvider::new(ALL_PROVIDERS)
            .on_prompt(
                VOTE_PROMPT,
                vec![Reply::text("VOTE: retry_same\nRATIONALE: try again")],
            )
            .on_role(AgentRole::Lead, vec![Reply::api_error("Invalid API key provided")]),
    );
    let manager = start(voting_config(), &mock);
    let build = manager.create_build(1, BuildRequest::new("app")).await.unwrap();
    manager.start_build(build.id).await.unwrap();

    let failed = wait_for_terminal(&manager, build.id).await;
    assert_eq!(failed.status, BuildStatus::Failed);
    let error = failed.error.clone().unwrap();
    assert!(error.starts_with("Task failed due to a non-retriable provider error"), "{error}");

    assert_eq!(mock.calls_for_role(AgentRole::Lead).len(), 1);
    assert_eq!(vote_calls(&mock).len(), 3);
    let plan = tasks_of(&failed, TaskType::Plan)[0];
    assert_eq!(plan.status, TaskStatus::Failed);
    assert_eq!(
        plan.input.consensus_decision.as_deref(),
        Some("abort (claude=retry_same, gpt4=retry_same, gemini=retry_same)")
    );
}

#[tokio::test]
async fn credit_exhaustion_is_not_voted_on() {
    let mock = Arc::new(ScriptedProvider::new(ALL_PROVIDERS).on_role(
        AgentRole::Lead,
        vec![Reply::api_error("402 Payment Required: insufficient credits")],
    ));
    let manager = start(voting_config(), &mock);
    let build = manager.create_build(1, BuildRequest::new("app")).await.unwrap();
    manager.start_build(build.id).await.unwrap();

    let failed = wait_for_terminal(&manager, build.id).await;
    assert_eq!(failed.status, BuildStatus::Failed);
    assert!(vote_calls(&mock).is_empty());
    assert!(tasks_of(&failed, TaskType::Plan)[0].input.consensus_decision.is_none());
}
