//! Result handling: success follow-ups, failure recovery and the completion
//! gate.
//!
//! Every handler re-validates the build, the agent and the task under the
//! build lock before acting, so late or duplicate results have no effect.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kiln_bridge::protocol::EventType;
use kiln_core::types::{
    AgentRole, AgentStatus, Build, BuildStatus, ProviderMode, RetryStrategy, Task, TaskAction,
    TaskInput, TaskOutput, TaskStatus, TaskType,
};
use kiln_harness::provider::{GenerateOptions, ProviderScope};

use crate::classifier::{
    classify, is_insufficient_credits, strategy_to_decision, Classification, RecoveryDecision,
};
use crate::consensus::{self, Incident};
use crate::dispatcher::{QueuedTask, TaskFailure, TaskResult};
use crate::manager::{scope_for, BuildHandle, ManagerInner};
use crate::output::collect_build_files;
use crate::readiness::{merge_problems, readiness_error_class, repair_hints, validate_readiness};
use crate::roles::RECOVERY_PRIORITY;
use crate::state_machine::{advance, advance_to_phase, BuildTransition};
use crate::verify::verify_generated_code;

const RETRY_GUIDANCE: &str = "Previous attempt failed. Analyze the error and try a different approach.";
const VERIFICATION_GUIDANCE: &str =
    "Previous code failed build verification. Fix the following errors:";

const TEST_FAILURE_KEYWORDS: [&str; 4] = ["fail", "error", "assertion", "expected"];
const CRITICAL_REVIEW_KEYWORDS: [&str; 5] = [
    "critical",
    "security vulnerability",
    "injection",
    "xss",
    "authentication bypass",
];

/// Whether a result for `task_id` from `agent_id` may still change the build.
fn accepts_result(build: &Build, task_id: Uuid, agent_id: Uuid) -> bool {
    if !build.is_active() {
        debug!(build_id = %build.id, task_id = %task_id, "dropping result for inactive build");
        return false;
    }
    let Some(agent) = build.agents.get(&agent_id) else {
        warn!(build_id = %build.id, agent_id = %agent_id, "dropping result from unknown agent");
        return false;
    };
    if agent.current_task != Some(task_id) {
        warn!(
            build_id = %build.id,
            task_id = %task_id,
            agent_id = %agent_id,
            "dropping stale result"
        );
        return false;
    }
    match build.task(task_id) {
        Some(task) if !task.status.is_terminal() => true,
        _ => {
            debug!(task_id = %task_id, "dropping result for terminal or unknown task");
            false
        }
    }
}

fn mentions_any(messages: &[String], keywords: &[&str]) -> bool {
    messages.iter().any(|m| {
        let lower = m.to_lowercase();
        keywords.iter().any(|k| lower.contains(k))
    })
}

/// Follow-up task created by a completion handler.
struct FollowUp {
    action: TaskAction,
    task_type: TaskType,
    priority: u8,
    description: String,
    findings: Vec<String>,
    trigger: Uuid,
    agents: &'static [AgentRole],
}

impl FollowUp {
    fn fix_tests(build: &Build, trigger: Uuid, findings: Vec<String>) -> Self {
        Self {
            action: TaskAction::FixTests,
            task_type: TaskType::Fix,
            priority: 85,
            description: format!("Fix failing tests for: {}", build.description),
            findings,
            trigger,
            agents: &[AgentRole::Solver, AgentRole::Backend, AgentRole::Frontend, AgentRole::Testing],
        }
    }

    fn fix_review(build: &Build, trigger: Uuid, findings: Vec<String>) -> Self {
        Self {
            action: TaskAction::FixReviewIssues,
            task_type: TaskType::Fix,
            priority: 95,
            description: format!("Resolve critical review findings for: {}", build.description),
            findings,
            trigger,
            agents: &[AgentRole::Solver, AgentRole::Backend, AgentRole::Frontend, AgentRole::Reviewer],
        }
    }

    fn regression_test(build: &Build, trigger: Uuid) -> Self {
        Self {
            action: TaskAction::RegressionTest,
            task_type: TaskType::Test,
            priority: 88,
            description: format!("Re-run tests after fixes for: {}", build.description),
            findings: Vec::new(),
            trigger,
            agents: &[AgentRole::Testing, AgentRole::Solver, AgentRole::Backend],
        }
    }

    fn post_fix_review(build: &Build, trigger: Uuid) -> Self {
        Self {
            action: TaskAction::PostFixReview,
            task_type: TaskType::Review,
            priority: 87,
            description: format!("Review the applied fixes for: {}", build.description),
            findings: Vec::new(),
            trigger,
            agents: &[AgentRole::Reviewer, AgentRole::Solver, AgentRole::Lead],
        }
    }
}

/// What to do with a failure once the vote (if any) is in.
struct FailureContext {
    error: String,
    classification: Classification,
    fallback: RecoveryDecision,
    incident: Option<Incident>,
    scope: ProviderScope,
    user_id: u64,
    use_platform_keys: bool,
}

impl ManagerInner {
    pub(crate) async fn process_result(self: &Arc<Self>, result: TaskResult) {
        let TaskResult {
            build_id,
            task_id,
            agent_id,
            outcome,
        } = result;
        match outcome {
            Ok(output) => self.handle_success(build_id, task_id, agent_id, output).await,
            Err(TaskFailure::Cancelled) => {
                debug!(build_id = %build_id, task_id = %task_id, "execution cancelled");
            }
            Err(failure) => self.handle_failure(build_id, task_id, agent_id, failure).await,
        }
    }

    // -- success ----------------------------------------------------------------

    async fn handle_success(
        self: &Arc<Self>,
        build_id: Uuid,
        task_id: Uuid,
        agent_id: Uuid,
        output: TaskOutput,
    ) {
        let Some(handle) = self.handle(build_id).await else {
            warn!(build_id = %build_id, "result for unknown build");
            return;
        };

        let mut submits = Vec::new();
        let mut start_pipeline = false;
        {
            let mut build = handle.build.lock().await;
            if !accepts_result(&build, task_id, agent_id) {
                return;
            }
            let Some(task_type) = build.task(task_id).map(|t| t.task_type) else {
                return;
            };

            if task_type.is_code_generation() {
                let problems = verify_generated_code(&output);
                if !problems.is_empty() {
                    match self.verification_failed_locked(&mut build, task_id, agent_id, &problems) {
                        Some(item) => {
                            drop(build);
                            self.submit_all(vec![item]).await;
                        }
                        None => {
                            drop(build);
                            let reason = format!(
                                "build verification failed after repeated attempts: {}",
                                problems.join("; ")
                            );
                            self.escalate(&handle, build_id, task_id, agent_id, reason, problems)
                                .await;
                        }
                    }
                    return;
                }
            }

            let (action, retry_count) = match build.task_mut(task_id) {
                Some(task) => {
                    task.output = Some(output.clone());
                    task.error = None;
                    task.finish(TaskStatus::Completed);
                    (task.input.action, task.retry_count)
                }
                None => return,
            };
            if let Some(agent) = build.agents.get_mut(&agent_id) {
                agent.output.push(format!(
                    "{task_type}: {} files, {} messages",
                    output.files.len(),
                    output.messages.len()
                ));
                agent.error = None;
            }
            build.touch();
            self.emit(
                EventType::AgentCompleted,
                build_id,
                Some(agent_id),
                json!({
                    "task_id": task_id,
                    "task_type": task_type.to_string(),
                    "files": output.files.len(),
                    "attempts": retry_count + 1,
                }),
            );
            info!(build_id = %build_id, task_id = %task_id, task_type = %task_type, "task completed");
            submits.extend(self.release_agent_locked(&mut build, agent_id, AgentStatus::Completed));

            match task_type {
                TaskType::Plan if build.status == BuildStatus::Planning => {
                    build.raise_progress(20);
                    self.checkpoint_locked(&mut build, "Planning Complete", "Build plan drafted");
                    start_pipeline = true;
                }
                TaskType::Review => {
                    if build.readiness_recovery_attempts == 0
                        && mentions_any(&output.messages, &CRITICAL_REVIEW_KEYWORDS)
                    {
                        let follow = FollowUp::fix_review(&build, task_id, output.messages.clone());
                        submits.extend(self.queue_follow_up_locked(&mut build, follow));
                    }
                }
                TaskType::Test => {
                    if mentions_any(&output.messages, &TEST_FAILURE_KEYWORDS) {
                        let follow = FollowUp::fix_tests(&build, task_id, output.messages.clone());
                        submits.extend(self.queue_follow_up_locked(&mut build, follow));
                    }
                }
                TaskType::Fix if action.is_some_and(|a| a.is_fix_loop()) => {
                    let test = FollowUp::regression_test(&build, task_id);
                    submits.extend(self.queue_follow_up_locked(&mut build, test));
                    let review = FollowUp::post_fix_review(&build, task_id);
                    submits.extend(self.queue_follow_up_locked(&mut build, review));
                }
                _ => {}
            }

            if task_type.is_code_generation() {
                for file in &output.files {
                    self.emit(
                        EventType::FileCreated,
                        build_id,
                        Some(agent_id),
                        json!({
                            "task_id": task_id,
                            "path": file.path,
                            "language": file.language,
                            "size": file.size,
                        }),
                    );
                }
            }
            self.update_progress_locked(&mut build);
        }

        self.submit_all(submits).await;
        if start_pipeline {
            self.spawn_pipeline(Arc::clone(&handle), build_id);
        }
        self.persist(&handle).await;
        self.check_build_completion(build_id).await;
    }

    /// Record a verification failure. Returns the resubmission when retries
    /// remain, `None` when the task must escalate.
    fn verification_failed_locked(
        &self,
        build: &mut Build,
        task_id: Uuid,
        agent_id: Uuid,
        problems: &[String],
    ) -> Option<QueuedTask> {
        let cap = self.config.recovery.max_error_history;
        let build_id = build.id;
        let task = build.task_mut(task_id)?;
        let summary = format!("Build verification failed: {}", problems.join("; "));
        task.record_attempt(summary.clone(), "verification", cap);
        if task.retry_count >= task.max_retries {
            task.error = Some(format!(
                "build verification failed after {} attempts: {}",
                task.retry_count + 1,
                problems.join("; ")
            ));
            return None;
        }

        task.retry_count += 1;
        task.status = TaskStatus::Pending;
        task.error = Some(summary);
        task.retry_strategy = RetryStrategy::FixAndRetry;
        task.input.retry_strategy = Some(RetryStrategy::FixAndRetry);
        task.input.verification_errors = problems.to_vec();
        task.input.previous_errors = task.error_history.clone();
        task.input.retry_guidance = Some(VERIFICATION_GUIDANCE.to_string());
        let retry_count = task.retry_count;
        build.touch();

        self.emit(
            EventType::AgentVerificationFailed,
            build_id,
            Some(agent_id),
            json!({
                "task_id": task_id,
                "errors": problems,
                "retry_count": retry_count,
            }),
        );
        warn!(build_id = %build_id, task_id = %task_id, problems = problems.len(), retry_count, "verification failed, retrying");
        Some(QueuedTask { build_id, task_id })
    }

    // -- failure ----------------------------------------------------------------

    async fn handle_failure(
        self: &Arc<Self>,
        build_id: Uuid,
        task_id: Uuid,
        agent_id: Uuid,
        failure: TaskFailure,
    ) {
        let Some(handle) = self.handle(build_id).await else {
            warn!(build_id = %build_id, "failure for unknown build");
            return;
        };
        let error = failure.to_string();

        let ctx = {
            let mut build = handle.build.lock().await;
            if !accepts_result(&build, task_id, agent_id) {
                return;
            }
            let classification = classify(&error);
            let cap = self.config.recovery.max_error_history;
            let scope = scope_for(&build);
            let user_id = build.user_id;
            let use_platform_keys = build.provider_mode == ProviderMode::Platform;
            let app_description = build.description.clone();
            let role = build
                .agents
                .get(&agent_id)
                .map(|a| a.role)
                .unwrap_or(AgentRole::Lead);
            let Some(task) = build.task_mut(task_id) else {
                return;
            };
            task.record_attempt(error.clone(), classification.strategy.to_string(), cap);
            task.error = Some(error.clone());
            task.retry_count += 1;

            // Counted after the increment, so every failed attempt is voted
            // on unless the account is out of credits.
            let should_vote = self.config.consensus.enabled && !is_insufficient_credits(&error);
            let incident = should_vote.then(|| Incident {
                app_description,
                task_type: task.task_type,
                task_description: task.description.clone(),
                role,
                error: error.clone(),
                default_strategy: classification.strategy,
            });
            warn!(
                build_id = %build_id,
                task_id = %task_id,
                agent_id = %agent_id,
                category = %classification.category,
                strategy = %classification.strategy,
                retry_count = task.retry_count,
                error = %error,
                "task attempt failed"
            );
            build.touch();

            FailureContext {
                error,
                classification,
                fallback: strategy_to_decision(classification.strategy),
                incident,
                scope,
                user_id,
                use_platform_keys,
            }
        };

        let (decision, vote_summary) = self.decide(&ctx, build_id).await;

        let mut submits = Vec::new();
        let escalate = {
            let mut build = handle.build.lock().await;
            if !accepts_result(&build, task_id, agent_id) {
                return;
            }
            if let Some(task) = build.task_mut(task_id) {
                if vote_summary.is_some() {
                    task.input.consensus_decision = vote_summary.clone();
                }
            }
            match decision {
                RecoveryDecision::Abort => {
                    if let Some(task) = build.task_mut(task_id) {
                        task.finish(TaskStatus::Failed);
                    }
                    self.mark_agent_error_locked(&mut build, agent_id, &ctx.error);
                    let message = if ctx.classification.is_non_retriable() {
                        format!("Task failed due to a non-retriable provider error: {}", ctx.error)
                    } else {
                        format!("Task failed after incident vote chose abort: {}", ctx.error)
                    };
                    self.fail_locked(&mut build, &handle.cancel, message, "Build Failed");
                    self.release_agent_locked(&mut build, agent_id, AgentStatus::Error);
                    false
                }
                RecoveryDecision::SpawnSolver => true,
                RecoveryDecision::RetrySame | RecoveryDecision::SwitchProvider => {
                    match build.task_mut(task_id) {
                        Some(task) if task.retry_count <= task.max_retries => {
                            let strategy = if decision == RecoveryDecision::SwitchProvider {
                                RetryStrategy::SwitchProvider
                            } else if ctx.classification.strategy == RetryStrategy::NonRetriable {
                                RetryStrategy::StandardRetry
                            } else {
                                ctx.classification.strategy
                            };
                            task.status = TaskStatus::Pending;
                            task.retry_strategy = strategy;
                            task.input.retry_strategy = Some(strategy);
                            task.input.previous_errors = task.error_history.clone();
                            task.input.retry_guidance = Some(RETRY_GUIDANCE.to_string());
                            let (retry_count, max_retries) = (task.retry_count, task.max_retries);
                            self.emit(
                                EventType::AgentRetrying,
                                build_id,
                                Some(agent_id),
                                json!({
                                    "task_id": task_id,
                                    "retry_count": retry_count,
                                    "max_retries": max_retries,
                                    "strategy": strategy.to_string(),
                                    "error": ctx.error,
                                }),
                            );
                            info!(build_id = %build_id, task_id = %task_id, retry_count, strategy = %strategy, "retrying task");
                            submits.push(QueuedTask { build_id, task_id });
                            false
                        }
                        _ => true,
                    }
                }
            }
        };

        if escalate {
            self.escalate(&handle, build_id, task_id, agent_id, ctx.error, Vec::new())
                .await;
            return;
        }
        self.submit_all(submits).await;
        self.persist(&handle).await;
        self.check_build_completion(build_id).await;
    }

    /// Consensus decision when a vote is due, else the classifier's mapping.
    /// The second value summarises the votes.
    async fn decide(&self, ctx: &FailureContext, build_id: Uuid) -> (RecoveryDecision, Option<String>) {
        let Some(incident) = &ctx.incident else {
            return (consensus::finalize(ctx.fallback, &ctx.classification), None);
        };

        let available = self.provider.available_providers(&ctx.scope).await;
        let voter_set = consensus::voters(&available);
        if voter_set.len() < consensus::MIN_VOTERS {
            return (consensus::finalize(ctx.fallback, &ctx.classification), None);
        }
        self.emit(
            EventType::BuildProgress,
            build_id,
            None,
            json!({
                "phase": "incident_consensus",
                "voters": voter_set.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
                "error": ctx.error,
            }),
        );
        self.emit(
            EventType::BuildPhase,
            build_id,
            None,
            json!({ "phase": "Incident Consensus" }),
        );

        let options = GenerateOptions::new(ctx.user_id)
            .with_platform_keys(ctx.use_platform_keys);
        let outcome = consensus::run_vote(
            Arc::clone(&self.provider),
            voter_set,
            incident,
            ctx.fallback,
            &self.config.consensus,
            options,
        )
        .await;
        match outcome {
            Some(outcome) => {
                let decision = consensus::finalize(outcome.decision, &ctx.classification);
                info!(build_id = %build_id, decision = %decision, votes = %outcome.summary(), "incident vote decided");
                (decision, Some(format!("{decision} ({})", outcome.summary())))
            }
            None => (consensus::finalize(ctx.fallback, &ctx.classification), None),
        }
    }

    // -- recovery tasks -----------------------------------------------------------

    /// Hand a task that cannot be retried to a recovery agent. A failed
    /// recovery task is never escalated again.
    async fn escalate(
        self: &Arc<Self>,
        handle: &Arc<BuildHandle>,
        build_id: Uuid,
        task_id: Uuid,
        agent_id: Uuid,
        reason: String,
        validation_errors: Vec<String>,
    ) {
        let is_recovery = {
            let build = handle.build.lock().await;
            if !accepts_result(&build, task_id, agent_id) {
                return;
            }
            build
                .task(task_id)
                .is_some_and(|t| t.input.action == Some(TaskAction::SolveBuildFailure))
        };

        let solver = if is_recovery {
            None
        } else {
            self.ensure_solver(handle, build_id, Some(agent_id)).await
        };

        let mut submits = Vec::new();
        {
            let mut build = handle.build.lock().await;
            if !accepts_result(&build, task_id, agent_id) {
                return;
            }
            match solver.filter(|id| build.agents.contains_key(id)) {
                Some(solver_id) => {
                    let Some(failed) = build.task(task_id).cloned() else {
                        return;
                    };
                    let input = TaskInput {
                        app_description: build.description.clone(),
                        tech_stack: build.tech_stack.clone(),
                        action: Some(TaskAction::SolveBuildFailure),
                        failed_task_id: Some(failed.id),
                        failed_task_type: Some(failed.task_type),
                        failed_task_description: Some(failed.description.clone()),
                        failure_error: Some(reason.clone()),
                        repair_hints: repair_hints(&validation_errors),
                        validation_errors,
                        trigger_task: Some(failed.id),
                        ..TaskInput::default()
                    };
                    let recovery = Task::new(
                        build_id,
                        TaskType::Fix,
                        format!("Resolve the failure of \"{}\"", failed.description),
                        RECOVERY_PRIORITY,
                        build.max_retries,
                    )
                    .with_input(input);
                    let recovery_id = recovery.id;

                    if let Some(task) = build.task_mut(task_id) {
                        task.input.superseded_by = Some(recovery_id);
                        task.input.recovery_queued = true;
                        task.finish(TaskStatus::Cancelled);
                    }
                    submits.extend(self.release_agent_locked(&mut build, agent_id, AgentStatus::Idle));
                    build.tasks.push(recovery);
                    self.emit_task_created(&build, recovery_id);
                    submits.extend(self.assign_locked(&mut build, recovery_id, solver_id));
                    build.touch();
                    info!(
                        build_id = %build_id,
                        failed_task = %task_id,
                        recovery_task = %recovery_id,
                        solver = %solver_id,
                        "recovery task queued"
                    );
                }
                None => {
                    if let Some(task) = build.task_mut(task_id) {
                        task.error = Some(reason.clone());
                        task.finish(TaskStatus::Failed);
                    }
                    if let Some(agent) = build.agents.get_mut(&agent_id) {
                        agent.error = Some(reason.clone());
                    }
                    submits.extend(self.release_agent_locked(&mut build, agent_id, AgentStatus::Idle));
                    warn!(build_id = %build_id, task_id = %task_id, error = %reason, "task failed without recovery");
                }
            }
            self.update_progress_locked(&mut build);
        }

        self.submit_all(submits).await;
        self.persist(handle).await;
        self.check_build_completion(build_id).await;
    }

    /// Create a fix-loop follow-up unless a loop cap or the duplicate guard
    /// blocks it.
    fn queue_follow_up_locked(&self, build: &mut Build, follow: FollowUp) -> Vec<QueuedTask> {
        let settings = &self.config.recovery;
        let count = |action: TaskAction| {
            build
                .tasks
                .iter()
                .filter(|t| t.input.action == Some(action))
                .count() as u32
        };
        let over = |used: u32, cap: u32| cap > 0 && used >= cap;
        let tests = count(TaskAction::FixTests);
        let reviews = count(TaskAction::FixReviewIssues);
        let cap_hit = match follow.action {
            TaskAction::FixTests => {
                over(tests, settings.max_test_fix_loops) || over(tests + reviews, settings.max_fix_loops)
            }
            TaskAction::FixReviewIssues => {
                over(reviews, settings.max_review_fix_loops)
                    || over(tests + reviews, settings.max_fix_loops)
            }
            _ => false,
        };
        if cap_hit {
            info!(build_id = %build.id, action = %follow.action, "fix loop cap reached");
            return self.cancel_fix_loop_locked(build);
        }

        let cooldown = chrono::Duration::from_std(settings.duplicate_cooldown())
            .unwrap_or_else(|_| chrono::Duration::seconds(20));
        let now = Utc::now();
        let duplicate = build.tasks.iter().any(|t| {
            t.input.action == Some(follow.action)
                && (matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress)
                    || now - t.created_at < cooldown)
        });
        if duplicate {
            debug!(build_id = %build.id, action = %follow.action, "skipping duplicate follow-up");
            return Vec::new();
        }

        let Some(agent_id) = follow.agents.iter().find_map(|role| {
            build
                .agents
                .values()
                .filter(|a| a.role == *role && a.status.is_available())
                .min_by_key(|a| a.created_at)
                .map(|a| a.id)
        }) else {
            debug!(build_id = %build.id, action = %follow.action, "no agent for follow-up");
            return Vec::new();
        };

        let input = TaskInput {
            app_description: build.description.clone(),
            tech_stack: build.tech_stack.clone(),
            action: Some(follow.action),
            findings: follow.findings,
            trigger_task: Some(follow.trigger),
            ..TaskInput::default()
        };
        let task = Task::new(
            build.id,
            follow.task_type,
            follow.description,
            follow.priority,
            build.max_retries,
        )
        .with_input(input);
        let task_id = task.id;
        build.tasks.push(task);
        self.emit_task_created(build, task_id);
        info!(build_id = %build.id, task_id = %task_id, action = %follow.action, "follow-up task queued");
        self.assign_locked(build, task_id, agent_id).into_iter().collect()
    }

    /// Cancel every open fix-loop task and free the agents holding them.
    fn cancel_fix_loop_locked(&self, build: &mut Build) -> Vec<QueuedTask> {
        let mut holders = Vec::new();
        for task in build.tasks.iter_mut() {
            let in_loop = task.input.action.is_some_and(|a| a.is_fix_loop());
            if in_loop && task.finish(TaskStatus::Cancelled) {
                holders.extend(task.assigned_to);
            }
        }
        let mut submits = Vec::new();
        for agent_id in holders {
            let holds_cancelled = build
                .agents
                .get(&agent_id)
                .and_then(|a| a.current_task)
                .and_then(|id| build.task(id))
                .is_some_and(|t| t.status == TaskStatus::Cancelled);
            if holds_cancelled {
                submits.extend(self.release_agent_locked(build, agent_id, AgentStatus::Idle));
            }
        }
        submits
    }

    // -- completion ---------------------------------------------------------------

    /// Decide whether a build whose tasks have all settled is complete, needs
    /// one readiness recovery pass, or has failed.
    pub(crate) async fn check_build_completion(self: &Arc<Self>, build_id: Uuid) {
        let Some(handle) = self.handle(build_id).await else {
            return;
        };
        let _gate = handle.completion_gate.lock().await;

        let (files, deep) = {
            let mut build = handle.build.lock().await;
            if !build.is_active() || !build.all_tasks_terminal() {
                return;
            }
            let evaluable = build.phased_pipeline_complete
                || build.readiness_recovery_attempts > 0
                || build.status == BuildStatus::Reviewing;
            if !evaluable {
                return;
            }

            let last_failed = build
                .tasks
                .iter()
                .rev()
                .find(|t| t.status == TaskStatus::Failed)
                .map(|t| {
                    t.error
                        .clone()
                        .or_else(|| t.error_history.last().map(|a| a.error.clone()))
                        .unwrap_or_else(|| "One or more tasks failed before build completion.".to_string())
                });
            if let Some(message) = last_failed {
                let failed = self.fail_locked(&mut build, &handle.cancel, message, "Build Failed");
                drop(build);
                if failed {
                    self.persist(&handle).await;
                }
                return;
            }
            (
                collect_build_files(&build),
                build.require_preview_ready || self.config.readiness.require_preview_default,
            )
        };

        let mut problems = validate_readiness(&files);
        if deep {
            merge_problems(&mut problems, self.preview.verify(&files).await);
        }

        let mut submits = Vec::new();
        {
            let mut build = handle.build.lock().await;
            if !build.is_active() || !build.all_tasks_terminal() {
                return;
            }

            if problems.is_empty() {
                if build.status == BuildStatus::Planning {
                    if let Err(err) = advance(&mut build, BuildTransition::Start) {
                        warn!(build_id = %build_id, error = %err, "start before completion rejected");
                    }
                }
                if let Err(err) = advance(&mut build, BuildTransition::Complete) {
                    warn!(build_id = %build_id, error = %err, "completion rejected");
                    return;
                }
                build.raise_progress(100);
                self.checkpoint_locked(&mut build, "Build Complete", "All phases finished and output validated");
                self.emit(
                    EventType::BuildCompleted,
                    build_id,
                    None,
                    json!({
                        "status": build.status.to_string(),
                        "progress": build.progress,
                        "files": files.len(),
                    }),
                );
                info!(build_id = %build_id, files = files.len(), "build completed");
                handle.cancel.cancel();
            } else {
                let class = readiness_error_class(&problems);
                let joined = problems.join("; ");
                if build.readiness_recovery_attempts > 0
                    && build.readiness_error_class.as_deref() == Some(class.as_str())
                {
                    self.fail_locked(
                        &mut build,
                        &handle.cancel,
                        format!("Final output validation failed after repeated recovery ({class}): {joined}"),
                        "Build Failed",
                    );
                } else if build.readiness_recovery_attempts < 1 {
                    build.readiness_recovery_attempts += 1;
                    build.readiness_error_class = Some(class.clone());
                    build.readiness_errors = problems.clone();
                    if build.status == BuildStatus::Planning {
                        if let Err(err) = advance(&mut build, BuildTransition::Start) {
                            warn!(build_id = %build_id, error = %err, "start before readiness recovery rejected");
                        }
                    }
                    if let Err(err) = advance_to_phase(&mut build, BuildStatus::Reviewing) {
                        warn!(build_id = %build_id, error = %err, "readiness recovery status rejected");
                    }
                    build.raise_progress(95);
                    self.emit(
                        EventType::BuildProgress,
                        build_id,
                        None,
                        json!({
                            "phase": "readiness_recovery",
                            "progress": build.progress,
                            "error_class": class,
                            "errors": problems,
                        }),
                    );
                    warn!(build_id = %build_id, class = %class, problems = problems.len(), "readiness recovery started");
                    drop(build);

                    let solver = self.ensure_solver(&handle, build_id, None).await;
                    let mut build = handle.build.lock().await;
                    if !build.is_active() {
                        return;
                    }
                    match solver.filter(|id| build.agents.contains_key(id)) {
                        Some(solver_id) => {
                            let input = TaskInput {
                                app_description: build.description.clone(),
                                tech_stack: build.tech_stack.clone(),
                                action: Some(TaskAction::SolveBuildFailure),
                                failure_error: Some(joined.clone()),
                                repair_hints: repair_hints(&problems),
                                validation_errors: problems.clone(),
                                ..TaskInput::default()
                            };
                            let task = Task::new(
                                build_id,
                                TaskType::Fix,
                                format!("Resolve final output validation failures for: {}", build.description),
                                RECOVERY_PRIORITY,
                                build.max_retries,
                            )
                            .with_input(input);
                            let task_id = task.id;
                            build.tasks.push(task);
                            self.emit_task_created(&build, task_id);
                            submits.extend(self.assign_locked(&mut build, task_id, solver_id));
                            build.touch();
                        }
                        None => {
                            self.fail_locked(
                                &mut build,
                                &handle.cancel,
                                format!("Final output validation failed and no recovery agent was available: {joined}"),
                                "Build Failed",
                            );
                        }
                    }
                } else {
                    self.fail_locked(
                        &mut build,
                        &handle.cancel,
                        format!("Final output validation failed after automated recovery: {joined}"),
                        "Build Failed",
                    );
                }
            }
        }

        self.submit_all(submits).await;
        self.persist(&handle).await;
    }
}
