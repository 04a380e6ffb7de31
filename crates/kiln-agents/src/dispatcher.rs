//! Task queue, dispatch loop and per-task executor.
//!
//! Work items travel over a bounded flume channel. The dispatch loop never
//! waits on a task: every item gets its own tokio task, and each executor
//! publishes exactly one [`TaskResult`] to the result queue. A single result
//! loop drains that queue so per-build decisions are applied one at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use kiln_bridge::protocol::EventType;
use kiln_core::config::temperature_for_role;
use kiln_core::types::{
    AgentRole, Build, PowerMode, Provider, ProviderMode, RetryStrategy, TaskOutput, TaskStatus,
    TaskType,
};
use kiln_harness::cancel::CancelToken;
use kiln_harness::provider::{GenerateOptions, ProviderError, ProviderScope};
use kiln_telemetry::logging::task_span;

use crate::classifier::is_truncation;
use crate::error::{EngineError, Result};
use crate::manager::{scope_for, BuildHandle, ManagerInner};
use crate::output::parse_task_output;
use crate::prompts;
use crate::roles;

// ---------------------------------------------------------------------------
// Queue items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueuedTask {
    pub build_id: Uuid,
    pub task_id: Uuid,
}

/// Why an execution produced no output. `Display` feeds the classifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskFailure {
    #[error("build not active")]
    BuildNotActive,
    #[error("build request budget exceeded")]
    BudgetExceeded,
    #[error("{0}")]
    Provider(String),
    #[error("empty response from provider")]
    EmptyResponse,
    #[error("task cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub build_id: Uuid,
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub outcome: std::result::Result<TaskOutput, TaskFailure>,
}

impl TaskResult {
    pub fn success(build_id: Uuid, task_id: Uuid, agent_id: Uuid, output: TaskOutput) -> Self {
        Self {
            build_id,
            task_id,
            agent_id,
            outcome: Ok(output),
        }
    }

    pub fn failure(build_id: Uuid, task_id: Uuid, agent_id: Uuid, failure: TaskFailure) -> Self {
        Self {
            build_id,
            task_id,
            agent_id,
            outcome: Err(failure),
        }
    }
}

/// Everything an executor needs once the build lock is released.
struct Job {
    build_id: Uuid,
    task_id: Uuid,
    agent_id: Uuid,
    user_id: u64,
    role: AgentRole,
    provider: Provider,
    task_type: TaskType,
    strategy: RetryStrategy,
    retry_count: u32,
    last_error: Option<String>,
    power_mode: PowerMode,
    max_tokens_cap: u32,
    use_platform_keys: bool,
    scope: ProviderScope,
    prompt: String,
    system_prompt: String,
}

enum Prepared {
    Drop,
    Rejected(TaskResult),
    Run(Box<Job>),
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

impl ManagerInner {
    pub(crate) async fn submit(&self, item: QueuedTask) -> Result<()> {
        self.task_tx
            .send_async(item)
            .await
            .map_err(|_| EngineError::QueueClosed)
    }

    /// Submit every item, logging the ones the closed queue refused.
    pub(crate) async fn submit_all(&self, items: Vec<QueuedTask>) {
        for item in items {
            if let Err(err) = self.submit(item).await {
                warn!(build_id = %item.build_id, task_id = %item.task_id, error = %err, "task submission failed");
            }
        }
    }

    pub(crate) async fn dispatch_loop(self: Arc<Self>, rx: flume::Receiver<QueuedTask>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                item = rx.recv_async() => match item {
                    Ok(item) => {
                        let inner = Arc::clone(&self);
                        tokio::spawn(async move { inner.execute(item).await });
                    }
                    Err(_) => break,
                },
            }
        }
        debug!("dispatch loop stopped");
    }

    pub(crate) async fn result_loop(self: Arc<Self>, rx: flume::Receiver<TaskResult>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = rx.recv_async() => match result {
                    Ok(result) => self.process_result(result).await,
                    Err(_) => break,
                },
            }
        }
        debug!("result loop stopped");
    }

    async fn send_result(&self, result: TaskResult) {
        if self.result_tx.send_async(result).await.is_err() {
            warn!("result queue closed, dropping task result");
        }
    }

    // -- execute ----------------------------------------------------------------

    async fn execute(self: Arc<Self>, item: QueuedTask) {
        let Some(handle) = self.handle(item.build_id).await else {
            warn!(build_id = %item.build_id, task_id = %item.task_id, "dropping task for unknown build");
            return;
        };

        let prepared = {
            let mut build = handle.build.lock().await;
            self.prepare_locked(&mut build, &handle.cancel, item.task_id)
        };
        let job = match prepared {
            Prepared::Drop => return,
            Prepared::Rejected(result) => {
                self.send_result(result).await;
                self.persist(&handle).await;
                return;
            }
            Prepared::Run(job) => job,
        };

        let span = task_span(job.build_id, job.task_id, &job.role.to_string());
        let outcome = self.run_job(&handle, &job).instrument(span).await;
        self.send_result(TaskResult {
            build_id: job.build_id,
            task_id: job.task_id,
            agent_id: job.agent_id,
            outcome,
        })
        .await;
    }

    /// Guardrails and prompt building, all before any network call.
    fn prepare_locked(&self, build: &mut Build, cancel: &CancelToken, task_id: Uuid) -> Prepared {
        let build_id = build.id;
        let Some(assigned) = build.task(task_id).map(|t| t.assigned_to) else {
            warn!(build_id = %build_id, task_id = %task_id, "dropping unknown task");
            return Prepared::Drop;
        };
        let Some(agent_id) = assigned else {
            warn!(build_id = %build_id, task_id = %task_id, "dropping unassigned task");
            return Prepared::Drop;
        };
        let Some(current) = build.agents.get(&agent_id).map(|a| a.current_task) else {
            warn!(build_id = %build_id, agent_id = %agent_id, "dropping task for unknown agent");
            return Prepared::Drop;
        };

        if !build.is_active() {
            if let Some(task) = build.task_mut(task_id) {
                task.max_retries = 0;
                task.finish(TaskStatus::Cancelled);
            }
            return Prepared::Rejected(TaskResult::failure(
                build_id,
                task_id,
                agent_id,
                TaskFailure::BuildNotActive,
            ));
        }
        if build.task(task_id).is_some_and(|t| t.status.is_terminal()) {
            debug!(task_id = %task_id, "skipping terminal task");
            return Prepared::Drop;
        }
        if current != Some(task_id) {
            debug!(task_id = %task_id, agent_id = %agent_id, "task is not the agent's current task");
            return Prepared::Drop;
        }

        if build.max_requests > 0 && build.requests_used >= build.max_requests {
            warn!(
                build_id = %build_id,
                requests_used = build.requests_used,
                max_requests = build.max_requests,
                "request budget exhausted"
            );
            self.fail_locked(
                build,
                cancel,
                "Build budget exceeded (request limit)",
                "Build Failed",
            );
            return Prepared::Rejected(TaskResult::failure(
                build_id,
                task_id,
                agent_id,
                TaskFailure::BudgetExceeded,
            ));
        }

        let (Some(task), Some(agent)) = (build.task(task_id), build.agents.get(&agent_id)) else {
            return Prepared::Drop;
        };
        let job = Job {
            build_id,
            task_id,
            agent_id,
            user_id: build.user_id,
            role: agent.role,
            provider: agent.provider,
            task_type: task.task_type,
            strategy: task.retry_strategy,
            retry_count: task.retry_count,
            last_error: task.error_history.last().map(|a| a.error.clone()),
            power_mode: build.power_mode,
            max_tokens_cap: build.max_tokens_per_request,
            use_platform_keys: build.provider_mode == ProviderMode::Platform,
            scope: scope_for(build),
            prompt: prompts::task_prompt(build, task, agent, self.config.recovery.error_context_chars),
            system_prompt: prompts::system_prompt(agent.role, build.tech_stack.as_ref()),
        };

        build.requests_used += 1;
        if let Some(task) = build.task_mut(task_id) {
            task.status = TaskStatus::InProgress;
            task.started_at = Some(Utc::now());
        }
        build.touch();
        Prepared::Run(Box::new(job))
    }

    async fn run_job(
        &self,
        handle: &BuildHandle,
        job: &Job,
    ) -> std::result::Result<TaskOutput, TaskFailure> {
        if job.strategy == RetryStrategy::Backoff && job.retry_count > 0 {
            let delay = Duration::from_millis(
                self.config
                    .recovery
                    .backoff_step_ms
                    .saturating_mul(u64::from(job.retry_count)),
            );
            debug!(delay_ms = delay.as_millis() as u64, "backing off before retry");
            tokio::select! {
                _ = handle.cancel.cancelled() => return Err(TaskFailure::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut provider = job.provider;
        if job.strategy == RetryStrategy::SwitchProvider {
            let available = self.provider.available_providers(&job.scope).await;
            if let Some(next) = roles::next_provider(provider, &available) {
                let mut build = handle.build.lock().await;
                let model = next.model_for(build.power_mode).to_string();
                if let Some(agent) = build.agents.get_mut(&job.agent_id) {
                    agent.provider = next;
                    agent.model = model.clone();
                    agent.updated_at = Utc::now();
                }
                self.emit(
                    EventType::AgentProviderSwitched,
                    job.build_id,
                    Some(job.agent_id),
                    json!({
                        "task_id": job.task_id,
                        "from": provider.to_string(),
                        "to": next.to_string(),
                        "model": model,
                    }),
                );
                info!(agent_id = %job.agent_id, from = %provider, to = %next, "switched provider");
                provider = next;
            }
        }

        let mut max_tokens = self.config.tokens.for_role(job.role, job.power_mode);
        if job.last_error.as_deref().is_some_and(is_truncation) {
            max_tokens = max_tokens.saturating_mul(3) / 2;
        }
        if job.max_tokens_cap > 0 {
            max_tokens = max_tokens.min(job.max_tokens_cap);
        }
        if job.strategy == RetryStrategy::ReduceContext {
            max_tokens = max_tokens.saturating_mul(3) / 4;
        }

        let options = GenerateOptions::new(job.user_id)
            .with_max_tokens(max_tokens)
            .with_temperature(temperature_for_role(job.role))
            .with_system_prompt(job.system_prompt.clone())
            .with_power_mode(job.power_mode)
            .with_platform_keys(job.use_platform_keys);

        self.emit(
            EventType::AgentThinking,
            job.build_id,
            Some(job.agent_id),
            json!({ "task_id": job.task_id, "role": job.role.to_string(), "provider": provider.to_string() }),
        );
        self.emit(
            EventType::AgentGenerating,
            job.build_id,
            Some(job.agent_id),
            json!({ "task_id": job.task_id, "max_tokens": max_tokens, "strategy": job.strategy.to_string() }),
        );
        debug!(provider = %provider, max_tokens, strategy = %job.strategy, "calling provider");

        let limit = self.config.timeouts.task_execution();
        let reply = tokio::select! {
            _ = handle.cancel.cancelled() => return Err(TaskFailure::Cancelled),
            reply = tokio::time::timeout(limit, self.provider.generate(provider, &job.prompt, &options)) => reply,
        };
        let failure = match reply {
            Ok(Ok(generation)) if !generation.content.trim().is_empty() => {
                let output = parse_task_output(job.task_type, &generation.content);
                self.emit(
                    EventType::CodeGenerated,
                    job.build_id,
                    Some(job.agent_id),
                    json!({
                        "task_id": job.task_id,
                        "model": generation.model,
                        "files": output.files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
                    }),
                );
                return Ok(output);
            }
            Ok(Ok(_)) => TaskFailure::EmptyResponse,
            Ok(Err(err)) => TaskFailure::Provider(err.to_string()),
            Err(_) => TaskFailure::Provider(ProviderError::Timeout.to_string()),
        };

        warn!(provider = %provider, error = %failure, "generation failed");
        self.emit(
            EventType::AgentGenerationFailed,
            job.build_id,
            Some(job.agent_id),
            json!({ "task_id": job.task_id, "provider": provider.to_string(), "error": failure.to_string() }),
        );
        Err(failure)
    }
}
