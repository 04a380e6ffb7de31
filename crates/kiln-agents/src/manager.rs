//! BuildManager -- the authoritative in-memory registry of builds.
//!
//! Locks, outermost first:
//! - `builds` maps build id to its [`BuildHandle`];
//! - `agents` maps agent id to the owning build id;
//! - each handle's `build` mutex guards one [`Build`].
//!
//! The map locks are only held long enough to clone an `Arc`. A build lock is
//! never held across a provider call, a sleep or a queue submission.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use kiln_bridge::event_bus::EventBus;
use kiln_bridge::protocol::{BuildEvent, EventType};
use kiln_core::config::EngineConfig;
use kiln_core::types::{
    Agent, AgentRole, AgentStatus, Build, BuildRequest, BuildStatus, Checkpoint, Provider,
    ProviderMode, Task, TaskInput, TaskStatus, TaskType,
};
use kiln_harness::cancel::CancelToken;
use kiln_harness::provider::{ModelProvider, ProviderScope};
use kiln_telemetry::logging::build_span;

use crate::dispatcher::{QueuedTask, TaskResult};
use crate::error::{EngineError, Result};
use crate::output::collect_build_files;
use crate::readiness::{NoopPreviewVerifier, PreviewVerifier};
use crate::roles;
use crate::state_machine::{advance, BuildTransition};
use crate::store::{BuildSnapshot, InMemorySnapshotStore, SnapshotStore};

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

pub(crate) struct BuildHandle {
    pub(crate) build: Mutex<Build>,
    /// Triggered on every terminal outcome. In-flight calls and monitors race it.
    pub(crate) cancel: CancelToken,
    /// Serialises completion evaluation for one build.
    pub(crate) completion_gate: Mutex<()>,
    pub(crate) local_profile: AtomicBool,
}

impl BuildHandle {
    fn new(build: Build) -> Self {
        Self {
            build: Mutex::new(build),
            cancel: CancelToken::new(),
            completion_gate: Mutex::new(()),
            local_profile: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_local_profile(&self) -> bool {
        self.local_profile.load(Ordering::Relaxed)
    }
}

pub(crate) struct ManagerInner {
    pub(crate) config: EngineConfig,
    pub(crate) provider: Arc<dyn ModelProvider>,
    pub(crate) bus: EventBus,
    pub(crate) store: Arc<dyn SnapshotStore>,
    pub(crate) preview: Arc<dyn PreviewVerifier>,
    pub(crate) builds: RwLock<HashMap<Uuid, Arc<BuildHandle>>>,
    pub(crate) agents: RwLock<HashMap<Uuid, Uuid>>,
    pub(crate) task_tx: flume::Sender<QueuedTask>,
    pub(crate) result_tx: flume::Sender<TaskResult>,
    pub(crate) shutdown: CancelToken,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct BuildManagerBuilder {
    config: EngineConfig,
    provider: Arc<dyn ModelProvider>,
    bus: Option<EventBus>,
    store: Option<Arc<dyn SnapshotStore>>,
    preview: Option<Arc<dyn PreviewVerifier>>,
}

impl BuildManagerBuilder {
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_preview_verifier(mut self, verifier: Arc<dyn PreviewVerifier>) -> Self {
        self.preview = Some(verifier);
        self
    }

    /// Build the manager and spawn its dispatch and result loops. Must be
    /// called inside a tokio runtime.
    pub fn start(self) -> BuildManager {
        let capacity = self.config.dispatcher.queue_capacity.max(1);
        let (task_tx, task_rx) = flume::bounded(capacity);
        let (result_tx, result_rx) = flume::bounded(capacity);

        let inner = Arc::new(ManagerInner {
            config: self.config,
            provider: self.provider,
            bus: self.bus.unwrap_or_default(),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemorySnapshotStore::new())),
            preview: self.preview.unwrap_or_else(|| Arc::new(NoopPreviewVerifier)),
            builds: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
            task_tx,
            result_tx,
            shutdown: CancelToken::new(),
        });

        tokio::spawn(Arc::clone(&inner).dispatch_loop(task_rx));
        tokio::spawn(Arc::clone(&inner).result_loop(result_rx));
        info!(queue_capacity = capacity, "build manager started");

        BuildManager { inner }
    }
}

// ---------------------------------------------------------------------------
// BuildManager
// ---------------------------------------------------------------------------

/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct BuildManager {
    inner: Arc<ManagerInner>,
}

impl BuildManager {
    pub fn builder(config: EngineConfig, provider: Arc<dyn ModelProvider>) -> BuildManagerBuilder {
        BuildManagerBuilder {
            config,
            provider,
            bus: None,
            store: None,
            preview: None,
        }
    }

    /// Manager with an in-memory store, a fresh bus and no deep preview checks.
    pub fn start(config: EngineConfig, provider: Arc<dyn ModelProvider>) -> Self {
        Self::builder(config, provider).start()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Stop the dispatch and result loops. Builds in flight stop progressing.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Register a new pending build with guardrails from the configured limits.
    pub async fn create_build(&self, user_id: u64, request: BuildRequest) -> Result<Build> {
        let mut build = Build::new(user_id, &request);
        let limits = self.inner.config.limits_for(build.mode, build.power_mode);
        build.max_agents = limits.max_agents;
        build.max_retries = limits.max_retries;
        build.max_requests = limits.max_requests;
        build.max_tokens_per_request = limits.max_tokens_per_request;
        if self.inner.config.readiness.require_preview_default {
            build.require_preview_ready = true;
        }

        let snapshot = build.clone();
        let handle = Arc::new(BuildHandle::new(build));
        self.inner
            .builds
            .write()
            .await
            .insert(snapshot.id, Arc::clone(&handle));
        info!(
            build_id = %snapshot.id,
            user_id,
            mode = %snapshot.mode,
            power_mode = %snapshot.power_mode,
            max_requests = snapshot.max_requests,
            "build created"
        );
        self.inner.persist(&handle).await;
        Ok(snapshot)
    }

    /// Spawn the lead, queue the plan task and arm the build monitors.
    pub async fn start_build(&self, build_id: Uuid) -> Result<()> {
        let inner = &self.inner;
        let handle = inner.handle_or_err(build_id).await?;
        let scope = {
            let build = handle.build.lock().await;
            if build.status != BuildStatus::Pending {
                return Err(EngineError::BuildNotActive(build_id));
            }
            scope_for(&build)
        };

        let available = inner.available_providers(&scope).await;
        if available.is_empty() {
            let mut build = handle.build.lock().await;
            inner.fail_locked(
                &mut build,
                &handle.cancel,
                "No AI providers available for this build",
                "Build Failed",
            );
            drop(build);
            inner.persist(&handle).await;
            return Err(EngineError::NoProviders);
        }
        let local = inner.config.registry.local_profile
            || (available.len() == 1 && available[0] == Provider::Ollama);
        handle.local_profile.store(local, Ordering::Relaxed);

        {
            let mut build = handle.build.lock().await;
            advance(&mut build, BuildTransition::Plan)?;
            inner.emit(
                EventType::BuildStarted,
                build_id,
                None,
                json!({
                    "status": build.status.to_string(),
                    "mode": build.mode.to_string(),
                    "providers": available.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
                }),
            );
        }

        let lead = match inner.spawn_lead(&handle, build_id, &available, &scope).await {
            Ok(lead) => lead,
            Err(err) => {
                let mut build = handle.build.lock().await;
                inner.fail_locked(&mut build, &handle.cancel, err.to_string(), "Build Failed");
                drop(build);
                inner.persist(&handle).await;
                return Err(err);
            }
        };

        let queued = {
            let mut build = handle.build.lock().await;
            let input = TaskInput {
                app_description: build.description.clone(),
                tech_stack: build.tech_stack.clone(),
                ..TaskInput::default()
            };
            let task = Task::new(
                build_id,
                TaskType::Plan,
                roles::description_for_role(AgentRole::Lead, &build.description),
                roles::priority_for_role(AgentRole::Lead),
                build.max_retries,
            )
            .with_input(input);
            let task_id = task.id;
            build.tasks.push(task);
            inner.emit_task_created(&build, task_id);
            inner.assign_locked(&mut build, task_id, lead)
        };
        if let Some(item) = queued {
            inner.submit(item).await?;
        }

        inner.spawn_monitors(Arc::clone(&handle), build_id);
        Ok(())
    }

    /// Cancel a build. Pending and in-progress tasks flip to cancelled and
    /// in-flight calls are abandoned.
    pub async fn cancel_build(&self, build_id: Uuid) -> Result<()> {
        let handle = self.inner.handle_or_err(build_id).await?;
        {
            let mut build = handle.build.lock().await;
            if !build.is_active() {
                return Err(EngineError::BuildNotActive(build_id));
            }
            build.set_error_once("Build was cancelled before completion.");
            advance(&mut build, BuildTransition::Cancel)?;
            let cancelled = build.cancel_open_tasks();
            self.inner
                .checkpoint_locked(&mut build, "Build Cancelled", "Build cancelled by request");
            self.inner.emit(
                EventType::BuildError,
                build_id,
                None,
                json!({ "status": build.status.to_string(), "error": build.error, "cancelled_tasks": cancelled }),
            );
            info!(build_id = %build_id, cancelled_tasks = cancelled, "build cancelled");
        }
        handle.cancel.cancel();
        self.inner.persist(&handle).await;
        Ok(())
    }

    /// Snapshot of the build's current state.
    pub async fn get_build(&self, build_id: Uuid) -> Result<Build> {
        let handle = self.inner.handle_or_err(build_id).await?;
        let build = handle.build.lock().await;
        Ok(build.clone())
    }

    pub async fn get_agent(&self, agent_id: Uuid) -> Result<Agent> {
        let build_id = self
            .inner
            .agents
            .read()
            .await
            .get(&agent_id)
            .copied()
            .ok_or(EngineError::AgentNotFound(agent_id))?;
        let handle = self.inner.handle_or_err(build_id).await?;
        let build = handle.build.lock().await;
        build
            .agents
            .get(&agent_id)
            .cloned()
            .ok_or(EngineError::AgentNotFound(agent_id))
    }

    pub async fn list_builds(&self) -> Vec<Uuid> {
        self.inner.builds.read().await.keys().copied().collect()
    }

    /// Append a user message to the lead agent's log and broadcast it.
    pub async fn send_message(&self, build_id: Uuid, message: &str) -> Result<()> {
        let handle = self.inner.handle_or_err(build_id).await?;
        let mut build = handle.build.lock().await;
        if !build.is_active() {
            return Err(EngineError::BuildNotActive(build_id));
        }
        let lead_id = build.agent_by_role(AgentRole::Lead).map(|a| a.id);
        if let Some(lead) = lead_id.and_then(|id| build.agents.get_mut(&id)) {
            lead.output.push(format!("user: {message}"));
            lead.updated_at = Utc::now();
        }
        build.touch();
        let mut event = BuildEvent::new(EventType::AgentWorking, build_id)
            .with_data(json!({ "from": "user", "message": message }));
        if let Some(lead) = lead_id {
            event = event.with_agent(lead);
        }
        self.inner.bus.publish(event);
        Ok(())
    }

    /// Restore a checkpoint's progress and drop every later checkpoint.
    pub async fn rollback_to_checkpoint(&self, build_id: Uuid, checkpoint_id: Uuid) -> Result<()> {
        let handle = self.inner.handle_or_err(build_id).await?;
        {
            let mut build = handle.build.lock().await;
            if !build.is_active() {
                return Err(EngineError::BuildNotActive(build_id));
            }
            let idx = build
                .checkpoints
                .iter()
                .position(|c| c.id == checkpoint_id)
                .ok_or(EngineError::InvalidCheckpoint(checkpoint_id))?;
            build.checkpoints.truncate(idx + 1);
            let restored = build.checkpoints[idx].progress;
            build.progress = restored;
            if build.status != BuildStatus::InProgress {
                advance(&mut build, BuildTransition::Rollback)?;
            }
            self.inner.emit(
                EventType::BuildCheckpoint,
                build_id,
                None,
                json!({ "rollback_to": checkpoint_id, "progress": restored }),
            );
            info!(build_id = %build_id, checkpoint = %checkpoint_id, progress = restored, "rolled back to checkpoint");
        }
        self.inner.persist(&handle).await;
        Ok(())
    }

    /// Add a task to an active build and hand it to `agent_id`.
    pub async fn add_task(&self, build_id: Uuid, task: Task, agent_id: Uuid) -> Result<Uuid> {
        let handle = self.inner.handle_or_err(build_id).await?;
        let (task_id, queued) = {
            let mut build = handle.build.lock().await;
            if !build.is_active() {
                return Err(EngineError::BuildNotActive(build_id));
            }
            if !build.agents.contains_key(&agent_id) {
                return Err(EngineError::AgentNotFound(agent_id));
            }
            let mut task = task;
            task.build_id = build_id;
            let task_id = task.id;
            build.tasks.push(task);
            self.inner.emit_task_created(&build, task_id);
            (task_id, self.inner.assign_locked(&mut build, task_id, agent_id))
        };
        if let Some(item) = queued {
            self.inner.submit(item).await?;
        }
        Ok(task_id)
    }

    /// Apply a task result as if an executor had produced it.
    pub async fn apply_result(&self, result: TaskResult) {
        self.inner.process_result(result).await;
    }

    /// Re-run completion evaluation for a build.
    pub async fn check_completion(&self, build_id: Uuid) {
        self.inner.check_build_completion(build_id).await;
    }
}

/// Key scope a build's generation calls are billed against.
pub(crate) fn scope_for(build: &Build) -> ProviderScope {
    match build.provider_mode {
        ProviderMode::Platform => ProviderScope::Platform,
        ProviderMode::Byok => ProviderScope::User(build.user_id),
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

impl ManagerInner {
    pub(crate) async fn handle(&self, build_id: Uuid) -> Option<Arc<BuildHandle>> {
        self.builds.read().await.get(&build_id).cloned()
    }

    pub(crate) async fn handle_or_err(&self, build_id: Uuid) -> Result<Arc<BuildHandle>> {
        self.handle(build_id)
            .await
            .ok_or(EngineError::BuildNotFound(build_id))
    }

    pub(crate) fn emit(
        &self,
        event_type: EventType,
        build_id: Uuid,
        agent_id: Option<Uuid>,
        data: serde_json::Value,
    ) {
        let mut event = BuildEvent::new(event_type, build_id).with_data(data);
        if let Some(agent) = agent_id {
            event = event.with_agent(agent);
        }
        self.bus.publish(event);
    }

    pub(crate) fn emit_task_created(&self, build: &Build, task_id: Uuid) {
        if let Some(task) = build.task(task_id) {
            self.emit(
                EventType::TaskCreated,
                build.id,
                task.assigned_to,
                json!({
                    "task_id": task.id,
                    "task_type": task.task_type.to_string(),
                    "description": task.description,
                    "priority": task.priority,
                    "action": task.input.action.map(|a| a.to_string()),
                }),
            );
        }
    }

    /// Hand `task_id` to `agent_id`. When the agent is free the task becomes
    /// its current task and the returned item must be submitted; otherwise the
    /// task waits until the agent is released.
    pub(crate) fn assign_locked(
        &self,
        build: &mut Build,
        task_id: Uuid,
        agent_id: Uuid,
    ) -> Option<QueuedTask> {
        let busy = build
            .agents
            .get(&agent_id)
            .and_then(|a| a.current_task)
            .and_then(|current| build.task(current))
            .is_some_and(|t| !t.status.is_terminal());

        let task = build.task_mut(task_id)?;
        task.assigned_to = Some(agent_id);
        if busy {
            return None;
        }
        let task_type = task.task_type;
        let agent = build.agents.get_mut(&agent_id)?;
        agent.current_task = Some(task_id);
        agent.status = AgentStatus::Working;
        agent.updated_at = Utc::now();
        self.emit(
            EventType::AgentWorking,
            build.id,
            Some(agent_id),
            json!({ "task_id": task_id, "task_type": task_type.to_string() }),
        );
        Some(QueuedTask {
            build_id: build.id,
            task_id,
        })
    }

    /// Clear the agent's finished task and promote its next waiting task, if
    /// any.
    pub(crate) fn release_agent_locked(
        &self,
        build: &mut Build,
        agent_id: Uuid,
        idle_status: AgentStatus,
    ) -> Option<QueuedTask> {
        let next = build
            .tasks
            .iter()
            .filter(|t| {
                t.assigned_to == Some(agent_id)
                    && t.status == TaskStatus::Pending
                    && build.agents.get(&agent_id).and_then(|a| a.current_task) != Some(t.id)
            })
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            })
            .map(|t| t.id);

        let agent = build.agents.get_mut(&agent_id)?;
        agent.current_task = None;
        agent.updated_at = Utc::now();
        if agent.status.is_available() {
            agent.status = idle_status;
        }
        match next {
            Some(task_id) if build.is_active() => self.assign_locked(build, task_id, agent_id),
            _ => None,
        }
    }

    pub(crate) fn checkpoint_locked(&self, build: &mut Build, name: &str, description: &str) {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            number: build.checkpoints.len() as u32 + 1,
            name: name.to_string(),
            description: description.to_string(),
            files: collect_build_files(build),
            progress: build.progress,
            created_at: Utc::now(),
        };
        self.emit(
            EventType::BuildCheckpoint,
            build.id,
            None,
            json!({
                "checkpoint_id": checkpoint.id,
                "number": checkpoint.number,
                "name": checkpoint.name,
                "files": checkpoint.files.len(),
                "progress": checkpoint.progress,
            }),
        );
        build.checkpoints.push(checkpoint);
    }

    /// Recompute progress from task and agent completion, never lowering it.
    pub(crate) fn update_progress_locked(&self, build: &mut Build) {
        let total = build.tasks.len();
        let completed = build
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let workers: Vec<&Agent> = build
            .agents
            .values()
            .filter(|a| a.role != AgentRole::Lead)
            .collect();
        let done = workers
            .iter()
            .filter(|a| a.status == AgentStatus::Completed && a.current_task.is_none())
            .count();

        let by_tasks = if total > 0 { 20 + completed * 80 / total } else { 0 };
        let by_agents = if workers.is_empty() {
            0
        } else {
            20 + done * 70 / workers.len()
        };
        let before = build.progress;
        build.raise_progress(by_tasks.max(by_agents).min(100) as u8);
        if build.progress != before {
            self.emit(
                EventType::BuildProgress,
                build.id,
                None,
                json!({
                    "progress": build.progress,
                    "completed_tasks": completed,
                    "total_tasks": total,
                }),
            );
        }
    }

    /// Fail an active build: record the error (first writer wins), cancel
    /// open tasks, checkpoint, broadcast and trip the cancel token. Returns
    /// `false` when the build was already terminal.
    pub(crate) fn fail_locked(
        &self,
        build: &mut Build,
        cancel: &CancelToken,
        message: impl Into<String>,
        checkpoint: &str,
    ) -> bool {
        if !build.is_active() {
            return false;
        }
        let message = message.into();
        build.set_error_once(message.clone());
        if let Err(err) = advance(build, BuildTransition::Fail) {
            warn!(build_id = %build.id, error = %err, "fail transition rejected");
            return false;
        }
        let cancelled = build.cancel_open_tasks();
        self.checkpoint_locked(build, checkpoint, &message);
        self.emit(
            EventType::BuildError,
            build.id,
            None,
            json!({
                "status": build.status.to_string(),
                "error": build.error,
                "cancelled_tasks": cancelled,
            }),
        );
        tracing::error!(build_id = %build.id, error = ?build.error, cancelled_tasks = cancelled, "build failed");
        cancel.cancel();
        true
    }

    pub(crate) async fn persist(&self, handle: &BuildHandle) {
        let snapshot = {
            let build = handle.build.lock().await;
            BuildSnapshot::from_build(&build)
        };
        match snapshot {
            Ok(snapshot) => {
                let build_id = snapshot.build_id;
                if let Err(err) = self.store.upsert(snapshot).await {
                    warn!(build_id = %build_id, error = %err, "snapshot write failed");
                }
            }
            Err(err) => warn!(error = %err, "snapshot encoding failed"),
        }
    }

    // -- monitors -------------------------------------------------------------

    fn spawn_monitors(self: &Arc<Self>, handle: Arc<BuildHandle>, build_id: Uuid) {
        let inner = Arc::clone(self);
        let timeout_handle = Arc::clone(&handle);
        tokio::spawn(
            async move { inner.watch_build_timeout(timeout_handle, build_id).await }
                .instrument(build_span(build_id)),
        );
        let inner = Arc::clone(self);
        tokio::spawn(
            async move { inner.watch_inactivity(handle, build_id).await }
                .instrument(build_span(build_id)),
        );
    }

    async fn watch_build_timeout(self: Arc<Self>, handle: Arc<BuildHandle>, build_id: Uuid) {
        let mode = handle.build.lock().await.mode;
        let limit = self
            .config
            .timeouts
            .build_timeout(mode, handle.is_local_profile());
        tokio::select! {
            _ = handle.cancel.cancelled() => return,
            _ = self.shutdown.cancelled() => return,
            _ = tokio::time::sleep(limit) => {}
        }
        let failed = {
            let mut build = handle.build.lock().await;
            self.fail_locked(
                &mut build,
                &handle.cancel,
                format!(
                    "Build timed out after {}s before all tasks completed",
                    limit.as_secs()
                ),
                "Build Timed Out",
            )
        };
        if failed {
            warn!(build_id = %build_id, timeout_secs = limit.as_secs(), "build timed out");
            self.persist(&handle).await;
        }
    }

    async fn watch_inactivity(self: Arc<Self>, handle: Arc<BuildHandle>, build_id: Uuid) {
        let timeouts = &self.config.timeouts;
        let threshold = chrono::Duration::from_std(timeouts.inactivity_threshold())
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let mut warnings = 0u32;
        let mut ticker = tokio::time::interval(timeouts.inactivity_check());
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = handle.cancel.cancelled() => return,
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let mut build = handle.build.lock().await;
            if !build.is_active() {
                return;
            }
            let idle = Utc::now() - build.last_activity;
            if idle < threshold {
                warnings = 0;
                continue;
            }
            warnings += 1;
            warn!(build_id = %build_id, idle_secs = idle.num_seconds(), warnings, "build inactive");
            self.emit(
                EventType::BuildProgress,
                build_id,
                None,
                json!({
                    "phase": "inactivity_warning",
                    "message": format!("No task activity for {}s", idle.num_seconds()),
                    "warnings": warnings,
                }),
            );
            if warnings >= timeouts.inactivity_warnings.max(1) {
                let failed = self.fail_locked(
                    &mut build,
                    &handle.cancel,
                    format!(
                        "Build stalled: no task activity for {}s after {warnings} warnings",
                        idle.num_seconds()
                    ),
                    "Build Failed",
                );
                drop(build);
                if failed {
                    self.persist(&handle).await;
                }
                return;
            }
        }
    }
}
