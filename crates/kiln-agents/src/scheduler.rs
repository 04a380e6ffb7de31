//! Phased wave scheduler.
//!
//! Phases run strictly in order. Each phase creates one task per member
//! agent, submits them together and polls until every task has settled
//! before the next phase creates anything.

use std::sync::Arc;

use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use kiln_bridge::protocol::EventType;
use kiln_core::types::{AgentRole, Build, BuildStatus, Task, TaskInput, TaskType};
use kiln_telemetry::logging::build_span;

use crate::manager::{BuildHandle, ManagerInner};
use crate::prompts::completed_output;
use crate::roles;
use crate::state_machine::{advance, advance_to_phase, BuildTransition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase {
    pub name: &'static str,
    pub roles: &'static [AgentRole],
    pub status: BuildStatus,
}

pub const PHASES: [Phase; 5] = [
    Phase {
        name: "Architecture",
        roles: &[AgentRole::Architect],
        status: BuildStatus::InProgress,
    },
    Phase {
        name: "Database Schema",
        roles: &[AgentRole::Database],
        status: BuildStatus::InProgress,
    },
    Phase {
        name: "Code Generation",
        roles: &[AgentRole::Frontend, AgentRole::Backend],
        status: BuildStatus::InProgress,
    },
    Phase {
        name: "Testing",
        roles: &[AgentRole::Testing],
        status: BuildStatus::Testing,
    },
    Phase {
        name: "Review",
        roles: &[AgentRole::Reviewer],
        status: BuildStatus::Reviewing,
    },
];

/// Whether `task_id` is terminal, following recovery hand-offs to the task
/// that replaced it.
pub fn settled(build: &Build, task_id: Uuid) -> bool {
    let mut current = task_id;
    for _ in 0..=build.tasks.len() {
        let Some(task) = build.task(current) else {
            return true;
        };
        match task.input.superseded_by {
            Some(next) if task.status.is_terminal() => current = next,
            _ => return task.status.is_terminal(),
        }
    }
    true
}

/// Agents working `phase`: each role's agent, plus the lead for at most one
/// role it absorbed.
fn phase_members(build: &Build, phase: &Phase) -> Vec<(AgentRole, Uuid)> {
    let mut members: Vec<(AgentRole, Uuid)> = phase
        .roles
        .iter()
        .filter_map(|role| build.agent_by_role(*role).map(|a| (*role, a.id)))
        .collect();
    let absorbed = phase
        .roles
        .iter()
        .copied()
        .find(|r| build.absorbed_roles.contains(r) && build.agent_by_role(*r).is_none());
    if let (Some(role), Some(lead)) = (absorbed, build.agent_by_role(AgentRole::Lead)) {
        members.push((role, lead.id));
    }
    members
}

impl ManagerInner {
    /// Spawn the team and run every phase in the background.
    pub(crate) fn spawn_pipeline(self: &Arc<Self>, handle: Arc<BuildHandle>, build_id: Uuid) {
        let inner = Arc::clone(self);
        tokio::spawn(
            async move {
                if let Err(err) = inner.spawn_team(&handle, build_id).await {
                    let failed = {
                        let mut build = handle.build.lock().await;
                        inner.fail_locked(&mut build, &handle.cancel, err.to_string(), "Build Failed")
                    };
                    if failed {
                        inner.persist(&handle).await;
                    }
                    return;
                }
                inner.run_phases(&handle, build_id).await;
            }
            .instrument(build_span(build_id)),
        );
    }

    async fn run_phases(self: &Arc<Self>, handle: &BuildHandle, build_id: Uuid) {
        for phase in PHASES.iter() {
            if !self.run_phase(handle, build_id, phase).await {
                debug!(build_id = %build_id, phase = phase.name, "pipeline stopped");
                return;
            }
        }
        {
            let mut build = handle.build.lock().await;
            if !build.is_active() {
                return;
            }
            build.phased_pipeline_complete = true;
            self.update_progress_locked(&mut build);
        }
        info!(build_id = %build_id, "phased pipeline complete");
        self.persist(handle).await;
        self.check_build_completion(build_id).await;
    }

    /// Run one phase. Returns `false` when the pipeline must stop.
    async fn run_phase(&self, handle: &BuildHandle, build_id: Uuid, phase: &Phase) -> bool {
        let (task_ids, queued) = {
            let mut build = handle.build.lock().await;
            if !build.is_active() {
                return false;
            }
            let members = phase_members(&build, phase);
            if members.is_empty() {
                debug!(build_id = %build_id, phase = phase.name, "skipping phase without agents");
                return true;
            }

            if build.status == BuildStatus::Planning && phase.status != BuildStatus::InProgress {
                if let Err(err) = advance(&mut build, BuildTransition::Start) {
                    warn!(build_id = %build_id, error = %err, "phase start rejected");
                }
            }
            if let Err(err) = advance_to_phase(&mut build, phase.status) {
                warn!(build_id = %build_id, phase = phase.name, error = %err, "phase status rejected");
            }
            self.emit(
                EventType::BuildPhase,
                build_id,
                None,
                json!({
                    "phase": phase.name,
                    "status": build.status.to_string(),
                    "roles": members.iter().map(|(r, _)| r.to_string()).collect::<Vec<_>>(),
                }),
            );
            info!(build_id = %build_id, phase = phase.name, agents = members.len(), "phase started");

            let architecture = completed_output(&build, TaskType::Architecture);
            let schema = completed_output(&build, TaskType::GenerateSchema);
            let mut task_ids = Vec::with_capacity(members.len());
            let mut queued = Vec::with_capacity(members.len());
            for (role, agent_id) in members {
                let input = TaskInput {
                    app_description: build.description.clone(),
                    tech_stack: build.tech_stack.clone(),
                    architecture_context: architecture.clone(),
                    schema_context: schema.clone(),
                    ..TaskInput::default()
                };
                let task = Task::new(
                    build_id,
                    roles::task_type_for_role(role),
                    roles::description_for_role(role, &build.description),
                    roles::priority_for_role(role),
                    build.max_retries,
                )
                .with_input(input);
                let task_id = task.id;
                build.tasks.push(task);
                self.emit_task_created(&build, task_id);
                task_ids.push(task_id);
                queued.extend(self.assign_locked(&mut build, task_id, agent_id));
            }
            build.touch();
            (task_ids, queued)
        };
        self.submit_all(queued).await;

        let poll = self.config.scheduler.poll_interval();
        let limit = self.config.scheduler.phase_timeout();
        let deadline = Instant::now() + limit;
        loop {
            {
                let build = handle.build.lock().await;
                if !build.is_active() {
                    return false;
                }
                if task_ids.iter().all(|id| settled(&build, *id)) {
                    break;
                }
            }
            if Instant::now() >= deadline {
                let failed = {
                    let mut build = handle.build.lock().await;
                    self.fail_locked(
                        &mut build,
                        &handle.cancel,
                        format!("Phase {} timed out after {}s", phase.name, limit.as_secs()),
                        "Build Failed",
                    )
                };
                if failed {
                    self.persist(handle).await;
                }
                return false;
            }
            tokio::select! {
                _ = handle.cancel.cancelled() => return false,
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(poll) => {}
            }
        }

        {
            let mut build = handle.build.lock().await;
            if !build.is_active() {
                return false;
            }
            let name = format!("{} Complete", phase.name);
            let description = format!("{} phase finished", phase.name);
            self.checkpoint_locked(&mut build, &name, &description);
            self.update_progress_locked(&mut build);
        }
        info!(build_id = %build_id, phase = phase.name, "phase complete");
        self.persist(handle).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::types::{BuildRequest, TaskStatus};

    #[test]
    fn settled_follows_supersession() {
        let mut build = Build::new(1, &BuildRequest::new("app"));
        let mut failed = Task::new(build.id, TaskType::GenerateUi, "ui", 60, 2);
        let recovery = Task::new(build.id, TaskType::Fix, "fix", 99, 2);
        failed.input.superseded_by = Some(recovery.id);
        failed.finish(TaskStatus::Cancelled);
        let (failed_id, recovery_id) = (failed.id, recovery.id);
        build.tasks.push(failed);
        build.tasks.push(recovery);

        assert!(!settled(&build, failed_id));
        if let Some(task) = build.task_mut(recovery_id) {
            task.finish(TaskStatus::Completed);
        }
        assert!(settled(&build, failed_id));
    }

    #[test]
    fn phases_cover_every_specialist_once() {
        let mut seen: Vec<AgentRole> = PHASES.iter().flat_map(|p| p.roles.iter().copied()).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 6);
        assert!(!seen.contains(&AgentRole::Lead));
        assert!(!seen.contains(&AgentRole::Solver));
        assert!(!seen.contains(&AgentRole::Planner));
    }
}
