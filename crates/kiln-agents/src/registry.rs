//! Team composition, provider assignment and agent spawning.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use kiln_bridge::protocol::EventType;
use kiln_core::types::{Agent, AgentRole, AgentStatus, Build, Provider};
use kiln_harness::provider::ProviderScope;

use crate::error::{EngineError, Result};
use crate::manager::{scope_for, BuildHandle, ManagerInner};
use crate::roles::{self, LOCAL_PROFILE_ROLES, MANDATORY_ROLES, OPTIONAL_ROLES};

const GRACE_POLL: Duration = Duration::from_millis(100);

/// Specialists asked to stand in for a solver, best fit first.
const SOLVER_STAND_INS: [AgentRole; 6] = [
    AgentRole::Solver,
    AgentRole::Backend,
    AgentRole::Frontend,
    AgentRole::Database,
    AgentRole::Reviewer,
    AgentRole::Architect,
];

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Roles to spawn after the lead. The base set is a floor; optional roles are
/// added only while they fit under `max_agents - 1`.
pub fn team_roles(max_agents: u32, local_profile: bool) -> Vec<AgentRole> {
    if local_profile {
        return LOCAL_PROFILE_ROLES.to_vec();
    }
    let budget = max_agents.saturating_sub(1) as usize;
    let mut team = MANDATORY_ROLES.to_vec();
    for role in OPTIONAL_ROLES {
        if team.len() < budget {
            team.push(role);
        }
    }
    team
}

/// Two-pass assignment: the first available provider on each role's
/// preference list, then the hard overrides for providers that are present.
pub fn assign_providers(team: &[AgentRole], available: &[Provider]) -> Vec<(AgentRole, Provider)> {
    team.iter()
        .filter_map(|&role| {
            let ranked = roles::provider_preferences(role)
                .iter()
                .copied()
                .find(|p| available.contains(p))
                .or_else(|| roles::strongest(available))?;
            let provider = roles::hard_override(role)
                .filter(|p| available.contains(p))
                .unwrap_or(ranked);
            Some((role, provider))
        })
        .collect()
}

/// Whether `agent_id` can take a task right now.
pub fn agent_is_free(build: &Build, agent_id: Uuid) -> bool {
    let Some(agent) = build.agents.get(&agent_id) else {
        return false;
    };
    agent.status.is_available()
        && agent
            .current_task
            .and_then(|id| build.task(id))
            .is_none_or(|t| t.status.is_terminal())
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

impl ManagerInner {
    /// Providers usable under `scope`, polling for up to the configured grace
    /// period while the list is empty.
    pub(crate) async fn available_providers(&self, scope: &ProviderScope) -> Vec<Provider> {
        let deadline = Instant::now() + self.config.registry.provider_grace();
        loop {
            let providers = self.provider.available_providers(scope).await;
            let now = Instant::now();
            if !providers.is_empty() || now >= deadline {
                return providers;
            }
            tokio::time::sleep(GRACE_POLL.min(deadline - now)).await;
        }
    }

    pub(crate) async fn spawn_lead(
        &self,
        handle: &BuildHandle,
        build_id: Uuid,
        available: &[Provider],
        scope: &ProviderScope,
    ) -> Result<Uuid> {
        let preferred = roles::strongest(available).ok_or(EngineError::NoProviders)?;
        self.spawn_role(handle, build_id, AgentRole::Lead, preferred, available, scope, false)
            .await?
            .ok_or_else(|| EngineError::Spawn {
                role: AgentRole::Lead.to_string(),
                reason: "no provider accepted the lead agent".to_string(),
            })
    }

    /// Spawn one agent per team role.
    pub(crate) async fn spawn_team(&self, handle: &BuildHandle, build_id: Uuid) -> Result<()> {
        let (scope, max_agents) = {
            let build = handle.build.lock().await;
            (scope_for(&build), build.max_agents)
        };
        let available = self.available_providers(&scope).await;
        if available.is_empty() {
            return Err(EngineError::NoProviders);
        }

        let team = team_roles(max_agents, handle.is_local_profile());
        let mut spawned = 0usize;
        for (role, provider) in assign_providers(&team, &available) {
            if handle.cancel.is_cancelled() {
                return Ok(());
            }
            if self
                .spawn_role(handle, build_id, role, provider, &available, &scope, true)
                .await?
                .is_some()
            {
                spawned += 1;
            }
        }
        info!(
            build_id = %build_id,
            spawned,
            requested = team.len(),
            local_profile = handle.is_local_profile(),
            "team spawned"
        );
        Ok(())
    }

    /// Probe and bind `role` to a provider.
    ///
    /// A lone provider gets three attempts; with several, each other
    /// available provider is tried once after the preferred one. `Ok(None)`
    /// means the role was absorbed by the lead.
    #[allow(clippy::too_many_arguments)]
    async fn spawn_role(
        &self,
        handle: &BuildHandle,
        build_id: Uuid,
        role: AgentRole,
        preferred: Provider,
        available: &[Provider],
        scope: &ProviderScope,
        absorbable: bool,
    ) -> Result<Option<Uuid>> {
        let single = available.len() <= 1;
        let attempts: u32 = if single { 3 } else { 1 };
        let mut candidates = vec![preferred];
        if !single {
            candidates.extend(available.iter().copied().filter(|p| *p != preferred));
        }

        let mut last_error = String::from("no provider available");
        for candidate in candidates {
            for attempt in 1..=attempts {
                match self.provider.check_provider(candidate, scope).await {
                    Ok(()) => {
                        let agent_id = self.register_agent(handle, build_id, role, candidate).await;
                        return Ok(Some(agent_id));
                    }
                    Err(err) => {
                        warn!(
                            build_id = %build_id,
                            role = %role,
                            provider = %candidate,
                            attempt,
                            error = %err,
                            "agent spawn attempt failed"
                        );
                        last_error = err.to_string();
                        if attempt < attempts {
                            tokio::time::sleep(self.config.registry.spawn_backoff() * attempt).await;
                        }
                    }
                }
            }
        }

        if single && absorbable {
            let mut build = handle.build.lock().await;
            if !build.absorbed_roles.contains(&role) {
                build.absorbed_roles.push(role);
            }
            self.emit(
                EventType::BuildProgress,
                build_id,
                None,
                json!({
                    "phase": "agent_spawn_mitigation",
                    "role": role.to_string(),
                    "message": format!("Could not start the {role} agent; the lead agent will cover this role."),
                    "error": last_error,
                }),
            );
            warn!(build_id = %build_id, role = %role, error = %last_error, "role absorbed by lead");
            return Ok(None);
        }

        Err(EngineError::Spawn {
            role: role.to_string(),
            reason: last_error,
        })
    }

    async fn register_agent(
        &self,
        handle: &BuildHandle,
        build_id: Uuid,
        role: AgentRole,
        provider: Provider,
    ) -> Uuid {
        let agent_id = {
            let mut build = handle.build.lock().await;
            let agent = Agent::new(build_id, role, provider, build.power_mode);
            let agent_id = agent.id;
            self.emit(
                EventType::AgentSpawned,
                build_id,
                Some(agent_id),
                json!({
                    "role": role.to_string(),
                    "provider": provider.to_string(),
                    "model": agent.model,
                }),
            );
            build.agents.insert(agent_id, agent);
            build.touch();
            agent_id
        };
        self.agents.write().await.insert(agent_id, build_id);
        info!(build_id = %build_id, agent_id = %agent_id, role = %role, provider = %provider, "agent spawned");
        agent_id
    }

    /// Agent to run a recovery task: an idle solver, a freshly spawned one,
    /// an existing specialist, and finally the agent whose task failed.
    pub(crate) async fn ensure_solver(
        &self,
        handle: &BuildHandle,
        build_id: Uuid,
        failing_agent: Option<Uuid>,
    ) -> Option<Uuid> {
        let scope = {
            let build = handle.build.lock().await;
            let idle_solver = build
                .agents
                .values()
                .filter(|a| a.role == AgentRole::Solver)
                .map(|a| a.id)
                .find(|id| agent_is_free(&build, *id));
            if idle_solver.is_some() {
                return idle_solver;
            }
            scope_for(&build)
        };

        let available = self.provider.available_providers(&scope).await;
        if let Some((_, provider)) = assign_providers(&[AgentRole::Solver], &available).first() {
            match self
                .spawn_role(handle, build_id, AgentRole::Solver, *provider, &available, &scope, false)
                .await
            {
                Ok(Some(agent_id)) => return Some(agent_id),
                Ok(None) => {}
                Err(err) => warn!(build_id = %build_id, error = %err, "solver spawn failed"),
            }
        }

        let build = handle.build.lock().await;
        let stand_in = SOLVER_STAND_INS.iter().find_map(|role| {
            let mut matching: Vec<&Agent> = build
                .agents
                .values()
                .filter(|a| a.role == *role && a.status.is_available())
                .collect();
            matching.sort_by_key(|a| (!agent_is_free(&build, a.id), a.created_at));
            matching.first().map(|a| a.id)
        });
        stand_in.or_else(|| {
            failing_agent.filter(|id| {
                build
                    .agents
                    .get(id)
                    .is_some_and(|a| a.status.is_available())
            })
        })
    }

    /// Mark an agent as failed and retire it from scheduling.
    pub(crate) fn mark_agent_error_locked(&self, build: &mut Build, agent_id: Uuid, error: &str) {
        if let Some(agent) = build.agents.get_mut(&agent_id) {
            agent.status = AgentStatus::Error;
            agent.error = Some(error.to_string());
            agent.updated_at = Utc::now();
        }
        self.emit(
            EventType::AgentError,
            build.id,
            Some(agent_id),
            json!({ "error": error }),
        );
    }
}
