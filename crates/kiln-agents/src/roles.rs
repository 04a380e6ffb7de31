use kiln_core::types::{AgentRole, Provider, TaskType};

/// Priority given to the recovery (`solve_build_failure`) task.
pub const RECOVERY_PRIORITY: u8 = 99;

/// Roles every full team carries, in phase order.
pub const MANDATORY_ROLES: [AgentRole; 6] = [
    AgentRole::Architect,
    AgentRole::Database,
    AgentRole::Backend,
    AgentRole::Frontend,
    AgentRole::Testing,
    AgentRole::Reviewer,
];

/// Optional roles added when the agent budget allows.
pub const OPTIONAL_ROLES: [AgentRole; 1] = [AgentRole::Planner];

/// Reduced team used with a local/offline provider.
pub const LOCAL_PROFILE_ROLES: [AgentRole; 4] = [
    AgentRole::Architect,
    AgentRole::Backend,
    AgentRole::Frontend,
    AgentRole::Reviewer,
];

/// Task type a role's phase task is created with.
pub fn task_type_for_role(role: AgentRole) -> TaskType {
    match role {
        AgentRole::Planner | AgentRole::Lead => TaskType::Plan,
        AgentRole::Architect => TaskType::Architecture,
        AgentRole::Frontend => TaskType::GenerateUi,
        AgentRole::Backend => TaskType::GenerateApi,
        AgentRole::Database => TaskType::GenerateSchema,
        AgentRole::Testing => TaskType::Test,
        AgentRole::Reviewer => TaskType::Review,
        AgentRole::Solver => TaskType::Fix,
    }
}

pub fn priority_for_role(role: AgentRole) -> u8 {
    match role {
        AgentRole::Lead => 100,
        AgentRole::Solver => 95,
        AgentRole::Architect => 90,
        AgentRole::Planner => 85,
        AgentRole::Database => 80,
        AgentRole::Backend => 70,
        AgentRole::Frontend => 60,
        AgentRole::Testing => 50,
        AgentRole::Reviewer => 40,
    }
}

/// Task description for a role's phase task.
pub fn description_for_role(role: AgentRole, app_description: &str) -> String {
    match role {
        AgentRole::Lead | AgentRole::Planner => format!("Create a build plan for: {app_description}"),
        AgentRole::Architect => format!("Design the architecture for: {app_description}"),
        AgentRole::Frontend => format!("Build the frontend UI for: {app_description}"),
        AgentRole::Backend => format!("Build the backend API for: {app_description}"),
        AgentRole::Database => format!("Design the database schema for: {app_description}"),
        AgentRole::Testing => format!("Write tests for: {app_description}"),
        AgentRole::Reviewer => format!("Review the generated code for: {app_description}"),
        AgentRole::Solver => format!("Fix build failures for: {app_description}"),
    }
}

/// Providers a role prefers, strongest fit first.
pub fn provider_preferences(role: AgentRole) -> &'static [Provider] {
    use Provider::*;
    match role {
        AgentRole::Lead | AgentRole::Planner | AgentRole::Architect | AgentRole::Reviewer => {
            &[Claude, Gpt4, Gemini, Grok, Ollama]
        }
        AgentRole::Frontend | AgentRole::Backend | AgentRole::Database | AgentRole::Solver => {
            &[Gpt4, Claude, Gemini, Grok, Ollama]
        }
        AgentRole::Testing => &[Gemini, Gpt4, Claude, Grok, Ollama],
    }
}

/// Provider that owns `role` whenever it is available.
pub fn hard_override(role: AgentRole) -> Option<Provider> {
    match role {
        AgentRole::Planner | AgentRole::Architect | AgentRole::Reviewer => Some(Provider::Claude),
        AgentRole::Frontend | AgentRole::Backend | AgentRole::Database | AgentRole::Solver => {
            Some(Provider::Gpt4)
        }
        AgentRole::Testing => Some(Provider::Gemini),
        AgentRole::Lead => None,
    }
}

/// Providers tried, in order, when switching away from `provider`.
pub fn fallback_chain(provider: Provider) -> &'static [Provider] {
    use Provider::*;
    match provider {
        Claude => &[Gpt4, Gemini, Ollama],
        Gpt4 => &[Claude, Gemini, Ollama],
        Gemini => &[Claude, Gpt4, Ollama],
        Ollama => &[Claude, Gpt4, Gemini],
        Grok => &[Claude, Gpt4, Gemini],
    }
}

/// Next available provider after `current` in its fallback chain.
pub fn next_provider(current: Provider, available: &[Provider]) -> Option<Provider> {
    fallback_chain(current)
        .iter()
        .copied()
        .find(|p| *p != current && available.contains(p))
}

/// Strongest available provider by capability rank.
pub fn strongest(available: &[Provider]) -> Option<Provider> {
    available.iter().copied().max_by_key(|p| p.capability_rank())
}
