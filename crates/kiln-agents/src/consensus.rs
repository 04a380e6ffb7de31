//! Incident vote across the major providers.
//!
//! Each available voter gets the same incident brief concurrently. A decision
//! needs at least [`MAJORITY`] matching votes; anything less falls back to the
//! classifier's mapped decision.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use kiln_core::config::ConsensusConfig;
use kiln_core::types::{AgentRole, PowerMode, Provider, RetryStrategy, TaskType};
use kiln_harness::provider::{GenerateOptions, ModelProvider};

use crate::classifier::{Classification, RecoveryDecision};

pub const SYSTEM_PROMPT: &str =
    "You are an incident commander. Vote for the safest path to complete the build.";

pub const MIN_VOTERS: usize = 2;
pub const MAJORITY: usize = 2;
pub const RATIONALE_CHARS: usize = 220;

/// Everything a voter is told about the incident.
#[derive(Debug, Clone)]
pub struct Incident {
    pub app_description: String,
    pub task_type: TaskType,
    pub task_description: String,
    pub role: AgentRole,
    pub error: String,
    pub default_strategy: RetryStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub provider: Provider,
    pub decision: RecoveryDecision,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub decision: RecoveryDecision,
    pub votes: Vec<Vote>,
}

impl ConsensusOutcome {
    /// `provider=decision` pairs in vote order.
    pub fn summary(&self) -> String {
        self.votes
            .iter()
            .map(|v| format!("{}={}", v.provider, v.decision))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Major providers present in `available`, in polling order.
pub fn voters(available: &[Provider]) -> Vec<Provider> {
    Provider::MAJOR
        .iter()
        .copied()
        .filter(|p| available.contains(p))
        .collect()
}

pub fn incident_prompt(incident: &Incident) -> String {
    format!(
        "You are taking part in a build recovery incident vote.\n\n\
         Build context:\n\
         - App description: {}\n\
         - Failed task type: {}\n\
         - Failed task description: {}\n\
         - Agent role: {}\n\
         - Error: {}\n\
         - Default strategy: {}\n\n\
         Choose exactly ONE recovery action:\n\
         1) retry_same\n2) switch_provider\n3) spawn_solver\n4) abort\n\n\
         Respond in this exact format:\n\
         VOTE: <retry_same|switch_provider|spawn_solver|abort>\n\
         RATIONALE: <single short sentence>",
        incident.app_description,
        incident.task_type,
        incident.task_description,
        incident.role,
        incident.error,
        incident.default_strategy,
    )
}

/// Decision named by a `VOTE:` line, if any, and the clipped reply.
pub fn parse_vote(reply: &str) -> (Option<RecoveryDecision>, String) {
    let lower = reply.to_lowercase();
    let decision = RecoveryDecision::ALL
        .iter()
        .copied()
        .find(|d| lower.contains(&format!("vote: {}", d.as_str())));
    let trimmed = reply.trim();
    let rationale = if trimmed.len() > RATIONALE_CHARS {
        format!("{}...", crate::prompts::head_chars(trimmed, RATIONALE_CHARS))
    } else {
        trimmed.to_string()
    };
    (decision, rationale)
}

/// Winner with at least [`MAJORITY`] votes, else `fallback`. Ties go to
/// `fallback`.
pub fn tally(votes: &[Vote], fallback: RecoveryDecision) -> RecoveryDecision {
    let mut counts: HashMap<RecoveryDecision, usize> = HashMap::new();
    for vote in votes {
        *counts.entry(vote.decision).or_default() += 1;
    }
    let best = counts.values().copied().max().unwrap_or(0);
    if best < MAJORITY {
        return fallback;
    }
    let leaders: Vec<RecoveryDecision> = counts
        .iter()
        .filter(|(_, c)| **c == best)
        .map(|(d, _)| *d)
        .collect();
    match leaders.as_slice() {
        [only] => *only,
        _ => fallback,
    }
}

/// A non-retriable classification is never voted back into a retry.
pub fn finalize(decision: RecoveryDecision, classification: &Classification) -> RecoveryDecision {
    if classification.is_non_retriable() {
        RecoveryDecision::Abort
    } else {
        decision
    }
}

/// Run the vote. Returns `None` when fewer than [`MIN_VOTERS`] voters exist.
///
/// A voter that errors or times out votes for `fallback`.
pub async fn run_vote(
    provider: Arc<dyn ModelProvider>,
    voter_set: Vec<Provider>,
    incident: &Incident,
    fallback: RecoveryDecision,
    settings: &ConsensusConfig,
    options: GenerateOptions,
) -> Option<ConsensusOutcome> {
    if voter_set.len() < MIN_VOTERS {
        return None;
    }

    let prompt = Arc::new(incident_prompt(incident));
    let options = options
        .with_max_tokens(settings.max_tokens)
        .with_temperature(settings.temperature)
        .with_system_prompt(SYSTEM_PROMPT)
        .with_power_mode(PowerMode::Fast);
    let limit = settings.timeout();

    let mut set = JoinSet::new();
    for (idx, voter) in voter_set.iter().copied().enumerate() {
        let provider = Arc::clone(&provider);
        let prompt = Arc::clone(&prompt);
        let options = options.clone();
        set.spawn(async move {
            let reply =
                tokio::time::timeout(limit, provider.generate(voter, &prompt, &options)).await;
            let vote = match reply {
                Ok(Ok(generation)) => {
                    let (decision, rationale) = parse_vote(&generation.content);
                    Vote {
                        provider: voter,
                        decision: decision.unwrap_or(fallback),
                        rationale,
                    }
                }
                Ok(Err(err)) => Vote {
                    provider: voter,
                    decision: fallback,
                    rationale: format!("fallback vote due to provider error: {err}"),
                },
                Err(_) => Vote {
                    provider: voter,
                    decision: fallback,
                    rationale: "fallback vote due to timeout".to_string(),
                },
            };
            (idx, vote)
        });
    }

    let mut collected: Vec<(usize, Vote)> = Vec::with_capacity(voter_set.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(pair) => collected.push(pair),
            Err(err) => tracing::warn!(error = %err, "consensus voter task failed"),
        }
    }
    collected.sort_by_key(|(idx, _)| *idx);
    let votes: Vec<Vote> = collected.into_iter().map(|(_, v)| v).collect();

    let decision = tally(&votes, fallback);
    tracing::info!(decision = %decision, votes = votes.len(), "incident consensus reached");
    Some(ConsensusOutcome { decision, votes })
}
