use thiserror::Error;
use uuid::Uuid;

use crate::state_machine::StateMachineError;
use crate::store::StoreError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("build not found: {0}")]
    BuildNotFound(Uuid),
    #[error("agent not found: {0}")]
    AgentNotFound(Uuid),
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
    #[error("build not active: {0}")]
    BuildNotActive(Uuid),
    #[error("build request budget exceeded")]
    BudgetExceeded,
    #[error("no AI providers available")]
    NoProviders,
    #[error("failed to spawn {role} agent: {reason}")]
    Spawn { role: String, reason: String },
    #[error("task queue closed")]
    QueueClosed,
    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(Uuid),
    #[error(transparent)]
    Transition(#[from] StateMachineError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
