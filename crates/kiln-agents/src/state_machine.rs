use serde::{Deserialize, Serialize};
use std::fmt;

use kiln_core::types::{Build, BuildStatus};

// ---------------------------------------------------------------------------
// BuildTransition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildTransition {
    Plan,
    Start,
    Test,
    Review,
    Rollback,
    Complete,
    Fail,
    Cancel,
}

impl fmt::Display for BuildTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BuildTransition::Plan => "Plan",
            BuildTransition::Start => "Start",
            BuildTransition::Test => "Test",
            BuildTransition::Review => "Review",
            BuildTransition::Rollback => "Rollback",
            BuildTransition::Complete => "Complete",
            BuildTransition::Fail => "Fail",
            BuildTransition::Cancel => "Cancel",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// An event was applied in a status that does not accept it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition {
        state: BuildStatus,
        event: BuildTransition,
    },
}

// ---------------------------------------------------------------------------
// BuildStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BuildStateMachine {
    current: BuildStatus,
    history: Vec<(BuildStatus, BuildTransition, BuildStatus)>,
}

impl BuildStateMachine {
    /// Create a new state machine starting in `Pending`.
    pub fn new() -> Self {
        Self::at(BuildStatus::Pending)
    }

    /// Resume from an existing status.
    pub fn at(status: BuildStatus) -> Self {
        Self {
            current: status,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> BuildStatus {
        self.current
    }

    pub fn history(&self) -> &[(BuildStatus, BuildTransition, BuildStatus)] {
        &self.history
    }

    /// Attempt a status change driven by `event`.
    ///
    /// Valid transitions:
    /// - Pending                                  + Plan     -> Planning
    /// - Planning | InProgress                    + Start    -> InProgress
    /// - InProgress | Testing | Reviewing         + Test     -> Testing
    /// - InProgress | Testing | Reviewing         + Review   -> Reviewing
    /// - Planning | InProgress | Testing | Reviewing + Rollback -> InProgress
    /// - InProgress | Testing | Reviewing         + Complete -> Completed
    /// - any non-terminal                         + Fail     -> Failed
    /// - any non-terminal                         + Cancel   -> Cancelled
    pub fn transition(&mut self, event: BuildTransition) -> Result<BuildStatus, StateMachineError> {
        let next = Self::next(self.current, event).ok_or(StateMachineError::InvalidTransition {
            state: self.current,
            event,
        })?;

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "build state transition");
        Ok(next)
    }

    pub fn can_transition(&self, event: BuildTransition) -> bool {
        Self::next(self.current, event).is_some()
    }

    fn next(state: BuildStatus, event: BuildTransition) -> Option<BuildStatus> {
        use BuildStatus as S;
        use BuildTransition as E;

        let next = match (state, event) {
            (S::Pending, E::Plan) => S::Planning,
            (S::Planning | S::InProgress, E::Start) => S::InProgress,
            (S::InProgress | S::Testing | S::Reviewing, E::Test) => S::Testing,
            (S::InProgress | S::Testing | S::Reviewing, E::Review) => S::Reviewing,
            (S::Planning | S::InProgress | S::Testing | S::Reviewing, E::Rollback) => S::InProgress,
            (S::InProgress | S::Testing | S::Reviewing, E::Complete) => S::Completed,
            (s, E::Fail) if !s.is_terminal() => S::Failed,
            (s, E::Cancel) if !s.is_terminal() => S::Cancelled,
            _ => return None,
        };
        Some(next)
    }
}

impl Default for BuildStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `event` to a build's stored status, stamping `completed_at` when the
/// build becomes terminal.
pub fn advance(build: &mut Build, event: BuildTransition) -> Result<BuildStatus, StateMachineError> {
    let mut sm = BuildStateMachine::at(build.status);
    let next = sm.transition(event)?;
    build.status = next;
    if next.is_terminal() && build.completed_at.is_none() {
        build.completed_at = Some(chrono::Utc::now());
    }
    build.touch();
    Ok(next)
}

/// Like [`advance`], but a no-op when the build is already in `target`.
pub fn advance_to_phase(
    build: &mut Build,
    target: BuildStatus,
) -> Result<BuildStatus, StateMachineError> {
    if build.status == target {
        return Ok(target);
    }
    let event = match target {
        BuildStatus::Testing => BuildTransition::Test,
        BuildStatus::Reviewing => BuildTransition::Review,
        _ => BuildTransition::Start,
    };
    advance(build, event)
}
