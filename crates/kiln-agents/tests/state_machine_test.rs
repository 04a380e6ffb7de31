use kiln_agents::state_machine::{
    advance, advance_to_phase, BuildStateMachine, BuildTransition, StateMachineError,
};
use kiln_core::types::{Build, BuildRequest, BuildStatus};

fn new_build() -> Build {
    Build::new(1, &BuildRequest::new("todo list app"))
}

#[test]
fn happy_path_pending_to_completed() {
    let mut sm = BuildStateMachine::new();
    assert_eq!(sm.state(), BuildStatus::Pending);

    sm.transition(BuildTransition::Plan).unwrap(); // Pending -> Planning
    sm.transition(BuildTransition::Start).unwrap(); // Planning -> InProgress
    sm.transition(BuildTransition::Test).unwrap(); // InProgress -> Testing
    sm.transition(BuildTransition::Review).unwrap(); // Testing -> Reviewing
    let s = sm.transition(BuildTransition::Complete).unwrap();
    assert_eq!(s, BuildStatus::Completed);
    assert_eq!(sm.history().len(), 5);
}

#[test]
fn planning_cannot_complete_directly() {
    let mut sm = BuildStateMachine::at(BuildStatus::Planning);
    let err = sm.transition(BuildTransition::Complete).unwrap_err();
    assert_eq!(
        err,
        StateMachineError::InvalidTransition {
            state: BuildStatus::Planning,
            event: BuildTransition::Complete,
        }
    );
    // Rejected transitions leave the state untouched.
    assert_eq!(sm.state(), BuildStatus::Planning);
    assert!(sm.history().is_empty());
}

#[test]
fn terminal_states_reject_everything() {
    for terminal in [BuildStatus::Completed, BuildStatus::Failed, BuildStatus::Cancelled] {
        let sm = BuildStateMachine::at(terminal);
        for event in [
            BuildTransition::Plan,
            BuildTransition::Start,
            BuildTransition::Test,
            BuildTransition::Review,
            BuildTransition::Rollback,
            BuildTransition::Complete,
            BuildTransition::Fail,
            BuildTransition::Cancel,
        ] {
            assert!(!sm.can_transition(event), "{terminal} accepted {event}");
        }
    }
}

#[test]
fn fail_and_cancel_from_any_active_state() {
    for status in [
        BuildStatus::Pending,
        BuildStatus::Planning,
        BuildStatus::InProgress,
        BuildStatus::Testing,
        BuildStatus::Reviewing,
    ] {
        assert!(BuildStateMachine::at(status).can_transition(BuildTransition::Fail));
        assert!(BuildStateMachine::at(status).can_transition(BuildTransition::Cancel));
    }
}

#[test]
fn rollback_returns_to_in_progress() {
    let mut sm = BuildStateMachine::at(BuildStatus::Reviewing);
    assert_eq!(sm.transition(BuildTransition::Rollback).unwrap(), BuildStatus::InProgress);
    assert!(!BuildStateMachine::new().can_transition(BuildTransition::Rollback));
}

#[test]
fn advance_stamps_completion_time() {
    let mut build = new_build();
    advance(&mut build, BuildTransition::Plan).unwrap();
    assert!(build.completed_at.is_none());
    advance(&mut build, BuildTransition::Fail).unwrap();
    assert_eq!(build.status, BuildStatus::Failed);
    assert!(build.completed_at.is_some());
}

#[test]
fn advance_to_phase_is_idempotent() {
    let mut build = new_build();
    advance(&mut build, BuildTransition::Plan).unwrap();
    advance(&mut build, BuildTransition::Start).unwrap();

    assert_eq!(advance_to_phase(&mut build, BuildStatus::InProgress).unwrap(), BuildStatus::InProgress);
    assert_eq!(advance_to_phase(&mut build, BuildStatus::Testing).unwrap(), BuildStatus::Testing);
    assert_eq!(advance_to_phase(&mut build, BuildStatus::Testing).unwrap(), BuildStatus::Testing);
    assert_eq!(advance_to_phase(&mut build, BuildStatus::Reviewing).unwrap(), BuildStatus::Reviewing);
}

#[test]
fn advance_rejects_without_touching_status() {
    let mut build = new_build();
    assert!(advance(&mut build, BuildTransition::Complete).is_err());
    assert_eq!(build.status, BuildStatus::Pending);
}
