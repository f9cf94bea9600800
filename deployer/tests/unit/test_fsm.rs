//! FSM unit tests

use policy_deployer::deploy::fsm::{DeploymentFsm, Transition};
use policy_deployer::models::deployment::DeploymentStatus;

#[test]
fn test_fsm_initial_state() {
    let fsm = DeploymentFsm::new();
    assert_eq!(fsm.state(), DeploymentStatus::Pending);
    assert!(fsm.error().is_none());
    assert!(!fsm.is_terminal());
}

#[test]
fn test_fsm_success_flow() {
    let mut fsm = DeploymentFsm::new();

    fsm.process(Transition::Validate).unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::Validating);

    fsm.process(Transition::StartDeploy).unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::Deploying);

    fsm.process(Transition::Verify).unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::Verifying);

    fsm.process(Transition::Complete).unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::Completed);
    assert!(fsm.is_terminal());
}

#[test]
fn test_fsm_rollback_flow() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(Transition::Validate).unwrap();
    fsm.process(Transition::StartDeploy).unwrap();

    fsm.process(Transition::RollBack).unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::RollingBack);

    fsm.process(Transition::RollbackComplete).unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::RolledBack);
    assert!(fsm.is_terminal());
}

#[test]
fn test_fsm_failed_rollback_records_error() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(Transition::Validate).unwrap();
    fsm.process(Transition::StartDeploy).unwrap();
    fsm.process(Transition::RollBack).unwrap();
    fsm.process(Transition::RollbackFailed("store unreachable".to_string()))
        .unwrap();

    assert_eq!(fsm.state(), DeploymentStatus::Failed);
    assert_eq!(fsm.error(), Some("store unreachable"));
}

#[test]
fn test_fsm_cancel_from_any_running_state() {
    for steps in 0..4 {
        let mut fsm = DeploymentFsm::new();
        let path = [Transition::Validate, Transition::StartDeploy, Transition::Verify];
        for step in path.into_iter().take(steps) {
            fsm.process(step).unwrap();
        }
        assert_eq!(fsm.process(Transition::Cancel).unwrap(), DeploymentStatus::Cancelled);
    }
}

#[test]
fn test_fsm_terminal_states_are_final() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(Transition::Validate).unwrap();
    fsm.process(Transition::Cancel).unwrap();

    assert!(fsm.process(Transition::Cancel).is_err());
    assert!(fsm.process(Transition::StartDeploy).is_err());
    assert_eq!(fsm.state(), DeploymentStatus::Cancelled);
}

#[test]
fn test_fsm_invalid_transition() {
    let mut fsm = DeploymentFsm::new();

    // Cannot complete without deploying
    let result = fsm.process(Transition::Complete);
    assert!(result.is_err());
    assert_eq!(fsm.state(), DeploymentStatus::Pending);
}

#[test]
fn test_fsm_history() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(Transition::Validate).unwrap();
    fsm.process(Transition::StartDeploy).unwrap();
    fsm.process(Transition::Fail("threshold".to_string())).unwrap();

    assert_eq!(
        fsm.history(),
        &[
            DeploymentStatus::Pending,
            DeploymentStatus::Validating,
            DeploymentStatus::Deploying,
            DeploymentStatus::Failed,
        ]
    );
}
