//! Finite State Machine for the rollout lifecycle

use crate::models::deployment::DeploymentStatus;

/// Lifecycle transition request
#[derive(Debug, Clone)]
pub enum Transition {
    /// Begin pre-flight validation
    Validate,

    /// Validation passed, start issuing batches
    StartDeploy,

    /// All batches settled, run verification
    Verify,

    /// Verification finished
    Complete,

    /// Unrecoverable failure
    Fail(String),

    /// Revert deployed targets
    RollBack,

    /// Rollback operation succeeded
    RollbackComplete,

    /// Rollback operation failed
    RollbackFailed(String),

    /// Operator cancellation
    Cancel,
}

/// Rollout FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentStatus,
    error: Option<String>,
    history: Vec<DeploymentStatus>,
}

impl DeploymentFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            state: DeploymentStatus::Pending,
            error: None,
            history: vec![DeploymentStatus::Pending],
        }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentStatus {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// States visited so far, oldest first
    pub fn history(&self) -> &[DeploymentStatus] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Process a transition
    pub fn process(&mut self, transition: Transition) -> Result<DeploymentStatus, String> {
        use DeploymentStatus as S;

        let new_state = match (self.state, &transition) {
            (S::Pending, Transition::Validate) => S::Validating,

            (S::Validating, Transition::StartDeploy) => S::Deploying,
            (S::Validating, Transition::Fail(err)) => {
                self.error = Some(err.clone());
                S::Failed
            }

            (S::Deploying, Transition::Verify) => S::Verifying,
            (S::Deploying, Transition::RollBack) => S::RollingBack,
            (S::Deploying, Transition::Fail(err)) => {
                self.error = Some(err.clone());
                S::Failed
            }

            (S::Verifying, Transition::Complete) => S::Completed,
            (S::Verifying, Transition::Fail(err)) => {
                self.error = Some(err.clone());
                S::Failed
            }

            (S::RollingBack, Transition::RollbackComplete) => S::RolledBack,
            (S::RollingBack, Transition::RollbackFailed(err)) => {
                self.error = Some(err.clone());
                S::Failed
            }

            (state, Transition::Cancel) if !state.is_terminal() => S::Cancelled,

            (state, transition) => {
                return Err(format!(
                    "Invalid transition: {:?} -> {:?}",
                    state, transition
                ));
            }
        };

        self.state = new_state;
        self.history.push(new_state);
        Ok(new_state)
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
