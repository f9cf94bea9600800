//! Error types for the policy deployer

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the policy deployer
#[derive(Error, Debug)]
pub enum DeployerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Target {target_id} is unreachable: {message}")]
    ConnectivityError { target_id: String, message: String },

    #[error("Deployment error on {}: {}", .0.target_id, .0.message)]
    DeploymentError(DeploymentErrorDetail),

    #[error("Health check failed: {0}")]
    HealthCheckFailure(String),

    #[error(
        "Failure threshold exceeded during {stage}: {failed}/{processed} targets failed (threshold {threshold})"
    )]
    ThresholdExceeded {
        stage: String,
        failed: usize,
        processed: usize,
        threshold: f64,
        rolled_back: bool,
    },

    #[error("Rollback error: {0}")]
    RollbackError(String),

    #[error("Snapshot {snapshot_id} failed integrity check: {reason}")]
    SnapshotIntegrityError { snapshot_id: String, reason: String },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for DeployerError {
    fn from(err: anyhow::Error) -> Self {
        DeployerError::Internal(err.to_string())
    }
}

/// Machine-readable failure codes attached to per-target errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectivityFailed,
    DeployFailed,
    Timeout,
    StrategyNotFound,
    SnapshotFailed,
    HealthCheckFailed,
    Cancelled,
    TaskPanicked,
}

impl ErrorCode {
    /// Operator-facing remediation hints for this failure class
    pub fn suggestions(&self) -> Vec<String> {
        let hints: &[&str] = match self {
            ErrorCode::ConnectivityFailed => &[
                "Verify the target host is reachable from the orchestrator",
                "Check credentials and connection settings for the target",
            ],
            ErrorCode::DeployFailed => &[
                "Inspect the strategy output for the failing target",
                "Retry the deployment for this target once the cause is fixed",
            ],
            ErrorCode::Timeout => &[
                "Increase the rollout timeout",
                "Check whether the target is overloaded or slow to respond",
            ],
            ErrorCode::StrategyNotFound => &[
                "Register a strategy for the target's strategy key",
                "Correct the strategy key in the target record",
            ],
            ErrorCode::SnapshotFailed => &[
                "Check free space and permissions on the snapshot storage directory",
            ],
            ErrorCode::HealthCheckFailed => &[
                "Review the health check endpoint and criteria",
                "Confirm the deployed policy is being loaded by the target",
            ],
            ErrorCode::Cancelled => &["Re-run the deployment if the cancellation was unintended"],
            ErrorCode::TaskPanicked => &[
                "Report the failure to the strategy maintainers",
                "Retry the deployment for this target",
            ],
        };
        hints.iter().map(|h| h.to_string()).collect()
    }
}

/// Structured per-target error with remediation suggestions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentErrorDetail {
    pub target_id: String,
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl DeploymentErrorDetail {
    pub fn new(target_id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            code,
            message: message.into(),
            details: None,
            suggestions: code.suggestions(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
