//! Rollback models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pre-deployment checkpoint of one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackSnapshot {
    pub snapshot_id: String,
    pub deployment_id: String,
    pub target_id: String,
    pub timestamp: DateTime<Utc>,
    pub new_configuration: serde_json::Value,
    #[serde(default)]
    pub previous_configuration: Option<serde_json::Value>,
    /// SHA256 of `new_configuration`
    pub checksum: String,
    #[serde(default)]
    pub backup_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackTrigger {
    Manual,
    Automatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RollbackStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RollbackStatus::Completed | RollbackStatus::Failed)
    }
}

/// Per-target rollback outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRollbackResult {
    pub target_id: String,
    pub snapshot_id: String,
    pub success: bool,
    pub message: String,
}

/// One rollback execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackOperation {
    pub operation_id: String,
    pub deployment_id: String,
    pub trigger: RollbackTrigger,
    pub status: RollbackStatus,
    #[serde(default)]
    pub reason: Option<String>,
    pub processed_targets: usize,
    pub failed_targets: usize,
    pub snapshots: Vec<String>,
    pub results: Vec<TargetRollbackResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}
