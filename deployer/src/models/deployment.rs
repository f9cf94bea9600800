//! Deployment models

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DeploymentErrorDetail;
use crate::models::filter::TargetFilter;
use crate::models::health::HealthCheckResult;
use crate::models::rollback::RollbackOperation;
use crate::models::target::DistributionTarget;
use crate::utils::duration_secs;

/// Rollout algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RolloutType {
    #[default]
    Immediate,
    Canary,
    Rolling,
    BlueGreen,
    Staged,
}

impl RolloutType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutType::Immediate => "immediate",
            RolloutType::Canary => "canary",
            RolloutType::Rolling => "rolling",
            RolloutType::BlueGreen => "blue-green",
            RolloutType::Staged => "staged",
        }
    }
}

/// How the rollout proceeds across targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutPolicy {
    #[serde(rename = "type", default)]
    pub rollout_type: RolloutType,
    /// Batch size; also the number of targets deployed concurrently
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-target deploy timeout
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
    /// Maximum tolerated fraction of failed targets
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub auto_rollback: bool,
    /// Treat an unhealthy post-deploy check as a target failure
    #[serde(default)]
    pub fail_on_health_check: bool,
}

fn default_max_concurrency() -> usize {
    10
}

fn default_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_failure_threshold() -> f64 {
    0.1
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            rollout_type: RolloutType::Immediate,
            max_concurrency: default_max_concurrency(),
            timeout: default_timeout(),
            failure_threshold: default_failure_threshold(),
            continue_on_error: false,
            auto_rollback: false,
            fail_on_health_check: false,
        }
    }
}

/// Rollback behaviour for a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Batch size used while restoring targets
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_true")]
    pub create_backups: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> usize {
    3
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            create_backups: true,
        }
    }
}

/// Monitoring behaviour for a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringPolicy {
    /// Run post-deploy and verification health checks
    #[serde(default = "default_true")]
    pub health_checks: bool,
}

impl Default for MonitoringPolicy {
    fn default() -> Self {
        Self {
            health_checks: true,
        }
    }
}

/// A requested rollout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub id: String,
    /// Opaque policy payload
    pub payload: serde_json::Value,
    pub targets: Vec<DistributionTarget>,
    /// Optional narrowing applied before batching
    #[serde(default)]
    pub filters: Vec<TargetFilter>,
    #[serde(default)]
    pub rollout: RolloutPolicy,
    #[serde(default)]
    pub rollback: RollbackPolicy,
    #[serde(default)]
    pub monitoring: MonitoringPolicy,
}

/// Lifecycle state of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    Pending,
    Validating,
    Deploying,
    Verifying,
    RollingBack,
    Completed,
    RolledBack,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Completed
                | DeploymentStatus::RolledBack
                | DeploymentStatus::Failed
                | DeploymentStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Validating => "validating",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Verifying => "verifying",
            DeploymentStatus::RollingBack => "rolling-back",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::RolledBack => "rolled-back",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Cancelled => "cancelled",
        }
    }
}

/// Per-target state inside a rollout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetStatus {
    Pending,
    Deploying,
    Verifying,
    Completed,
    Failed,
}

impl TargetStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TargetStatus::Completed | TargetStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetProgress {
    pub target_id: String,
    pub target_name: String,
    pub status: TargetStatus,
    /// 0-100
    pub progress: u8,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregate rollout state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentProgress {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub total_targets: usize,
    pub successful_targets: usize,
    pub failed_targets: usize,
    pub in_progress_targets: usize,
    pub pending_targets: usize,
    /// floor(mean of per-target progress)
    pub progress: u8,
    pub current_batch: usize,
    pub total_batches: usize,
    pub targets: Vec<TargetProgress>,
    #[serde(default)]
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeploymentProgress {
    pub fn new(deployment_id: impl Into<String>, targets: &[DistributionTarget]) -> Self {
        let now = Utc::now();
        let mut progress = Self {
            deployment_id: deployment_id.into(),
            status: DeploymentStatus::Pending,
            total_targets: targets.len(),
            successful_targets: 0,
            failed_targets: 0,
            in_progress_targets: 0,
            pending_targets: 0,
            progress: 0,
            current_batch: 0,
            total_batches: 0,
            targets: targets
                .iter()
                .map(|t| TargetProgress {
                    target_id: t.id.clone(),
                    target_name: t.name.clone(),
                    status: TargetStatus::Pending,
                    progress: 0,
                    message: None,
                    error: None,
                    started_at: None,
                    completed_at: None,
                })
                .collect(),
            message: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        };
        progress.recompute();
        progress
    }

    /// Recompute aggregate counters from the per-target list
    pub fn recompute(&mut self) {
        self.total_targets = self.targets.len();
        self.successful_targets = 0;
        self.failed_targets = 0;
        self.in_progress_targets = 0;
        self.pending_targets = 0;

        for target in &self.targets {
            match target.status {
                TargetStatus::Completed => self.successful_targets += 1,
                TargetStatus::Failed => self.failed_targets += 1,
                TargetStatus::Deploying | TargetStatus::Verifying => self.in_progress_targets += 1,
                TargetStatus::Pending => self.pending_targets += 1,
            }
        }

        self.progress = if self.targets.is_empty() {
            0
        } else {
            let sum: u64 = self.targets.iter().map(|t| t.progress as u64).sum();
            (sum / self.targets.len() as u64) as u8
        };
        self.updated_at = Utc::now();
    }

    /// Fraction of finished targets that failed
    pub fn failure_rate(&self) -> f64 {
        let processed = self.successful_targets + self.failed_targets;
        if processed == 0 {
            0.0
        } else {
            self.failed_targets as f64 / processed as f64
        }
    }

    pub fn counts_consistent(&self) -> bool {
        self.successful_targets + self.failed_targets + self.in_progress_targets + self.pending_targets
            == self.total_targets
    }
}

/// Outcome of deploying to one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResult {
    pub target_id: String,
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<DeploymentErrorDetail>,
    #[serde(default)]
    pub health_checks: Vec<HealthCheckResult>,
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

/// Final outcome of a rollout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionResult {
    pub deployment_id: String,
    pub success: bool,
    pub status: DeploymentStatus,
    /// "N/M targets successful"
    pub summary: String,
    pub total_targets: usize,
    pub successful_targets: usize,
    pub failed_targets: usize,
    /// Targets never attempted (filtered in but not reached)
    pub pending_targets: usize,
    pub duration_ms: u64,
    pub results: Vec<TargetResult>,
    pub errors: Vec<DeploymentErrorDetail>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub rollback: Option<RollbackOperation>,
}

pub fn summary_line(successful: usize, total: usize) -> String {
    format!("{}/{} targets successful", successful, total)
}
