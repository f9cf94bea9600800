//! Deployment lifecycle events and the observer seam

use async_trait::async_trait;
use serde::Serialize;

use crate::logs::LogLevel;
use crate::models::deployment::{DeploymentProgress, DistributionResult, RolloutType};
use crate::models::rollback::RollbackOperation;

/// Something that happened during a rollout
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum LifecycleEvent {
    Started {
        deployment_id: String,
        total_targets: usize,
        rollout_type: RolloutType,
    },
    Progress(DeploymentProgress),
    TargetFinished {
        deployment_id: String,
        target_id: String,
        success: bool,
        duration_ms: u64,
    },
    Log {
        deployment_id: String,
        target_id: Option<String>,
        level: LogLevel,
        message: String,
    },
    Completed {
        deployment_id: String,
        result: Box<DistributionResult>,
    },
    Failed {
        deployment_id: String,
        error: String,
    },
    Cancelled {
        deployment_id: String,
    },
    RolledBack {
        deployment_id: String,
        operation: Box<RollbackOperation>,
    },
}

impl LifecycleEvent {
    /// Event name used by notifiers
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Started { .. } => "deployment-started",
            LifecycleEvent::Progress(_) => "deployment-progress",
            LifecycleEvent::TargetFinished { .. } => "target-finished",
            LifecycleEvent::Log { .. } => "deployment-log",
            LifecycleEvent::Completed { .. } => "deployment-completed",
            LifecycleEvent::Failed { .. } => "deployment-failed",
            LifecycleEvent::Cancelled { .. } => "deployment-cancelled",
            LifecycleEvent::RolledBack { .. } => "deployment-rolled-back",
        }
    }

    pub fn deployment_id(&self) -> &str {
        match self {
            LifecycleEvent::Progress(progress) => &progress.deployment_id,
            LifecycleEvent::Started { deployment_id, .. }
            | LifecycleEvent::TargetFinished { deployment_id, .. }
            | LifecycleEvent::Log { deployment_id, .. }
            | LifecycleEvent::Completed { deployment_id, .. }
            | LifecycleEvent::Failed { deployment_id, .. }
            | LifecycleEvent::Cancelled { deployment_id }
            | LifecycleEvent::RolledBack { deployment_id, .. } => deployment_id,
        }
    }
}

/// Receives lifecycle events from the deployer.
///
/// Events of one deployment are delivered in order from a single task.
#[async_trait]
pub trait DeploymentObserver: Send + Sync {
    async fn on_event(&self, event: &LifecycleEvent);
}
