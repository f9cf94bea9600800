//! Live progress snapshots per deployment

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::models::deployment::{DeploymentProgress, DeploymentStatus, TargetStatus};
use crate::models::target::DistributionTarget;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Partial update for one target; unset fields are left as they are
#[derive(Debug, Clone, Default)]
pub struct TargetUpdate {
    pub status: Option<TargetStatus>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl TargetUpdate {
    pub fn status(status: TargetStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: u8, message: Option<String>) -> Self {
        Self {
            progress: Some(progress),
            message,
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Holds the current progress snapshot of every known deployment.
///
/// Every mutation recomputes the aggregate counters and publishes the new
/// snapshot to subscribers.
pub struct ProgressTracker {
    deployments: RwLock<HashMap<String, DeploymentProgress>>,
    updates: broadcast::Sender<DeploymentProgress>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            deployments: RwLock::new(HashMap::new()),
            updates,
        }
    }

    /// Start tracking a deployment, replacing any previous snapshot for the id
    pub fn start(&self, deployment_id: &str, targets: &[DistributionTarget]) -> DeploymentProgress {
        let progress = DeploymentProgress::new(deployment_id, targets);
        {
            let mut deployments = self.deployments.write().unwrap_or_else(|e| e.into_inner());
            deployments.insert(deployment_id.to_string(), progress.clone());
        }
        self.publish(&progress);
        progress
    }

    pub fn set_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        message: Option<String>,
    ) -> Option<DeploymentProgress> {
        self.mutate(deployment_id, |progress| {
            progress.status = status;
            if message.is_some() {
                progress.message = message;
            }
            if status.is_terminal() && progress.completed_at.is_none() {
                progress.completed_at = Some(Utc::now());
            }
        })
    }

    pub fn set_batch(
        &self,
        deployment_id: &str,
        current_batch: usize,
        total_batches: usize,
    ) -> Option<DeploymentProgress> {
        self.mutate(deployment_id, |progress| {
            progress.current_batch = current_batch;
            progress.total_batches = total_batches;
        })
    }

    /// Apply an update to one target of a deployment
    pub fn update_target(
        &self,
        deployment_id: &str,
        target_id: &str,
        update: TargetUpdate,
    ) -> Option<DeploymentProgress> {
        self.mutate(deployment_id, |progress| {
            let Some(target) = progress.targets.iter_mut().find(|t| t.target_id == target_id)
            else {
                return;
            };

            if let Some(status) = update.status {
                let now = Utc::now();
                if status != TargetStatus::Pending && target.started_at.is_none() {
                    target.started_at = Some(now);
                }
                if status.is_finished() {
                    target.completed_at = Some(now);
                    target.progress = 100;
                }
                target.status = status;
            }
            if let Some(value) = update.progress {
                // finished targets stay at 100
                if !target.status.is_finished() {
                    target.progress = value.min(100);
                }
            }
            if update.message.is_some() {
                target.message = update.message;
            }
            if update.error.is_some() {
                target.error = update.error;
            }
        })
    }

    pub fn get(&self, deployment_id: &str) -> Option<DeploymentProgress> {
        let deployments = self.deployments.read().unwrap_or_else(|e| e.into_inner());
        deployments.get(deployment_id).cloned()
    }

    /// All snapshots, newest first
    pub fn list(&self) -> Vec<DeploymentProgress> {
        let deployments = self.deployments.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<DeploymentProgress> = deployments.values().cloned().collect();
        list.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        list
    }

    pub fn remove(&self, deployment_id: &str) -> Option<DeploymentProgress> {
        let mut deployments = self.deployments.write().unwrap_or_else(|e| e.into_inner());
        deployments.remove(deployment_id)
    }

    /// Receive every published snapshot; slow receivers skip ahead
    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentProgress> {
        self.updates.subscribe()
    }

    fn mutate(
        &self,
        deployment_id: &str,
        apply: impl FnOnce(&mut DeploymentProgress),
    ) -> Option<DeploymentProgress> {
        let snapshot = {
            let mut deployments = self.deployments.write().unwrap_or_else(|e| e.into_inner());
            let progress = deployments.get_mut(deployment_id)?;
            apply(progress);
            progress.recompute();
            progress.clone()
        };
        self.publish(&snapshot);
        Some(snapshot)
    }

    fn publish(&self, progress: &DeploymentProgress) {
        trace!(
            deployment_id = %progress.deployment_id,
            "progress {}% ({} ok, {} failed, {} running, {} pending)",
            progress.progress,
            progress.successful_targets,
            progress.failed_targets,
            progress.in_progress_targets,
            progress.pending_targets
        );
        // no subscribers is fine
        let _ = self.updates.send(progress.clone());
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
