//! Snapshot capture and restore

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::errors::DeployerError;
use crate::models::deployment::RollbackPolicy;
use crate::models::rollback::{
    RollbackOperation, RollbackSnapshot, RollbackStatus, RollbackTrigger, TargetRollbackResult,
};
use crate::models::target::DistributionTarget;
use crate::rollback::store::{backup_name, SnapshotStore};
use crate::strategy::manager::StrategyManager;
use crate::strategy::StrategyContext;
use crate::targets::manager::TargetManager;
use crate::utils::{generate_id, json_checksum};

/// Rollback service options, used where a deployment brings no
/// [`RollbackPolicy`] of its own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackOptions {
    /// Targets restored concurrently per batch
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Failure rate above which a rollback operation aborts
    #[serde(default = "default_abort_failure_rate")]
    pub abort_failure_rate: f64,
    /// Attempts required before the abort rate is checked
    #[serde(default = "default_abort_min_attempts")]
    pub abort_min_attempts: usize,
    #[serde(default = "default_true")]
    pub create_backups: bool,
}

fn default_max_attempts() -> usize {
    3
}

fn default_abort_failure_rate() -> f64 {
    0.5
}

fn default_abort_min_attempts() -> usize {
    3
}

fn default_true() -> bool {
    true
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            abort_failure_rate: default_abort_failure_rate(),
            abort_min_attempts: default_abort_min_attempts(),
            create_backups: true,
        }
    }
}

/// Captures pre-deployment snapshots and restores them through each
/// target's strategy
pub struct RollbackService {
    store: Arc<dyn SnapshotStore>,
    strategies: Arc<StrategyManager>,
    registry: Option<Arc<TargetManager>>,
    options: RollbackOptions,
    known_targets: RwLock<HashMap<String, DistributionTarget>>,
    operations: RwLock<HashMap<String, RollbackOperation>>,
}

impl RollbackService {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        strategies: Arc<StrategyManager>,
        options: RollbackOptions,
    ) -> Self {
        Self {
            store,
            strategies,
            registry: None,
            options,
            known_targets: RwLock::new(HashMap::new()),
            operations: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve targets not seen by `create_snapshot` through the registry
    pub fn with_target_registry(mut self, registry: Arc<TargetManager>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn options(&self) -> &RollbackOptions {
        &self.options
    }

    fn batch_size(&self, policy: Option<&RollbackPolicy>) -> usize {
        policy
            .map_or(self.options.max_attempts, |p| p.max_attempts)
            .max(1)
    }

    fn create_backups(&self, policy: Option<&RollbackPolicy>) -> bool {
        policy.map_or(self.options.create_backups, |p| p.create_backups)
    }

    fn remember(&self, target: &DistributionTarget) {
        let mut known = self.known_targets.write().unwrap_or_else(|e| e.into_inner());
        known.insert(target.id.clone(), target.clone());
    }

    fn lookup_target(&self, target_id: &str) -> Option<DistributionTarget> {
        let known = {
            let known = self.known_targets.read().unwrap_or_else(|e| e.into_inner());
            known.get(target_id).cloned()
        };
        known.or_else(|| self.registry.as_ref().and_then(|r| r.get(target_id)))
    }

    /// Capture the target's current configuration before deploying
    /// `new_configuration`.
    ///
    /// Reading the current configuration is best-effort; a target without one
    /// (first deployment) yields `previous_configuration = None`. A backup
    /// artifact is written only when the policy asks for one.
    pub async fn create_snapshot(
        &self,
        deployment_id: &str,
        target: &DistributionTarget,
        new_configuration: &serde_json::Value,
        policy: Option<&RollbackPolicy>,
    ) -> Result<RollbackSnapshot, DeployerError> {
        let previous_configuration = match self.strategies.for_target(target) {
            Ok(strategy) => match strategy.current_configuration(target).await {
                Ok(current) => current,
                Err(e) => {
                    warn!(target_id = %target.id, "Could not read current configuration: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!(target_id = %target.id, "{}", e);
                None
            }
        };

        let snapshot_id = generate_id("snap");
        let backup_path = match (&previous_configuration, self.create_backups(policy)) {
            (Some(previous), true) => Some(
                self.store
                    .put_backup(&backup_name(&target.id, &snapshot_id), previous)
                    .await?,
            ),
            _ => None,
        };

        let snapshot = RollbackSnapshot {
            snapshot_id,
            deployment_id: deployment_id.to_string(),
            target_id: target.id.clone(),
            timestamp: Utc::now(),
            new_configuration: new_configuration.clone(),
            previous_configuration,
            checksum: json_checksum(new_configuration),
            backup_path,
        };

        self.store.put(&snapshot).await?;
        self.remember(target);
        debug!(
            deployment_id = %deployment_id,
            target_id = %target.id,
            "Created snapshot {}",
            snapshot.snapshot_id
        );
        Ok(snapshot)
    }

    /// Check that a snapshot can be trusted: the checksum matches the stored
    /// configuration and any backup artifact still exists
    pub async fn validate_snapshot(&self, snapshot: &RollbackSnapshot) -> Result<(), DeployerError> {
        let actual = json_checksum(&snapshot.new_configuration);
        if actual != snapshot.checksum {
            return Err(DeployerError::SnapshotIntegrityError {
                snapshot_id: snapshot.snapshot_id.clone(),
                reason: format!("checksum mismatch (expected {}, got {})", snapshot.checksum, actual),
            });
        }
        if let Some(path) = &snapshot.backup_path {
            if !self.store.backup_exists(path).await {
                return Err(DeployerError::SnapshotIntegrityError {
                    snapshot_id: snapshot.snapshot_id.clone(),
                    reason: format!("backup artifact {} is missing", path),
                });
            }
        }
        Ok(())
    }

    pub async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<RollbackSnapshot>, DeployerError> {
        self.store.get(snapshot_id).await
    }

    /// Snapshots of one deployment, oldest first
    pub async fn list_snapshots(&self, deployment_id: &str) -> Result<Vec<RollbackSnapshot>, DeployerError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|s| s.deployment_id == deployment_id)
            .collect())
    }

    /// Latest snapshot per target, optionally restricted to `target_ids`
    async fn latest_snapshots(
        &self,
        deployment_id: &str,
        target_ids: Option<&[String]>,
    ) -> Result<Vec<RollbackSnapshot>, DeployerError> {
        let mut latest: HashMap<String, RollbackSnapshot> = HashMap::new();
        for snapshot in self.list_snapshots(deployment_id).await? {
            if target_ids.is_some_and(|ids| !ids.contains(&snapshot.target_id)) {
                continue;
            }
            match latest.get(&snapshot.target_id) {
                Some(existing) if existing.timestamp > snapshot.timestamp => {}
                _ => {
                    latest.insert(snapshot.target_id.clone(), snapshot);
                }
            }
        }
        let mut snapshots: Vec<RollbackSnapshot> = latest.into_values().collect();
        snapshots.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        Ok(snapshots)
    }

    /// Restore every target of a deployment from its latest snapshot,
    /// `policy.max_attempts` targets at a time
    pub async fn rollback(
        &self,
        deployment_id: &str,
        trigger: RollbackTrigger,
        reason: Option<String>,
        policy: Option<&RollbackPolicy>,
    ) -> RollbackOperation {
        self.run_operation(deployment_id, None, trigger, reason, self.batch_size(policy))
            .await
    }

    /// Operator-initiated rollback of a subset of targets
    pub async fn trigger_rollback(
        &self,
        deployment_id: &str,
        target_ids: &[String],
        reason: Option<String>,
        policy: Option<&RollbackPolicy>,
    ) -> RollbackOperation {
        let scope = (!target_ids.is_empty()).then_some(target_ids);
        self.run_operation(
            deployment_id,
            scope,
            RollbackTrigger::Manual,
            reason,
            self.batch_size(policy),
        )
        .await
    }

    async fn run_operation(
        &self,
        deployment_id: &str,
        target_ids: Option<&[String]>,
        trigger: RollbackTrigger,
        reason: Option<String>,
        batch_size: usize,
    ) -> RollbackOperation {
        let mut operation = RollbackOperation {
            operation_id: generate_id("rb"),
            deployment_id: deployment_id.to_string(),
            trigger,
            status: RollbackStatus::Pending,
            reason,
            processed_targets: 0,
            failed_targets: 0,
            snapshots: Vec::new(),
            results: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        };
        self.save_operation(&operation);

        info!(
            deployment_id = %deployment_id,
            "Starting {:?} rollback {}",
            trigger,
            operation.operation_id
        );

        let snapshots = match self.latest_snapshots(deployment_id, target_ids).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!(deployment_id = %deployment_id, "Failed to load snapshots: {}", e);
                operation.status = RollbackStatus::Failed;
                operation.error = Some(e.to_string());
                operation.completed_at = Some(Utc::now());
                self.save_operation(&operation);
                return operation;
            }
        };

        operation.status = RollbackStatus::InProgress;
        operation.snapshots = snapshots.iter().map(|s| s.snapshot_id.clone()).collect();
        self.save_operation(&operation);

        for batch in snapshots.chunks(batch_size) {
            let results = join_all(batch.iter().map(|s| self.restore_target(s))).await;
            for result in results {
                operation.processed_targets += 1;
                if !result.success {
                    operation.failed_targets += 1;
                }
                operation.results.push(result);
            }
            self.save_operation(&operation);

            if self.should_abort(operation.failed_targets, operation.processed_targets) {
                let message = format!(
                    "aborted after {}/{} target rollbacks failed",
                    operation.failed_targets, operation.processed_targets
                );
                warn!(deployment_id = %deployment_id, "Rollback {}", message);
                operation.error = Some(message);
                break;
            }
        }

        operation.status = if operation.error.is_none() && operation.failed_targets == 0 {
            RollbackStatus::Completed
        } else {
            if operation.error.is_none() {
                operation.error = Some(format!(
                    "{} of {} target rollbacks failed",
                    operation.failed_targets, operation.processed_targets
                ));
            }
            RollbackStatus::Failed
        };
        operation.completed_at = Some(Utc::now());
        self.save_operation(&operation);

        info!(
            deployment_id = %deployment_id,
            "Rollback {} {:?}: {}/{} targets restored",
            operation.operation_id,
            operation.status,
            operation.processed_targets - operation.failed_targets,
            operation.processed_targets
        );
        operation
    }

    fn should_abort(&self, failed: usize, processed: usize) -> bool {
        processed >= self.options.abort_min_attempts
            && processed > 0
            && failed as f64 / processed as f64 > self.options.abort_failure_rate
    }

    async fn restore_target(&self, snapshot: &RollbackSnapshot) -> TargetRollbackResult {
        let result = |success: bool, message: String| TargetRollbackResult {
            target_id: snapshot.target_id.clone(),
            snapshot_id: snapshot.snapshot_id.clone(),
            success,
            message,
        };

        if let Err(e) = self.validate_snapshot(snapshot).await {
            error!(target_id = %snapshot.target_id, "{}", e);
            return result(false, e.to_string());
        }

        let Some(target) = self.lookup_target(&snapshot.target_id) else {
            return result(false, format!("unknown target {}", snapshot.target_id));
        };
        let strategy = match self.strategies.for_target(&target) {
            Ok(strategy) => strategy,
            Err(e) => return result(false, e.to_string()),
        };

        let mut ctx = StrategyContext::new(&snapshot.deployment_id, &target.id);
        ctx.previous_configuration = snapshot.previous_configuration.clone();

        let outcome = strategy.rollback(&target, &snapshot.deployment_id, &ctx).await;
        if outcome.success {
            result(true, outcome.message)
        } else {
            let message = match outcome.error {
                Some(error) => format!("{}: {}", outcome.message, error),
                None => outcome.message,
            };
            warn!(target_id = %target.id, "Rollback failed: {}", message);
            result(false, message)
        }
    }

    fn save_operation(&self, operation: &RollbackOperation) {
        let mut operations = self.operations.write().unwrap_or_else(|e| e.into_inner());
        operations.insert(operation.operation_id.clone(), operation.clone());
    }

    pub fn get_operation(&self, operation_id: &str) -> Option<RollbackOperation> {
        let operations = self.operations.read().unwrap_or_else(|e| e.into_inner());
        operations.get(operation_id).cloned()
    }

    /// Operations, newest first, optionally for one deployment
    pub fn list_operations(&self, deployment_id: Option<&str>) -> Vec<RollbackOperation> {
        let operations = self.operations.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<RollbackOperation> = operations
            .values()
            .filter(|op| deployment_id.is_none_or(|id| op.deployment_id == id))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        list
    }

    /// Delete snapshots (and their backups) older than `older_than`
    pub async fn cleanup_snapshots(&self, older_than: Duration) -> Result<usize, DeployerError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| DeployerError::ConfigError(e.to_string()))?;

        let mut removed = 0;
        for snapshot in self.store.list().await? {
            if snapshot.timestamp >= cutoff {
                continue;
            }
            if let Some(path) = &snapshot.backup_path {
                self.store.delete_backup(path).await?;
            }
            if self.store.delete(&snapshot.snapshot_id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} snapshots older than {}", removed, cutoff);
        }
        Ok(removed)
    }
}
