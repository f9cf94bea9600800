//! Local filesystem strategy
//!
//! Writes the policy payload as JSON to the path in a `local` connection
//! config. Useful for workstation agents that pick the file up themselves and
//! as the reference implementation of the strategy contract.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::errors::DeployerError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::models::target::{ConnectionConfig, DistributionTarget};
use crate::strategy::{
    DeploymentStrategy, StrategyContext, StrategyOutcome, StrategyStatus, TargetDeployState,
};
use crate::utils::json_checksum;

pub const LOCAL_STRATEGY: &str = "local";

#[derive(Debug, Clone)]
struct TargetRecord {
    deployment_id: String,
    state: TargetDeployState,
    message: String,
}

/// Strategy writing payloads to local files
pub struct LocalFileStrategy {
    records: RwLock<HashMap<String, TargetRecord>>,
}

impl LocalFileStrategy {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    fn policy_file(target: &DistributionTarget) -> Result<File, DeployerError> {
        match &target.connection {
            ConnectionConfig::Local { path } => Ok(File::new(path)),
            other => Err(DeployerError::ConfigError(format!(
                "target {} has a '{}' connection, the local strategy needs 'local'",
                target.id,
                other.kind()
            ))),
        }
    }

    fn record(&self, target_id: &str, deployment_id: &str, state: TargetDeployState, message: &str) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(
            target_id.to_string(),
            TargetRecord {
                deployment_id: deployment_id.to_string(),
                state,
                message: message.to_string(),
            },
        );
    }
}

impl Default for LocalFileStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeploymentStrategy for LocalFileStrategy {
    fn key(&self) -> &str {
        LOCAL_STRATEGY
    }

    async fn deploy(
        &self,
        target: &DistributionTarget,
        payload: &serde_json::Value,
        ctx: &StrategyContext,
    ) -> StrategyOutcome {
        let file = match Self::policy_file(target) {
            Ok(file) => file,
            Err(e) => return StrategyOutcome::failed("Invalid connection config", e.to_string()),
        };

        if ctx.cancel.is_cancelled() {
            return StrategyOutcome::failed("Deployment cancelled", "cancelled before write");
        }

        self.record(&target.id, &ctx.deployment_id, TargetDeployState::InProgress, "writing");
        ctx.reporter.progress(25, format!("Writing policy to {}", file.path().display()));

        match file.write_json(payload).await {
            Ok(()) => {
                let checksum = json_checksum(payload);
                let message = format!("Policy written to {}", file.path().display());
                self.record(&target.id, &ctx.deployment_id, TargetDeployState::Deployed, &message);
                ctx.reporter.progress(100, message.clone());
                debug!(target_id = %target.id, "Local policy write complete");
                StrategyOutcome::ok(message).with_metadata(serde_json::json!({
                    "path": file.path().display().to_string(),
                    "checksum": checksum,
                }))
            }
            Err(e) => {
                self.record(&target.id, &ctx.deployment_id, TargetDeployState::Failed, &e.to_string());
                ctx.reporter.log(LogLevel::Error, format!("Write failed: {}", e));
                StrategyOutcome::failed("Failed to write policy file", e.to_string())
            }
        }
    }

    async fn validate_connectivity(&self, target: &DistributionTarget) -> Result<(), DeployerError> {
        let file = Self::policy_file(target)?;
        let parent = file
            .path()
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        match tokio::fs::metadata(parent).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(DeployerError::ConnectivityError {
                target_id: target.id.clone(),
                message: format!("{} is not a directory", parent.display()),
            }),
            Err(e) => Err(DeployerError::ConnectivityError {
                target_id: target.id.clone(),
                message: format!("{}: {}", parent.display(), e),
            }),
        }
    }

    async fn rollback(
        &self,
        target: &DistributionTarget,
        deployment_id: &str,
        ctx: &StrategyContext,
    ) -> StrategyOutcome {
        let file = match Self::policy_file(target) {
            Ok(file) => file,
            Err(e) => return StrategyOutcome::failed("Invalid connection config", e.to_string()),
        };

        let result = match &ctx.previous_configuration {
            Some(previous) => file.write_json(previous).await.map(|_| "restored previous policy"),
            None => file.delete().await.map(|_| "removed policy (no previous version)"),
        };

        match result {
            Ok(action) => {
                let message = format!("{} at {}", action, file.path().display());
                info!(target_id = %target.id, "Rollback: {}", message);
                self.record(&target.id, deployment_id, TargetDeployState::RolledBack, &message);
                StrategyOutcome::ok(message)
            }
            Err(e) => StrategyOutcome::failed("Rollback failed", e.to_string()),
        }
    }

    async fn get_status(
        &self,
        target: &DistributionTarget,
        deployment_id: &str,
    ) -> Result<StrategyStatus, DeployerError> {
        let record = {
            let records = self.records.read().unwrap_or_else(|e| e.into_inner());
            records.get(&target.id).cloned()
        };

        if let Some(record) = record.filter(|r| r.deployment_id == deployment_id) {
            let progress = match record.state {
                TargetDeployState::InProgress => 50,
                TargetDeployState::NotDeployed | TargetDeployState::Unknown => 0,
                _ => 100,
            };
            return Ok(StrategyStatus {
                status: record.state,
                progress,
                message: record.message,
            });
        }

        let file = Self::policy_file(target)?;
        let (status, message) = if file.exists().await {
            (TargetDeployState::Unknown, "policy present from another deployment")
        } else {
            (TargetDeployState::NotDeployed, "no policy deployed")
        };
        Ok(StrategyStatus {
            status,
            progress: 0,
            message: message.to_string(),
        })
    }

    async fn current_configuration(
        &self,
        target: &DistributionTarget,
    ) -> Result<Option<serde_json::Value>, DeployerError> {
        Self::policy_file(target)?.read_json_opt().await
    }
}
