//! Transport strategy contract
//!
//! A strategy knows how to push a policy payload to one class of target
//! (ssh hosts, containers, git repositories, ...). The orchestrator only talks
//! to targets through this trait.

pub mod local;
pub mod manager;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::deploy::cancel::CancelToken;
use crate::errors::DeployerError;
use crate::logs::LogLevel;
use crate::models::deployment::RolloutType;
use crate::models::target::DistributionTarget;
use crate::utils::BackoffPolicy;

/// Retry policy handed to strategies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Message sent from a strategy back to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyUpdate {
    Progress {
        target_id: String,
        progress: u8,
        message: Option<String>,
    },
    Log {
        target_id: String,
        level: LogLevel,
        message: String,
    },
}

/// Progress and log sink for one target
#[derive(Debug, Clone)]
pub struct StrategyReporter {
    target_id: String,
    tx: Option<mpsc::UnboundedSender<StrategyUpdate>>,
}

impl StrategyReporter {
    pub fn new(target_id: impl Into<String>, tx: mpsc::UnboundedSender<StrategyUpdate>) -> Self {
        Self {
            target_id: target_id.into(),
            tx: Some(tx),
        }
    }

    /// Reporter that drops every message
    pub fn disabled(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            tx: None,
        }
    }

    pub fn progress(&self, progress: u8, message: impl Into<String>) {
        self.send(StrategyUpdate::Progress {
            target_id: self.target_id.clone(),
            progress: progress.min(100),
            message: Some(message.into()),
        });
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.send(StrategyUpdate::Log {
            target_id: self.target_id.clone(),
            level,
            message: message.into(),
        });
    }

    fn send(&self, update: StrategyUpdate) {
        if let Some(tx) = &self.tx {
            // receiver gone means the rollout finished; late updates are dropped
            let _ = tx.send(update);
        }
    }
}

/// Everything a strategy call needs besides the target itself
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub deployment_id: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub rollout_type: RolloutType,
    /// Configuration to restore; set for rollback calls only
    pub previous_configuration: Option<serde_json::Value>,
    pub cancel: CancelToken,
    pub reporter: StrategyReporter,
}

impl StrategyContext {
    pub fn new(deployment_id: impl Into<String>, target_id: &str) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            rollout_type: RolloutType::Immediate,
            previous_configuration: None,
            cancel: CancelToken::new(),
            reporter: StrategyReporter::disabled(target_id),
        }
    }
}

/// Structured result of a deploy or rollback call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl StrategyOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            metadata: None,
        }
    }

    pub fn failed(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetDeployState {
    NotDeployed,
    InProgress,
    Deployed,
    RolledBack,
    Failed,
    Unknown,
}

/// Answer to `get_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyStatus {
    pub status: TargetDeployState,
    pub progress: u8,
    pub message: String,
}

/// Transport implementation for one class of target.
///
/// `deploy` and `rollback` report failures inside [`StrategyOutcome`];
/// `Err` is reserved for the orchestrator-facing calls.
#[async_trait]
pub trait DeploymentStrategy: Send + Sync {
    /// Registry key
    fn key(&self) -> &str;

    async fn deploy(
        &self,
        target: &DistributionTarget,
        payload: &serde_json::Value,
        ctx: &StrategyContext,
    ) -> StrategyOutcome;

    /// Fail fast when the target is unreachable
    async fn validate_connectivity(&self, target: &DistributionTarget) -> Result<(), DeployerError>;

    async fn rollback(
        &self,
        target: &DistributionTarget,
        deployment_id: &str,
        ctx: &StrategyContext,
    ) -> StrategyOutcome;

    async fn get_status(
        &self,
        target: &DistributionTarget,
        deployment_id: &str,
    ) -> Result<StrategyStatus, DeployerError>;

    /// Configuration currently deployed on the target, if the transport can read it
    async fn current_configuration(
        &self,
        _target: &DistributionTarget,
    ) -> Result<Option<serde_json::Value>, DeployerError> {
        Ok(None)
    }
}
