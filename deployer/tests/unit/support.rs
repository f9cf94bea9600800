//! Shared fixtures for the integration tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use policy_deployer::deploy::executor::{DeployerOptions, DeployerServices, EnterpriseDeployer};
use policy_deployer::errors::DeployerError;
use policy_deployer::health::checker::HealthChecker;
use policy_deployer::models::deployment::{DeploymentConfig, RolloutPolicy};
use policy_deployer::models::target::{ConnectionConfig, DistributionTarget, TargetType};
use policy_deployer::monitoring::events::{DeploymentObserver, LifecycleEvent};
use policy_deployer::progress::tracker::ProgressTracker;
use policy_deployer::rollback::service::{RollbackOptions, RollbackService};
use policy_deployer::rollback::store::InMemorySnapshotStore;
use policy_deployer::strategy::manager::StrategyManager;
use policy_deployer::strategy::{
    DeploymentStrategy, StrategyContext, StrategyOutcome, StrategyStatus, TargetDeployState,
};
use policy_deployer::targets::filter::FilterEngine;

pub const SCRIPTED: &str = "scripted";

/// Strategy whose per-target behaviour is set up front
#[derive(Default)]
pub struct ScriptedStrategy {
    pub fail: HashSet<String>,
    pub panic_on: HashSet<String>,
    pub unreachable: HashSet<String>,
    pub delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    deployed: Mutex<Vec<String>>,
    rolled_back: Mutex<Vec<String>>,
}

impl ScriptedStrategy {
    pub fn failing(ids: &[&str]) -> Self {
        Self {
            fail: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn deployed(&self) -> Vec<String> {
        self.deployed.lock().unwrap().clone()
    }

    pub fn rolled_back(&self) -> Vec<String> {
        let mut ids = self.rolled_back.lock().unwrap().clone();
        ids.sort();
        ids
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeploymentStrategy for ScriptedStrategy {
    fn key(&self) -> &str {
        SCRIPTED
    }

    async fn deploy(
        &self,
        target: &DistributionTarget,
        _payload: &serde_json::Value,
        ctx: &StrategyContext,
    ) -> StrategyOutcome {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.deployed.lock().unwrap().push(target.id.clone());
        ctx.reporter.progress(50, "applying");

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panic_on.contains(&target.id) {
            panic!("strategy crashed on {}", target.id);
        }
        if self.fail.contains(&target.id) {
            return StrategyOutcome::failed("apply failed", "permission denied");
        }
        StrategyOutcome::ok(format!("applied to {}", target.id))
    }

    async fn validate_connectivity(&self, target: &DistributionTarget) -> Result<(), DeployerError> {
        if self.unreachable.contains(&target.id) {
            return Err(DeployerError::ConnectivityError {
                target_id: target.id.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn rollback(
        &self,
        target: &DistributionTarget,
        _deployment_id: &str,
        _ctx: &StrategyContext,
    ) -> StrategyOutcome {
        self.rolled_back.lock().unwrap().push(target.id.clone());
        StrategyOutcome::ok("restored")
    }

    async fn get_status(
        &self,
        _target: &DistributionTarget,
        _deployment_id: &str,
    ) -> Result<StrategyStatus, DeployerError> {
        Ok(StrategyStatus {
            status: TargetDeployState::Deployed,
            progress: 100,
            message: String::new(),
        })
    }

    async fn current_configuration(
        &self,
        target: &DistributionTarget,
    ) -> Result<Option<serde_json::Value>, DeployerError> {
        Ok(Some(json!({"version": 1, "target": target.id})))
    }
}

/// Collects every lifecycle event in delivery order
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingObserver {
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.name()).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }
}

#[async_trait]
impl DeploymentObserver for RecordingObserver {
    async fn on_event(&self, event: &LifecycleEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn target(id: &str) -> DistributionTarget {
    DistributionTarget::new(
        id,
        format!("Target {}", id),
        TargetType::Workstation,
        SCRIPTED,
        ConnectionConfig::Local {
            path: format!("/var/lib/policies/{}.json", id),
        },
    )
}

/// `t-00` .. `t-{n-1}`
pub fn targets(n: usize) -> Vec<DistributionTarget> {
    (0..n).map(|i| target(&format!("t-{:02}", i))).collect()
}

pub fn config(id: &str, targets: Vec<DistributionTarget>, rollout: RolloutPolicy) -> DeploymentConfig {
    DeploymentConfig {
        id: id.to_string(),
        payload: json!({"version": 2, "rules": ["deny-usb"]}),
        targets,
        filters: Vec::new(),
        rollout,
        rollback: Default::default(),
        monitoring: Default::default(),
    }
}

pub struct Harness {
    pub deployer: Arc<EnterpriseDeployer>,
    pub strategy: Arc<ScriptedStrategy>,
    pub observer: Arc<RecordingObserver>,
    pub rollback: Arc<RollbackService>,
}

pub fn harness(strategy: ScriptedStrategy) -> Harness {
    harness_with(strategy, DeployerOptions {
        canary_observation: Duration::ZERO,
        ..Default::default()
    })
}

pub fn harness_with(strategy: ScriptedStrategy, options: DeployerOptions) -> Harness {
    let strategy = Arc::new(strategy);
    let strategies = Arc::new(StrategyManager::new());
    strategies.register(strategy.clone());

    let rollback = Arc::new(RollbackService::new(
        Arc::new(InMemorySnapshotStore::new()),
        strategies.clone(),
        RollbackOptions::default(),
    ));
    let services = DeployerServices {
        strategies,
        filters: Arc::new(FilterEngine::default()),
        health: Arc::new(HealthChecker::new()),
        rollback: rollback.clone(),
        progress: Arc::new(ProgressTracker::new()),
    };

    let deployer = Arc::new(EnterpriseDeployer::new(options, services));
    let observer = Arc::new(RecordingObserver::default());
    deployer.add_observer(observer.clone());

    Harness {
        deployer,
        strategy,
        observer,
        rollback,
    }
}
