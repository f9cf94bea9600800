//! Rollout executor
//!
//! [`EnterpriseDeployer`] owns one execution context per deployment id, runs
//! the selected rollout algorithm and reports lifecycle events to observers.
//! Per-target work runs in its own task so a failing or panicking strategy
//! only ever produces a failed [`TargetResult`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use crate::deploy::cancel::CancelToken;
use crate::deploy::fsm::{DeploymentFsm, Transition};
use crate::deploy::rollout::{
    canary_size, partition_batches, staged_groups, threshold_exceeded, DEFAULT_CANARY_FRACTION,
};
use crate::errors::{DeployerError, DeploymentErrorDetail, ErrorCode};
use crate::health::checker::HealthChecker;
use crate::logs::LogLevel;
use crate::models::deployment::{
    summary_line, DeploymentConfig, DeploymentProgress, DeploymentStatus, DistributionResult,
    RollbackPolicy, RolloutType, TargetResult, TargetStatus,
};
use crate::models::health::HealthCheckResult;
use crate::models::rollback::{RollbackOperation, RollbackStatus, RollbackTrigger};
use crate::models::target::DistributionTarget;
use crate::monitoring::events::{DeploymentObserver, LifecycleEvent};
use crate::progress::tracker::{ProgressTracker, TargetUpdate};
use crate::rollback::service::RollbackService;
use crate::strategy::manager::StrategyManager;
use crate::strategy::{RetryPolicy, StrategyContext, StrategyReporter, StrategyUpdate};
use crate::targets::filter::FilterEngine;
use crate::targets::manager::TargetManager;

/// Deployer options
#[derive(Debug, Clone)]
pub struct DeployerOptions {
    /// Top-level fields every payload must carry
    pub required_payload_fields: Vec<String>,
    /// Share of targets in the canary subset
    pub canary_fraction: f64,
    /// How long canaries must stay healthy before the remainder is deployed
    pub canary_observation: Duration,
    /// Probe connectivity before the first batch; issues become warnings
    pub preflight_connectivity: bool,
    pub retry: RetryPolicy,
}

impl Default for DeployerOptions {
    fn default() -> Self {
        Self {
            required_payload_fields: vec!["version".to_string()],
            canary_fraction: DEFAULT_CANARY_FRACTION,
            canary_observation: Duration::from_secs(30),
            preflight_connectivity: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// Collaborators the deployer drives
#[derive(Clone)]
pub struct DeployerServices {
    pub strategies: Arc<StrategyManager>,
    pub filters: Arc<FilterEngine>,
    pub health: Arc<HealthChecker>,
    pub rollback: Arc<RollbackService>,
    pub progress: Arc<ProgressTracker>,
}

/// Runtime state of one rollout
struct Execution {
    deployment_id: String,
    rollback_policy: RollbackPolicy,
    fsm: RwLock<DeploymentFsm>,
    cancel: CancelToken,
    results: Mutex<HashMap<String, TargetResult>>,
    warnings: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::UnboundedSender<LifecycleEvent>>>,
}

impl Execution {
    fn emit(&self, event: LifecycleEvent) {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = events.as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Stop accepting events; the pump drains what is queued and exits
    fn close_events(&self) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.take();
    }

    fn warn(&self, message: String) {
        warn!(deployment_id = %self.deployment_id, "{}", message);
        self.emit(LifecycleEvent::Log {
            deployment_id: self.deployment_id.clone(),
            target_id: None,
            level: LogLevel::Warn,
            message: message.clone(),
        });
        let mut warnings = self.warnings.lock().unwrap_or_else(|e| e.into_inner());
        warnings.push(message);
    }

    fn record(&self, result: TargetResult) {
        let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        results.insert(result.target_id.clone(), result);
    }

    fn results(&self) -> HashMap<String, TargetResult> {
        self.results.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Running failure tally across batches and stages
#[derive(Debug, Default)]
struct Tally {
    processed: usize,
    failed: usize,
    batch: usize,
    total_batches: usize,
}

/// Orchestrates rollouts across targets
pub struct EnterpriseDeployer {
    options: DeployerOptions,
    services: DeployerServices,
    observers: std::sync::RwLock<Vec<Arc<dyn DeploymentObserver>>>,
    executions: RwLock<HashMap<String, Arc<Execution>>>,
    finished: RwLock<HashMap<String, DistributionResult>>,
}

impl EnterpriseDeployer {
    pub fn new(options: DeployerOptions, services: DeployerServices) -> Self {
        Self {
            options,
            services,
            observers: std::sync::RwLock::new(Vec::new()),
            executions: RwLock::new(HashMap::new()),
            finished: RwLock::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &DeployerServices {
        &self.services
    }

    pub fn add_observer(&self, observer: Arc<dyn DeploymentObserver>) {
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        observers.push(observer);
    }

    fn observers(&self) -> Vec<Arc<dyn DeploymentObserver>> {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Reject configurations that must not touch any target
    pub fn validate(&self, config: &DeploymentConfig) -> Result<(), DeployerError> {
        if config.id.trim().is_empty() {
            return Err(DeployerError::ValidationError("deployment id is empty".to_string()));
        }
        if config.targets.is_empty() {
            return Err(DeployerError::ValidationError(
                "deployment has no targets".to_string(),
            ));
        }

        let payload = config.payload.as_object().ok_or_else(|| {
            DeployerError::ValidationError("payload must be a JSON object".to_string())
        })?;
        for field in &self.options.required_payload_fields {
            if !payload.contains_key(field) {
                return Err(DeployerError::ValidationError(format!(
                    "payload is missing required field '{}'",
                    field
                )));
            }
        }

        let rollout = &config.rollout;
        if rollout.max_concurrency == 0 {
            return Err(DeployerError::ValidationError(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&rollout.failure_threshold) {
            return Err(DeployerError::ValidationError(format!(
                "failure_threshold {} is outside [0, 1]",
                rollout.failure_threshold
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for target in &config.targets {
            TargetManager::validate(target)?;
            if !seen.insert(target.id.as_str()) {
                return Err(DeployerError::ValidationError(format!(
                    "duplicate target id '{}'",
                    target.id
                )));
            }
        }
        Ok(())
    }

    /// Run a deployment to completion.
    ///
    /// Only validation failures and failure-threshold breaches are returned as
    /// errors; per-target failures are reported inside the result.
    pub async fn deploy(&self, config: DeploymentConfig) -> Result<DistributionResult, DeployerError> {
        let started = Instant::now();
        let deployment_id = config.id.clone();
        info!(
            deployment_id = %deployment_id,
            "Starting {} deployment to {} targets",
            config.rollout.rollout_type.as_str(),
            config.targets.len()
        );

        let mut fsm = DeploymentFsm::new();
        fsm.process(Transition::Validate)
            .map_err(DeployerError::InvalidTransition)?;

        if let Err(e) = self.validate(&config) {
            error!(deployment_id = %deployment_id, "Validation failed: {}", e);
            return Err(e);
        }

        let targets = self.services.filters.apply(&config.targets, &config.filters);
        if targets.is_empty() {
            return Err(DeployerError::ValidationError(
                "no targets remain after filtering".to_string(),
            ));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let execution = Arc::new(Execution {
            deployment_id: deployment_id.clone(),
            rollback_policy: config.rollback.clone(),
            fsm: RwLock::new(fsm),
            cancel: CancelToken::new(),
            results: Mutex::new(HashMap::new()),
            warnings: Mutex::new(Vec::new()),
            events: Mutex::new(Some(events_tx)),
        });

        {
            let mut executions = self.executions.write().await;
            if let Some(existing) = executions.get(&deployment_id) {
                if !existing.fsm.read().await.is_terminal() {
                    return Err(DeployerError::ValidationError(format!(
                        "deployment {} is already running",
                        deployment_id
                    )));
                }
            }
            executions.insert(deployment_id.clone(), execution.clone());
        }

        let initial = self.services.progress.start(&deployment_id, &targets);
        let pump = tokio::spawn(pump_events(
            deployment_id.clone(),
            self.observers(),
            self.services.progress.clone(),
            events_rx,
            updates_rx,
        ));

        execution.emit(LifecycleEvent::Started {
            deployment_id: deployment_id.clone(),
            total_targets: targets.len(),
            rollout_type: config.rollout.rollout_type,
        });
        execution.emit(LifecycleEvent::Progress(initial));

        let runner = Runner {
            options: self.options.clone(),
            services: self.services.clone(),
            execution: execution.clone(),
            config: Arc::new(config),
            targets: Arc::new(targets),
            updates: updates_tx,
        };

        if self.options.preflight_connectivity {
            runner.preflight().await;
        }

        runner.transition(Transition::StartDeploy, None).await;
        let outcome = runner.run_rollout().await;

        let mut rollback = None;
        let failure = match outcome {
            Ok(()) => {
                if !runner.is_cancelled().await {
                    runner.transition(Transition::Verify, None).await;
                    runner.verify().await;
                    runner.transition(Transition::Complete, None).await;
                }
                None
            }
            Err(DeployerError::ThresholdExceeded {
                stage,
                failed,
                processed,
                threshold,
                ..
            }) => {
                let reason = format!(
                    "failure threshold exceeded during {}: {}/{} targets failed",
                    stage, failed, processed
                );
                error!(deployment_id = %deployment_id, "{}", reason);

                let rolled_back = if runner.config.rollout.auto_rollback && runner.config.rollback.enabled {
                    let operation = runner.auto_rollback(&reason).await;
                    let ok = operation.status == RollbackStatus::Completed;
                    rollback = Some(operation);
                    ok
                } else {
                    runner.transition(Transition::Fail(reason.clone()), Some(reason.clone())).await;
                    false
                };

                execution.emit(LifecycleEvent::Failed {
                    deployment_id: deployment_id.clone(),
                    error: reason,
                });
                Some(DeployerError::ThresholdExceeded {
                    stage,
                    failed,
                    processed,
                    threshold,
                    rolled_back,
                })
            }
            Err(e) => {
                error!(deployment_id = %deployment_id, "Deployment failed: {}", e);
                runner.transition(Transition::Fail(e.to_string()), Some(e.to_string())).await;
                execution.emit(LifecycleEvent::Failed {
                    deployment_id: deployment_id.clone(),
                    error: e.to_string(),
                });
                Some(e)
            }
        };

        let result = runner.build_result(started.elapsed(), rollback).await;
        if failure.is_none() && result.status != DeploymentStatus::Cancelled {
            execution.emit(LifecycleEvent::Completed {
                deployment_id: deployment_id.clone(),
                result: Box::new(result.clone()),
            });
        }

        // the pump exits once every sender is gone
        drop(runner);
        execution.close_events();
        if let Err(e) = pump.await {
            warn!(deployment_id = %deployment_id, "Event pump ended abnormally: {}", e);
        }

        {
            let mut finished = self.finished.write().await;
            finished.insert(deployment_id.clone(), result.clone());
        }

        info!(
            deployment_id = %deployment_id,
            "Deployment {}: {} in {}ms",
            result.status.as_str(),
            result.summary,
            result.duration_ms
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    /// Cancel a running deployment.
    ///
    /// Batches and targets not yet started are skipped; in-flight strategy and
    /// health calls observe the cancellation token.
    pub async fn cancel_deployment(&self, deployment_id: &str) -> Result<DeploymentProgress, DeployerError> {
        let execution = {
            let executions = self.executions.read().await;
            executions
                .get(deployment_id)
                .cloned()
                .ok_or_else(|| DeployerError::NotFound(format!("deployment {}", deployment_id)))?
        };

        {
            let mut fsm = execution.fsm.write().await;
            fsm.process(Transition::Cancel)
                .map_err(DeployerError::InvalidTransition)?;
        }
        execution.cancel.cancel();
        info!(deployment_id = %deployment_id, "Deployment cancelled");

        let snapshot = self
            .services
            .progress
            .set_status(
                deployment_id,
                DeploymentStatus::Cancelled,
                Some("cancelled by operator".to_string()),
            )
            .ok_or_else(|| DeployerError::NotFound(format!("progress for {}", deployment_id)))?;

        execution.emit(LifecycleEvent::Progress(snapshot.clone()));
        execution.emit(LifecycleEvent::Cancelled {
            deployment_id: deployment_id.to_string(),
        });
        Ok(snapshot)
    }

    /// Operator-initiated rollback of a deployment, optionally scoped to targets.
    ///
    /// The deployment's own rollback policy applies while its execution is
    /// still held; pruned deployments fall back to the service defaults.
    pub async fn rollback_deployment(
        &self,
        deployment_id: &str,
        target_ids: &[String],
        reason: Option<String>,
    ) -> Result<RollbackOperation, DeployerError> {
        let policy = self
            .executions
            .read()
            .await
            .get(deployment_id)
            .map(|execution| execution.rollback_policy.clone());
        let known = policy.is_some()
            || !self
                .services
                .rollback
                .list_snapshots(deployment_id)
                .await?
                .is_empty();
        if !known {
            return Err(DeployerError::NotFound(format!("deployment {}", deployment_id)));
        }

        let operation = self
            .services
            .rollback
            .trigger_rollback(deployment_id, target_ids, reason, policy.as_ref())
            .await;

        let event = LifecycleEvent::RolledBack {
            deployment_id: deployment_id.to_string(),
            operation: Box::new(operation.clone()),
        };
        for observer in self.observers() {
            observer.on_event(&event).await;
        }
        Ok(operation)
    }

    pub fn get_progress(&self, deployment_id: &str) -> Option<DeploymentProgress> {
        self.services.progress.get(deployment_id)
    }

    pub fn list_progress(&self) -> Vec<DeploymentProgress> {
        self.services.progress.list()
    }

    /// Final result of a finished deployment
    pub async fn get_result(&self, deployment_id: &str) -> Option<DistributionResult> {
        self.finished.read().await.get(deployment_id).cloned()
    }

    pub async fn status(&self, deployment_id: &str) -> Option<DeploymentStatus> {
        let execution = self.executions.read().await.get(deployment_id).cloned()?;
        let status = execution.fsm.read().await.state();
        Some(status)
    }

    /// Drop finished executions, keeping their results and progress
    pub async fn prune_finished(&self) -> usize {
        let mut executions = self.executions.write().await;
        let mut finished = Vec::new();
        for (id, execution) in executions.iter() {
            if execution.fsm.read().await.is_terminal() {
                finished.push(id.clone());
            }
        }
        for id in &finished {
            executions.remove(id);
        }
        finished.len()
    }

    /// Forget deployments that finished more than `retention` ago: their
    /// execution, final result and progress snapshot
    pub async fn prune_expired(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(24));

        let mut executions = self.executions.write().await;
        let mut finished = self.finished.write().await;
        let expired: Vec<String> = self
            .services
            .progress
            .list()
            .into_iter()
            .filter(|p| p.status.is_terminal())
            .filter(|p| p.completed_at.unwrap_or(p.updated_at) < cutoff)
            // still inside deploy(), e.g. draining after a cancel
            .filter(|p| finished.contains_key(&p.deployment_id) || !executions.contains_key(&p.deployment_id))
            .map(|p| p.deployment_id)
            .collect();

        for id in &expired {
            executions.remove(id);
            finished.remove(id);
            self.services.progress.remove(id);
        }
        if !expired.is_empty() {
            debug!("Pruned {} deployments finished before {}", expired.len(), cutoff);
        }
        expired.len()
    }
}

/// Delivers events of one deployment to the observers, in order, from a
/// single task. Strategy updates are folded into progress snapshots here.
async fn pump_events(
    deployment_id: String,
    observers: Vec<Arc<dyn DeploymentObserver>>,
    progress: Arc<ProgressTracker>,
    mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
    mut updates: mpsc::UnboundedReceiver<StrategyUpdate>,
) {
    loop {
        let next = tokio::select! {
            biased;
            Some(update) = updates.recv() => Some(translate_update(&deployment_id, &progress, update)),
            event = events.recv() => event.map(Some),
        };
        let Some(event) = next else {
            break;
        };
        let Some(event) = event else {
            continue;
        };
        for observer in &observers {
            observer.on_event(&event).await;
        }
    }
    debug!(deployment_id = %deployment_id, "Event pump finished");
}

fn translate_update(
    deployment_id: &str,
    progress: &ProgressTracker,
    update: StrategyUpdate,
) -> Option<LifecycleEvent> {
    match update {
        StrategyUpdate::Progress {
            target_id,
            progress: percent,
            message,
        } => progress
            .update_target(deployment_id, &target_id, TargetUpdate::progress(percent, message))
            .map(LifecycleEvent::Progress),
        StrategyUpdate::Log {
            target_id,
            level,
            message,
        } => {
            match level {
                LogLevel::Error => error!(deployment_id = %deployment_id, target_id = %target_id, "{}", message),
                LogLevel::Warn => warn!(deployment_id = %deployment_id, target_id = %target_id, "{}", message),
                _ => debug!(deployment_id = %deployment_id, target_id = %target_id, "{}", message),
            }
            Some(LifecycleEvent::Log {
                deployment_id: deployment_id.to_string(),
                target_id: Some(target_id),
                level,
                message,
            })
        }
    }
}

/// Per-deployment worker; cheap to clone into target tasks
#[derive(Clone)]
struct Runner {
    options: DeployerOptions,
    services: DeployerServices,
    execution: Arc<Execution>,
    config: Arc<DeploymentConfig>,
    targets: Arc<Vec<DistributionTarget>>,
    updates: mpsc::UnboundedSender<StrategyUpdate>,
}

impl Runner {
    fn deployment_id(&self) -> &str {
        &self.execution.deployment_id
    }

    async fn is_cancelled(&self) -> bool {
        self.execution.cancel.is_cancelled()
            || self.execution.fsm.read().await.state() == DeploymentStatus::Cancelled
    }

    /// Apply a lifecycle transition and publish the new status.
    ///
    /// Invalid transitions (e.g. after a cancellation) are ignored.
    async fn transition(&self, transition: Transition, message: Option<String>) -> bool {
        let state = {
            let mut fsm = self.execution.fsm.write().await;
            match fsm.process(transition) {
                Ok(state) => state,
                Err(e) => {
                    debug!(deployment_id = %self.deployment_id(), "{}", e);
                    return false;
                }
            }
        };
        if let Some(snapshot) = self
            .services
            .progress
            .set_status(self.deployment_id(), state, message)
        {
            self.execution.emit(LifecycleEvent::Progress(snapshot));
        }
        true
    }

    fn update_target(&self, target_id: &str, update: TargetUpdate) {
        if let Some(snapshot) = self
            .services
            .progress
            .update_target(self.deployment_id(), target_id, update)
        {
            self.execution.emit(LifecycleEvent::Progress(snapshot));
        }
    }

    async fn preflight(&self) {
        let issues = self
            .services
            .strategies
            .validate_connectivity_all(&self.targets, self.config.rollout.max_concurrency)
            .await;
        for issue in issues {
            self.execution.warn(format!(
                "pre-flight connectivity check failed for {}: {}",
                issue.target_id, issue.message
            ));
        }
    }

    async fn run_rollout(&self) -> Result<(), DeployerError> {
        let size = self.config.rollout.max_concurrency.max(1);
        let mut tally = Tally::default();

        match self.config.rollout.rollout_type {
            RolloutType::Immediate | RolloutType::Rolling | RolloutType::BlueGreen => {
                let targets = self.targets.clone();
                tally.total_batches = targets.len().div_ceil(size);
                self.run_batches(self.config.rollout.rollout_type.as_str(), &targets, &mut tally)
                    .await
            }
            RolloutType::Staged => {
                let stages = staged_groups(&self.targets);
                tally.total_batches = stages.iter().map(|(_, g)| g.len().div_ceil(size)).sum();
                for (stage, group) in stages {
                    if self.is_cancelled().await {
                        break;
                    }
                    info!(
                        deployment_id = %self.deployment_id(),
                        "Deploying stage '{}' ({} targets)",
                        stage,
                        group.len()
                    );
                    self.run_batches(&stage, &group, &mut tally).await?;
                }
                Ok(())
            }
            RolloutType::Canary => self.run_canary(&mut tally).await,
        }
    }

    /// Batch primitive: deploy each batch concurrently, settle it, then check
    /// the running failure rate
    async fn run_batches(
        &self,
        stage: &str,
        targets: &[DistributionTarget],
        tally: &mut Tally,
    ) -> Result<(), DeployerError> {
        let policy = &self.config.rollout;

        for batch in partition_batches(targets, policy.max_concurrency) {
            if self.is_cancelled().await {
                info!(deployment_id = %self.deployment_id(), "Cancelled, skipping remaining batches");
                return Ok(());
            }

            tally.batch += 1;
            self.set_batch(tally);
            debug!(
                deployment_id = %self.deployment_id(),
                "Batch {}/{} ({} targets)",
                tally.batch,
                tally.total_batches,
                batch.len()
            );

            for result in self.deploy_batch(&batch).await {
                tally.processed += 1;
                if !result.success {
                    tally.failed += 1;
                }
            }

            if !policy.continue_on_error
                && threshold_exceeded(tally.failed, tally.processed, policy.failure_threshold)
            {
                return Err(DeployerError::ThresholdExceeded {
                    stage: stage.to_string(),
                    failed: tally.failed,
                    processed: tally.processed,
                    threshold: policy.failure_threshold,
                    rolled_back: false,
                });
            }
        }
        Ok(())
    }

    async fn run_canary(&self, tally: &mut Tally) -> Result<(), DeployerError> {
        let size = self.config.rollout.max_concurrency.max(1);
        let count = canary_size(self.targets.len(), self.options.canary_fraction);
        let (canary, rest) = self.targets.split_at(count);
        tally.total_batches = canary.len().div_ceil(size) + rest.len().div_ceil(size);

        info!(
            deployment_id = %self.deployment_id(),
            "Canary phase: {} of {} targets",
            canary.len(),
            self.targets.len()
        );

        let abort = |failed: usize, processed: usize| DeployerError::ThresholdExceeded {
            stage: "canary".to_string(),
            failed,
            processed,
            threshold: 0.0,
            rolled_back: false,
        };

        let mut canary_results = Vec::new();
        for batch in partition_batches(canary, size) {
            if self.is_cancelled().await {
                return Ok(());
            }
            tally.batch += 1;
            self.set_batch(tally);
            canary_results.extend(self.deploy_batch(&batch).await);
        }
        let failed = canary_results.iter().filter(|r| !r.success).count();
        tally.processed += canary_results.len();
        tally.failed += failed;
        if failed > 0 {
            return Err(abort(failed, canary_results.len()));
        }

        let unhealthy: Vec<&str> = canary_results
            .iter()
            .filter(|r| r.health_checks.iter().any(|check| !check.is_healthy()))
            .map(|r| r.target_id.as_str())
            .collect();
        if !unhealthy.is_empty() {
            self.execution.warn(format!(
                "canary targets failed health checks: {}",
                unhealthy.join(", ")
            ));
            tally.failed += unhealthy.len();
            return Err(abort(unhealthy.len(), canary_results.len()));
        }

        if !self.options.canary_observation.is_zero() {
            info!(
                deployment_id = %self.deployment_id(),
                "Observing canaries for {}s",
                self.options.canary_observation.as_secs()
            );
            tokio::select! {
                _ = tokio::time::sleep(self.options.canary_observation) => {}
                _ = self.execution.cancel.cancelled() => return Ok(()),
            }
        }

        let failing: Vec<String> = self
            .recheck(canary)
            .await
            .into_iter()
            .filter(|(_, checks)| checks.iter().any(|c| !c.is_healthy()))
            .map(|(id, _)| id)
            .collect();
        if !failing.is_empty() {
            self.execution.warn(format!(
                "canary targets unhealthy after observation: {}",
                failing.join(", ")
            ));
            tally.failed += failing.len();
            return Err(abort(failing.len(), canary_results.len()));
        }

        self.run_batches("canary-remainder", rest, tally).await
    }

    fn set_batch(&self, tally: &Tally) {
        if let Some(snapshot) =
            self.services
                .progress
                .set_batch(self.deployment_id(), tally.batch, tally.total_batches)
        {
            self.execution.emit(LifecycleEvent::Progress(snapshot));
        }
    }

    /// Deploy every target of the batch in its own task and wait for all of
    /// them. Targets skipped because of cancellation produce no result.
    async fn deploy_batch(&self, batch: &[DistributionTarget]) -> Vec<TargetResult> {
        let handles: Vec<(String, tokio::task::JoinHandle<Option<TargetResult>>)> = batch
            .iter()
            .map(|target| {
                let runner = self.clone();
                let target = target.clone();
                let id = target.id.clone();
                (id, tokio::spawn(runner.deploy_to_target(target)))
            })
            .collect();

        let (ids, handles): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
        let joined = join_all(handles).await;

        let mut results = Vec::with_capacity(ids.len());
        for (target_id, joined) in ids.into_iter().zip(joined) {
            match joined {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => {
                    error!(target_id = %target_id, "Target task aborted: {}", e);
                    let detail = DeploymentErrorDetail::new(
                        &target_id,
                        ErrorCode::TaskPanicked,
                        format!("target task aborted: {}", e),
                    );
                    results.push(self.fail_target(&target_id, detail, 0, Vec::new(), None));
                }
            }
        }
        results
    }

    /// Snapshot, deploy and health-check one target.
    ///
    /// Every failure is converted into a failed [`TargetResult`].
    async fn deploy_to_target(self, target: DistributionTarget) -> Option<TargetResult> {
        if self.is_cancelled().await {
            return None;
        }

        let started = Instant::now();
        let elapsed = |started: Instant| started.elapsed().as_millis() as u64;
        self.update_target(
            &target.id,
            TargetUpdate::status(TargetStatus::Deploying).with_message("deploying"),
        );

        let strategy = match self.services.strategies.for_target(&target) {
            Ok(strategy) => strategy,
            Err(e) => {
                let detail = DeploymentErrorDetail::new(&target.id, ErrorCode::StrategyNotFound, e.to_string());
                return Some(self.fail_target(&target.id, detail, elapsed(started), Vec::new(), None));
            }
        };

        let mut snapshot_id = None;
        if self.config.rollback.enabled {
            match self
                .services
                .rollback
                .create_snapshot(
                    self.deployment_id(),
                    &target,
                    &self.config.payload,
                    Some(&self.config.rollback),
                )
                .await
            {
                Ok(snapshot) => snapshot_id = Some(snapshot.snapshot_id),
                Err(e) => {
                    let detail = DeploymentErrorDetail::new(
                        &target.id,
                        ErrorCode::SnapshotFailed,
                        format!("could not create rollback snapshot: {}", e),
                    );
                    return Some(self.fail_target(&target.id, detail, elapsed(started), Vec::new(), None));
                }
            }
        }

        let ctx = StrategyContext {
            deployment_id: self.deployment_id().to_string(),
            timeout: self.config.rollout.timeout,
            retry: self.options.retry.clone(),
            rollout_type: self.config.rollout.rollout_type,
            previous_configuration: None,
            cancel: self.execution.cancel.clone(),
            reporter: StrategyReporter::new(&target.id, self.updates.clone()),
        };

        let outcome = match tokio::time::timeout(
            self.config.rollout.timeout,
            strategy.deploy(&target, &self.config.payload, &ctx),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                let detail = DeploymentErrorDetail::new(
                    &target.id,
                    ErrorCode::Timeout,
                    format!("deploy timed out after {}s", self.config.rollout.timeout.as_secs()),
                );
                return Some(self.fail_target(&target.id, detail, elapsed(started), Vec::new(), snapshot_id));
            }
        };

        if !outcome.success {
            let code = if ctx.cancel.is_cancelled() {
                ErrorCode::Cancelled
            } else {
                ErrorCode::DeployFailed
            };
            let message = match &outcome.error {
                Some(error) => format!("{}: {}", outcome.message, error),
                None => outcome.message.clone(),
            };
            let mut detail = DeploymentErrorDetail::new(&target.id, code, message);
            if let Some(metadata) = outcome.metadata {
                detail = detail.with_details(metadata);
            }
            return Some(self.fail_target(&target.id, detail, elapsed(started), Vec::new(), snapshot_id));
        }

        let mut health_checks = Vec::new();
        if self.config.monitoring.health_checks && target.health_check.is_some() {
            self.update_target(
                &target.id,
                TargetUpdate::status(TargetStatus::Verifying).with_message("running health checks"),
            );
            health_checks = self
                .services
                .health
                .check_target(&target, &self.execution.cancel)
                .await;

            if let Some(failed) = health_checks.iter().find(|c| !c.is_healthy()) {
                if self.config.rollout.fail_on_health_check {
                    let detail = DeploymentErrorDetail::new(
                        &target.id,
                        ErrorCode::HealthCheckFailed,
                        failed.message.clone(),
                    );
                    return Some(self.fail_target(&target.id, detail, elapsed(started), health_checks, snapshot_id));
                }
                self.execution.warn(format!(
                    "target {} deployed but health check failed: {}",
                    target.id, failed.message
                ));
            }
        }

        let result = TargetResult {
            target_id: target.id.clone(),
            success: true,
            message: outcome.message.clone(),
            duration_ms: elapsed(started),
            error: None,
            health_checks,
            snapshot_id,
        };
        self.update_target(
            &target.id,
            TargetUpdate::status(TargetStatus::Completed).with_message(outcome.message),
        );
        self.finish_target(result.clone());
        Some(result)
    }

    fn fail_target(
        &self,
        target_id: &str,
        detail: DeploymentErrorDetail,
        duration_ms: u64,
        health_checks: Vec<HealthCheckResult>,
        snapshot_id: Option<String>,
    ) -> TargetResult {
        warn!(
            deployment_id = %self.deployment_id(),
            target_id = %target_id,
            "Target failed ({:?}): {}",
            detail.code,
            detail.message
        );
        self.execution.emit(LifecycleEvent::Log {
            deployment_id: self.deployment_id().to_string(),
            target_id: Some(target_id.to_string()),
            level: LogLevel::Error,
            message: detail.message.clone(),
        });
        self.update_target(
            target_id,
            TargetUpdate::status(TargetStatus::Failed).with_error(detail.message.clone()),
        );

        let result = TargetResult {
            target_id: target_id.to_string(),
            success: false,
            message: detail.message.clone(),
            duration_ms,
            error: Some(detail),
            health_checks,
            snapshot_id,
        };
        self.finish_target(result.clone());
        result
    }

    fn finish_target(&self, result: TargetResult) {
        self.execution.emit(LifecycleEvent::TargetFinished {
            deployment_id: self.deployment_id().to_string(),
            target_id: result.target_id.clone(),
            success: result.success,
            duration_ms: result.duration_ms,
        });
        self.execution.record(result);
    }

    /// Re-run health checks on the given targets, bounded by max concurrency
    async fn recheck(&self, targets: &[DistributionTarget]) -> Vec<(String, Vec<HealthCheckResult>)> {
        let semaphore = Arc::new(Semaphore::new(self.config.rollout.max_concurrency.max(1)));
        let checks = targets
            .iter()
            .filter(|t| t.health_check.is_some())
            .map(|target| {
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore.acquire().await.ok();
                    let results = self
                        .services
                        .health
                        .check_target(target, &self.execution.cancel)
                        .await;
                    (target.id.clone(), results)
                }
            });
        join_all(checks).await
    }

    /// Verification phase: health-check every target whose deploy succeeded.
    ///
    /// Results are attached to the target results; failures are reported as
    /// warnings and do not change any status.
    async fn verify(&self) {
        if !self.config.monitoring.health_checks {
            return;
        }
        let results = self.execution.results();
        let succeeded: Vec<DistributionTarget> = self
            .targets
            .iter()
            .filter(|t| results.get(&t.id).is_some_and(|r| r.success))
            .cloned()
            .collect();
        if succeeded.is_empty() {
            return;
        }

        info!(
            deployment_id = %self.deployment_id(),
            "Verifying {} deployed targets",
            succeeded.len()
        );
        for (target_id, checks) in self.recheck(&succeeded).await {
            if let Some(failed) = checks.iter().find(|c| !c.is_healthy()) {
                self.execution.warn(format!(
                    "verification health check failed for {}: {}",
                    target_id, failed.message
                ));
            }
            let mut results = self.execution.results.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(result) = results.get_mut(&target_id) {
                result.health_checks.extend(checks);
            }
        }
    }

    async fn auto_rollback(&self, reason: &str) -> RollbackOperation {
        self.transition(Transition::RollBack, Some(reason.to_string())).await;
        let operation = self
            .services
            .rollback
            .rollback(
                self.deployment_id(),
                RollbackTrigger::Automatic,
                Some(reason.to_string()),
                Some(&self.config.rollback),
            )
            .await;

        if operation.status == RollbackStatus::Completed {
            self.transition(Transition::RollbackComplete, Some(reason.to_string()))
                .await;
        } else {
            let error = operation
                .error
                .clone()
                .unwrap_or_else(|| "rollback failed".to_string());
            self.transition(Transition::RollbackFailed(error.clone()), Some(error))
                .await;
        }

        self.execution.emit(LifecycleEvent::RolledBack {
            deployment_id: self.deployment_id().to_string(),
            operation: Box::new(operation.clone()),
        });
        operation
    }

    async fn build_result(
        &self,
        elapsed: Duration,
        rollback: Option<RollbackOperation>,
    ) -> DistributionResult {
        let status = self.execution.fsm.read().await.state();
        let mut by_id = self.execution.results();

        let results: Vec<TargetResult> = self
            .targets
            .iter()
            .filter_map(|t| by_id.remove(&t.id))
            .collect();
        let total = self.targets.len();
        let successful = results.iter().filter(|r| r.success).count();
        let failed = results.len() - successful;
        let warnings = self
            .execution
            .warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        DistributionResult {
            deployment_id: self.deployment_id().to_string(),
            success: status == DeploymentStatus::Completed && failed == 0,
            status,
            summary: summary_line(successful, total),
            total_targets: total,
            successful_targets: successful,
            failed_targets: failed,
            pending_targets: total - results.len(),
            duration_ms: elapsed.as_millis() as u64,
            errors: results.iter().filter_map(|r| r.error.clone()).collect(),
            results,
            warnings,
            rollback,
        }
    }
}
