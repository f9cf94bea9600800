//! Metrics, alerts and dashboard aggregation

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::errors::DeployerError;
use crate::logs::LogLevel;
use crate::models::deployment::{DeploymentProgress, DeploymentStatus};
use crate::models::monitoring::{
    Alert, AlertRule, AlertSeverity, AlertStatus, DashboardData, MetricDataPoint, MetricSummary,
    MetricType, SystemHealth,
};
use crate::models::rollback::RollbackStatus;
use crate::monitoring::events::{DeploymentObserver, LifecycleEvent};
use crate::monitoring::rules::{evaluate_deployment, evaluate_error_logs, AlertThresholds, RuleHit};
use crate::utils::generate_id;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
const RECENT_ALERTS: usize = 10;
const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Monitoring service options
#[derive(Debug, Clone)]
pub struct MonitoringOptions {
    pub retention: Duration,
    pub thresholds: AlertThresholds,
}

impl Default for MonitoringOptions {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            thresholds: AlertThresholds::default(),
        }
    }
}

/// Append-only metric log, rule-based alerting and dashboard data
pub struct MonitoringService {
    options: MonitoringOptions,
    metrics: RwLock<HashMap<String, Vec<MetricDataPoint>>>,
    alerts: RwLock<Vec<Alert>>,
    deployments: RwLock<HashMap<String, DeploymentProgress>>,
    error_logs: RwLock<VecDeque<DateTime<Utc>>>,
    alert_tx: broadcast::Sender<Alert>,
}

impl MonitoringService {
    pub fn new(options: MonitoringOptions) -> Self {
        let (alert_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            options,
            metrics: RwLock::new(HashMap::new()),
            alerts: RwLock::new(Vec::new()),
            deployments: RwLock::new(HashMap::new()),
            error_logs: RwLock::new(VecDeque::new()),
            alert_tx,
        }
    }

    pub fn options(&self) -> &MonitoringOptions {
        &self.options
    }

    // --- metrics ---

    pub fn record_metric(
        &self,
        name: &str,
        value: f64,
        metric_type: MetricType,
        labels: &[(&str, &str)],
    ) {
        self.record_point(MetricDataPoint {
            name: name.to_string(),
            value,
            timestamp: Utc::now(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            metric_type,
        });
    }

    pub fn record_point(&self, point: MetricDataPoint) {
        let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        metrics.entry(point.name.clone()).or_default().push(point);
    }

    /// Points of one metric inside `[from, to]`, oldest first
    pub fn query(
        &self,
        name: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Vec<MetricDataPoint> {
        let metrics = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        metrics
            .get(name)
            .map(|points| {
                points
                    .iter()
                    .filter(|p| from.is_none_or(|f| p.timestamp >= f))
                    .filter(|p| to.is_none_or(|t| p.timestamp <= t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn metric_names(&self) -> Vec<String> {
        let metrics = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = metrics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Latest value and aggregates per metric name
    pub fn summaries(&self) -> Vec<MetricSummary> {
        let metrics = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        let mut summaries: Vec<MetricSummary> = metrics
            .iter()
            .filter_map(|(name, points)| {
                let latest = points.last()?;
                let values = points.iter().map(|p| p.value);
                Some(MetricSummary {
                    name: name.clone(),
                    latest: latest.value,
                    count: points.len(),
                    sum: values.clone().sum(),
                    min: values.clone().fold(f64::INFINITY, f64::min),
                    max: values.fold(f64::NEG_INFINITY, f64::max),
                })
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Drop whatever aged out of the retention window: metric points,
    /// error-log marks, finished deployments and resolved alerts. Returns the
    /// number of metric points removed.
    pub fn prune_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now
            - chrono::Duration::from_std(self.options.retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut removed = 0;
        {
            let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
            for points in metrics.values_mut() {
                let before = points.len();
                points.retain(|p| p.timestamp >= cutoff);
                removed += before - points.len();
            }
            metrics.retain(|_, points| !points.is_empty());
        }
        {
            let mut logs = self.error_logs.write().unwrap_or_else(|e| e.into_inner());
            while logs.front().is_some_and(|at| *at < cutoff) {
                logs.pop_front();
            }
        }
        let deployments = {
            let mut deployments = self.deployments.write().unwrap_or_else(|e| e.into_inner());
            let before = deployments.len();
            deployments.retain(|_, p| {
                !p.status.is_terminal() || p.completed_at.unwrap_or(p.updated_at) >= cutoff
            });
            before - deployments.len()
        };
        let alerts = {
            let mut alerts = self.alerts.write().unwrap_or_else(|e| e.into_inner());
            let before = alerts.len();
            alerts.retain(|a| {
                a.status != AlertStatus::Resolved || a.resolved_at.is_none_or(|at| at >= cutoff)
            });
            before - alerts.len()
        };
        if removed + deployments + alerts > 0 {
            debug!(
                "Pruned {} metric points, {} deployments and {} resolved alerts older than {}",
                removed, deployments, alerts, cutoff
            );
        }
        removed
    }

    pub fn prune(&self) -> usize {
        self.prune_at(Utc::now())
    }

    // --- deployments and logs ---

    /// Store the latest snapshot of a deployment and evaluate its rules
    pub fn track_progress(&self, progress: &DeploymentProgress) -> Vec<Alert> {
        {
            let mut deployments = self.deployments.write().unwrap_or_else(|e| e.into_inner());
            deployments.insert(progress.deployment_id.clone(), progress.clone());
        }
        self.record_metric(
            "deployment_progress",
            progress.progress as f64,
            MetricType::Gauge,
            &[("deployment_id", &progress.deployment_id)],
        );
        if progress.status.is_terminal() {
            self.resolve_rule_alerts(AlertRule::LongRunningDeployment, &progress.deployment_id);
        }

        let hits = evaluate_deployment(progress, &self.options.thresholds, Utc::now());
        self.raise_all(hits)
    }

    pub fn deployment(&self, deployment_id: &str) -> Option<DeploymentProgress> {
        let deployments = self.deployments.read().unwrap_or_else(|e| e.into_inner());
        deployments.get(deployment_id).cloned()
    }

    fn set_deployment_status(&self, deployment_id: &str, status: DeploymentStatus, message: Option<String>) {
        let snapshot = {
            let mut deployments = self.deployments.write().unwrap_or_else(|e| e.into_inner());
            let Some(progress) = deployments.get_mut(deployment_id) else {
                return;
            };
            if progress.status.is_terminal() {
                return;
            }
            progress.status = status;
            if message.is_some() {
                progress.message = message;
            }
            progress.clone()
        };
        self.track_progress(&snapshot);
    }

    pub fn record_log_at(&self, level: LogLevel, at: DateTime<Utc>) -> Option<Alert> {
        self.record_metric(
            "log_messages",
            1.0,
            MetricType::Counter,
            &[("level", level.as_str())],
        );
        if level != LogLevel::Error {
            return None;
        }

        let logs: Vec<DateTime<Utc>> = {
            let mut error_logs = self.error_logs.write().unwrap_or_else(|e| e.into_inner());
            error_logs.push_back(at);
            error_logs.iter().copied().collect()
        };
        let hit = evaluate_error_logs(&logs, &self.options.thresholds, at)?;
        self.raise(hit)
    }

    pub fn record_log(&self, level: LogLevel) -> Option<Alert> {
        self.record_log_at(level, Utc::now())
    }

    /// Evaluate every time-based rule; returns the alerts raised
    pub fn evaluate_rules_at(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let deployments: Vec<DeploymentProgress> = {
            let deployments = self.deployments.read().unwrap_or_else(|e| e.into_inner());
            deployments.values().cloned().collect()
        };

        let mut hits: Vec<RuleHit> = deployments
            .iter()
            .flat_map(|progress| evaluate_deployment(progress, &self.options.thresholds, now))
            .collect();

        let logs: Vec<DateTime<Utc>> = {
            let error_logs = self.error_logs.read().unwrap_or_else(|e| e.into_inner());
            error_logs.iter().copied().collect()
        };
        hits.extend(evaluate_error_logs(&logs, &self.options.thresholds, now));

        self.raise_all(hits)
    }

    pub fn evaluate_rules(&self) -> Vec<Alert> {
        self.evaluate_rules_at(Utc::now())
    }

    // --- alerts ---

    fn raise_all(&self, hits: Vec<RuleHit>) -> Vec<Alert> {
        hits.into_iter().filter_map(|hit| self.raise(hit)).collect()
    }

    /// Raise an alert unless one is already open for the same rule and deployment
    fn raise(&self, hit: RuleHit) -> Option<Alert> {
        let alert = {
            let mut alerts = self.alerts.write().unwrap_or_else(|e| e.into_inner());
            let duplicate = alerts
                .iter()
                .any(|a| a.is_open() && a.rule == hit.rule && a.deployment_id == hit.deployment_id);
            if duplicate {
                return None;
            }

            let alert = Alert {
                id: generate_id("alert"),
                rule: hit.rule,
                severity: hit.severity,
                status: AlertStatus::Active,
                message: hit.message,
                deployment_id: hit.deployment_id,
                triggered_at: Utc::now(),
                acknowledged_at: None,
                resolved_at: None,
                metadata: hit.metadata,
            };
            alerts.push(alert.clone());
            alert
        };

        match alert.severity {
            AlertSeverity::Critical => warn!(alert_id = %alert.id, "CRITICAL alert: {}", alert.message),
            _ => info!(alert_id = %alert.id, "Alert raised: {}", alert.message),
        }
        let _ = self.alert_tx.send(alert.clone());
        Some(alert)
    }

    fn resolve_rule_alerts(&self, rule: AlertRule, deployment_id: &str) {
        let now = Utc::now();
        let mut alerts = self.alerts.write().unwrap_or_else(|e| e.into_inner());
        for alert in alerts
            .iter_mut()
            .filter(|a| a.is_open() && a.rule == rule && a.deployment_id.as_deref() == Some(deployment_id))
        {
            alert.status = AlertStatus::Resolved;
            alert.resolved_at = Some(now);
        }
    }

    fn transition(&self, alert_id: &str, next: AlertStatus) -> Result<Alert, DeployerError> {
        let mut alerts = self.alerts.write().unwrap_or_else(|e| e.into_inner());
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| DeployerError::NotFound(format!("alert {}", alert_id)))?;

        if !alert.status.can_transition_to(next) {
            return Err(DeployerError::InvalidTransition(format!(
                "alert {} cannot move from {:?} to {:?}",
                alert_id, alert.status, next
            )));
        }

        let now = Utc::now();
        alert.status = next;
        match next {
            AlertStatus::Acknowledged => alert.acknowledged_at = Some(now),
            AlertStatus::Resolved => alert.resolved_at = Some(now),
            AlertStatus::Active => {}
        }
        Ok(alert.clone())
    }

    pub fn acknowledge_alert(&self, alert_id: &str) -> Result<Alert, DeployerError> {
        self.transition(alert_id, AlertStatus::Acknowledged)
    }

    pub fn resolve_alert(&self, alert_id: &str) -> Result<Alert, DeployerError> {
        self.transition(alert_id, AlertStatus::Resolved)
    }

    /// Alerts, newest first, optionally filtered by status
    pub fn alerts(&self, status: Option<AlertStatus>) -> Vec<Alert> {
        let alerts = self.alerts.read().unwrap_or_else(|e| e.into_inner());
        alerts
            .iter()
            .rev()
            .filter(|a| status.is_none_or(|s| a.status == s))
            .cloned()
            .collect()
    }

    /// Alerts that are not resolved
    pub fn open_alerts(&self) -> Vec<Alert> {
        let alerts = self.alerts.read().unwrap_or_else(|e| e.into_inner());
        alerts.iter().rev().filter(|a| a.is_open()).cloned().collect()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alert_tx.subscribe()
    }

    /// Any active critical alert makes the system critical; more than two
    /// active warnings make it degraded. Acknowledged alerts do not count.
    pub fn system_health(&self) -> SystemHealth {
        let active = self.alerts(Some(AlertStatus::Active));
        let critical = active.iter().filter(|a| a.severity == AlertSeverity::Critical).count();
        let warnings = active.iter().filter(|a| a.severity == AlertSeverity::Warning).count();

        if critical > 0 {
            SystemHealth::Critical
        } else if warnings > 2 {
            SystemHealth::Degraded
        } else {
            SystemHealth::Healthy
        }
    }

    pub fn dashboard(&self) -> DashboardData {
        let deployments: Vec<DeploymentProgress> = {
            let deployments = self.deployments.read().unwrap_or_else(|e| e.into_inner());
            deployments.values().cloned().collect()
        };
        let active = deployments.iter().filter(|d| !d.status.is_terminal()).count();
        let completed = deployments
            .iter()
            .filter(|d| d.status == DeploymentStatus::Completed)
            .count();
        let failed = deployments
            .iter()
            .filter(|d| matches!(d.status, DeploymentStatus::Failed | DeploymentStatus::RolledBack))
            .count();
        let finished = completed + failed;
        let success_rate = if finished == 0 {
            1.0
        } else {
            completed as f64 / finished as f64
        };

        let active_alerts = self.alerts(Some(AlertStatus::Active));
        DashboardData {
            system_health: self.system_health(),
            active_deployments: active,
            total_deployments: deployments.len(),
            completed_deployments: completed,
            failed_deployments: failed,
            success_rate,
            active_alerts: active_alerts.len(),
            critical_alerts: active_alerts
                .iter()
                .filter(|a| a.severity == AlertSeverity::Critical)
                .count(),
            warning_alerts: active_alerts
                .iter()
                .filter(|a| a.severity == AlertSeverity::Warning)
                .count(),
            recent_alerts: self.alerts(None).into_iter().take(RECENT_ALERTS).collect(),
            metrics: self.summaries(),
            generated_at: Utc::now(),
        }
    }
}

impl Default for MonitoringService {
    fn default() -> Self {
        Self::new(MonitoringOptions::default())
    }
}

#[async_trait]
impl DeploymentObserver for MonitoringService {
    async fn on_event(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Started {
                deployment_id,
                total_targets,
                rollout_type,
            } => {
                self.record_metric(
                    "deployments_started",
                    1.0,
                    MetricType::Counter,
                    &[("rollout_type", rollout_type.as_str())],
                );
                self.record_metric(
                    "deployment_targets",
                    *total_targets as f64,
                    MetricType::Gauge,
                    &[("deployment_id", deployment_id)],
                );
            }
            LifecycleEvent::Progress(progress) => {
                self.track_progress(progress);
            }
            LifecycleEvent::TargetFinished {
                success,
                duration_ms,
                ..
            } => {
                let result = if *success { "success" } else { "failure" };
                self.record_metric("target_deployments", 1.0, MetricType::Counter, &[("result", result)]);
                self.record_metric(
                    "target_deploy_duration_ms",
                    *duration_ms as f64,
                    MetricType::Histogram,
                    &[("result", result)],
                );
            }
            LifecycleEvent::Log { level, .. } => {
                self.record_log(*level);
            }
            LifecycleEvent::Completed { result, .. } => {
                self.record_metric("deployments_completed", 1.0, MetricType::Counter, &[]);
                self.record_metric(
                    "deployment_duration_ms",
                    result.duration_ms as f64,
                    MetricType::Histogram,
                    &[],
                );
                self.record_metric(
                    "deployment_success_rate",
                    if result.total_targets == 0 {
                        1.0
                    } else {
                        result.successful_targets as f64 / result.total_targets as f64
                    },
                    MetricType::Gauge,
                    &[("deployment_id", &result.deployment_id)],
                );
            }
            LifecycleEvent::Failed { deployment_id, error } => {
                self.record_metric("deployments_failed", 1.0, MetricType::Counter, &[]);
                self.set_deployment_status(deployment_id, DeploymentStatus::Failed, Some(error.clone()));
            }
            LifecycleEvent::Cancelled { deployment_id } => {
                self.record_metric("deployments_cancelled", 1.0, MetricType::Counter, &[]);
                self.set_deployment_status(deployment_id, DeploymentStatus::Cancelled, None);
            }
            LifecycleEvent::RolledBack { operation, .. } => {
                let status = match operation.status {
                    RollbackStatus::Completed => "completed",
                    _ => "failed",
                };
                self.record_metric("rollbacks", 1.0, MetricType::Counter, &[("status", status)]);
            }
        }
    }
}
