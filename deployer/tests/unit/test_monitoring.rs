//! Monitoring observer, alert lifecycle and dashboard tests

use std::sync::Arc;

use chrono::Utc;

use policy_deployer::errors::DeployerError;
use policy_deployer::logs::LogLevel;
use policy_deployer::models::deployment::{
    DeploymentProgress, DeploymentStatus, RolloutPolicy, RolloutType,
};
use policy_deployer::models::monitoring::{AlertRule, AlertSeverity, AlertStatus, SystemHealth};
use policy_deployer::monitoring::service::{MonitoringOptions, MonitoringService};

use crate::support::{config, harness, targets, ScriptedStrategy};

fn rollout(max_concurrency: usize, failure_threshold: f64) -> RolloutPolicy {
    RolloutPolicy {
        rollout_type: RolloutType::Rolling,
        max_concurrency,
        failure_threshold,
        ..Default::default()
    }
}

fn rule_alerts(monitoring: &MonitoringService, rule: AlertRule) -> usize {
    monitoring.alerts(None).iter().filter(|a| a.rule == rule).count()
}

#[tokio::test]
async fn test_observer_tracks_completed_deployment() {
    let h = harness(ScriptedStrategy::failing(&["t-03", "t-07"]));
    let monitoring = Arc::new(MonitoringService::default());
    h.deployer.add_observer(monitoring.clone());

    let result = h
        .deployer
        .deploy(config("d-mon", targets(10), rollout(5, 0.5)))
        .await
        .unwrap();
    assert_eq!(result.failed_targets, 2);

    let tracked = monitoring.deployment("d-mon").unwrap();
    assert_eq!(tracked.status, DeploymentStatus::Completed);
    assert_eq!(tracked.successful_targets, 8);
    assert_eq!(tracked.failed_targets, 2);

    // 20% failed is above the default 10% alert threshold; raised once
    assert_eq!(rule_alerts(&monitoring, AlertRule::HighFailureRate), 1);
    assert!(monitoring.metric_names().contains(&"deployments_completed".to_string()));

    let dashboard = monitoring.dashboard();
    assert_eq!(dashboard.total_deployments, 1);
    assert_eq!(dashboard.completed_deployments, 1);
    assert_eq!(dashboard.active_deployments, 0);
    assert_eq!(dashboard.success_rate, 1.0);
    assert_eq!(dashboard.critical_alerts, 1);
    assert_eq!(dashboard.system_health, SystemHealth::Critical);
}

#[tokio::test]
async fn test_observer_tracks_failed_deployment() {
    let h = harness(ScriptedStrategy::failing(&["t-00", "t-01", "t-02", "t-03"]));
    let monitoring = Arc::new(MonitoringService::default());
    h.deployer.add_observer(monitoring.clone());

    let err = h
        .deployer
        .deploy(config("d-fail", targets(4), rollout(2, 0.1)))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployerError::ThresholdExceeded { .. }));

    let tracked = monitoring.deployment("d-fail").unwrap();
    assert_eq!(tracked.status, DeploymentStatus::Failed);
    assert_eq!(rule_alerts(&monitoring, AlertRule::DeploymentFailed), 1);

    let dashboard = monitoring.dashboard();
    assert_eq!(dashboard.failed_deployments, 1);
    assert_eq!(dashboard.success_rate, 0.0);
}

#[tokio::test]
async fn test_acknowledged_alerts_leave_health_untouched() {
    let h = harness(ScriptedStrategy::failing(&["t-00", "t-01"]));
    let monitoring = Arc::new(MonitoringService::default());
    h.deployer.add_observer(monitoring.clone());

    assert!(h
        .deployer
        .deploy(config("d-ack", targets(2), rollout(2, 0.1)))
        .await
        .is_err());
    assert_eq!(monitoring.system_health(), SystemHealth::Critical);

    let active = monitoring.alerts(Some(AlertStatus::Active));
    assert!(active.iter().any(|a| a.rule == AlertRule::DeploymentFailed));
    for alert in &active {
        monitoring.acknowledge_alert(&alert.id).unwrap();
    }

    assert_eq!(monitoring.system_health(), SystemHealth::Healthy);
    let dashboard = monitoring.dashboard();
    assert_eq!(dashboard.system_health, SystemHealth::Healthy);
    assert_eq!(dashboard.active_alerts, 0);
    assert_eq!(dashboard.critical_alerts, 0);
    assert_eq!(dashboard.warning_alerts, 0);
    // still listed until resolved
    assert_eq!(monitoring.open_alerts().len(), active.len());
    assert_eq!(dashboard.recent_alerts.len(), active.len());
}

#[tokio::test]
async fn test_retention_drops_finished_deployments_and_resolved_alerts() {
    let h = harness(ScriptedStrategy::failing(&["t-00", "t-01"]));
    let monitoring = Arc::new(MonitoringService::default());
    h.deployer.add_observer(monitoring.clone());

    assert!(h
        .deployer
        .deploy(config("d-old", targets(2), rollout(2, 0.1)))
        .await
        .is_err());
    let mut running = DeploymentProgress::new("d-running", &[]);
    running.status = DeploymentStatus::Deploying;
    monitoring.track_progress(&running);

    for alert in monitoring.open_alerts() {
        monitoring.resolve_alert(&alert.id).unwrap();
    }
    let later = Utc::now() + chrono::Duration::hours(25);
    monitoring.prune_at(later);

    assert!(monitoring.deployment("d-old").is_none());
    assert!(monitoring.deployment("d-running").is_some());
    assert!(monitoring.alerts(Some(AlertStatus::Resolved)).is_empty());
    assert_eq!(monitoring.dashboard().total_deployments, 1);
    // long-running alert for the deployment still in flight
    let raised = monitoring.evaluate_rules_at(later);
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].deployment_id.as_deref(), Some("d-running"));
}

#[tokio::test]
async fn test_dashboard_counts_both_outcomes() {
    let h = harness(ScriptedStrategy::failing(&["bad-00", "bad-01"]));
    let monitoring = Arc::new(MonitoringService::default());
    h.deployer.add_observer(monitoring.clone());

    h.deployer
        .deploy(config("d-good", targets(3), rollout(3, 0.5)))
        .await
        .unwrap();

    let bad = vec![crate::support::target("bad-00"), crate::support::target("bad-01")];
    assert!(h
        .deployer
        .deploy(config("d-bad", bad, rollout(2, 0.1)))
        .await
        .is_err());

    let dashboard = monitoring.dashboard();
    assert_eq!(dashboard.total_deployments, 2);
    assert_eq!(dashboard.completed_deployments, 1);
    assert_eq!(dashboard.failed_deployments, 1);
    assert_eq!(dashboard.success_rate, 0.5);
}

#[test]
fn test_alert_lifecycle() {
    let monitoring = MonitoringService::new(MonitoringOptions::default());
    let now = Utc::now();
    for _ in 0..12 {
        monitoring.record_log_at(LogLevel::Error, now);
    }

    let alerts = monitoring.alerts(Some(AlertStatus::Active));
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.rule, AlertRule::ErrorLogSpike);
    assert_eq!(alert.severity, AlertSeverity::Warning);

    let acknowledged = monitoring.acknowledge_alert(&alert.id).unwrap();
    assert_eq!(acknowledged.status, AlertStatus::Acknowledged);
    assert!(acknowledged.acknowledged_at.is_some());
    assert!(matches!(
        monitoring.acknowledge_alert(&alert.id),
        Err(DeployerError::InvalidTransition(_))
    ));

    let resolved = monitoring.resolve_alert(&alert.id).unwrap();
    assert_eq!(resolved.status, AlertStatus::Resolved);
    assert!(resolved.resolved_at.is_some());
    assert!(monitoring.open_alerts().is_empty());
    assert!(matches!(
        monitoring.resolve_alert(&alert.id),
        Err(DeployerError::InvalidTransition(_))
    ));

    assert!(matches!(
        monitoring.resolve_alert("alert-missing"),
        Err(DeployerError::NotFound(_))
    ));
}

#[test]
fn test_error_logs_below_threshold_raise_nothing() {
    let monitoring = MonitoringService::default();
    let now = Utc::now();
    for _ in 0..10 {
        assert!(monitoring.record_log_at(LogLevel::Error, now).is_none());
    }
    assert!(monitoring.record_log_at(LogLevel::Warn, now).is_none());
    assert!(monitoring.alerts(None).is_empty());
    assert_eq!(monitoring.system_health(), SystemHealth::Healthy);
}
