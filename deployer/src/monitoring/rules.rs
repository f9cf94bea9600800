//! Alert rules

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::deployment::{DeploymentProgress, DeploymentStatus};
use crate::models::monitoring::{AlertRule, AlertSeverity};
use crate::utils::duration_secs;

/// Thresholds the rules compare against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Failure rate above which a deployment raises a critical alert
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,
    #[serde(default = "default_long_running", with = "duration_secs")]
    pub long_running: Duration,
    #[serde(default = "default_error_window", with = "duration_secs")]
    pub error_log_window: Duration,
    /// Error logs tolerated inside the window
    #[serde(default = "default_error_threshold")]
    pub error_log_threshold: usize,
}

fn default_failure_rate() -> f64 {
    0.1
}

fn default_long_running() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_error_window() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_error_threshold() -> usize {
    10
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            failure_rate: default_failure_rate(),
            long_running: default_long_running(),
            error_log_window: default_error_window(),
            error_log_threshold: default_error_threshold(),
        }
    }
}

/// A rule that fired
#[derive(Debug, Clone, PartialEq)]
pub struct RuleHit {
    pub rule: AlertRule,
    pub severity: AlertSeverity,
    pub deployment_id: Option<String>,
    pub message: String,
    pub metadata: serde_json::Value,
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Rules over one deployment snapshot
pub fn evaluate_deployment(
    progress: &DeploymentProgress,
    thresholds: &AlertThresholds,
    now: DateTime<Utc>,
) -> Vec<RuleHit> {
    let mut hits = Vec::new();
    let id = &progress.deployment_id;

    if progress.status == DeploymentStatus::Failed {
        hits.push(RuleHit {
            rule: AlertRule::DeploymentFailed,
            severity: AlertSeverity::Critical,
            deployment_id: Some(id.clone()),
            message: format!(
                "Deployment {} failed: {}",
                id,
                progress.message.as_deref().unwrap_or("no details")
            ),
            metadata: serde_json::json!({
                "failed_targets": progress.failed_targets,
                "total_targets": progress.total_targets,
            }),
        });
    }

    let rate = progress.failure_rate();
    if rate > thresholds.failure_rate {
        hits.push(RuleHit {
            rule: AlertRule::HighFailureRate,
            severity: AlertSeverity::Critical,
            deployment_id: Some(id.clone()),
            message: format!(
                "Deployment {} failure rate {:.1}% exceeds {:.1}%",
                id,
                rate * 100.0,
                thresholds.failure_rate * 100.0
            ),
            metadata: serde_json::json!({
                "failure_rate": rate,
                "failed_targets": progress.failed_targets,
            }),
        });
    }

    let still_running = matches!(
        progress.status,
        DeploymentStatus::Pending | DeploymentStatus::Deploying
    );
    let elapsed = now - progress.started_at;
    if still_running && elapsed > chrono_duration(thresholds.long_running) {
        hits.push(RuleHit {
            rule: AlertRule::LongRunningDeployment,
            severity: AlertSeverity::Warning,
            deployment_id: Some(id.clone()),
            message: format!(
                "Deployment {} has been {} for {} minutes",
                id,
                progress.status.as_str(),
                elapsed.num_minutes()
            ),
            metadata: serde_json::json!({ "elapsed_seconds": elapsed.num_seconds() }),
        });
    }

    hits
}

/// Number of error logs inside the trailing window ending at `now`
pub fn errors_in_window(
    error_logs: &[DateTime<Utc>],
    window: Duration,
    now: DateTime<Utc>,
) -> usize {
    let since = now - chrono_duration(window);
    error_logs
        .iter()
        .filter(|at| **at >= since && **at <= now)
        .count()
}

pub fn evaluate_error_logs(
    error_logs: &[DateTime<Utc>],
    thresholds: &AlertThresholds,
    now: DateTime<Utc>,
) -> Option<RuleHit> {
    let count = errors_in_window(error_logs, thresholds.error_log_window, now);
    (count > thresholds.error_log_threshold).then(|| RuleHit {
        rule: AlertRule::ErrorLogSpike,
        severity: AlertSeverity::Warning,
        deployment_id: None,
        message: format!(
            "{} error logs in the last {} minutes",
            count,
            thresholds.error_log_window.as_secs() / 60
        ),
        metadata: serde_json::json!({ "error_logs": count }),
    })
}
