//! Health check runner with bounded retries

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::deploy::cancel::CancelToken;
use crate::health::backoff::{Sleeper, TokioSleeper};
use crate::health::probes::{
    CommandProbe, ConfigValidationProbe, FileExistsProbe, HealthProbe, HttpProbe, TcpProbe,
};
use crate::models::health::{HealthCheckResult, HealthCheckSpec, HealthCheckType, HealthStatus};
use crate::models::target::DistributionTarget;
use crate::utils::BackoffPolicy;

/// Substitute `{{TARGET_HOST}}`, `{{TARGET_PORT}}` and `{{TARGET_PATH}}`
pub fn resolve_endpoint(template: &str, target: &DistributionTarget) -> String {
    template
        .replace("{{TARGET_HOST}}", &target.connection.host())
        .replace("{{TARGET_PORT}}", &target.connection.port().to_string())
        .replace("{{TARGET_PATH}}", &target.connection.path())
}

/// Runs typed probes against a target
pub struct HealthChecker {
    probes: HashMap<HealthCheckType, Arc<dyn HealthProbe>>,
    backoff: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl HealthChecker {
    /// Checker with the built-in probes and real sleeps
    pub fn new() -> Self {
        let mut probes: HashMap<HealthCheckType, Arc<dyn HealthProbe>> = HashMap::new();
        probes.insert(HealthCheckType::Http, Arc::new(HttpProbe::new()));
        probes.insert(HealthCheckType::Tcp, Arc::new(TcpProbe));
        probes.insert(HealthCheckType::Command, Arc::new(CommandProbe));
        probes.insert(HealthCheckType::FileExists, Arc::new(FileExistsProbe));
        probes.insert(HealthCheckType::ConfigValidation, Arc::new(ConfigValidationProbe));

        Self {
            probes,
            backoff: BackoffPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Replace the probe used for one check type
    pub fn with_probe(mut self, check_type: HealthCheckType, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.insert(check_type, probe);
        self
    }

    /// Run one check with up to `retries + 1` attempts.
    ///
    /// Never fails: exhausted retries, a missing probe or cancellation all
    /// produce an unhealthy result.
    pub async fn perform_single_check(
        &self,
        spec: &HealthCheckSpec,
        target: &DistributionTarget,
        cancel: &CancelToken,
    ) -> HealthCheckResult {
        let started = Instant::now();
        let endpoint = resolve_endpoint(&spec.endpoint, target);
        let timeout = Duration::from_secs(spec.timeout_seconds.max(1));
        let max_attempts = spec.retries.saturating_add(1);

        let result = |status: HealthStatus, message: String, attempts: u32| HealthCheckResult {
            check_type: spec.check_type,
            endpoint: endpoint.clone(),
            status,
            message,
            duration_ms: started.elapsed().as_millis() as u64,
            attempts,
            checked_at: Utc::now(),
        };

        let Some(probe) = self.probes.get(&spec.check_type).cloned() else {
            return result(
                HealthStatus::Unhealthy,
                format!("no probe registered for '{}'", spec.check_type.as_str()),
                0,
            );
        };

        let mut errors = Vec::new();
        let mut attempts = 0;

        while attempts < max_attempts {
            if cancel.is_cancelled() {
                errors.push("cancelled".to_string());
                break;
            }
            attempts += 1;

            match probe.probe(&endpoint, &spec.criteria, timeout).await {
                Ok(message) => {
                    debug!(
                        target_id = %target.id,
                        "{} check passed on attempt {}: {}",
                        spec.check_type.as_str(),
                        attempts,
                        message
                    );
                    return result(HealthStatus::Healthy, message, attempts);
                }
                Err(e) => {
                    debug!(
                        target_id = %target.id,
                        "{} check attempt {}/{} failed: {}",
                        spec.check_type.as_str(),
                        attempts,
                        max_attempts,
                        e
                    );
                    errors.push(format!("attempt {}: {}", attempts, e));
                }
            }

            if attempts < max_attempts {
                let delay = self.backoff.delay_for(attempts);
                tokio::select! {
                    _ = self.sleeper.sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }

        let message = format!(
            "Health check failed after {} attempts: {}",
            attempts,
            errors.join("; ")
        );
        warn!(target_id = %target.id, "{}", message);
        result(HealthStatus::Unhealthy, message, attempts)
    }

    /// Run each spec in order
    pub async fn run_checks(
        &self,
        specs: &[HealthCheckSpec],
        target: &DistributionTarget,
        cancel: &CancelToken,
    ) -> Vec<HealthCheckResult> {
        let mut results = Vec::with_capacity(specs.len());
        for spec in specs {
            results.push(self.perform_single_check(spec, target, cancel).await);
        }
        results
    }

    /// Run the target's own health check, if it has one
    pub async fn check_target(
        &self,
        target: &DistributionTarget,
        cancel: &CancelToken,
    ) -> Vec<HealthCheckResult> {
        match &target.health_check {
            Some(spec) => vec![self.perform_single_check(spec, target, cancel).await],
            None => Vec::new(),
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}
