//! Health checker retry tests

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use policy_deployer::deploy::cancel::CancelToken;
use policy_deployer::errors::DeployerError;
use policy_deployer::health::backoff::RecordingSleeper;
use policy_deployer::health::checker::HealthChecker;
use policy_deployer::health::probes::HealthProbe;
use policy_deployer::models::health::{HealthCheckSpec, HealthCheckType, HealthCriteria, HealthStatus};

use crate::support::target;

#[tokio::test]
async fn test_failing_command_is_retried_with_backoff() {
    let sleeper = Arc::new(RecordingSleeper::new());
    let checker = HealthChecker::new().with_sleeper(sleeper.clone());
    let spec = HealthCheckSpec::new(HealthCheckType::Command, "exit 1").with_retries(2);

    let result = checker
        .perform_single_check(&spec, &target("ws-1"), &CancelToken::new())
        .await;

    assert_eq!(result.status, HealthStatus::Unhealthy);
    assert_eq!(result.attempts, 3);
    assert!(result.message.contains("3 attempts"), "{}", result.message);
    assert_eq!(
        sleeper.delays(),
        vec![Duration::from_millis(1000), Duration::from_millis(2000)]
    );
}

#[tokio::test]
async fn test_passing_command_stops_after_first_attempt() {
    let sleeper = Arc::new(RecordingSleeper::new());
    let checker = HealthChecker::new().with_sleeper(sleeper.clone());
    let mut spec = HealthCheckSpec::new(HealthCheckType::Command, "echo policy-ok").with_retries(4);
    spec.criteria.contains = Some("policy-ok".to_string());

    let result = checker
        .perform_single_check(&spec, &target("ws-1"), &CancelToken::new())
        .await;

    assert!(result.is_healthy(), "{}", result.message);
    assert_eq!(result.attempts, 1);
    assert!(sleeper.delays().is_empty());
}

#[tokio::test]
async fn test_endpoint_placeholders_are_resolved() {
    let checker = HealthChecker::new().with_sleeper(Arc::new(RecordingSleeper::new()));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ws-1.json");
    tokio::fs::write(&path, "{}").await.unwrap();

    let mut ws = target("ws-1");
    ws.connection = policy_deployer::models::target::ConnectionConfig::Local {
        path: path.display().to_string(),
    };
    let spec = HealthCheckSpec::new(HealthCheckType::FileExists, "{{TARGET_PATH}}");

    let result = checker
        .perform_single_check(&spec, &ws, &CancelToken::new())
        .await;
    assert!(result.is_healthy(), "{}", result.message);
    assert_eq!(result.endpoint, path.display().to_string());
}

#[tokio::test]
async fn test_cancelled_check_stops_early() {
    let sleeper = Arc::new(RecordingSleeper::new());
    let checker = HealthChecker::new().with_sleeper(sleeper.clone());
    let spec = HealthCheckSpec::new(HealthCheckType::Command, "exit 1").with_retries(5);

    let cancel = CancelToken::new();
    cancel.cancel();
    let result = checker.perform_single_check(&spec, &target("ws-1"), &cancel).await;

    assert_eq!(result.status, HealthStatus::Unhealthy);
    assert_eq!(result.attempts, 0);
}

/// Fails a fixed number of times, then passes
struct FlakyProbe {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl HealthProbe for FlakyProbe {
    async fn probe(
        &self,
        endpoint: &str,
        _criteria: &HealthCriteria,
        _timeout: Duration,
    ) -> Result<String, DeployerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(DeployerError::HealthCheckFailure(format!("{} not ready", endpoint)));
        }
        Ok(format!("{} ready", endpoint))
    }
}

#[tokio::test]
async fn test_flaky_probe_recovers_within_retries() {
    let sleeper = Arc::new(RecordingSleeper::new());
    let probe = Arc::new(FlakyProbe {
        failures: 2,
        calls: AtomicU32::new(0),
    });
    let checker = HealthChecker::new()
        .with_sleeper(sleeper.clone())
        .with_probe(HealthCheckType::Http, probe.clone());
    let spec = HealthCheckSpec::new(HealthCheckType::Http, "http://{{TARGET_HOST}}/ready").with_retries(3);

    let result = checker
        .perform_single_check(&spec, &target("ws-1"), &CancelToken::new())
        .await;

    assert!(result.is_healthy(), "{}", result.message);
    assert_eq!(result.attempts, 3);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    assert_eq!(sleeper.delays().len(), 2);
}
