//! Rollout executor tests

use std::collections::HashSet;
use std::time::Duration;

use policy_deployer::deploy::executor::DeployerOptions;
use policy_deployer::errors::{DeployerError, ErrorCode};
use policy_deployer::models::deployment::{
    DeploymentStatus, RolloutPolicy, RolloutType, TargetStatus,
};
use policy_deployer::models::filter::{FilterCriterion, FilterOperator, TargetFilter};
use policy_deployer::models::health::{HealthCheckSpec, HealthCheckType};
use policy_deployer::models::target::TargetMetadata;
use serde_json::json;

use crate::support::{config, harness, harness_with, target, targets, ScriptedStrategy};

fn policy(rollout_type: RolloutType, max_concurrency: usize, failure_threshold: f64) -> RolloutPolicy {
    RolloutPolicy {
        rollout_type,
        max_concurrency,
        failure_threshold,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_immediate_rollout_tolerates_failures_below_threshold() {
    let h = harness(ScriptedStrategy::failing(&["t-01", "t-07"]));
    let result = h
        .deployer
        .deploy(config("d-1", targets(10), policy(RolloutType::Immediate, 5, 0.5)))
        .await
        .unwrap();

    assert_eq!(result.status, DeploymentStatus::Completed);
    assert!(!result.success);
    assert_eq!(result.total_targets, 10);
    assert_eq!(result.successful_targets, 8);
    assert_eq!(result.failed_targets, 2);
    assert_eq!(result.pending_targets, 0);
    assert_eq!(result.summary, "8/10 targets successful");
    assert_eq!(result.errors.len(), 2);
    assert!(result
        .errors
        .iter()
        .all(|e| e.code == ErrorCode::DeployFailed && e.message.contains("permission denied")));

    // every target exactly once
    let ids: HashSet<&str> = result.results.iter().map(|r| r.target_id.as_str()).collect();
    assert_eq!(ids.len(), 10);
    assert_eq!(h.strategy.deployed().len(), 10);
    assert!(h.strategy.max_in_flight() <= 5);

    let progress = h.deployer.get_progress("d-1").unwrap();
    assert!(progress.counts_consistent());
    assert_eq!(progress.successful_targets, 8);
    assert_eq!(progress.failed_targets, 2);
    assert_eq!(progress.total_batches, 2);
    assert!(progress.completed_at.is_some());
}

#[tokio::test]
async fn test_all_targets_succeed() {
    let h = harness(ScriptedStrategy::default());
    let result = h
        .deployer
        .deploy(config("d-ok", targets(4), RolloutPolicy::default()))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.status, DeploymentStatus::Completed);
    assert!(result.results.iter().all(|r| r.snapshot_id.is_some()));
    assert_eq!(h.deployer.get_result("d-ok").await.unwrap(), result);

    let progress = h.deployer.get_progress("d-ok").unwrap();
    assert_eq!(progress.progress, 100);
    assert!(progress.targets.iter().all(|t| t.status == TargetStatus::Completed));
}

#[tokio::test]
async fn test_threshold_breach_stops_new_batches() {
    let h = harness(ScriptedStrategy::failing(&["t-00", "t-01"]));
    let err = h
        .deployer
        .deploy(config("d-2", targets(10), policy(RolloutType::Rolling, 2, 0.1)))
        .await
        .unwrap_err();

    match err {
        DeployerError::ThresholdExceeded {
            failed,
            processed,
            rolled_back,
            ..
        } => {
            assert_eq!(failed, 2);
            assert_eq!(processed, 2);
            assert!(!rolled_back);
        }
        other => panic!("unexpected error: {other}"),
    }

    // only the first batch was issued
    assert_eq!(h.strategy.deployed().len(), 2);
    assert!(h.strategy.rolled_back().is_empty());

    let progress = h.deployer.get_progress("d-2").unwrap();
    assert_eq!(progress.status, DeploymentStatus::Failed);
    assert_eq!(progress.pending_targets, 8);

    let result = h.deployer.get_result("d-2").await.unwrap();
    assert_eq!(result.status, DeploymentStatus::Failed);
    assert_eq!(result.pending_targets, 8);
    assert_eq!(h.observer.count("deployment-failed"), 1);
    assert_eq!(h.observer.count("deployment-completed"), 0);
}

#[tokio::test]
async fn test_threshold_breach_with_auto_rollback() {
    let h = harness(ScriptedStrategy::failing(&["t-02", "t-03"]));
    let mut rollout = policy(RolloutType::Immediate, 2, 0.3);
    rollout.auto_rollback = true;

    let err = h
        .deployer
        .deploy(config("d-3", targets(6), rollout))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DeployerError::ThresholdExceeded {
            rolled_back: true,
            ..
        }
    ));
    // snapshots exist for every attempted target, failed ones included
    assert_eq!(h.strategy.rolled_back(), vec!["t-00", "t-01", "t-02", "t-03"]);
    assert_eq!(h.deployer.status("d-3").await, Some(DeploymentStatus::RolledBack));

    let result = h.deployer.get_result("d-3").await.unwrap();
    let operation = result.rollback.unwrap();
    assert_eq!(operation.processed_targets, 4);
    assert_eq!(operation.failed_targets, 0);
    assert_eq!(h.observer.count("deployment-rolled-back"), 1);
}

#[tokio::test]
async fn test_canary_failure_leaves_remainder_untouched() {
    let h = harness(ScriptedStrategy::failing(&["t-00"]));
    let err = h
        .deployer
        .deploy(config("d-4", targets(20), policy(RolloutType::Canary, 10, 0.5)))
        .await
        .unwrap_err();

    match err {
        DeployerError::ThresholdExceeded { stage, .. } => assert_eq!(stage, "canary"),
        other => panic!("unexpected error: {other}"),
    }
    // ceil(0.1 * 20) canaries, nothing else
    assert_eq!(h.strategy.deployed().len(), 2);
    let progress = h.deployer.get_progress("d-4").unwrap();
    assert_eq!(progress.pending_targets, 18);
}

#[tokio::test]
async fn test_unhealthy_canaries_abort_with_their_count() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.json").display().to_string();
    let fleet: Vec<_> = targets(20)
        .into_iter()
        .enumerate()
        .map(|(i, t)| {
            if i < 2 {
                t.with_health_check(HealthCheckSpec::new(HealthCheckType::FileExists, &missing))
            } else {
                t
            }
        })
        .collect();

    let h = harness(ScriptedStrategy::default());
    let err = h
        .deployer
        .deploy(config("d-4b", fleet, policy(RolloutType::Canary, 10, 0.5)))
        .await
        .unwrap_err();

    match err {
        DeployerError::ThresholdExceeded {
            stage,
            failed,
            processed,
            ..
        } => {
            assert_eq!(stage, "canary");
            assert_eq!(failed, 2);
            assert_eq!(processed, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.strategy.deployed().len(), 2);
    let result = h.deployer.get_result("d-4b").await.unwrap();
    assert!(result.warnings.iter().any(|w| w.contains("t-00") && w.contains("t-01")));
}

#[tokio::test]
async fn test_canary_success_deploys_canaries_first() {
    let h = harness(ScriptedStrategy::default());
    let result = h
        .deployer
        .deploy(config("d-5", targets(10), policy(RolloutType::Canary, 5, 0.1)))
        .await
        .unwrap();

    assert!(result.success);
    let deployed = h.strategy.deployed();
    assert_eq!(deployed.len(), 10);
    assert_eq!(deployed[0], "t-00");
    assert!(!deployed[1..].contains(&"t-00".to_string()));
}

#[tokio::test]
async fn test_staged_rollout_orders_environments() {
    let h = harness(ScriptedStrategy::default());
    let env = |id: &str, env: &str| {
        target(id).with_metadata(TargetMetadata {
            environment: Some(env.to_string()),
            ..Default::default()
        })
    };
    let fleet = vec![
        env("prod-1", "production"),
        env("dev-1", "development"),
        env("stg-1", "staging"),
        env("prod-2", "production"),
    ];

    let result = h
        .deployer
        .deploy(config("d-6", fleet, policy(RolloutType::Staged, 1, 0.0)))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(h.strategy.deployed(), vec!["dev-1", "stg-1", "prod-1", "prod-2"]);
}

#[tokio::test]
async fn test_cancellation_skips_remaining_batches() {
    let h = harness(ScriptedStrategy::default().with_delay(Duration::from_millis(200)));
    let deployer = h.deployer.clone();
    let handle = tokio::spawn(async move {
        deployer
            .deploy(config("d-7", targets(5), policy(RolloutType::Immediate, 1, 0.5)))
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let progress = h.deployer.cancel_deployment("d-7").await.unwrap();
    assert_eq!(progress.status, DeploymentStatus::Cancelled);

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, DeploymentStatus::Cancelled);
    assert!(!result.success);
    assert!(result.pending_targets >= 3);
    assert!(h.strategy.deployed().len() <= 2);

    assert_eq!(h.observer.count("deployment-cancelled"), 1);
    assert_eq!(h.observer.count("deployment-completed"), 0);

    // a cancelled deployment cannot be cancelled again
    assert!(matches!(
        h.deployer.cancel_deployment("d-7").await,
        Err(DeployerError::InvalidTransition(_))
    ));
    assert!(matches!(
        h.deployer.cancel_deployment("unknown").await,
        Err(DeployerError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_validation_rejects_bad_configs() {
    let h = harness(ScriptedStrategy::default());

    let empty = config("d-8", Vec::new(), RolloutPolicy::default());
    assert!(matches!(
        h.deployer.deploy(empty).await,
        Err(DeployerError::ValidationError(_))
    ));

    let mut no_version = config("d-8", targets(2), RolloutPolicy::default());
    no_version.payload = json!({"rules": []});
    match h.deployer.deploy(no_version).await {
        Err(DeployerError::ValidationError(msg)) => assert!(msg.contains("version")),
        other => panic!("unexpected: {other:?}"),
    }

    let mut duplicate = targets(2);
    duplicate.push(target("t-00"));
    assert!(matches!(
        h.deployer.deploy(config("d-8", duplicate, RolloutPolicy::default())).await,
        Err(DeployerError::ValidationError(_))
    ));

    assert!(matches!(
        h.deployer
            .deploy(config("d-8", targets(2), policy(RolloutType::Immediate, 0, 0.1)))
            .await,
        Err(DeployerError::ValidationError(_))
    ));

    assert!(h.strategy.deployed().is_empty());
    assert!(h.deployer.get_progress("d-8").is_none());
    assert!(h.observer.names().is_empty());
}

#[tokio::test]
async fn test_filters_narrow_the_fleet() {
    let h = harness(ScriptedStrategy::default());
    let mut cfg = config("d-9", targets(5), RolloutPolicy::default());
    cfg.filters = vec![TargetFilter::exclude(vec![FilterCriterion::new(
        "id",
        FilterOperator::In,
        json!(["t-01", "t-03"]),
    )])];

    let result = h.deployer.deploy(cfg).await.unwrap();
    assert_eq!(result.total_targets, 3);
    assert_eq!(h.strategy.deployed(), vec!["t-00", "t-02", "t-04"]);

    let mut none_left = config("d-10", targets(2), RolloutPolicy::default());
    none_left.filters = vec![TargetFilter::include(vec![FilterCriterion::new(
        "environment",
        FilterOperator::Equals,
        json!("production"),
    )])];
    assert!(matches!(
        h.deployer.deploy(none_left).await,
        Err(DeployerError::ValidationError(_))
    ));
}

#[tokio::test]
async fn test_panicking_strategy_only_fails_its_target() {
    let mut strategy = ScriptedStrategy::default();
    strategy.panic_on.insert("t-03".to_string());
    let h = harness(strategy);

    let result = h
        .deployer
        .deploy(config("d-11", targets(5), policy(RolloutType::Immediate, 5, 0.5)))
        .await
        .unwrap();

    assert_eq!(result.successful_targets, 4);
    let failed = result.results.iter().find(|r| !r.success).unwrap();
    assert_eq!(failed.target_id, "t-03");
    assert_eq!(failed.error.as_ref().unwrap().code, ErrorCode::TaskPanicked);
}

#[tokio::test]
async fn test_slow_target_times_out() {
    let h = harness(ScriptedStrategy::default().with_delay(Duration::from_secs(5)));
    let mut rollout = policy(RolloutType::Immediate, 2, 1.0);
    rollout.timeout = Duration::from_millis(50);

    let result = h
        .deployer
        .deploy(config("d-12", targets(2), rollout))
        .await
        .unwrap();

    assert_eq!(result.failed_targets, 2);
    assert!(result
        .errors
        .iter()
        .all(|e| e.code == ErrorCode::Timeout));
}

#[tokio::test]
async fn test_unknown_strategy_fails_target() {
    let h = harness(ScriptedStrategy::default());
    let mut fleet = targets(2);
    fleet[1].strategy = "ansible".to_string();

    let result = h
        .deployer
        .deploy(config("d-13", fleet, policy(RolloutType::Immediate, 2, 1.0)))
        .await
        .unwrap();

    assert_eq!(result.successful_targets, 1);
    assert_eq!(result.errors[0].target_id, "t-01");
    assert_eq!(result.errors[0].code, ErrorCode::StrategyNotFound);
    assert!(!result.errors[0].suggestions.is_empty());
    // pre-flight reported it too
    assert!(result.warnings.iter().any(|w| w.contains("t-01")));
}

#[tokio::test]
async fn test_unhealthy_target_fails_only_when_required() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.json").display().to_string();
    let fleet = vec![
        target("t-00").with_health_check(HealthCheckSpec::new(HealthCheckType::FileExists, &missing)),
        target("t-01"),
    ];

    let h = harness(ScriptedStrategy::default());
    let lenient = h
        .deployer
        .deploy(config("d-14", fleet.clone(), policy(RolloutType::Immediate, 2, 1.0)))
        .await
        .unwrap();
    assert_eq!(lenient.successful_targets, 2);
    assert!(lenient.warnings.iter().any(|w| w.contains("t-00")));
    let checks = &lenient.results[0].health_checks;
    assert!(!checks.is_empty());
    assert!(checks.iter().all(|c| !c.is_healthy()));

    let mut strict = policy(RolloutType::Immediate, 2, 1.0);
    strict.fail_on_health_check = true;
    let result = h
        .deployer
        .deploy(config("d-15", fleet, strict))
        .await
        .unwrap();
    assert_eq!(result.successful_targets, 1);
    assert_eq!(result.errors[0].code, ErrorCode::HealthCheckFailed);
}

#[tokio::test]
async fn test_observers_see_ordered_lifecycle() {
    let h = harness(ScriptedStrategy::failing(&["t-02"]));
    h.deployer
        .deploy(config("d-16", targets(4), policy(RolloutType::Immediate, 2, 0.5)))
        .await
        .unwrap();

    let names = h.observer.names();
    assert_eq!(names.first(), Some(&"deployment-started"));
    assert_eq!(names.last(), Some(&"deployment-completed"));
    assert_eq!(h.observer.count("target-finished"), 4);
    // one error log for the failed target
    assert!(h.observer.count("deployment-log") >= 1);
    assert!(h.observer.count("deployment-progress") > 4);
}

#[tokio::test]
async fn test_unreachable_target_is_a_warning() {
    let mut strategy = ScriptedStrategy::default();
    strategy.unreachable.insert("t-00".to_string());
    let h = harness_with(
        strategy,
        DeployerOptions {
            canary_observation: Duration::ZERO,
            ..Default::default()
        },
    );

    let result = h
        .deployer
        .deploy(config("d-17", targets(2), RolloutPolicy::default()))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].contains("connection refused"));
}

#[tokio::test]
async fn test_prune_expired_forgets_finished_deployments() {
    let h = harness(ScriptedStrategy::default());
    h.deployer
        .deploy(config("d-18", targets(2), RolloutPolicy::default()))
        .await
        .unwrap();

    assert_eq!(h.deployer.prune_expired(Duration::from_secs(3600)).await, 0);
    assert!(h.deployer.get_result("d-18").await.is_some());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.deployer.prune_expired(Duration::ZERO).await, 1);
    assert!(h.deployer.get_result("d-18").await.is_none());
    assert!(h.deployer.get_progress("d-18").is_none());
    assert_eq!(h.deployer.status("d-18").await, None);
}
