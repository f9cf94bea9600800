//! Snapshot and rollback tests against real policy files

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use policy_deployer::deploy::executor::{DeployerOptions, DeployerServices, EnterpriseDeployer};
use policy_deployer::errors::DeployerError;
use policy_deployer::filesys::file::File;
use policy_deployer::health::checker::HealthChecker;
use policy_deployer::models::deployment::{DeploymentConfig, RolloutPolicy};
use policy_deployer::models::rollback::{RollbackSnapshot, RollbackStatus};
use policy_deployer::models::target::{ConnectionConfig, DistributionTarget, TargetType};
use policy_deployer::progress::tracker::ProgressTracker;
use policy_deployer::rollback::service::{RollbackOptions, RollbackService};
use policy_deployer::rollback::store::FileSnapshotStore;
use policy_deployer::strategy::local::{LocalFileStrategy, LOCAL_STRATEGY};
use policy_deployer::strategy::manager::StrategyManager;
use policy_deployer::strategy::{DeploymentStrategy, TargetDeployState};
use policy_deployer::targets::filter::FilterEngine;

struct Fleet {
    dir: TempDir,
    store: Arc<FileSnapshotStore>,
    strategy: Arc<LocalFileStrategy>,
    rollback: Arc<RollbackService>,
    deployer: EnterpriseDeployer,
}

async fn fleet() -> Fleet {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileSnapshotStore::new(dir.path().join("snapshots")));
    store.setup().await.unwrap();

    let strategy = Arc::new(LocalFileStrategy::new());
    let strategies = Arc::new(StrategyManager::new());
    strategies.register(strategy.clone());
    let rollback = Arc::new(RollbackService::new(
        store.clone(),
        strategies.clone(),
        RollbackOptions::default(),
    ));

    let deployer = EnterpriseDeployer::new(
        DeployerOptions {
            canary_observation: Duration::ZERO,
            ..Default::default()
        },
        DeployerServices {
            strategies,
            filters: Arc::new(FilterEngine::default()),
            health: Arc::new(HealthChecker::new()),
            rollback: rollback.clone(),
            progress: Arc::new(ProgressTracker::new()),
        },
    );

    Fleet {
        dir,
        store,
        strategy,
        rollback,
        deployer,
    }
}

fn workstation(id: &str, root: &Path) -> DistributionTarget {
    DistributionTarget::new(
        id,
        id.to_uppercase(),
        TargetType::Workstation,
        LOCAL_STRATEGY,
        ConnectionConfig::Local {
            path: root.join(format!("{}.json", id)).display().to_string(),
        },
    )
}

fn rollout(id: &str, version: u32, targets: Vec<DistributionTarget>) -> DeploymentConfig {
    DeploymentConfig {
        id: id.to_string(),
        payload: json!({"version": version, "rules": ["block-removable-media"]}),
        targets,
        filters: Vec::new(),
        rollout: RolloutPolicy::default(),
        rollback: Default::default(),
        monitoring: Default::default(),
    }
}

async fn policy_version(root: &Path, id: &str) -> Option<u64> {
    let file = File::new(root.join(format!("{}.json", id)));
    let policy: Option<serde_json::Value> = file.read_json_opt().await.unwrap();
    policy.and_then(|p| p["version"].as_u64())
}

#[tokio::test]
async fn test_rollback_restores_previous_policy() {
    let fleet = fleet().await;
    let root = fleet.dir.path().to_path_buf();
    let targets = vec![workstation("c0", &root), workstation("c1", &root)];

    let first = fleet.deployer.deploy(rollout("v1", 1, targets.clone())).await.unwrap();
    assert!(first.success);
    let second = fleet.deployer.deploy(rollout("v2", 2, targets.clone())).await.unwrap();
    assert!(second.success);
    let status = fleet.strategy.get_status(&targets[0], "v2").await.unwrap();
    assert_eq!(status.status, TargetDeployState::Deployed);
    assert_eq!(policy_version(&root, "c0").await, Some(2));
    assert_eq!(policy_version(&root, "c1").await, Some(2));
    assert!(second.results.iter().all(|r| r.snapshot_id.is_some()));

    let operation = fleet
        .deployer
        .rollback_deployment("v2", &[], Some("bad rule".to_string()))
        .await
        .unwrap();

    assert_eq!(operation.status, RollbackStatus::Completed);
    assert_eq!(operation.processed_targets, 2);
    assert_eq!(operation.failed_targets, 0);
    assert_eq!(policy_version(&root, "c0").await, Some(1));
    assert_eq!(policy_version(&root, "c1").await, Some(1));
    for target in &targets {
        let status = fleet.strategy.get_status(target, "v2").await.unwrap();
        assert_eq!(status.status, TargetDeployState::RolledBack);
    }
}

#[tokio::test]
async fn test_deployment_rollback_policy_controls_backups() {
    let fleet = fleet().await;
    let root = fleet.dir.path().to_path_buf();
    let targets = vec![workstation("c0", &root), workstation("c1", &root)];

    fleet.deployer.deploy(rollout("v1", 1, targets.clone())).await.unwrap();

    let mut config = rollout("v2", 2, targets);
    config.rollback.create_backups = false;
    config.rollback.max_attempts = 1;
    assert!(fleet.deployer.deploy(config).await.unwrap().success);

    let snapshots = fleet.rollback.list_snapshots("v2").await.unwrap();
    assert_eq!(snapshots.len(), 2);
    for snapshot in &snapshots {
        assert_eq!(snapshot.previous_configuration.as_ref().map(|p| p["version"].clone()), Some(json!(1)));
        assert!(snapshot.backup_path.is_none());
    }

    // restoring still works from the snapshot alone
    let operation = fleet.deployer.rollback_deployment("v2", &[], None).await.unwrap();
    assert_eq!(operation.status, RollbackStatus::Completed);
    assert_eq!(policy_version(&root, "c0").await, Some(1));
}

#[tokio::test]
async fn test_partial_rollback_only_touches_selected_targets() {
    let fleet = fleet().await;
    let root = fleet.dir.path().to_path_buf();
    let targets = vec![workstation("c0", &root), workstation("c1", &root)];

    fleet.deployer.deploy(rollout("v1", 1, targets.clone())).await.unwrap();
    fleet.deployer.deploy(rollout("v2", 2, targets)).await.unwrap();

    let operation = fleet
        .deployer
        .rollback_deployment("v2", &["c1".to_string()], None)
        .await
        .unwrap();

    assert_eq!(operation.processed_targets, 1);
    assert_eq!(policy_version(&root, "c0").await, Some(2));
    assert_eq!(policy_version(&root, "c1").await, Some(1));
}

#[tokio::test]
async fn test_rollback_of_first_deployment_removes_policy() {
    let fleet = fleet().await;
    let root = fleet.dir.path().to_path_buf();

    fleet
        .deployer
        .deploy(rollout("v1", 1, vec![workstation("c0", &root)]))
        .await
        .unwrap();
    assert_eq!(policy_version(&root, "c0").await, Some(1));

    let operation = fleet.deployer.rollback_deployment("v1", &[], None).await.unwrap();
    assert_eq!(operation.status, RollbackStatus::Completed);
    assert_eq!(policy_version(&root, "c0").await, None);
}

#[tokio::test]
async fn test_rollback_unknown_deployment() {
    let fleet = fleet().await;
    let err = fleet.deployer.rollback_deployment("nope", &[], None).await.unwrap_err();
    assert!(matches!(err, DeployerError::NotFound(_)));
}

#[tokio::test]
async fn test_tampered_snapshot_is_rejected() {
    let fleet = fleet().await;
    let root = fleet.dir.path().to_path_buf();
    let target = workstation("c0", &root);

    let snapshot = fleet
        .rollback
        .create_snapshot("v2", &target, &json!({"version": 2}), None)
        .await
        .unwrap();
    assert_ok!(fleet.rollback.validate_snapshot(&snapshot).await);

    let file = fleet.store.snapshot_file(&snapshot.snapshot_id);
    let mut stored: RollbackSnapshot = file.read_json().await.unwrap();
    stored.new_configuration = json!({"version": 3});
    file.delete().await.unwrap();
    file.write_json(&stored).await.unwrap();

    let reloaded = fleet
        .rollback
        .get_snapshot(&snapshot.snapshot_id)
        .await
        .unwrap()
        .unwrap();
    let err = assert_err!(fleet.rollback.validate_snapshot(&reloaded).await);
    assert!(matches!(err, DeployerError::SnapshotIntegrityError { .. }));

    let operation = fleet.rollback.trigger_rollback("v2", &[], None, None).await;
    assert_eq!(operation.failed_targets, 1);
    assert!(!operation.results[0].success);
}

#[tokio::test]
async fn test_cleanup_snapshots_removes_old_entries() {
    let fleet = fleet().await;
    let root = fleet.dir.path().to_path_buf();
    let target = workstation("c0", &root);

    fleet
        .rollback
        .create_snapshot("v1", &target, &json!({"version": 1}), None)
        .await
        .unwrap();
    assert_eq!(fleet.rollback.list_snapshots("v1").await.unwrap().len(), 1);

    // Nothing is older than an hour
    assert_eq!(
        fleet.rollback.cleanup_snapshots(Duration::from_secs(3600)).await.unwrap(),
        0
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fleet.rollback.cleanup_snapshots(Duration::ZERO).await.unwrap(), 1);
    assert!(fleet.rollback.list_snapshots("v1").await.unwrap().is_empty());
}
