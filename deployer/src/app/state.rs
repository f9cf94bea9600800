//! Application state management

use std::sync::Arc;

use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::deploy::executor::{DeployerServices, EnterpriseDeployer};
use crate::errors::DeployerError;
use crate::health::checker::HealthChecker;
use crate::models::deployment::DistributionResult;
use crate::models::target::DistributionTarget;
use crate::monitoring::service::MonitoringService;
use crate::notify::{LogNotifier, NotificationObserver};
use crate::progress::tracker::ProgressTracker;
use crate::rollback::service::RollbackService;
use crate::rollback::store::{FileSnapshotStore, SnapshotStore};
use crate::storage::layout::StorageLayout;
use crate::strategy::local::LocalFileStrategy;
use crate::strategy::manager::StrategyManager;
use crate::targets::filter::FilterEngine;
use crate::targets::manager::TargetManager;

/// Main application state
pub struct AppState {
    pub layout: StorageLayout,
    pub targets: Arc<TargetManager>,
    pub strategies: Arc<StrategyManager>,
    pub monitoring: Arc<MonitoringService>,
    pub rollback: Arc<RollbackService>,
    pub deployer: Arc<EnterpriseDeployer>,
}

impl AppState {
    /// Initialize application state backed by the storage layout
    pub async fn init(options: &AppOptions) -> Result<Self, DeployerError> {
        info!("Initializing application state...");

        options.storage.setup().await?;
        let store = FileSnapshotStore::new(options.storage.snapshots_dir().path());
        store.setup().await?;

        Ok(Self::with_store(options, Arc::new(store)))
    }

    /// Wire the services around a snapshot store
    pub fn with_store(options: &AppOptions, store: Arc<dyn SnapshotStore>) -> Self {
        let targets = Arc::new(TargetManager::new());

        let strategies = Arc::new(StrategyManager::new());
        strategies.register(Arc::new(LocalFileStrategy::new()));

        let rollback = Arc::new(
            RollbackService::new(store, strategies.clone(), options.rollback.clone())
                .with_target_registry(targets.clone()),
        );
        let monitoring = Arc::new(MonitoringService::new(options.monitoring.clone()));

        let services = DeployerServices {
            strategies: strategies.clone(),
            filters: Arc::new(FilterEngine::new(options.filter_cache_capacity)),
            health: Arc::new(HealthChecker::new().with_backoff(options.health_backoff.clone())),
            rollback: rollback.clone(),
            progress: Arc::new(ProgressTracker::new()),
        };
        let deployer = Arc::new(EnterpriseDeployer::new(options.deployer.clone(), services));
        deployer.add_observer(monitoring.clone());
        deployer.add_observer(Arc::new(NotificationObserver::new(Arc::new(LogNotifier))));

        Self {
            layout: options.storage.clone(),
            targets,
            strategies,
            monitoring,
            rollback,
            deployer,
        }
    }

    /// Register the targets listed in `targets.json`; invalid entries are
    /// skipped with a warning
    pub async fn load_targets(&self) -> Result<usize, DeployerError> {
        let file = self.layout.targets_file();
        let Some(targets) = file.read_json_opt::<Vec<DistributionTarget>>().await? else {
            return Ok(0);
        };

        let mut loaded = 0;
        for target in targets {
            let id = target.id.clone();
            match self.targets.upsert(target) {
                Ok(_) => loaded += 1,
                Err(e) => warn!("Skipping target {}: {}", id, e),
            }
        }
        info!("Loaded {} targets from {}", loaded, file.path().display());
        Ok(loaded)
    }

    /// Persist a finished deployment's result under `results/`
    pub async fn save_result(&self, result: &DistributionResult) -> Result<(), DeployerError> {
        let file = self
            .layout
            .results_dir()
            .file(&format!("{}.json", result.deployment_id));
        file.write_json(result).await
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), DeployerError> {
        info!("Shutting down application state...");
        let pruned = self.deployer.prune_finished().await;
        info!("Released {} finished executions", pruned);
        Ok(())
    }
}
