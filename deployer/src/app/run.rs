//! Main application run loop

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::DeployerError;
use crate::models::deployment::{DeploymentConfig, DistributionResult};
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::monitor;

/// Run the deployer.
///
/// When a deployment is given it is executed against the registered fleet;
/// a shutdown signal during the rollout cancels it. With the HTTP API enabled
/// the process keeps serving until the shutdown signal.
pub async fn run(
    options: AppOptions,
    deployment: Option<DeploymentConfig>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<Option<DistributionResult>, DeployerError> {
    info!("Initializing policy deployer...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    let app_state = match init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to start deployer: {}", e);
            shutdown_manager.shutdown().await?;
            return Err(e);
        }
    };

    let mut shutdown_signal = Box::pin(shutdown_signal);
    let mut signalled = false;

    let mut outcome = Ok(None);
    if let Some(config) = deployment {
        let (result, got_signal) = run_deployment(&app_state, config, &mut shutdown_signal).await;
        signalled = got_signal;
        outcome = result.map(Some);
    }

    if options.enable_server && !signalled {
        info!("Serving until shutdown signal...");
        shutdown_signal.await;
        info!("Shutdown signal received, shutting down...");
    }

    drop(shutdown_tx);
    shutdown_manager.shutdown().await?;
    outcome
}

/// Execute one deployment. Threshold breaches are reported through the
/// returned result; only validation failures surface as errors.
async fn run_deployment(
    app_state: &AppState,
    mut config: DeploymentConfig,
    shutdown_signal: &mut Pin<Box<impl Future<Output = ()> + Send>>,
) -> (Result<DistributionResult, DeployerError>, bool) {
    if config.targets.is_empty() {
        config.targets = app_state.targets.list();
        info!("Deployment lists no targets, using {} registered targets", config.targets.len());
    }

    let deployment_id = config.id.clone();
    let deployer = app_state.deployer.clone();
    let deploy = deployer.deploy(config);
    tokio::pin!(deploy);

    let finished = tokio::select! {
        result = &mut deploy => Some(result),
        _ = shutdown_signal.as_mut() => None,
    };
    let signalled = finished.is_none();
    let result = match finished {
        Some(result) => result,
        None => {
            warn!("Shutdown signal received, cancelling deployment {}", deployment_id);
            if let Err(e) = app_state.deployer.cancel_deployment(&deployment_id).await {
                warn!("Unable to cancel deployment {}: {}", deployment_id, e);
            }
            deploy.await
        }
    };

    let result = match result {
        Ok(result) => Ok(result),
        Err(e @ DeployerError::ThresholdExceeded { .. }) => {
            error!("Deployment {} aborted: {}", deployment_id, e);
            app_state
                .deployer
                .get_result(&deployment_id)
                .await
                .ok_or(e)
        }
        Err(e) => Err(e),
    };

    if let Ok(result) = &result {
        if let Err(e) = app_state.save_result(result).await {
            warn!("Unable to persist result of {}: {}", deployment_id, e);
        }
    }
    (result, signalled)
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, DeployerError> {
    let app_state = Arc::new(AppState::init(options).await?);
    app_state.load_targets().await?;
    shutdown_manager.with_app_state(app_state.clone())?;

    init_monitor_worker(
        options.monitor_worker.clone(),
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    if options.enable_server {
        init_server(options, app_state.clone(), shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    Ok(app_state)
}

fn init_monitor_worker(
    options: monitor::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeployerError> {
    info!("Initializing monitor worker...");

    let monitoring = app_state.monitoring.clone();
    let deployer = app_state.deployer.clone();
    let handle = tokio::spawn(async move {
        monitor::run(
            &options,
            monitoring.as_ref(),
            deployer.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_monitor_worker_handle(handle)
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeployerError> {
    info!("Initializing HTTP API...");

    let server_state = ServerState::new(
        app_state.deployer.clone(),
        app_state.monitoring.clone(),
        app_state.targets.clone(),
    );

    let handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    server_handle: Option<JoinHandle<Result<(), DeployerError>>>,
    monitor_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            server_handle: None,
            monitor_worker_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), DeployerError> {
        if self.app_state.is_some() {
            return Err(DeployerError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_monitor_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DeployerError> {
        if self.monitor_worker_handle.is_some() {
            return Err(DeployerError::ShutdownError("monitor_handle already set".to_string()));
        }
        self.monitor_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), DeployerError>>,
    ) -> Result<(), DeployerError> {
        if self.server_handle.is_some() {
            return Err(DeployerError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), DeployerError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), DeployerError> {
        info!("Shutting down policy deployer...");

        // 1. Monitor worker
        if let Some(handle) = self.monitor_worker_handle.take() {
            handle.await.map_err(|e| DeployerError::ShutdownError(e.to_string()))?;
        }

        // 2. HTTP API
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| DeployerError::ShutdownError(e.to_string()))??;
        }

        // 3. App state
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
