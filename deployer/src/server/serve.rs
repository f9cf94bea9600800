//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::DeployerError;
use crate::server::handlers::{
    acknowledge_alert_handler, alerts_handler, cancel_handler, dashboard_handler,
    deployment_handler, deployments_handler, health_handler, metrics_handler, resolve_alert_handler,
    rollback_handler, target_stats_handler, targets_handler, version_handler,
};
use crate::server::state::ServerState;

/// Routes of the HTTP API
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Deployments
        .route("/deployments", get(deployments_handler))
        .route("/deployments/{id}", get(deployment_handler))
        .route("/deployments/{id}/cancel", post(cancel_handler))
        .route("/deployments/{id}/rollback", post(rollback_handler))
        // Fleet
        .route("/targets", get(targets_handler))
        .route("/targets/stats", get(target_stats_handler))
        // Monitoring
        .route("/dashboard", get(dashboard_handler))
        .route("/metrics", get(metrics_handler))
        .route("/alerts", get(alerts_handler))
        .route("/alerts/{id}/acknowledge", post(acknowledge_alert_handler))
        .route("/alerts/{id}/resolve", post(resolve_alert_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), DeployerError>>, DeployerError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| DeployerError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| DeployerError::ServerError(e.to_string()))
    });

    Ok(handle)
}
