//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::DeployerError;
use crate::models::deployment::{DeploymentProgress, DistributionResult};
use crate::models::monitoring::{AlertStatus, SystemHealth};
use crate::server::state::ServerState;
use crate::utils::version_info;

fn status_for(error: &DeployerError) -> StatusCode {
    match error {
        DeployerError::NotFound(_) => StatusCode::NOT_FOUND,
        DeployerError::InvalidTransition(_) => StatusCode::CONFLICT,
        DeployerError::ValidationError(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(error: DeployerError) -> StatusCode {
    let status = status_for(&error);
    if status.is_server_error() {
        warn!("Request failed: {}", error);
    }
    status
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub system_health: SystemHealth,
}

pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "policy-deployer".to_string(),
        version: version.version,
        system_health: state.monitoring.system_health(),
    })
}

pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

pub async fn deployments_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.deployer.list_progress())
}

/// Progress of a deployment and, once finished, its result
#[derive(Debug, Serialize)]
pub struct DeploymentView {
    pub progress: DeploymentProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<DistributionResult>,
}

pub async fn deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let progress = state.deployer.get_progress(&id).ok_or(StatusCode::NOT_FOUND)?;
    let result = state.deployer.get_result(&id).await;
    Ok(Json(DeploymentView { progress, result }))
}

pub async fn cancel_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let progress = state.deployer.cancel_deployment(&id).await.map_err(reject)?;
    Ok(Json(progress))
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    /// Restrict the rollback to these targets; all when empty
    #[serde(default)]
    pub target_ids: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn rollback_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let operation = state
        .deployer
        .rollback_deployment(&id, &request.target_ids, request.reason)
        .await
        .map_err(reject)?;
    Ok(Json(operation))
}

pub async fn targets_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.targets.list())
}

pub async fn target_stats_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.targets.stats())
}

pub async fn dashboard_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.monitoring.dashboard())
}

pub async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.monitoring.summaries())
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub status: Option<AlertStatus>,
}

pub async fn alerts_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AlertsQuery>,
) -> impl IntoResponse {
    Json(state.monitoring.alerts(query.status))
}

pub async fn acknowledge_alert_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let alert = state.monitoring.acknowledge_alert(&id).map_err(reject)?;
    Ok(Json(alert))
}

pub async fn resolve_alert_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let alert = state.monitoring.resolve_alert(&id).map_err(reject)?;
    Ok(Json(alert))
}
