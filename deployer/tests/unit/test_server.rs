//! HTTP API tests

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;

use policy_deployer::logs::LogLevel;
use policy_deployer::models::deployment::RolloutPolicy;
use policy_deployer::monitoring::service::MonitoringService;
use policy_deployer::server::serve::router;
use policy_deployer::server::state::ServerState;
use policy_deployer::targets::manager::TargetManager;

use crate::support::{config, harness, targets, Harness, ScriptedStrategy};

struct Api {
    harness: Harness,
    monitoring: Arc<MonitoringService>,
    router: Router,
}

fn api() -> Api {
    let harness = harness(ScriptedStrategy::default());
    let monitoring = Arc::new(MonitoringService::default());
    harness.deployer.add_observer(monitoring.clone());

    let registry = Arc::new(TargetManager::new());
    for target in targets(3) {
        registry.upsert(target).unwrap();
    }

    let state = Arc::new(ServerState::new(
        harness.deployer.clone(),
        monitoring.clone(),
        registry,
    ));
    Api {
        harness,
        monitoring,
        router: router(state),
    }
}

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let api = api();
    let (status, body) = call(&api.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["system_health"], "healthy");
}

#[tokio::test]
async fn test_unknown_deployment_is_not_found() {
    let api = api();
    let (status, _) = call(&api.router, "GET", "/deployments/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&api.router, "POST", "/deployments/missing/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_finished_deployment_view_and_cancel_conflict() {
    let api = api();
    api.harness
        .deployer
        .deploy(config("d-api", targets(3), RolloutPolicy::default()))
        .await
        .unwrap();

    let (status, body) = call(&api.router, "GET", "/deployments/d-api", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["progress"]["status"], "completed");
    assert_eq!(body["result"]["summary"], "3/3 targets successful");

    let (status, body) = call(&api.router, "GET", "/deployments", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(|a| a.len()), Some(1));

    let (status, _) = call(&api.router, "POST", "/deployments/d-api/cancel", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_rollback_route() {
    let api = api();
    api.harness
        .deployer
        .deploy(config("d-rb", targets(3), RolloutPolicy::default()))
        .await
        .unwrap();

    let (status, body) = call(
        &api.router,
        "POST",
        "/deployments/d-rb/rollback",
        Some(json!({"target_ids": ["t-01"], "reason": "regression"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["processed_targets"], 1);
    assert_eq!(api.harness.strategy.rolled_back(), vec!["t-01".to_string()]);

    let (status, _) = call(
        &api.router,
        "POST",
        "/deployments/nope/rollback",
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_alert_routes() {
    let api = api();
    let now = Utc::now();
    for _ in 0..11 {
        api.monitoring.record_log_at(LogLevel::Error, now);
    }

    let (status, body) = call(&api.router, "GET", "/alerts?status=active", None).await;
    assert_eq!(status, StatusCode::OK);
    let alerts = body.as_array().cloned().unwrap_or_default();
    assert_eq!(alerts.len(), 1);
    let id = alerts[0]["id"].as_str().unwrap().to_string();

    let (status, body) = call(&api.router, "POST", &format!("/alerts/{}/acknowledge", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "acknowledged");

    let (status, body) = call(&api.router, "POST", &format!("/alerts/{}/resolve", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "resolved");

    let (status, _) = call(&api.router, "POST", &format!("/alerts/{}/resolve", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(&api.router, "POST", "/alerts/alert-missing/resolve", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_fleet_and_dashboard_routes() {
    let api = api();

    let (status, body) = call(&api.router, "GET", "/targets", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(|a| a.len()), Some(3));

    let (status, _) = call(&api.router, "GET", "/targets/stats", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&api.router, "GET", "/dashboard", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_deployments"], 0);
    assert_eq!(body["success_rate"], 1.0);
}
