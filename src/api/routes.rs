//! API route definitions.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use super::state::AppState;
use crate::detect::{AlertStatus, DetectError};
use crate::storage::AlertFilter;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/detect-anomalies", post(detect_anomalies))
        .route("/alerts", get(list_alerts))
        .route("/alerts/{id}", get(get_alert))
        .route("/alerts/{id}/acknowledge", post(acknowledge_alert))
        .route("/alerts/{id}/resolve", post(resolve_alert))
}

/// Error payload `{ "error": ... }` with a status derived from the cause.
struct ApiError(StatusCode, String);

impl From<DetectError> for ApiError {
    fn from(e: DetectError) -> Self {
        let status = match &e {
            DetectError::MissingBuildingId => StatusCode::BAD_REQUEST,
            DetectError::BuildingNotFound(_) | DetectError::AlertNotFound(_) => StatusCode::NOT_FOUND,
            DetectError::InvalidAlertTransition { .. } => StatusCode::CONFLICT,
            DetectError::InsufficientBaseline { .. } | DetectError::Store(_) => {
                error!(error = %e, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError(status, e.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        DetectError::Store(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

#[derive(Debug, Deserialize)]
struct DetectRequest {
    building_id: Option<String>,
}

async fn detect_anomalies(
    State(state): State<AppState>,
    body: Result<Json<DetectRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let building_id = match body {
        Ok(Json(DetectRequest {
            building_id: Some(id),
        })) if !id.trim().is_empty() => id,
        _ => return Err(DetectError::MissingBuildingId.into()),
    };

    let report = state.engine.run_detection(&building_id).await?;
    Ok(Json(json!({
        "success": true,
        "anomalies_detected": report.anomalies_detected,
        "alerts_created": report.alerts_created,
        "anomalies": report.findings,
    })))
}

#[derive(Debug, Deserialize)]
struct AlertQuery {
    sensor_id: Option<String>,
    status: Option<AlertStatus>,
    limit: Option<usize>,
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(q): Query<AlertQuery>,
) -> Result<Json<Value>, ApiError> {
    let mut filter = AlertFilter {
        sensor_id: q.sensor_id,
        status: q.status,
        ..AlertFilter::default()
    };
    if let Some(limit) = q.limit {
        filter.limit = limit.min(500);
    }
    let alerts = state.store.list_alerts(filter).await?;
    Ok(Json(json!({ "data": alerts, "meta": { "total": alerts.len() } })))
}

async fn get_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    match state.store.get_alert(id).await? {
        Some(alert) => Ok(Json(json!({ "data": alert }))),
        None => Err(DetectError::AlertNotFound(id).into()),
    }
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let alert = state.store.acknowledge(id, chrono::Utc::now()).await?;
    Ok(Json(json!({ "data": alert })))
}

async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let alert = state.store.resolve(id, chrono::Utc::now()).await?;
    Ok(Json(json!({ "data": alert })))
}
