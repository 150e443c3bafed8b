//! Serving process management endpoints.
//!
//! This side-channel orchestrates sibling serving processes directly
//! through the supervisor, independent of the virtual model registry.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::{ApiError, ApiJson};
use crate::state::AppState;
use vgate_core::LaunchParams;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/serve", post(serve))
        .route("/stop", post(stop))
        .route("/offload", post(offload))
        .route("/list", get(list))
        .route("/health", get(health))
}

/// Spawn a serving process for a named model. Idempotent: a second call
/// for a live name returns the existing process.
async fn serve(
    State(state): State<AppState>,
    ApiJson(params): ApiJson<LaunchParams>,
) -> Result<Response, ApiError> {
    let record = state.supervisor.spawn(params).await?;
    info!(name = %record.name, pid = record.pid, port = record.port, "serving process up");
    Ok(Json(json!({ "port": record.port, "pid": record.pid })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub name: String,
}

async fn stop(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<StopRequest>,
) -> Result<Response, ApiError> {
    state.supervisor.stop(&req.name).await?;
    info!(name = %req.name, "serving process stopped");
    Ok(Json(json!({ "msg": format!("{} stopped", req.name) })).into_response())
}

/// Remove a virtual model from the registry, stopping its serving
/// process when one is tracked.
async fn offload(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<StopRequest>,
) -> Result<Response, ApiError> {
    state.manager.offload(&req.name).await?;
    Ok(Json(json!({ "msg": format!("{} offloaded", req.name) })).into_response())
}

/// Map of live serving processes keyed by name.
async fn list(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut entries = serde_json::Map::new();
    for record in state.supervisor.list().await {
        entries.insert(
            record.name.clone(),
            json!({ "params": record.params, "pid": record.pid, "state": record.state }),
        );
    }
    Json(serde_json::Value::Object(entries))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
