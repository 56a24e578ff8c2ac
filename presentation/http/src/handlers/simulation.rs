//! Simulation updater lifecycle and activity ingest handlers

use crate::{ApiResponse, AppState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use engram_core::types::GraphId;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

type JsonResult = (StatusCode, Json<ApiResponse<Value>>);

#[derive(Debug, Deserialize)]
pub struct CreateUpdaterRequest {
    graph_id: String,
}

/// `POST /simulations/{id}/updater`: create (or replace) the simulation's
/// graph memory updater.
pub async fn create_updater(
    State(state): State<AppState>,
    Path(simulation_id): Path<String>,
    Json(request): Json<CreateUpdaterRequest>,
) -> JsonResult {
    if request.graph_id.trim().is_empty() {
        return ApiResponse::error(StatusCode::BAD_REQUEST, "graph_id must not be empty");
    }
    let updater = state
        .registry
        .create(&simulation_id, GraphId::new(request.graph_id))
        .await;
    info!("Updater created for simulation {}", simulation_id);
    ApiResponse::success(serde_json::to_value(updater.get_stats()).unwrap_or_default())
}

/// `DELETE /simulations/{id}/updater`: stop and remove the updater.
pub async fn stop_updater(
    State(state): State<AppState>,
    Path(simulation_id): Path<String>,
) -> JsonResult {
    if state.registry.stop(&simulation_id).await {
        ApiResponse::success(json!({"stopped": true}))
    } else {
        ApiResponse::error(
            StatusCode::NOT_FOUND,
            format!("No updater for simulation {}", simulation_id),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    platform: String,
    #[serde(default)]
    activities: Vec<Value>,
}

/// `POST /simulations/{id}/activities`: enqueue raw activity records.
/// Meta-events and `DO_NOTHING` actions are filtered by the updater itself.
pub async fn ingest_activities(
    State(state): State<AppState>,
    Path(simulation_id): Path<String>,
    Json(request): Json<IngestRequest>,
) -> JsonResult {
    let Some(updater) = state.registry.get(&simulation_id).await else {
        return ApiResponse::error(
            StatusCode::NOT_FOUND,
            format!("No updater for simulation {}", simulation_id),
        );
    };

    for record in &request.activities {
        updater.add_activity_from_dict(record, &request.platform);
    }
    ApiResponse::success(json!({"accepted": request.activities.len()}))
}

/// `GET /simulations/stats`: stats for every registered updater.
pub async fn all_stats(State(state): State<AppState>) -> JsonResult {
    let stats = state.registry.all_stats().await;
    ApiResponse::success(serde_json::to_value(stats).unwrap_or_default())
}
