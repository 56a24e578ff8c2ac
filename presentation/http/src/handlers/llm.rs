//! LLM configuration, routing and usage handlers

use crate::{ApiResponse, AppState};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use engram_connector_openai::{
    aggregate_usage, read_usage_records, routing_presets, stage_catalog, SettingsUpdate,
    UsageSummary, DEFAULT_USAGE_LIMIT, MAX_USAGE_LIMIT,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

type JsonResult = (StatusCode, Json<ApiResponse<Value>>);

/// `GET /llm/config`: public projection of the current settings.
pub async fn get_config(State(state): State<AppState>) -> JsonResult {
    ApiResponse::success(state.settings.snapshot().public_view())
}

/// `POST /llm/config`: apply a partial settings update.
///
/// `models` must be an array of strings and `model_routing` an object when
/// present; anything else is a 400.
pub async fn update_config(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> JsonResult {
    if let Some(models) = payload.get("models") {
        let valid = models
            .as_array()
            .map(|list| list.iter().all(|m| m.is_string()))
            .unwrap_or(false);
        if !valid {
            return ApiResponse::error(
                StatusCode::BAD_REQUEST,
                "models must be an array of strings",
            );
        }
    }
    if let Some(routing) = payload.get("model_routing") {
        if !routing.is_object() {
            return ApiResponse::error(StatusCode::BAD_REQUEST, "model_routing must be an object");
        }
    }

    let update: SettingsUpdate = match serde_json::from_value(payload) {
        Ok(update) => update,
        Err(e) => {
            return ApiResponse::error(StatusCode::BAD_REQUEST, format!("Invalid payload: {}", e))
        }
    };

    match state.settings.apply(update) {
        Ok(settings) => {
            info!("LLM settings updated");
            ApiResponse::success(settings.public_view())
        }
        Err(e) => ApiResponse::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to persist settings: {}", e),
        ),
    }
}

/// `GET /llm/models`: proxy the upstream model list.
pub async fn list_models(State(state): State<AppState>) -> JsonResult {
    match state.client.list_models().await {
        Ok(models) => ApiResponse::success(Value::from(models)),
        Err(e) => ApiResponse::error(StatusCode::BAD_GATEWAY, format!("Upstream error: {}", e)),
    }
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    limit: Option<i64>,
}

/// `GET /llm/usage?limit=N`: aggregated usage totals by model and stage.
pub async fn usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> (StatusCode, Json<ApiResponse<UsageSummary>>) {
    let limit = query
        .limit
        .map(|l| l.clamp(1, MAX_USAGE_LIMIT as i64) as usize)
        .unwrap_or(DEFAULT_USAGE_LIMIT);

    let records = read_usage_records(&state.usage_log_path, limit);
    debug!("Aggregating {} usage records", records.len());
    ApiResponse::success(aggregate_usage(&records))
}

/// `GET /llm/stages`: the stage catalog.
pub async fn stages() -> JsonResult {
    ApiResponse::success(serde_json::to_value(stage_catalog()).unwrap_or_default())
}

/// `GET /llm/presets`: named routing presets.
pub async fn presets() -> JsonResult {
    ApiResponse::success(serde_json::to_value(routing_presets()).unwrap_or_default())
}

#[derive(Debug, Deserialize)]
pub struct RoutingRequest {
    preset: Option<String>,
    model_routing: Option<BTreeMap<String, String>>,
}

/// `POST /llm/routing`: apply a named preset or an explicit routing map.
pub async fn apply_routing(
    State(state): State<AppState>,
    Json(request): Json<RoutingRequest>,
) -> JsonResult {
    let routing = if let Some(name) = &request.preset {
        let Some(preset) = routing_presets().into_iter().find(|p| p.name == name.as_str()) else {
            return ApiResponse::error(
                StatusCode::BAD_REQUEST,
                format!("Unknown routing preset: {}", name),
            );
        };
        preset
            .routing
            .iter()
            .map(|(stage, model)| (stage.to_string(), model.to_string()))
            .collect()
    } else if let Some(routing) = request.model_routing {
        routing
    } else {
        return ApiResponse::error(
            StatusCode::BAD_REQUEST,
            "Provide either a preset name or a model_routing map",
        );
    };

    match state.settings.apply(SettingsUpdate {
        model_routing: Some(routing),
        ..Default::default()
    }) {
        Ok(settings) => ApiResponse::success(settings.public_view()),
        Err(e) => ApiResponse::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to persist settings: {}", e),
        ),
    }
}
