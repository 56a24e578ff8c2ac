//! Request handlers

use crate::ApiResponse;
use axum::{http::StatusCode, response::Json};

pub mod llm;
pub mod simulation;

/// Liveness probe
pub async fn health() -> (StatusCode, Json<ApiResponse<serde_json::Value>>) {
    ApiResponse::success(serde_json::json!({"status": "ok"}))
}
