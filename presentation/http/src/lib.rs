//! HTTP surface for Engram.
//!
//! A thin axum layer over the LLM configuration (settings, routing, usage)
//! and the simulation updater registry. Every response uses the uniform
//! `{success, data?, error?, http_status}` envelope.

use axum::{
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use engram_connector_openai::{RotatingLlmClient, SettingsHandle, UsageLog};
use engram_core::errors::LlmResult;
use engram_core::traits::GraphStore;
use engram_memory::{LlmGraphExtractor, UpdaterRegistry};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

mod config;
mod handlers;

pub use config::ServerConfig;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<UpdaterRegistry>,
    pub settings: Arc<SettingsHandle>,
    pub client: Arc<RotatingLlmClient>,
    pub usage_log_path: PathBuf,
}

impl AppState {
    /// Wire the shared state over a graph store: the rotating client reads
    /// the same settings handle the config endpoints mutate, and the same
    /// client drives extraction and entity disambiguation in every updater
    /// the registry creates.
    pub fn new(
        store: Arc<dyn GraphStore>,
        settings: Arc<SettingsHandle>,
        usage_log_path: PathBuf,
    ) -> LlmResult<Self> {
        let client = Arc::new(RotatingLlmClient::new(
            settings.clone(),
            UsageLog::new(usage_log_path.clone()),
        )?);
        let extractor = Arc::new(LlmGraphExtractor::new(client.clone()));
        let registry = Arc::new(UpdaterRegistry::new(store, extractor, Some(client.clone())));
        Ok(Self {
            registry,
            settings,
            client,
            usage_log_path,
        })
    }

    /// Wire the shared state around an existing registry (tests, embeddings
    /// into a larger process).
    pub fn with_registry(
        registry: Arc<UpdaterRegistry>,
        settings: Arc<SettingsHandle>,
        usage_log_path: PathBuf,
    ) -> LlmResult<Self> {
        let client = Arc::new(RotatingLlmClient::new(
            settings.clone(),
            UsageLog::new(usage_log_path.clone()),
        )?);
        Ok(Self {
            registry,
            settings,
            client,
            usage_log_path,
        })
    }
}

/// Standard API response envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub http_status: u16,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> (StatusCode, Json<Self>) {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                data: Some(data),
                error: None,
                http_status: StatusCode::OK.as_u16(),
            }),
        )
    }

    pub fn error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                success: false,
                data: None,
                error: Some(message.into()),
                http_status: status.as_u16(),
            }),
        )
    }
}

/// Build the router with all routes and middleware.
pub fn build_router(state: AppState, enable_cors: bool) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health))
        // LLM configuration
        .route("/llm/config", get(handlers::llm::get_config))
        .route("/llm/config", post(handlers::llm::update_config))
        .route("/llm/models", get(handlers::llm::list_models))
        .route("/llm/usage", get(handlers::llm::usage))
        .route("/llm/stages", get(handlers::llm::stages))
        .route("/llm/presets", get(handlers::llm::presets))
        .route("/llm/routing", post(handlers::llm::apply_routing))
        // Simulation updaters
        .route(
            "/simulations/:simulation_id/updater",
            post(handlers::simulation::create_updater),
        )
        .route(
            "/simulations/:simulation_id/updater",
            delete(handlers::simulation::stop_updater),
        )
        .route(
            "/simulations/:simulation_id/activities",
            post(handlers::simulation::ingest_activities),
        )
        .route("/simulations/stats", get(handlers::simulation::all_stats))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        router = router.layer(CorsLayer::permissive());
    }
    router
}

/// Bind and serve until the process is stopped.
pub async fn serve(config: ServerConfig, state: AppState) -> std::io::Result<()> {
    let router = build_router(state, config.enable_cors);
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!("Engram HTTP surface listening on {}", config.bind_address);
    axum::serve(listener, router).await
}
