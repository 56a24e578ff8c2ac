//! Engram server binary

use engram_adapter_in_memory::InMemoryStore;
use engram_adapter_neo4j::{Neo4jConfig, Neo4jStore};
use engram_connector_openai::{resolve_settings_path, SettingsHandle};
use engram_core::traits::GraphStore;
use engram_http::{AppState, ServerConfig};
use std::process;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging; RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = match ServerConfig::load(None) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let store = build_store().await;

    let settings_path = resolve_settings_path(&config.data_root);
    info!("Loading LLM settings from {}", settings_path.display());
    let settings = Arc::new(SettingsHandle::load(settings_path));

    let state = match AppState::new(store, settings, config.usage_log_path()) {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to wire application state: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = engram_http::serve(config, state).await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}

/// Connect to Neo4j when `ENGRAM_NEO4J_URI` is set; otherwise fall back to
/// the in-memory store for local development.
async fn build_store() -> Arc<dyn GraphStore> {
    let Ok(uri) = std::env::var("ENGRAM_NEO4J_URI") else {
        info!("ENGRAM_NEO4J_URI not set; using the in-memory store");
        return Arc::new(InMemoryStore::new());
    };

    let mut neo4j_config = Neo4jConfig::new(uri);
    if let (Ok(user), Ok(password)) = (
        std::env::var("ENGRAM_NEO4J_USER"),
        std::env::var("ENGRAM_NEO4J_PASSWORD"),
    ) {
        neo4j_config = neo4j_config.with_credentials(user, password);
    }

    match Neo4jStore::new(neo4j_config).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to connect to Neo4j: {}", e);
            process::exit(1);
        }
    }
}
