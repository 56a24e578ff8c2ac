//! Simulation-id -> updater registry.
//!
//! Owned by whoever composes the process (the HTTP server, a test); there is
//! no process-global state. One updater runs per simulation; creating a new
//! one under the same id stops its predecessor first.

use crate::updater::{GraphMemoryUpdater, UpdaterStats};
use engram_connector_openai::RotatingLlmClient;
use engram_core::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Registry of graph memory updaters, keyed by simulation id.
pub struct UpdaterRegistry {
    store: Arc<dyn GraphStore>,
    extractor: Arc<dyn KnowledgeExtractor>,
    llm_client: Option<Arc<RotatingLlmClient>>,
    updaters: Mutex<HashMap<String, Arc<GraphMemoryUpdater>>>,
    shutdown_done: AtomicBool,
}

impl UpdaterRegistry {
    /// The LLM client, when supplied, is handed to every updater so its
    /// entity resolver can disambiguate mid-confidence candidates.
    pub fn new(
        store: Arc<dyn GraphStore>,
        extractor: Arc<dyn KnowledgeExtractor>,
        llm_client: Option<Arc<RotatingLlmClient>>,
    ) -> Self {
        Self {
            store,
            extractor,
            llm_client,
            updaters: Mutex::new(HashMap::new()),
            shutdown_done: AtomicBool::new(false),
        }
    }

    /// Create and start an updater for the simulation, stopping and
    /// replacing any previous one under the same id.
    pub async fn create(&self, simulation_id: &str, graph_id: GraphId) -> Arc<GraphMemoryUpdater> {
        let mut updaters = self.updaters.lock().await;
        if let Some(previous) = updaters.remove(simulation_id) {
            previous.stop().await;
        }

        let updater = Arc::new(
            GraphMemoryUpdater::new(
                graph_id.clone(),
                self.store.clone(),
                self.extractor.clone(),
                self.llm_client.clone(),
            )
            .await,
        );
        updater.start().await;
        updaters.insert(simulation_id.to_string(), updater.clone());

        info!(
            "Created graph memory updater: simulation_id={}, graph_id={}",
            simulation_id, graph_id
        );
        updater
    }

    pub async fn get(&self, simulation_id: &str) -> Option<Arc<GraphMemoryUpdater>> {
        self.updaters.lock().await.get(simulation_id).cloned()
    }

    /// Stop and remove the simulation's updater. Returns whether one existed.
    pub async fn stop(&self, simulation_id: &str) -> bool {
        let removed = self.updaters.lock().await.remove(simulation_id);
        match removed {
            Some(updater) => {
                updater.stop().await;
                info!("Stopped graph memory updater: simulation_id={}", simulation_id);
                true
            }
            None => false,
        }
    }

    /// Best-effort stop of every updater. One-shot: subsequent calls are
    /// no-ops. Never fails; per-key problems are logged.
    pub async fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut updaters = self.updaters.lock().await;
        for (simulation_id, updater) in updaters.drain() {
            let result =
                tokio::spawn(async move { updater.stop().await }).await;
            if let Err(e) = result {
                error!(
                    "Failed to stop updater: simulation_id={}, error={}",
                    simulation_id, e
                );
            }
        }
        info!("Stopped all graph memory updaters");
    }

    /// Stats snapshot for every registered updater.
    pub async fn all_stats(&self) -> BTreeMap<String, UpdaterStats> {
        self.updaters
            .lock()
            .await
            .iter()
            .map(|(simulation_id, updater)| (simulation_id.clone(), updater.get_stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_adapter_in_memory::InMemoryStore;

    struct NullExtractor;

    #[async_trait]
    impl KnowledgeExtractor for NullExtractor {
        async fn extract(
            &self,
            _text: &str,
            _ontology: &Ontology,
        ) -> Result<ExtractionOutcome, LlmError> {
            Ok(ExtractionOutcome::default())
        }
    }

    fn registry() -> UpdaterRegistry {
        UpdaterRegistry::new(Arc::new(InMemoryStore::new()), Arc::new(NullExtractor), None)
    }

    #[tokio::test]
    async fn create_get_stop_lifecycle() {
        let registry = registry();
        let updater = registry.create("sim1", GraphId::new("g1")).await;
        assert!(updater.get_stats().running);

        assert!(registry.get("sim1").await.is_some());
        assert!(registry.get("sim2").await.is_none());

        assert!(registry.stop("sim1").await);
        assert!(!registry.stop("sim1").await);
        assert!(registry.get("sim1").await.is_none());
    }

    #[tokio::test]
    async fn create_replaces_previous_updater() {
        let registry = registry();
        let first = registry.create("sim1", GraphId::new("g1")).await;
        let second = registry.create("sim1", GraphId::new("g2")).await;

        // The first updater was stopped when replaced.
        assert!(!first.get_stats().running);
        assert!(second.get_stats().running);
        assert_eq!(registry.all_stats().await.len(), 1);
        assert_eq!(
            registry.get("sim1").await.unwrap().graph_id().as_str(),
            "g2"
        );
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_clears_the_map() {
        let registry = registry();
        registry.create("sim1", GraphId::new("g1")).await;
        registry.create("sim2", GraphId::new("g2")).await;

        registry.shutdown().await;
        assert!(registry.all_stats().await.is_empty());

        // Second shutdown is a no-op.
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn all_stats_snapshots_each_updater() {
        let registry = registry();
        registry.create("sim1", GraphId::new("g1")).await;
        registry.create("sim2", GraphId::new("g2")).await;

        let stats = registry.all_stats().await;
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["sim1"].graph_id, "g1");
        assert_eq!(stats["sim2"].graph_id, "g2");
    }
}
