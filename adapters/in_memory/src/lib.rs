//! In-memory implementation of GraphStore for testing and development

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engram_core::prelude::*;
use engram_core::similarity::normalize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Configuration for the in-memory store
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Maximum number of entities to store
    pub max_entities: Option<usize>,
    /// Maximum number of relations to store
    pub max_relations: Option<usize>,
    /// Whether to enable verbose logging
    pub verbose: bool,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_entities: Some(100_000),
            max_relations: Some(500_000),
            verbose: false,
        }
    }
}

/// Internal storage, indexed by primary keys
#[derive(Debug, Default)]
struct MemoryStore {
    /// Graph metadata by graph_id
    graphs: HashMap<String, GraphMeta>,
    /// Entities by uuid
    entities: HashMap<String, Entity>,
    /// Relations by uuid
    relations: HashMap<String, Relation>,
    /// Chunks by chunk_id
    chunks: HashMap<String, Chunk>,
    /// chunk_id -> mentioned entity uuids
    mentions: HashMap<String, Vec<String>>,
}

impl MemoryStore {
    fn entities_in_graph<'a>(
        &'a self,
        graph_id: &'a GraphId,
    ) -> impl Iterator<Item = &'a Entity> + 'a {
        self.entities
            .values()
            .filter(move |e| &e.graph_id == graph_id)
    }
}

/// In-memory GraphStore implementation
pub struct InMemoryStore {
    store: Arc<RwLock<MemoryStore>>,
    config: InMemoryConfig,
}

impl InMemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::new_with_config(InMemoryConfig::default())
    }

    /// Create a new in-memory store with configuration
    pub fn new_with_config(config: InMemoryConfig) -> Self {
        Self {
            store: Arc::new(RwLock::new(MemoryStore::default())),
            config,
        }
    }

    /// Entity and relation counts
    pub async fn stats(&self) -> (usize, usize) {
        let store = self.store.read().await;
        (store.entities.len(), store.relations.len())
    }

    /// Clear all data from the store
    pub async fn clear(&self) {
        let mut store = self.store.write().await;
        *store = MemoryStore::default();
        info!("Cleared in-memory store");
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_empty_attributes(attributes: &serde_json::Value) -> bool {
    match attributes {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn union_append(existing: &mut Vec<String>, incoming: &[String]) {
    for value in incoming {
        if !value.is_empty() && !existing.contains(value) {
            existing.push(value.clone());
        }
    }
}

#[async_trait]
impl GraphStore for InMemoryStore {
    async fn create_graph(
        &self,
        project_id: &str,
        name: &str,
        ontology: &Ontology,
    ) -> Result<GraphId, GraphError> {
        let graph_id = GraphId::generate();
        let meta = GraphMeta {
            graph_id: graph_id.clone(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            ontology: ontology.clone(),
            created_at: Utc::now(),
        };
        let mut store = self.store.write().await;
        store.graphs.insert(graph_id.as_str().to_string(), meta);
        debug!("Created graph {} for project {}", graph_id, project_id);
        Ok(graph_id)
    }

    async fn delete_graph(&self, graph_id: &GraphId) -> Result<(), GraphError> {
        let mut store = self.store.write().await;
        store.graphs.remove(graph_id.as_str());
        store.entities.retain(|_, e| &e.graph_id != graph_id);
        store.relations.retain(|_, r| &r.graph_id != graph_id);
        let removed_chunks: Vec<String> = store
            .chunks
            .values()
            .filter(|c| &c.graph_id == graph_id)
            .map(|c| c.chunk_id.clone())
            .collect();
        for chunk_id in &removed_chunks {
            store.chunks.remove(chunk_id);
            store.mentions.remove(chunk_id);
        }
        info!("Deleted graph {}", graph_id);
        Ok(())
    }

    async fn load_graph_meta(&self, graph_id: &GraphId) -> Result<Option<GraphMeta>, GraphError> {
        let store = self.store.read().await;
        Ok(store.graphs.get(graph_id.as_str()).cloned())
    }

    async fn upsert_entities(&self, entities: &[Entity]) -> Result<Vec<String>, GraphError> {
        let mut store = self.store.write().await;

        if let Some(max) = self.config.max_entities {
            if store.entities.len() + entities.len() > max {
                return Err(GraphError::ConstraintViolation(format!(
                    "Maximum entity limit ({}) reached",
                    max
                )));
            }
        }

        let mut uuids = Vec::with_capacity(entities.len());
        for incoming in entities {
            uuids.push(incoming.uuid.clone());
            match store.entities.get_mut(&incoming.uuid) {
                Some(existing) => {
                    existing.name = incoming.name.clone();
                    existing.entity_type = incoming.entity_type.clone();
                    if !incoming.summary.is_empty() {
                        existing.summary = incoming.summary.clone();
                    }
                    if !is_empty_attributes(&incoming.attributes) {
                        existing.attributes = incoming.attributes.clone();
                    }
                    union_append(
                        &mut existing.source_entity_types,
                        &incoming.source_entity_types,
                    );
                    // created_at stays at first insertion
                }
                None => {
                    let mut entity = incoming.clone();
                    entity.source_entity_types.clear();
                    union_append(&mut entity.source_entity_types, &incoming.source_entity_types);
                    store.entities.insert(entity.uuid.clone(), entity);
                }
            }
            if self.config.verbose {
                debug!("Upserted entity {}", incoming.uuid);
            }
        }
        Ok(uuids)
    }

    async fn upsert_relations(&self, relations: &[Relation]) -> Result<(), GraphError> {
        let mut store = self.store.write().await;

        if let Some(max) = self.config.max_relations {
            if store.relations.len() + relations.len() > max {
                return Err(GraphError::ConstraintViolation(format!(
                    "Maximum relation limit ({}) reached",
                    max
                )));
            }
        }

        for incoming in relations {
            match store.relations.get_mut(&incoming.uuid) {
                Some(existing) => {
                    existing.name = incoming.name.clone();
                    existing.fact = incoming.fact.clone();
                    existing.fact_type = incoming.name.clone();
                    existing.attributes = incoming.attributes.clone();
                    // created_at and valid_at stay at first insertion
                    union_append(&mut existing.episodes, &incoming.episodes);
                }
                None => {
                    store
                        .relations
                        .insert(incoming.uuid.clone(), incoming.clone());
                }
            }
            if self.config.verbose {
                debug!("Upserted relation {}", incoming.uuid);
            }
        }
        Ok(())
    }

    async fn update_entity_summary(
        &self,
        uuid: &str,
        summary: Option<&str>,
        append_source_types: &[String],
    ) -> Result<bool, GraphError> {
        let mut store = self.store.write().await;
        let Some(entity) = store.entities.get_mut(uuid) else {
            return Ok(false);
        };
        let mut updated = false;
        if let Some(summary) = summary {
            if !summary.is_empty() {
                entity.summary = summary.to_string();
                updated = true;
            }
        }
        if !append_source_types.is_empty() {
            union_append(&mut entity.source_entity_types, append_source_types);
            updated = true;
        }
        Ok(updated)
    }

    async fn invalidate_edge(
        &self,
        edge_uuid: &str,
        invalid_at: DateTime<Utc>,
    ) -> Result<bool, GraphError> {
        let mut store = self.store.write().await;
        let Some(relation) = store.relations.get_mut(edge_uuid) else {
            return Ok(false);
        };
        // First contradiction wins; the timestamp is never cleared or bumped.
        if relation.invalid_at.is_none() {
            relation.invalid_at = Some(invalid_at);
            relation.expired_at = Some(invalid_at);
        }
        Ok(true)
    }

    async fn add_episode_to_edges(
        &self,
        edge_uuids: &[String],
        episode_id: &str,
    ) -> Result<usize, GraphError> {
        let mut store = self.store.write().await;
        let mut updated = 0;
        for uuid in edge_uuids {
            if let Some(relation) = store.relations.get_mut(uuid) {
                union_append(&mut relation.episodes, &[episode_id.to_string()]);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn find_similar_entities(
        &self,
        graph_id: &GraphId,
        name: &str,
        entity_type: Option<&str>,
    ) -> Result<Vec<Entity>, GraphError> {
        let normalized = normalize(name);
        let store = self.store.read().await;
        Ok(store
            .entities_in_graph(graph_id)
            .filter(|e| normalize(&e.name) == normalized)
            .filter(|e| entity_type.map_or(true, |t| e.entity_type == t))
            .cloned()
            .collect())
    }

    async fn search_similar_entities(
        &self,
        graph_id: &GraphId,
        name: &str,
        limit: usize,
    ) -> Result<Vec<Entity>, GraphError> {
        let normalized = normalize(name);
        if normalized.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.store.read().await;

        let mut scored: Vec<(u8, Entity)> = store
            .entities_in_graph(graph_id)
            .filter_map(|entity| {
                let candidate = normalize(&entity.name);
                let score = if candidate == normalized {
                    3
                } else if candidate.starts_with(&normalized) {
                    2
                } else if candidate.contains(&normalized) || normalized.contains(candidate.as_str())
                {
                    1
                } else {
                    return None;
                };
                Some((score, entity.clone()))
            })
            .collect();

        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b.cmp(score_a).then_with(|| a.name.cmp(&b.name))
        });
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, entity)| entity)
            .collect())
    }

    async fn get_edges_between_entities(
        &self,
        graph_id: &GraphId,
        source_uuid: &str,
        target_uuid: &str,
        include_invalid: bool,
    ) -> Result<Vec<Relation>, GraphError> {
        let store = self.store.read().await;
        Ok(store
            .relations
            .values()
            .filter(|r| {
                &r.graph_id == graph_id
                    && r.source_uuid == source_uuid
                    && r.target_uuid == target_uuid
                    && (include_invalid || r.is_active())
            })
            .cloned()
            .collect())
    }

    async fn get_entity_by_uuid(&self, uuid: &str) -> Result<Option<Entity>, GraphError> {
        let store = self.store.read().await;
        Ok(store.entities.get(uuid).cloned())
    }

    async fn get_valid_edges_for_entity(
        &self,
        graph_id: &GraphId,
        entity_uuid: &str,
        include_invalid: bool,
    ) -> Result<Vec<Relation>, GraphError> {
        let store = self.store.read().await;
        Ok(store
            .relations
            .values()
            .filter(|r| {
                &r.graph_id == graph_id
                    && (r.source_uuid == entity_uuid || r.target_uuid == entity_uuid)
                    && (include_invalid || r.is_active())
            })
            .cloned()
            .collect())
    }

    async fn upsert_chunk(&self, chunk: &Chunk) -> Result<(), GraphError> {
        let mut store = self.store.write().await;
        match store.chunks.get_mut(&chunk.chunk_id) {
            Some(existing) => {
                existing.text = chunk.text.clone();
            }
            None => {
                store.chunks.insert(chunk.chunk_id.clone(), chunk.clone());
            }
        }
        Ok(())
    }

    async fn link_mentions(
        &self,
        graph_id: &GraphId,
        chunk_id: &str,
        entity_uuids: &[String],
    ) -> Result<(), GraphError> {
        let mut store = self.store.write().await;
        let valid: Vec<String> = entity_uuids
            .iter()
            .filter(|uuid| {
                store
                    .entities
                    .get(*uuid)
                    .map_or(false, |e| &e.graph_id == graph_id)
            })
            .cloned()
            .collect();
        let links = store.mentions.entry(chunk_id.to_string()).or_default();
        union_append(links, &valid);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), GraphError> {
        let (entities, relations) = {
            let store = self.store.read().await;
            (store.entities.len(), store.relations.len())
        };
        debug!(
            "In-memory store health check: {} entities, {} relations",
            entities, relations
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn graph(store: &InMemoryStore) -> GraphId {
        store
            .create_graph("proj1", "test graph", &Ontology::default())
            .await
            .unwrap()
    }

    fn entity(graph_id: &GraphId, name: &str, entity_type: &str) -> Entity {
        Entity::new("proj1", graph_id.clone(), name, entity_type)
            .with_source_types(vec![entity_type.to_string()])
    }

    #[tokio::test]
    async fn entity_upsert_is_idempotent() {
        let store = InMemoryStore::new();
        let graph_id = graph(&store).await;

        let alice = entity(&graph_id, "Alice", "Person").with_summary("first");
        let uuids = store.upsert_entities(&[alice.clone()]).await.unwrap();
        let created_at = store
            .get_entity_by_uuid(&uuids[0])
            .await
            .unwrap()
            .unwrap()
            .created_at;

        // Second upsert with an empty summary keeps the old one.
        let again = entity(&graph_id, "Alice", "Person");
        let uuids2 = store.upsert_entities(&[again]).await.unwrap();
        assert_eq!(uuids, uuids2);

        let stored = store.get_entity_by_uuid(&uuids[0]).await.unwrap().unwrap();
        assert_eq!(stored.summary, "first");
        assert_eq!(stored.created_at, created_at);
        let (entities, _) = store.stats().await;
        assert_eq!(entities, 1);
    }

    #[tokio::test]
    async fn source_types_union_append_in_first_occurrence_order() {
        let store = InMemoryStore::new();
        let graph_id = graph(&store).await;

        let alice = entity(&graph_id, "Alice", "Person");
        let uuid = store.upsert_entities(&[alice]).await.unwrap()[0].clone();

        store
            .update_entity_summary(&uuid, None, &["User".to_string(), "Person".to_string()])
            .await
            .unwrap();
        store
            .update_entity_summary(&uuid, None, &["User".to_string(), "Agent".to_string()])
            .await
            .unwrap();

        let stored = store.get_entity_by_uuid(&uuid).await.unwrap().unwrap();
        assert_eq!(stored.source_entity_types, vec!["Person", "User", "Agent"]);
    }

    #[tokio::test]
    async fn relation_upsert_preserves_temporal_fields_and_merges_episodes() {
        let store = InMemoryStore::new();
        let graph_id = graph(&store).await;
        let a = entity(&graph_id, "Alice", "Person");
        let b = entity(&graph_id, "Bluesky", "Product");
        store.upsert_entities(&[a.clone(), b.clone()]).await.unwrap();

        let valid_at = Utc::now();
        let rel = Relation::new("proj1", graph_id.clone(), &a.uuid, &b.uuid, "LIKES", valid_at)
            .with_fact("Alice likes Bluesky")
            .with_episodes(vec!["ep_1".to_string()]);
        store.upsert_relations(&[rel.clone()]).await.unwrap();

        let mut second = rel.clone();
        second.valid_at = Utc::now();
        second.episodes = vec!["ep_1".to_string(), "ep_2".to_string()];
        store.upsert_relations(&[second]).await.unwrap();

        let edges = store
            .get_edges_between_entities(&graph_id, &a.uuid, &b.uuid, true)
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].valid_at, valid_at);
        assert_eq!(edges[0].episodes, vec!["ep_1", "ep_2"]);
    }

    #[tokio::test]
    async fn invalidate_edge_sets_both_fields_once() {
        let store = InMemoryStore::new();
        let graph_id = graph(&store).await;
        let a = entity(&graph_id, "Alice", "Person");
        let b = entity(&graph_id, "Bob", "Person");
        store.upsert_entities(&[a.clone(), b.clone()]).await.unwrap();

        let rel = Relation::new("proj1", graph_id.clone(), &a.uuid, &b.uuid, "TRUSTS", Utc::now());
        store.upsert_relations(&[rel.clone()]).await.unwrap();

        let first = Utc::now();
        assert!(store.invalidate_edge(&rel.uuid, first).await.unwrap());
        let later = first + chrono::Duration::seconds(60);
        assert!(store.invalidate_edge(&rel.uuid, later).await.unwrap());

        let edges = store
            .get_edges_between_entities(&graph_id, &a.uuid, &b.uuid, true)
            .await
            .unwrap();
        assert_eq!(edges[0].invalid_at, Some(first));
        assert_eq!(edges[0].expired_at, Some(first));

        // Invalidated edges are hidden from the active view.
        let active = store
            .get_edges_between_entities(&graph_id, &a.uuid, &b.uuid, false)
            .await
            .unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn search_orders_exact_before_prefix_before_contains() {
        let store = InMemoryStore::new();
        let graph_id = graph(&store).await;
        store
            .upsert_entities(&[
                entity(&graph_id, "Blue", "Topic"),
                entity(&graph_id, "Bluesky", "Product"),
                entity(&graph_id, "Old Bluesky", "Product"),
                entity(&graph_id, "Reddit", "Product"),
            ])
            .await
            .unwrap();

        let results = store
            .search_similar_entities(&graph_id, "blue", 10)
            .await
            .unwrap();
        let names: Vec<&str> = results.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Blue", "Bluesky", "Old Bluesky"]);

        let capped = store
            .search_similar_entities(&graph_id, "blue", 2)
            .await
            .unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn find_similar_entities_matches_exact_case_insensitive() {
        let store = InMemoryStore::new();
        let graph_id = graph(&store).await;
        store
            .upsert_entities(&[entity(&graph_id, "Alice Smith", "Person")])
            .await
            .unwrap();

        let hits = store
            .find_similar_entities(&graph_id, "alice smith", None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let typed_miss = store
            .find_similar_entities(&graph_id, "alice smith", Some("Product"))
            .await
            .unwrap();
        assert!(typed_miss.is_empty());
    }

    #[tokio::test]
    async fn delete_graph_cascades() {
        let store = InMemoryStore::new();
        let graph_id = graph(&store).await;
        let other_graph = graph(&store).await;

        let a = entity(&graph_id, "Alice", "Person");
        let b = entity(&graph_id, "Bob", "Person");
        let other = entity(&other_graph, "Carol", "Person");
        store
            .upsert_entities(&[a.clone(), b.clone(), other.clone()])
            .await
            .unwrap();
        let rel = Relation::new("proj1", graph_id.clone(), &a.uuid, &b.uuid, "KNOWS", Utc::now());
        store.upsert_relations(&[rel]).await.unwrap();
        let chunk = Chunk::new("proj1", graph_id.clone(), "some text");
        store.upsert_chunk(&chunk).await.unwrap();
        store
            .link_mentions(&graph_id, &chunk.chunk_id, &[a.uuid.clone()])
            .await
            .unwrap();

        store.delete_graph(&graph_id).await.unwrap();

        assert!(store.load_graph_meta(&graph_id).await.unwrap().is_none());
        assert!(store.get_entity_by_uuid(&a.uuid).await.unwrap().is_none());
        // The other graph is untouched.
        assert!(store.get_entity_by_uuid(&other.uuid).await.unwrap().is_some());
        let (entities, relations) = store.stats().await;
        assert_eq!((entities, relations), (1, 0));
    }

    #[tokio::test]
    async fn graph_scoping_isolates_lookups() {
        let store = InMemoryStore::new();
        let graph_a = graph(&store).await;
        let graph_b = graph(&store).await;

        store
            .upsert_entities(&[entity(&graph_a, "Alice", "Person")])
            .await
            .unwrap();

        let hits = store
            .search_similar_entities(&graph_b, "Alice", 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn episodes_append_without_duplicates() {
        let store = InMemoryStore::new();
        let graph_id = graph(&store).await;
        let a = entity(&graph_id, "Alice", "Person");
        let b = entity(&graph_id, "Bob", "Person");
        store.upsert_entities(&[a.clone(), b.clone()]).await.unwrap();
        let rel = Relation::new("proj1", graph_id.clone(), &a.uuid, &b.uuid, "KNOWS", Utc::now())
            .with_episodes(vec!["ep_1".to_string()]);
        store.upsert_relations(&[rel.clone()]).await.unwrap();

        let updated = store
            .add_episode_to_edges(&[rel.uuid.clone(), "rel_missing".to_string()], "ep_2")
            .await
            .unwrap();
        assert_eq!(updated, 1);
        store
            .add_episode_to_edges(&[rel.uuid.clone()], "ep_2")
            .await
            .unwrap();

        let edges = store
            .get_edges_between_entities(&graph_id, &a.uuid, &b.uuid, true)
            .await
            .unwrap();
        assert_eq!(edges[0].episodes, vec!["ep_1", "ep_2"]);
    }

    #[tokio::test]
    async fn edges_for_entity_cover_both_directions() {
        let store = InMemoryStore::new();
        let graph_id = graph(&store).await;
        let a = entity(&graph_id, "Alice", "Person");
        let b = entity(&graph_id, "Bob", "Person");
        let c = entity(&graph_id, "Carol", "Person");
        store
            .upsert_entities(&[a.clone(), b.clone(), c.clone()])
            .await
            .unwrap();

        let outgoing =
            Relation::new("proj1", graph_id.clone(), &a.uuid, &b.uuid, "FOLLOWS", Utc::now());
        let incoming =
            Relation::new("proj1", graph_id.clone(), &c.uuid, &a.uuid, "FOLLOWS", Utc::now());
        store
            .upsert_relations(&[outgoing.clone(), incoming.clone()])
            .await
            .unwrap();
        store
            .invalidate_edge(&incoming.uuid, Utc::now())
            .await
            .unwrap();

        let active = store
            .get_valid_edges_for_entity(&graph_id, &a.uuid, false)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].uuid, outgoing.uuid);

        let all = store
            .get_valid_edges_for_entity(&graph_id, &a.uuid, true)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn attributes_replaced_only_when_non_empty() {
        let store = InMemoryStore::new();
        let graph_id = graph(&store).await;

        let alice = entity(&graph_id, "Alice", "Person")
            .with_attributes(json!({"followers": 42}));
        let uuid = store.upsert_entities(&[alice]).await.unwrap()[0].clone();

        let plain = entity(&graph_id, "Alice", "Person");
        store.upsert_entities(&[plain]).await.unwrap();

        let stored = store.get_entity_by_uuid(&uuid).await.unwrap().unwrap();
        assert_eq!(stored.attributes["followers"], 42);
    }
}
