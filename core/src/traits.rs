//! Core traits defining the pluggable seams of the Engram pipeline

use crate::errors::{GraphError, LlmError};
use crate::ontology::Ontology;
use crate::types::{Chunk, EdgeFact, Entity, ExtractionOutcome, GraphId, GraphMeta, Relation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Property-graph persistence contract.
///
/// Every method is scoped by `graph_id`. Each method either completes
/// atomically on a single node/edge or is safe to retry: upserts are
/// idempotent by uuid, so the delivery contract is at-least-once.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create a graph, persisting its metadata, and return the generated id.
    async fn create_graph(
        &self,
        project_id: &str,
        name: &str,
        ontology: &Ontology,
    ) -> Result<GraphId, GraphError>;

    /// Remove the graph metadata and every entity, relation, chunk and
    /// mention link under it. No dangling references remain.
    async fn delete_graph(&self, graph_id: &GraphId) -> Result<(), GraphError>;

    /// Fetch graph metadata (project id, ontology), if the graph exists.
    async fn load_graph_meta(&self, graph_id: &GraphId) -> Result<Option<GraphMeta>, GraphError>;

    /// Idempotent by uuid. On conflict: replace `name`/`entity_type`;
    /// replace `summary` only when the new one is non-empty; union-append
    /// `source_entity_types`; preserve the original `created_at`.
    async fn upsert_entities(&self, entities: &[Entity]) -> Result<Vec<String>, GraphError>;

    /// Idempotent by uuid. On conflict: set `name`, `fact`, attributes;
    /// preserve `created_at`; set `valid_at` only when absent; union-append
    /// `episodes`.
    async fn upsert_relations(&self, relations: &[Relation]) -> Result<(), GraphError>;

    /// Partial update: a non-empty summary overrides; types are
    /// union-appended. Returns false when the entity does not exist.
    async fn update_entity_summary(
        &self,
        uuid: &str,
        summary: Option<&str>,
        append_source_types: &[String],
    ) -> Result<bool, GraphError>;

    /// Set `invalid_at` and `expired_at` on the edge. Idempotent.
    async fn invalidate_edge(
        &self,
        edge_uuid: &str,
        invalid_at: DateTime<Utc>,
    ) -> Result<bool, GraphError>;

    /// Union-append the episode id to each edge; returns how many edges were
    /// updated.
    async fn add_episode_to_edges(
        &self,
        edge_uuids: &[String],
        episode_id: &str,
    ) -> Result<usize, GraphError>;

    /// Exact (case-insensitive) name match, optionally filtered by type.
    async fn find_similar_entities(
        &self,
        graph_id: &GraphId,
        name: &str,
        entity_type: Option<&str>,
    ) -> Result<Vec<Entity>, GraphError>;

    /// Candidate recall for deduplication: up to `limit` entities scored by
    /// match class `exact > prefix > contains` over normalized names,
    /// ordered by score then name.
    async fn search_similar_entities(
        &self,
        graph_id: &GraphId,
        name: &str,
        limit: usize,
    ) -> Result<Vec<Entity>, GraphError>;

    /// All edges between the two entities; invalidated edges are excluded
    /// unless `include_invalid`.
    async fn get_edges_between_entities(
        &self,
        graph_id: &GraphId,
        source_uuid: &str,
        target_uuid: &str,
        include_invalid: bool,
    ) -> Result<Vec<Relation>, GraphError>;

    /// Entity lookup by uuid.
    async fn get_entity_by_uuid(&self, uuid: &str) -> Result<Option<Entity>, GraphError>;

    /// All edges touching the entity (incoming and outgoing), optionally
    /// including invalidated ones.
    async fn get_valid_edges_for_entity(
        &self,
        graph_id: &GraphId,
        entity_uuid: &str,
        include_invalid: bool,
    ) -> Result<Vec<Relation>, GraphError>;

    /// Persist a document chunk and attach it to its graph.
    async fn upsert_chunk(&self, chunk: &Chunk) -> Result<(), GraphError>;

    /// Link a chunk to the entities it mentions.
    async fn link_mentions(
        &self,
        graph_id: &GraphId,
        chunk_id: &str,
        entity_uuids: &[String],
    ) -> Result<(), GraphError>;

    /// Test the connection to the storage backend.
    async fn health_check(&self) -> Result<(), GraphError>;
}

/// Turns episode text into structured entities and relations.
#[async_trait]
pub trait KnowledgeExtractor: Send + Sync {
    async fn extract(&self, text: &str, ontology: &Ontology)
        -> Result<ExtractionOutcome, LlmError>;
}

/// Decides which existing edges between the same pair of entities are
/// contradicted by a new edge. Returns the uuids of the contradicted edges.
#[async_trait]
pub trait ContradictionDetector: Send + Sync {
    async fn detect_contradictions(
        &self,
        new_edge: &EdgeFact,
        existing_edges: &[EdgeFact],
    ) -> Vec<String>;
}
