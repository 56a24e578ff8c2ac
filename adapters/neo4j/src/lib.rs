//! Neo4j adapter for the Engram GraphStore trait

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engram_core::prelude::*;
use engram_core::similarity::normalize;
use neo4rs::{query, Graph};
use tracing::{debug, info, warn};

mod config;
mod queries;
mod utils;

pub use config::Neo4jConfig;
use utils::{entity_from_row, relation_from_row, parse_datetime};

/// Neo4j implementation of GraphStore
pub struct Neo4jStore {
    graph: Graph,
}

impl Neo4jStore {
    /// Connect to Neo4j, verify the connection and bootstrap the schema.
    pub async fn new(config: Neo4jConfig) -> Result<Self, GraphError> {
        info!("Connecting to Neo4j at {}", config.uri);

        let graph = Graph::new(
            &config.uri,
            config.user.as_deref().unwrap_or("neo4j"),
            config.password.as_deref().unwrap_or("neo4j"),
        )
        .await
        .map_err(|e| GraphError::ConnectionFailed(format!("Neo4j connection failed: {}", e)))?;

        let store = Self { graph };
        store.health_check().await?;
        store.ensure_schema().await;
        Ok(store)
    }

    /// Schema statements are advisory: dialects differ across server
    /// versions, so each failure is logged and skipped.
    async fn ensure_schema(&self) {
        for statement in queries::SCHEMA_STATEMENTS {
            debug!("Applying schema statement: {}", statement);
            if let Err(e) = self.graph.run(query(statement)).await {
                warn!("Neo4j schema statement failed, continuing: {} ({})", statement, e);
            }
        }
    }

    fn attributes_json(attributes: &serde_json::Value) -> String {
        serde_json::to_string(attributes).unwrap_or_else(|_| "{}".to_string())
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn create_graph(
        &self,
        project_id: &str,
        name: &str,
        ontology: &Ontology,
    ) -> Result<GraphId, GraphError> {
        let graph_id = GraphId::generate();
        let ontology_json = serde_json::to_string(ontology)
            .map_err(|e| GraphError::Serialization(e.to_string()))?;

        self.graph
            .run(
                query(queries::CREATE_GRAPH)
                    .param("graph_id", graph_id.as_str())
                    .param("project_id", project_id)
                    .param("name", name)
                    .param("ontology_json", ontology_json)
                    .param("created_at", Utc::now().to_rfc3339()),
            )
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Failed to create graph: {}", e)))?;

        info!("Created graph {} for project {}", graph_id, project_id);
        Ok(graph_id)
    }

    async fn delete_graph(&self, graph_id: &GraphId) -> Result<(), GraphError> {
        for statement in [
            queries::DELETE_GRAPH,
            queries::DELETE_GRAPH_ENTITIES,
            queries::DELETE_GRAPH_CHUNKS,
        ] {
            self.graph
                .run(query(statement).param("graph_id", graph_id.as_str()))
                .await
                .map_err(|e| GraphError::QueryFailed(format!("Failed to delete graph: {}", e)))?;
        }
        info!("Deleted graph {}", graph_id);
        Ok(())
    }

    async fn load_graph_meta(&self, graph_id: &GraphId) -> Result<Option<GraphMeta>, GraphError> {
        let mut result = self
            .graph
            .execute(query(queries::GET_GRAPH_META).param("graph_id", graph_id.as_str()))
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Failed to load graph meta: {}", e)))?;

        let Some(row) = result
            .next()
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Failed to fetch row: {}", e)))?
        else {
            return Ok(None);
        };

        let ontology_json: Option<String> = row.get("ontology_json").ok();
        let ontology = ontology_json
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        let created_at: String = row
            .get("created_at")
            .map_err(|e| GraphError::DatabaseError(format!("Missing created_at: {}", e)))?;

        Ok(Some(GraphMeta {
            graph_id: graph_id.clone(),
            project_id: row.get::<Option<String>>("project_id").ok().flatten().unwrap_or_default(),
            name: row.get::<Option<String>>("name").ok().flatten().unwrap_or_default(),
            ontology,
            created_at: parse_datetime(&created_at)?,
        }))
    }

    async fn upsert_entities(&self, entities: &[Entity]) -> Result<Vec<String>, GraphError> {
        let mut uuids = Vec::with_capacity(entities.len());
        for entity in entities {
            uuids.push(entity.uuid.clone());
            let source_types: Vec<String> = {
                let mut seen = Vec::new();
                for t in &entity.source_entity_types {
                    if !t.is_empty() && !seen.contains(t) {
                        seen.push(t.clone());
                    }
                }
                seen
            };
            self.graph
                .run(
                    query(queries::UPSERT_ENTITY)
                        .param("uuid", entity.uuid.as_str())
                        .param("project_id", entity.project_id.as_str())
                        .param("graph_id", entity.graph_id.as_str())
                        .param("name", entity.name.as_str())
                        .param("entity_type", entity.entity_type.as_str())
                        .param("summary", entity.summary.as_str())
                        .param("attributes_json", Self::attributes_json(&entity.attributes))
                        .param("source_entity_types", source_types)
                        .param("created_at", entity.created_at.to_rfc3339()),
                )
                .await
                .map_err(|e| GraphError::QueryFailed(format!("Failed to upsert entity: {}", e)))?;
        }
        Ok(uuids)
    }

    async fn upsert_relations(&self, relations: &[Relation]) -> Result<(), GraphError> {
        for relation in relations {
            self.graph
                .run(
                    query(queries::UPSERT_RELATION)
                        .param("uuid", relation.uuid.as_str())
                        .param("project_id", relation.project_id.as_str())
                        .param("graph_id", relation.graph_id.as_str())
                        .param("source_uuid", relation.source_uuid.as_str())
                        .param("target_uuid", relation.target_uuid.as_str())
                        .param("name", relation.name.as_str())
                        .param("fact", relation.fact.as_str())
                        .param("attributes_json", Self::attributes_json(&relation.attributes))
                        .param("created_at", relation.created_at.to_rfc3339())
                        .param("valid_at", relation.valid_at.to_rfc3339())
                        .param("episodes", relation.episodes.clone()),
                )
                .await
                .map_err(|e| GraphError::QueryFailed(format!("Failed to upsert relation: {}", e)))?;
        }
        Ok(())
    }

    async fn update_entity_summary(
        &self,
        uuid: &str,
        summary: Option<&str>,
        append_source_types: &[String],
    ) -> Result<bool, GraphError> {
        let mut result = self
            .graph
            .execute(
                query(queries::UPDATE_ENTITY_SUMMARY)
                    .param("uuid", uuid)
                    .param("summary", summary.unwrap_or(""))
                    .param("append_types", append_source_types.to_vec()),
            )
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Failed to update entity: {}", e)))?;

        Ok(result
            .next()
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Failed to fetch row: {}", e)))?
            .is_some())
    }

    async fn invalidate_edge(
        &self,
        edge_uuid: &str,
        invalid_at: DateTime<Utc>,
    ) -> Result<bool, GraphError> {
        let mut result = self
            .graph
            .execute(
                query(queries::INVALIDATE_EDGE)
                    .param("uuid", edge_uuid)
                    .param("invalid_at", invalid_at.to_rfc3339()),
            )
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Failed to invalidate edge: {}", e)))?;

        Ok(result
            .next()
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Failed to fetch row: {}", e)))?
            .is_some())
    }

    async fn add_episode_to_edges(
        &self,
        edge_uuids: &[String],
        episode_id: &str,
    ) -> Result<usize, GraphError> {
        let mut updated = 0;
        for uuid in edge_uuids {
            let mut result = self
                .graph
                .execute(
                    query(queries::ADD_EPISODE_TO_EDGE)
                        .param("uuid", uuid.as_str())
                        .param("episode_id", episode_id),
                )
                .await
                .map_err(|e| GraphError::QueryFailed(format!("Failed to add episode: {}", e)))?;
            if result
                .next()
                .await
                .map_err(|e| GraphError::QueryFailed(format!("Failed to fetch row: {}", e)))?
                .is_some()
            {
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
        let type_filter = if entity_type.is_some() {
            "AND e.entity_type = $entity_type"
        } else {
            ""
        };
        let cypher = format!(
            "MATCH (e:Entity {{graph_id: $graph_id}})\n\
             WHERE toLower(e.name) = $normalized_name {}\n{}",
            type_filter,
            queries::ENTITY_RETURN
        );

        let mut q = query(&cypher)
            .param("graph_id", graph_id.as_str())
            .param("normalized_name", normalize(name));
        if let Some(entity_type) = entity_type {
            q = q.param("entity_type", entity_type);
        }

        let mut result = self
            .graph
            .execute(q)
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Entity lookup failed: {}", e)))?;

        let mut entities = Vec::new();
        while let Some(row) = result
            .next()
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Failed to fetch row: {}", e)))?
        {
            entities.push(entity_from_row(&row)?);
        }
        Ok(entities)
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

        let cypher = format!(
            "MATCH (e:Entity {{graph_id: $graph_id}})\n\
             WITH e, toLower(e.name) AS lower_name\n\
             WHERE lower_name = $normalized_name\n\
                OR lower_name STARTS WITH $normalized_name\n\
                OR lower_name CONTAINS $normalized_name\n\
                OR $normalized_name CONTAINS lower_name\n\
             WITH e, CASE\n\
                     WHEN lower_name = $normalized_name THEN 3\n\
                     WHEN lower_name STARTS WITH $normalized_name THEN 2\n\
                     ELSE 1\n\
                 END AS match_score\n\
             ORDER BY match_score DESC, e.name\n\
             LIMIT $limit\n{}",
            queries::ENTITY_RETURN
        );

        let mut result = self
            .graph
            .execute(
                query(&cypher)
                    .param("graph_id", graph_id.as_str())
                    .param("normalized_name", normalized)
                    .param("limit", limit as i64),
            )
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Entity search failed: {}", e)))?;

        let mut entities = Vec::new();
        while let Some(row) = result
            .next()
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Failed to fetch row: {}", e)))?
        {
            entities.push(entity_from_row(&row)?);
        }
        Ok(entities)
    }

    async fn get_edges_between_entities(
        &self,
        graph_id: &GraphId,
        source_uuid: &str,
        target_uuid: &str,
        include_invalid: bool,
    ) -> Result<Vec<Relation>, GraphError> {
        let invalid_filter = if include_invalid {
            ""
        } else {
            "WHERE r.invalid_at IS NULL OR r.invalid_at = \"\""
        };
        let cypher = format!(
            "MATCH (s:Entity {{uuid: $source_uuid}})-[r:REL {{graph_id: $graph_id}}]->(t:Entity {{uuid: $target_uuid}})\n\
             {}\n{}",
            invalid_filter,
            queries::RELATION_RETURN
        );

        let mut result = self
            .graph
            .execute(
                query(&cypher)
                    .param("graph_id", graph_id.as_str())
                    .param("source_uuid", source_uuid)
                    .param("target_uuid", target_uuid),
            )
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Edge lookup failed: {}", e)))?;

        let mut relations = Vec::new();
        while let Some(row) = result
            .next()
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Failed to fetch row: {}", e)))?
        {
            relations.push(relation_from_row(&row)?);
        }
        Ok(relations)
    }

    async fn get_entity_by_uuid(&self, uuid: &str) -> Result<Option<Entity>, GraphError> {
        let cypher = format!("MATCH (e:Entity {{uuid: $uuid}})\n{}", queries::ENTITY_RETURN);
        let mut result = self
            .graph
            .execute(query(&cypher).param("uuid", uuid))
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Entity lookup failed: {}", e)))?;

        match result
            .next()
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Failed to fetch row: {}", e)))?
        {
            Some(row) => Ok(Some(entity_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_valid_edges_for_entity(
        &self,
        graph_id: &GraphId,
        entity_uuid: &str,
        include_invalid: bool,
    ) -> Result<Vec<Relation>, GraphError> {
        let invalid_filter = if include_invalid {
            ""
        } else {
            "AND (r.invalid_at IS NULL OR r.invalid_at = \"\")"
        };
        let cypher = format!(
            "MATCH (s:Entity)-[r:REL {{graph_id: $graph_id}}]->(t:Entity)\n\
             WHERE (s.uuid = $entity_uuid OR t.uuid = $entity_uuid) {}\n{}",
            invalid_filter,
            queries::RELATION_RETURN
        );

        let mut result = self
            .graph
            .execute(
                query(&cypher)
                    .param("graph_id", graph_id.as_str())
                    .param("entity_uuid", entity_uuid),
            )
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Edge lookup failed: {}", e)))?;

        let mut relations = Vec::new();
        while let Some(row) = result
            .next()
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Failed to fetch row: {}", e)))?
        {
            relations.push(relation_from_row(&row)?);
        }
        Ok(relations)
    }

    async fn upsert_chunk(&self, chunk: &Chunk) -> Result<(), GraphError> {
        self.graph
            .run(
                query(queries::UPSERT_CHUNK)
                    .param("chunk_id", chunk.chunk_id.as_str())
                    .param("project_id", chunk.project_id.as_str())
                    .param("graph_id", chunk.graph_id.as_str())
                    .param("text", chunk.text.as_str())
                    .param("created_at", chunk.created_at.to_rfc3339()),
            )
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Failed to upsert chunk: {}", e)))
    }

    async fn link_mentions(
        &self,
        graph_id: &GraphId,
        chunk_id: &str,
        entity_uuids: &[String],
    ) -> Result<(), GraphError> {
        if entity_uuids.is_empty() {
            return Ok(());
        }
        self.graph
            .run(
                query(queries::LINK_MENTIONS)
                    .param("chunk_id", chunk_id)
                    .param("graph_id", graph_id.as_str())
                    .param("entity_uuids", entity_uuids.to_vec()),
            )
            .await
            .map_err(|e| GraphError::QueryFailed(format!("Failed to link mentions: {}", e)))
    }

    async fn health_check(&self) -> Result<(), GraphError> {
        debug!("Performing Neo4j health check");
        let mut result = self
            .graph
            .execute(query(queries::HEALTH_CHECK))
            .await
            .map_err(|e| GraphError::ConnectionFailed(format!("Health check failed: {}", e)))?;

        if result
            .next()
            .await
            .map_err(|e| GraphError::ConnectionFailed(format!("Health check result failed: {}", e)))?
            .is_some()
        {
            Ok(())
        } else {
            Err(GraphError::ConnectionFailed(
                "Health check returned no results".to_string(),
            ))
        }
    }
}
