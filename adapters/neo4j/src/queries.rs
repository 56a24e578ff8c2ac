//! Cypher statements used by the Neo4j adapter.
//!
//! Temporal fields are stored as RFC3339 strings; free-form attribute maps
//! and the ontology are stored as JSON strings (bolt parameters must be
//! scalar-compatible).

/// Schema statements are advisory: dialects differ across Neo4j versions, so
/// failures are logged and skipped.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE CONSTRAINT graph_id_unique IF NOT EXISTS FOR (g:Graph) REQUIRE g.graph_id IS UNIQUE",
    "CREATE CONSTRAINT entity_uuid_unique IF NOT EXISTS FOR (e:Entity) REQUIRE e.uuid IS UNIQUE",
    "CREATE INDEX entity_graph_id IF NOT EXISTS FOR (e:Entity) ON (e.graph_id)",
    "CREATE INDEX entity_project_id IF NOT EXISTS FOR (e:Entity) ON (e.project_id)",
    "CREATE INDEX relation_graph_id IF NOT EXISTS FOR ()-[r:REL]-() ON (r.graph_id)",
    "CREATE INDEX chunk_graph_id IF NOT EXISTS FOR (c:Chunk) ON (c.graph_id)",
];

pub const CREATE_GRAPH: &str = r#"
CREATE (g:Graph {
    graph_id: $graph_id,
    project_id: $project_id,
    name: $name,
    ontology_json: $ontology_json,
    created_at: $created_at
})
"#;

pub const DELETE_GRAPH: &str = r#"
MATCH (g:Graph {graph_id: $graph_id})
OPTIONAL MATCH (g)-[:HAS_CHUNK]->(c:Chunk)
DETACH DELETE g, c
"#;

pub const DELETE_GRAPH_ENTITIES: &str = "MATCH (e:Entity {graph_id: $graph_id}) DETACH DELETE e";

pub const DELETE_GRAPH_CHUNKS: &str = "MATCH (c:Chunk {graph_id: $graph_id}) DETACH DELETE c";

pub const GET_GRAPH_META: &str = r#"
MATCH (g:Graph {graph_id: $graph_id})
RETURN g.graph_id AS graph_id, g.project_id AS project_id, g.name AS name,
       g.ontology_json AS ontology_json, g.created_at AS created_at
"#;

pub const UPSERT_ENTITY: &str = r#"
MERGE (e:Entity {uuid: $uuid})
SET e.project_id = $project_id,
    e.graph_id = $graph_id,
    e.name = $name,
    e.entity_type = $entity_type,
    e.summary = CASE
        WHEN $summary IS NULL OR $summary = "" THEN e.summary
        ELSE $summary
    END,
    e.attributes_json = CASE
        WHEN $attributes_json IS NULL OR $attributes_json = "{}" THEN e.attributes_json
        ELSE $attributes_json
    END,
    e.source_entity_types = CASE
        WHEN e.source_entity_types IS NULL THEN $source_entity_types
        ELSE e.source_entity_types + [t IN $source_entity_types WHERE NOT t IN e.source_entity_types]
    END,
    e.created_at = COALESCE(e.created_at, $created_at)
"#;

pub const UPSERT_RELATION: &str = r#"
MATCH (s:Entity {uuid: $source_uuid, graph_id: $graph_id})
MATCH (t:Entity {uuid: $target_uuid, graph_id: $graph_id})
MERGE (s)-[r:REL {uuid: $uuid}]->(t)
SET r.project_id = $project_id,
    r.graph_id = $graph_id,
    r.name = $name,
    r.fact = $fact,
    r.fact_type = $name,
    r.attributes_json = $attributes_json,
    r.created_at = COALESCE(r.created_at, $created_at),
    r.valid_at = COALESCE(r.valid_at, $valid_at),
    r.episodes = CASE
        WHEN r.episodes IS NULL THEN $episodes
        ELSE r.episodes + [ep IN $episodes WHERE NOT ep IN r.episodes]
    END
"#;

pub const UPDATE_ENTITY_SUMMARY: &str = r#"
MATCH (e:Entity {uuid: $uuid})
SET e.summary = CASE
        WHEN $summary IS NULL OR $summary = "" THEN e.summary
        ELSE $summary
    END,
    e.source_entity_types = CASE
        WHEN $append_types = [] THEN e.source_entity_types
        WHEN e.source_entity_types IS NULL THEN $append_types
        ELSE e.source_entity_types + [t IN $append_types WHERE NOT t IN e.source_entity_types]
    END
RETURN e.uuid AS uuid
"#;

pub const INVALIDATE_EDGE: &str = r#"
MATCH ()-[r:REL {uuid: $uuid}]->()
SET r.invalid_at = COALESCE(r.invalid_at, $invalid_at),
    r.expired_at = COALESCE(r.expired_at, $invalid_at)
RETURN r.uuid AS uuid
"#;

pub const ADD_EPISODE_TO_EDGE: &str = r#"
MATCH ()-[r:REL {uuid: $uuid}]->()
SET r.episodes = CASE
    WHEN r.episodes IS NULL THEN [$episode_id]
    WHEN NOT $episode_id IN r.episodes THEN r.episodes + $episode_id
    ELSE r.episodes
END
RETURN r.uuid AS uuid
"#;

pub const ENTITY_RETURN: &str = r#"
RETURN e.uuid AS uuid, e.project_id AS project_id, e.graph_id AS graph_id,
       e.name AS name, e.entity_type AS entity_type, e.summary AS summary,
       e.attributes_json AS attributes_json,
       e.source_entity_types AS source_entity_types,
       e.created_at AS created_at
"#;

pub const RELATION_RETURN: &str = r#"
RETURN r.uuid AS uuid, r.project_id AS project_id, r.graph_id AS graph_id,
       s.uuid AS source_uuid, t.uuid AS target_uuid,
       r.name AS name, r.fact AS fact, r.fact_type AS fact_type,
       r.attributes_json AS attributes_json, r.created_at AS created_at,
       r.valid_at AS valid_at, r.invalid_at AS invalid_at,
       r.expired_at AS expired_at, r.episodes AS episodes
"#;

pub const UPSERT_CHUNK: &str = r#"
MERGE (c:Chunk {chunk_id: $chunk_id})
SET c.project_id = $project_id,
    c.graph_id = $graph_id,
    c.text = $text,
    c.created_at = COALESCE(c.created_at, $created_at)
WITH c
MATCH (g:Graph {graph_id: $graph_id})
MERGE (g)-[:HAS_CHUNK]->(c)
"#;

pub const LINK_MENTIONS: &str = r#"
MATCH (c:Chunk {chunk_id: $chunk_id, graph_id: $graph_id})
UNWIND $entity_uuids AS entity_uuid
MATCH (e:Entity {uuid: entity_uuid, graph_id: $graph_id})
MERGE (c)-[:MENTIONS]->(e)
"#;

pub const HEALTH_CHECK: &str = "RETURN 1 AS test";
