//! Core data types for the Engram knowledge graph

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ontology::Ontology;
use crate::similarity::normalize;

/// Unique identifier for a graph, the top-level scoping key.
///
/// Every store mutation is scoped by a `GraphId`; cross-graph traversals are
/// forbidden.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphId(pub String);

impl GraphId {
    /// Create a new GraphId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh GraphId
    pub fn generate() -> Self {
        Self(format!("graph_{}", random_hex16()))
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic entity uuid: a pure function of `(project_id, entity_type,
/// normalized name)`, so re-ingesting the same canonical name converges on
/// the same node across restarts and replays.
pub fn stable_entity_uuid(project_id: &str, entity_type: &str, name: &str) -> String {
    let key = format!("{}:{}:{}", project_id, entity_type, normalize(name));
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
        .simple()
        .to_string();
    format!("ent_{}", &digest[..16])
}

/// 16 random hex characters, the tail of fresh relation/episode ids.
pub fn random_hex16() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[..16].to_string()
}

/// A node in the knowledge graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Deterministic primary key (see [`stable_entity_uuid`])
    pub uuid: String,
    pub project_id: String,
    pub graph_id: GraphId,
    /// Display name
    pub name: String,
    /// Canonical label from the ontology
    pub entity_type: String,
    /// Free-text summary; replaced on upsert only when the new one is non-empty
    pub summary: String,
    /// Free-form key/value attributes
    pub attributes: serde_json::Value,
    /// Raw extractor labels, de-duplicated, append-only
    pub source_entity_types: Vec<String>,
    /// First insertion time, never mutated
    pub created_at: DateTime<Utc>,
}

impl Entity {
    /// Create a new entity; the uuid is derived from the scoping key.
    pub fn new(
        project_id: impl Into<String>,
        graph_id: GraphId,
        name: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        let project_id = project_id.into();
        let name = name.into();
        let entity_type = entity_type.into();
        Self {
            uuid: stable_entity_uuid(&project_id, &entity_type, &name),
            project_id,
            graph_id,
            name,
            entity_type,
            summary: String::new(),
            attributes: serde_json::Value::Object(Default::default()),
            source_entity_types: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Set the summary
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Set the attributes object
    pub fn with_attributes(mut self, attributes: serde_json::Value) -> Self {
        self.attributes = attributes;
        self
    }

    /// Set the raw source types seen so far
    pub fn with_source_types(mut self, types: Vec<String>) -> Self {
        self.source_entity_types = types;
        self
    }
}

/// A bi-temporal edge (relation) between two entities.
///
/// The uuid is fresh per inserted fact: multiple facts may coexist between
/// the same pair of entities, so it is never derived from the endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub uuid: String,
    pub project_id: String,
    pub graph_id: GraphId,
    pub source_uuid: String,
    pub target_uuid: String,
    /// Relation label, e.g. `SUPPORTS`
    pub name: String,
    /// Natural-language justification for the fact
    pub fact: String,
    /// Mirrors `name`, kept for downstream consumers
    pub fact_type: String,
    /// Free-form attributes, excluding the temporal keys
    pub attributes: serde_json::Value,
    /// When the record was written
    pub created_at: DateTime<Utc>,
    /// When the fact became true in the modeled world
    pub valid_at: DateTime<Utc>,
    /// Set when a later fact contradicts this one; never cleared
    pub invalid_at: Option<DateTime<Utc>>,
    /// Mirrors `invalid_at`
    pub expired_at: Option<DateTime<Utc>>,
    /// Episode ids that contributed to this edge; append-only, deduplicated
    pub episodes: Vec<String>,
}

impl Relation {
    /// Create a new relation with a fresh uuid, valid from `valid_at`.
    pub fn new(
        project_id: impl Into<String>,
        graph_id: GraphId,
        source_uuid: impl Into<String>,
        target_uuid: impl Into<String>,
        name: impl Into<String>,
        valid_at: DateTime<Utc>,
    ) -> Self {
        let name = name.into();
        Self {
            uuid: format!("rel_{}", random_hex16()),
            project_id: project_id.into(),
            graph_id,
            source_uuid: source_uuid.into(),
            target_uuid: target_uuid.into(),
            fact: String::new(),
            fact_type: name.clone(),
            name,
            attributes: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
            valid_at,
            invalid_at: None,
            expired_at: None,
            episodes: Vec::new(),
        }
    }

    /// Set the fact text
    pub fn with_fact(mut self, fact: impl Into<String>) -> Self {
        self.fact = fact.into();
        self
    }

    /// Set the attributes object
    pub fn with_attributes(mut self, attributes: serde_json::Value) -> Self {
        self.attributes = attributes;
        self
    }

    /// Set the contributing episodes
    pub fn with_episodes(mut self, episodes: Vec<String>) -> Self {
        self.episodes = episodes;
        self
    }

    /// An edge is active iff it has not been invalidated.
    pub fn is_active(&self) -> bool {
        self.invalid_at.is_none()
    }
}

/// A text chunk from the document-ingestion path, linked to the entities it
/// mentions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub project_id: String,
    pub graph_id: GraphId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    pub fn new(
        project_id: impl Into<String>,
        graph_id: GraphId,
        text: impl Into<String>,
    ) -> Self {
        Self {
            chunk_id: format!("chunk_{}", random_hex16()),
            project_id: project_id.into(),
            graph_id,
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

/// Graph metadata record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphMeta {
    pub graph_id: GraphId,
    pub project_id: String,
    pub name: String,
    pub ontology: Ontology,
    pub created_at: DateTime<Utc>,
}

/// An entity candidate extracted by the LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    /// Raw extractor label, canonicalized against the ontology before use
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub attributes: Option<serde_json::Value>,
}

/// A relation candidate extracted by the LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub source: String,
    #[serde(default)]
    pub source_type: String,
    pub target: String,
    #[serde(default)]
    pub target_type: String,
    pub relation: String,
    #[serde(default)]
    pub fact: String,
    #[serde(default)]
    pub attributes: Option<serde_json::Value>,
}

/// Structured result of one extraction call. Missing or empty fields
/// collapse to empty collections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,
}

impl ExtractionOutcome {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }
}

/// The contradiction-detector view of an edge: endpoint names, relation
/// label, and fact text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeFact {
    pub uuid: String,
    pub source_name: String,
    pub target_name: String,
    pub relation_name: String,
    pub fact: String,
}

impl EdgeFact {
    pub fn new(
        uuid: impl Into<String>,
        source_name: impl Into<String>,
        target_name: impl Into<String>,
        relation_name: impl Into<String>,
        fact: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            source_name: source_name.into(),
            target_name: target_name.into(),
            relation_name: relation_name.into(),
            fact: fact.into(),
        }
    }
}
