//! Ontology definitions guiding LLM extraction

use serde::{Deserialize, Serialize};

/// A single entity or edge type in the ontology
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OntologyEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl OntologyEntry {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// The extraction ontology: which entity and edge types the extractor should
/// look for. Stored serialized on the graph meta node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ontology {
    #[serde(default)]
    pub entity_types: Vec<OntologyEntry>,
    #[serde(default)]
    pub edge_types: Vec<OntologyEntry>,
}

impl Default for Ontology {
    fn default() -> Self {
        Self {
            entity_types: vec![
                OntologyEntry::new("Person", "A person or agent"),
                OntologyEntry::new("Organization", "A company, institution or group"),
                OntologyEntry::new("Product", "A product or service"),
                OntologyEntry::new("Location", "A physical or virtual place"),
                OntologyEntry::new("Topic", "A topic or concept under discussion"),
            ],
            edge_types: vec![
                OntologyEntry::new("LIKES", "Positive sentiment towards the target"),
                OntologyEntry::new("DISLIKES", "Negative sentiment towards the target"),
                OntologyEntry::new("FOLLOWS", "Follows the target"),
                OntologyEntry::new("MENTIONS", "Mentions the target"),
                OntologyEntry::new("INTERACTS_WITH", "Interacts with the target"),
                OntologyEntry::new("DISCUSSES", "Discusses the target"),
                OntologyEntry::new("SUPPORTS", "Expresses support for the target"),
                OntologyEntry::new("OPPOSES", "Expresses opposition to the target"),
            ],
        }
    }
}

impl Ontology {
    /// Case-insensitive lookup of a canonical entity type name.
    pub fn canonical_entity_type(&self, raw: &str) -> Option<&str> {
        let raw = raw.trim();
        self.entity_types
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(raw))
            .map(|e| e.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ontology_has_core_types() {
        let ontology = Ontology::default();
        assert!(ontology.canonical_entity_type("person").is_some());
        assert!(ontology.canonical_entity_type(" TOPIC ").is_some());
        assert!(ontology.canonical_entity_type("Spaceship").is_none());
    }

    #[test]
    fn ontology_round_trips_through_json() {
        let ontology = Ontology::default();
        let json = serde_json::to_string(&ontology).unwrap();
        let back: Ontology = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entity_types.len(), ontology.entity_types.len());
        assert_eq!(back.edge_types.len(), ontology.edge_types.len());
    }
}
