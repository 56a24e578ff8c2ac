//! LLM-driven entity and relation extraction from episode text

use async_trait::async_trait;
use engram_core::prelude::*;
use engram_connector_openai::{ChatMessage, ChatOptions, RotatingLlmClient, Stage};
use std::sync::Arc;
use tracing::debug;

/// Extracts entities and relations from episode text with an LLM, guided by
/// the graph's ontology.
pub struct LlmGraphExtractor {
    client: Arc<RotatingLlmClient>,
}

impl LlmGraphExtractor {
    pub fn new(client: Arc<RotatingLlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KnowledgeExtractor for LlmGraphExtractor {
    async fn extract(
        &self,
        text: &str,
        ontology: &Ontology,
    ) -> Result<ExtractionOutcome, LlmError> {
        let messages = [
            ChatMessage::system(build_system_prompt(ontology)),
            ChatMessage::user(build_user_prompt(text)),
        ];
        let value = self
            .client
            .chat_json(&messages, &ChatOptions::json(Stage::JsonStructure))
            .await?;
        let outcome = parse_outcome(value, ontology)?;
        debug!(
            "Extracted {} entities and {} relations",
            outcome.entities.len(),
            outcome.relations.len()
        );
        Ok(outcome)
    }
}

fn build_system_prompt(ontology: &Ontology) -> String {
    let entity_types = ontology
        .entity_types
        .iter()
        .map(|e| format!("- {}: {}", e.name, e.description))
        .collect::<Vec<_>>()
        .join("\n");
    let edge_types = ontology
        .edge_types
        .iter()
        .map(|e| format!("- {}: {}", e.name, e.description))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You are an expert knowledge graph extraction engine. Analyze the \
         provided agent activity log and identify entities and the relations \
         between them.\n\n\
         Entity types:\n{}\n\n\
         Relation types:\n{}\n\n\
         Return strictly a JSON object of the form:\n\
         {{\n\
           \"entities\": [{{\"name\": \"...\", \"type\": \"...\", \"summary\": \"...\"}}],\n\
           \"relations\": [{{\"source\": \"...\", \"source_type\": \"...\", \
         \"target\": \"...\", \"target_type\": \"...\", \"relation\": \"...\", \"fact\": \"...\"}}]\n\
         }}\n\n\
         Instructions:\n\
         - Only extract explicitly stated information; do not infer or hallucinate\n\
         - `relation` must be one of the relation types above\n\
         - `fact` is a one-sentence natural-language statement of the relation\n\
         - Use an empty array when nothing matches",
        entity_types, edge_types
    )
}

fn build_user_prompt(text: &str) -> String {
    format!("Activity log:\n{}", text)
}

/// Validate the extraction payload shape and canonicalize raw type labels
/// against the ontology. Missing or empty fields collapse to empty arrays.
pub(crate) fn parse_outcome(
    value: serde_json::Value,
    ontology: &Ontology,
) -> Result<ExtractionOutcome, LlmError> {
    let mut outcome: ExtractionOutcome = serde_json::from_value(value)
        .map_err(|e| LlmError::ResponseParseError(format!("Unexpected extraction shape: {}", e)))?;

    for entity in &mut outcome.entities {
        entity.entity_type = canonicalize_entity_type(&entity.entity_type, ontology);
    }
    for relation in &mut outcome.relations {
        relation.source_type = canonicalize_entity_type(&relation.source_type, ontology);
        relation.target_type = canonicalize_entity_type(&relation.target_type, ontology);
    }
    Ok(outcome)
}

/// Map a raw extractor label onto a canonical ontology entity type. Unknown
/// labels pass through unchanged; an empty label becomes `Entity`.
pub fn canonicalize_entity_type(raw: &str, ontology: &Ontology) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return "Entity".to_string();
    }
    if let Some(canonical) = ontology.canonical_entity_type(raw) {
        return canonical.to_string();
    }

    let alias_target = match raw.to_lowercase().as_str() {
        "person" | "people" | "human" | "user" | "agent" | "individual" => "Person",
        "organization" | "organisation" | "org" | "company" | "corporation" | "institution"
        | "group" => "Organization",
        "product" | "app" | "application" | "service" | "platform" | "tool" => "Product",
        "location" | "place" | "city" | "country" | "region" => "Location",
        "topic" | "concept" | "subject" | "theme" | "idea" | "event" => "Topic",
        _ => return raw.to_string(),
    };
    ontology
        .canonical_entity_type(alias_target)
        .unwrap_or(alias_target)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonicalization_maps_aliases_onto_ontology() {
        let ontology = Ontology::default();
        assert_eq!(canonicalize_entity_type("user", &ontology), "Person");
        assert_eq!(canonicalize_entity_type("company", &ontology), "Organization");
        assert_eq!(canonicalize_entity_type("platform", &ontology), "Product");
        assert_eq!(canonicalize_entity_type("PERSON", &ontology), "Person");
        assert_eq!(canonicalize_entity_type("", &ontology), "Entity");
        // Unknown labels pass through.
        assert_eq!(canonicalize_entity_type("Spaceship", &ontology), "Spaceship");
    }

    #[test]
    fn parse_outcome_collapses_missing_fields() {
        let ontology = Ontology::default();
        let outcome = parse_outcome(json!({}), &ontology).unwrap();
        assert!(outcome.is_empty());

        let outcome = parse_outcome(
            json!({
                "entities": [{"name": "Alice", "type": "user"}],
                "relations": [{
                    "source": "Alice", "source_type": "user",
                    "target": "Bluesky", "target_type": "app",
                    "relation": "LIKES", "fact": "Alice likes Bluesky"
                }]
            }),
            &ontology,
        )
        .unwrap();
        assert_eq!(outcome.entities[0].entity_type, "Person");
        assert_eq!(outcome.relations[0].source_type, "Person");
        assert_eq!(outcome.relations[0].target_type, "Product");
    }

    #[test]
    fn parse_outcome_rejects_non_object_payloads() {
        let ontology = Ontology::default();
        assert!(parse_outcome(json!([1, 2, 3]), &ontology).is_err());
        assert!(parse_outcome(json!({"entities": "nope"}), &ontology).is_err());
    }

    #[test]
    fn system_prompt_lists_ontology_types() {
        let prompt = build_system_prompt(&Ontology::default());
        assert!(prompt.contains("- Person:"));
        assert!(prompt.contains("- LIKES:"));
        assert!(prompt.contains("\"entities\""));
    }
}
