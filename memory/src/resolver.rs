//! Entity deduplication: decides whether an extracted entity is new or an
//! alias of an existing node.
//!
//! Two-stage strategy: deterministic matching (exact, then fuzzy over
//! recalled candidates) and an optional LLM disambiguation pass for
//! mid-confidence candidates.

use engram_core::prelude::*;
use engram_core::similarity::{normalize, normalize_fuzzy, sequence_ratio, token_jaccard};
use engram_core::types::stable_entity_uuid;
use engram_connector_openai::{ChatMessage, ChatOptions, RotatingLlmClient, Stage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Minimum trimmed name length; shorter names never match existing nodes.
pub const MIN_NAME_LENGTH: usize = 2;
/// Deterministic fuzzy-match acceptance threshold.
pub const FUZZY_MATCH_THRESHOLD: f64 = 0.85;
/// Candidates below the threshold but above this floor go to the LLM pass.
const LLM_BAND_FLOOR: f64 = 0.5;
const CANDIDATE_LIMIT: usize = 20;

/// Result of resolving one extracted entity.
#[derive(Debug, Clone)]
pub struct ResolvedEntity {
    /// Matched entity uuid, or the deterministic uuid of the new entity
    pub uuid: String,
    /// Best canonical name
    pub name: String,
    pub entity_type: String,
    pub is_new: bool,
    pub matched_uuid: Option<String>,
    /// Best deterministic score in [0, 1], kept for diagnostics on misses
    pub match_score: f64,
    pub should_update_summary: bool,
}

/// Optional LLM pass deciding whether a new entity duplicates one of the
/// recalled candidates.
pub struct LlmDisambiguator {
    client: Arc<RotatingLlmClient>,
}

impl LlmDisambiguator {
    pub fn new(client: Arc<RotatingLlmClient>) -> Self {
        Self { client }
    }

    /// Returns the index of the duplicated candidate, or `None`. Failures
    /// fall back to the deterministic result.
    pub async fn disambiguate(
        &self,
        name: &str,
        entity_type: &str,
        candidates: &[Entity],
        context: &str,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let candidate_list = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| {
                format!(
                    "[{}] {} (type: {}, summary: {})",
                    i,
                    c.name,
                    c.entity_type,
                    if c.summary.is_empty() { "none" } else { &c.summary }
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Decide whether the new entity is the same real-world object as \
             one of the candidates.\n\n\
             <context>\n{}\n</context>\n\n\
             <new entity>\nname: {}\ntype: {}\n</new entity>\n\n\
             <candidates>\n{}\n</candidates>\n\n\
             Rules:\n\
             - Same only when both refer to the same real-world object or concept\n\
             - Related but distinct entities are not the same\n\
             - Similar names for different individuals are not the same\n\n\
             Return a JSON object: {{\"duplicate_idx\": <candidate index>}} on a \
             match, {{\"duplicate_idx\": -1}} otherwise.",
            context, name, entity_type, candidate_list
        );

        let messages = [
            ChatMessage::system("You are an assistant that judges whether two entities are the same."),
            ChatMessage::user(prompt),
        ];

        let value = match self
            .client
            .chat_json(&messages, &ChatOptions::json(Stage::JsonStructure))
            .await
        {
            Ok(value) => value,
            Err(e) => {
                warn!("LLM entity disambiguation failed: {}", e);
                return None;
            }
        };

        candidate_index(&value, candidates.len())
    }
}

/// Out-of-range indices (including the explicit -1) mean "none".
fn candidate_index(value: &serde_json::Value, candidate_count: usize) -> Option<usize> {
    let idx = value.get("duplicate_idx").and_then(|v| v.as_i64())?;
    if idx >= 0 && (idx as usize) < candidate_count {
        Some(idx as usize)
    } else {
        None
    }
}

/// Entity resolver with a per-batch cache keyed by normalized name.
pub struct EntityResolver {
    store: Arc<dyn GraphStore>,
    fuzzy_threshold: f64,
    disambiguator: Option<LlmDisambiguator>,
    cache: Mutex<HashMap<String, ResolvedEntity>>,
}

impl EntityResolver {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            fuzzy_threshold: FUZZY_MATCH_THRESHOLD,
            disambiguator: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.fuzzy_threshold = threshold;
        self
    }

    pub fn with_disambiguator(mut self, disambiguator: LlmDisambiguator) -> Self {
        self.disambiguator = Some(disambiguator);
        self
    }

    /// Clear the per-batch cache; called at the start of every batch.
    pub fn clear_cache(&self) {
        self.cache.lock().expect("resolver cache poisoned").clear();
    }

    /// Resolve one extracted entity against the graph's existing nodes.
    pub async fn resolve(
        &self,
        graph_id: &GraphId,
        name: &str,
        entity_type: &str,
        summary: &str,
        context: &str,
    ) -> Result<ResolvedEntity, GraphError> {
        let trimmed = name.trim();
        if trimmed.chars().count() < MIN_NAME_LENGTH {
            return Ok(new_entity_result(trimmed, entity_type, 0.0));
        }

        let cache_key = format!("{}:{}", graph_id, normalize(trimmed));
        if let Some(cached) = self.cache.lock().expect("resolver cache poisoned").get(&cache_key) {
            return Ok(cached.clone());
        }

        let (mut result, candidates) = self
            .deterministic_resolve(graph_id, trimmed, entity_type, summary)
            .await?;

        // Mid-confidence band: a candidate was close but below threshold.
        if result.is_new
            && result.match_score > LLM_BAND_FLOOR
            && result.match_score < self.fuzzy_threshold
        {
            if let Some(disambiguator) = &self.disambiguator {
                if let Some(idx) = disambiguator
                    .disambiguate(trimmed, entity_type, &candidates, context)
                    .await
                {
                    let candidate = &candidates[idx];
                    debug!(
                        "LLM disambiguation matched '{}' -> '{}'",
                        trimmed, candidate.name
                    );
                    result = matched_result(
                        trimmed,
                        entity_type,
                        candidate,
                        result.match_score,
                        summary,
                    );
                }
            }
        }

        self.cache
            .lock()
            .expect("resolver cache poisoned")
            .insert(cache_key, result.clone());
        Ok(result)
    }

    /// Resolve against existing nodes only, never creating: the relation
    /// endpoint fallback. Returns the matched uuid, if any.
    pub async fn find_existing(
        &self,
        graph_id: &GraphId,
        name: &str,
        entity_type: &str,
    ) -> Result<Option<String>, GraphError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let resolved = self.resolve(graph_id, trimmed, entity_type, "", "").await?;
        if resolved.is_new {
            Ok(None)
        } else {
            Ok(Some(resolved.uuid))
        }
    }

    async fn deterministic_resolve(
        &self,
        graph_id: &GraphId,
        name: &str,
        entity_type: &str,
        summary: &str,
    ) -> Result<(ResolvedEntity, Vec<Entity>), GraphError> {
        let normalized = normalize(name);
        let fuzzy = normalize_fuzzy(name);

        let candidates = self
            .store
            .search_similar_entities(graph_id, name, CANDIDATE_LIMIT)
            .await?;
        if candidates.is_empty() {
            return Ok((new_entity_result(name, entity_type, 0.0), candidates));
        }

        let mut best_score = 0.0_f64;
        let mut best_idx: Option<usize> = None;

        for (idx, candidate) in candidates.iter().enumerate() {
            let candidate_normalized = normalize(&candidate.name);

            if candidate_normalized == normalized {
                let result = matched_result(name, entity_type, candidate, 1.0, summary);
                return Ok((result, candidates));
            }

            let candidate_fuzzy = normalize_fuzzy(&candidate.name);
            let score = sequence_ratio(&normalized, &candidate_normalized)
                .max(sequence_ratio(&fuzzy, &candidate_fuzzy))
                .max(token_jaccard(&fuzzy, &candidate_fuzzy));

            if score > best_score {
                best_score = score;
                best_idx = Some(idx);
            }
        }

        if let Some(idx) = best_idx {
            if best_score >= self.fuzzy_threshold {
                let candidate = &candidates[idx];
                debug!(
                    "Fuzzy match '{}' -> '{}' (score={:.3})",
                    name, candidate.name, best_score
                );
                let result = matched_result(name, entity_type, candidate, best_score, summary);
                return Ok((result, candidates));
            }
        }

        Ok((new_entity_result(name, entity_type, best_score), candidates))
    }
}

fn matched_result(
    name: &str,
    entity_type: &str,
    candidate: &Entity,
    score: f64,
    summary: &str,
) -> ResolvedEntity {
    ResolvedEntity {
        uuid: candidate.uuid.clone(),
        name: select_best_name(name, &candidate.name),
        entity_type: entity_type.to_string(),
        is_new: false,
        matched_uuid: Some(candidate.uuid.clone()),
        match_score: score,
        should_update_summary: !summary.is_empty(),
    }
}

fn new_entity_result(name: &str, entity_type: &str, score: f64) -> ResolvedEntity {
    // Diagnostic uuid over an empty project id; the definitive uuid is
    // derived when the entity record is built for upsert.
    ResolvedEntity {
        uuid: stable_entity_uuid("", entity_type, name),
        name: name.to_string(),
        entity_type: entity_type.to_string(),
        is_new: true,
        matched_uuid: None,
        match_score: score,
        should_update_summary: false,
    }
}

/// Canonical name on merge: the longer of the two after stripping
/// whitespace, ties going to the existing name.
fn select_best_name(new_name: &str, existing_name: &str) -> String {
    if existing_name.is_empty() {
        return new_name.to_string();
    }
    if new_name.is_empty() {
        return existing_name.to_string();
    }
    let new_len = new_name.chars().filter(|c| !c.is_whitespace()).count();
    let existing_len = existing_name.chars().filter(|c| !c.is_whitespace()).count();
    if new_len > existing_len {
        new_name.to_string()
    } else {
        existing_name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_adapter_in_memory::InMemoryStore;
    use engram_connector_openai::{LlmSettings, SettingsHandle, UsageLog};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn llm_client(base_url: &str) -> Arc<RotatingLlmClient> {
        let settings = LlmSettings {
            base_url: base_url.to_string(),
            api_key: "sk-test".to_string(),
            models: vec!["m1".to_string()],
            ..Default::default()
        };
        let handle =
            SettingsHandle::with_settings(std::env::temp_dir().join("unused.json"), settings);
        Arc::new(RotatingLlmClient::new(Arc::new(handle), UsageLog::disabled()).unwrap())
    }

    async fn mock_duplicate_answer(server: &MockServer, content: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": content}}]
            })))
            .mount(server)
            .await;
    }

    async fn store_with_entities(names: &[(&str, &str)]) -> (Arc<InMemoryStore>, GraphId) {
        let store = Arc::new(InMemoryStore::new());
        let graph_id = store
            .create_graph("proj1", "resolver test", &Ontology::default())
            .await
            .unwrap();
        let entities: Vec<Entity> = names
            .iter()
            .map(|(name, entity_type)| {
                Entity::new("proj1", graph_id.clone(), *name, *entity_type)
            })
            .collect();
        store.upsert_entities(&entities).await.unwrap();
        (store, graph_id)
    }

    #[tokio::test]
    async fn exact_match_wins_with_full_score() {
        let (store, graph_id) = store_with_entities(&[("Alice Smith", "Person")]).await;
        let resolver = EntityResolver::new(store);

        let resolved = resolver
            .resolve(&graph_id, "alice smith", "Person", "a summary", "")
            .await
            .unwrap();
        assert!(!resolved.is_new);
        assert_eq!(resolved.match_score, 1.0);
        assert!(resolved.should_update_summary);
        // Longer existing name is kept as canonical.
        assert_eq!(resolved.name, "Alice Smith");
    }

    #[tokio::test]
    async fn near_duplicate_matches_fuzzily() {
        let (store, graph_id) = store_with_entities(&[("Bluesky", "Product")]).await;
        let resolver = EntityResolver::new(store);

        let resolved = resolver
            .resolve(&graph_id, "Bluesky!", "Product", "", "")
            .await
            .unwrap();
        assert!(!resolved.is_new, "score {}", resolved.match_score);
        assert!(resolved.match_score >= FUZZY_MATCH_THRESHOLD);
        assert!(!resolved.should_update_summary);
    }

    #[tokio::test]
    async fn unrelated_name_is_new_with_diagnostic_score() {
        let (store, graph_id) = store_with_entities(&[("Bluesky app", "Product")]).await;
        let resolver = EntityResolver::new(store);

        let resolved = resolver
            .resolve(&graph_id, "Blue Origin", "Organization", "", "")
            .await
            .unwrap();
        assert!(resolved.is_new);
        assert!(resolved.match_score < FUZZY_MATCH_THRESHOLD);
        assert!(resolved.matched_uuid.is_none());
    }

    #[tokio::test]
    async fn short_names_are_rejected_outright() {
        let (store, graph_id) = store_with_entities(&[("X", "Product")]).await;
        let resolver = EntityResolver::new(store);

        let resolved = resolver.resolve(&graph_id, "X", "Product", "", "").await.unwrap();
        assert!(resolved.is_new);
        assert_eq!(resolved.match_score, 0.0);
        assert_eq!(resolved.uuid, stable_entity_uuid("", "Product", "X"));
    }

    #[tokio::test]
    async fn cache_returns_same_result_until_cleared() {
        let (store, graph_id) = store_with_entities(&[]).await;
        let resolver = EntityResolver::new(store.clone());

        let first = resolver
            .resolve(&graph_id, "Nova Labs", "Organization", "", "")
            .await
            .unwrap();
        assert!(first.is_new);

        // The store learns about the entity, but the cached answer stands
        // within the same batch.
        store
            .upsert_entities(&[Entity::new(
                "proj1",
                graph_id.clone(),
                "Nova Labs",
                "Organization",
            )])
            .await
            .unwrap();
        let cached = resolver
            .resolve(&graph_id, "Nova Labs", "Organization", "", "")
            .await
            .unwrap();
        assert!(cached.is_new);

        resolver.clear_cache();
        let fresh = resolver
            .resolve(&graph_id, "Nova Labs", "Organization", "", "")
            .await
            .unwrap();
        assert!(!fresh.is_new);
    }

    #[tokio::test]
    async fn find_existing_never_creates() {
        let (store, graph_id) = store_with_entities(&[("Alice", "Person")]).await;
        let resolver = EntityResolver::new(store);

        let hit = resolver
            .find_existing(&graph_id, "Alice", "Person")
            .await
            .unwrap();
        assert!(hit.is_some());

        let miss = resolver
            .find_existing(&graph_id, "Nobody Here", "Person")
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn mid_confidence_candidate_stays_new_without_llm() {
        let (store, graph_id) = store_with_entities(&[("Bluesky app", "Product")]).await;
        let resolver = EntityResolver::new(store);

        let resolved = resolver
            .resolve(&graph_id, "Bluesky", "Product", "", "")
            .await
            .unwrap();
        assert!(resolved.is_new);
        assert!(resolved.match_score > 0.5 && resolved.match_score < FUZZY_MATCH_THRESHOLD);
    }

    #[test]
    fn disambiguation_index_drops_out_of_range_answers() {
        assert_eq!(candidate_index(&json!({"duplicate_idx": 1}), 3), Some(1));
        assert_eq!(candidate_index(&json!({"duplicate_idx": -1}), 3), None);
        assert_eq!(candidate_index(&json!({"duplicate_idx": 3}), 3), None);
        assert_eq!(candidate_index(&json!({"duplicate_idx": "x"}), 3), None);
        assert_eq!(candidate_index(&json!({}), 3), None);
    }

    #[tokio::test]
    async fn llm_disambiguation_merges_mid_confidence_candidate() {
        let server = MockServer::start().await;
        mock_duplicate_answer(&server, "{\"duplicate_idx\": 0}").await;

        let (store, graph_id) = store_with_entities(&[("Bluesky app", "Product")]).await;
        let candidate_uuid = store
            .search_similar_entities(&graph_id, "Bluesky app", 1)
            .await
            .unwrap()[0]
            .uuid
            .clone();
        let resolver = EntityResolver::new(store)
            .with_disambiguator(LlmDisambiguator::new(llm_client(&server.uri())));

        // "Bluesky" vs "Bluesky app" scores inside the (0.5, 0.85) band, so
        // the LLM gets the final word.
        let resolved = resolver
            .resolve(&graph_id, "Bluesky", "Product", "", "Alice posted about Bluesky")
            .await
            .unwrap();
        assert!(!resolved.is_new);
        assert_eq!(resolved.matched_uuid.as_deref(), Some(candidate_uuid.as_str()));
        assert_eq!(resolved.name, "Bluesky app");
        assert!(resolved.match_score < FUZZY_MATCH_THRESHOLD);
    }

    #[tokio::test]
    async fn llm_no_match_answer_keeps_the_entity_new() {
        let server = MockServer::start().await;
        mock_duplicate_answer(&server, "{\"duplicate_idx\": -1}").await;

        let (store, graph_id) = store_with_entities(&[("Bluesky app", "Product")]).await;
        let resolver = EntityResolver::new(store)
            .with_disambiguator(LlmDisambiguator::new(llm_client(&server.uri())));

        let resolved = resolver
            .resolve(&graph_id, "Bluesky", "Product", "", "")
            .await
            .unwrap();
        assert!(resolved.is_new);
        assert!(resolved.matched_uuid.is_none());
    }

    #[tokio::test]
    async fn llm_failure_falls_back_to_the_deterministic_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "invalid api key"}
            })))
            .mount(&server)
            .await;

        let (store, graph_id) = store_with_entities(&[("Bluesky app", "Product")]).await;
        let resolver = EntityResolver::new(store)
            .with_disambiguator(LlmDisambiguator::new(llm_client(&server.uri())));

        let resolved = resolver
            .resolve(&graph_id, "Bluesky", "Product", "", "")
            .await
            .unwrap();
        assert!(resolved.is_new);
        assert!(resolved.match_score > 0.5 && resolved.match_score < FUZZY_MATCH_THRESHOLD);
    }

    #[test]
    fn best_name_prefers_longer() {
        assert_eq!(select_best_name("Alice", "Alice Smith"), "Alice Smith");
        assert_eq!(select_best_name("Alice Johnson", "Alice"), "Alice Johnson");
        // Ties go to the existing name.
        assert_eq!(select_best_name("alice", "Alice"), "Alice");
    }
}
