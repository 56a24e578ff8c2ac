//! Per-graph memory updater: ingests agent activities, batches them per
//! platform, and drives extraction, entity resolution, contradiction
//! detection and persistence from a single worker task.

use crate::invalidator::RuleBasedEdgeInvalidator;
use crate::resolver::{EntityResolver, LlmDisambiguator};
use chrono::{DateTime, Utc};
use engram_connector_openai::RotatingLlmClient;
use engram_core::prelude::*;
use engram_core::similarity::{normalize, sequence_ratio};
use engram_core::types::random_hex16;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

/// Activities per platform batch
pub const BATCH_SIZE: usize = 5;
/// Pause between processed batches, pacing LLM load
pub const PROCESS_INTERVAL: Duration = Duration::from_millis(500);
/// Attempts per batch
pub const MAX_RETRIES: u32 = 3;
/// Base retry backoff, multiplied by the attempt number
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

const QUEUE_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Relation-name similarity floor for the duplicate-fact guard
const DUPLICATE_RELATION_SIMILARITY: f64 = 0.8;
/// Fact similarity threshold for the duplicate-fact guard
const DUPLICATE_FACT_THRESHOLD: f64 = 0.75;

/// Snapshot of an updater's counters and buffers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdaterStats {
    pub graph_id: String,
    pub batch_size: usize,
    pub total_activities: u64,
    pub processed: u64,
    pub entities_extracted: u64,
    pub relations_extracted: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub queue_size: usize,
    pub buffer_sizes: BTreeMap<String, usize>,
    pub running: bool,
}

#[derive(Default)]
struct Counters {
    total_activities: u64,
    processed: u64,
    entities: u64,
    relations: u64,
    failed: u64,
    skipped: u64,
    queue_depth: usize,
    buffer_sizes: BTreeMap<String, usize>,
}

/// Everything the worker task needs, shared with the updater handle.
struct Pipeline {
    graph_id: GraphId,
    project_id: String,
    ontology: Ontology,
    store: Arc<dyn GraphStore>,
    extractor: Arc<dyn KnowledgeExtractor>,
    resolver: EntityResolver,
    invalidator: RuleBasedEdgeInvalidator,
    counters: Mutex<Counters>,
    running: AtomicBool,
    stopped: AtomicBool,
}

/// Per-graph graph memory updater.
///
/// One worker task consumes the inbox; platform buffers are private to the
/// worker. Producers may call [`add_activity`](Self::add_activity) from any
/// thread. A stopped updater cannot restart; the registry replaces it.
pub struct GraphMemoryUpdater {
    pipeline: Arc<Pipeline>,
    inbox: Mutex<Option<mpsc::UnboundedSender<Activity>>>,
    worker: AsyncMutex<Option<JoinHandle<()>>>,
}

impl GraphMemoryUpdater {
    /// Build an updater for the graph, loading its ontology and project id
    /// from the store (falling back to defaults when the meta is missing).
    ///
    /// When an LLM client is supplied the entity resolver escalates
    /// mid-confidence candidates to LLM disambiguation; without one it stays
    /// deterministic-only.
    pub async fn new(
        graph_id: GraphId,
        store: Arc<dyn GraphStore>,
        extractor: Arc<dyn KnowledgeExtractor>,
        llm_client: Option<Arc<RotatingLlmClient>>,
    ) -> Self {
        let (project_id, ontology) = match store.load_graph_meta(&graph_id).await {
            Ok(Some(meta)) => (meta.project_id, meta.ontology),
            Ok(None) => {
                debug!("Graph {} has no meta; using the default ontology", graph_id);
                ("default".to_string(), Ontology::default())
            }
            Err(e) => {
                warn!("Failed to load meta for graph {}: {}", graph_id, e);
                ("default".to_string(), Ontology::default())
            }
        };

        let mut resolver = EntityResolver::new(store.clone());
        if let Some(client) = llm_client {
            resolver = resolver.with_disambiguator(LlmDisambiguator::new(client));
        }
        let mut buffer_sizes = BTreeMap::new();
        buffer_sizes.insert("twitter".to_string(), 0);
        buffer_sizes.insert("reddit".to_string(), 0);

        let pipeline = Arc::new(Pipeline {
            graph_id: graph_id.clone(),
            project_id,
            ontology,
            store,
            extractor,
            resolver,
            invalidator: RuleBasedEdgeInvalidator::new(),
            counters: Mutex::new(Counters {
                buffer_sizes,
                ..Default::default()
            }),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });

        info!(
            "Graph memory updater ready: graph_id={}, batch_size={}",
            graph_id, BATCH_SIZE
        );
        Self {
            pipeline,
            inbox: Mutex::new(None),
            worker: AsyncMutex::new(None),
        }
    }

    pub fn graph_id(&self) -> &GraphId {
        &self.pipeline.graph_id
    }

    /// Spawn the worker task. Idempotent; a no-op once the updater has been
    /// stopped.
    pub async fn start(&self) {
        if self.pipeline.stopped.load(Ordering::SeqCst) {
            warn!("Updater for graph {} is stopped and cannot restart", self.pipeline.graph_id);
            return;
        }
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbox.lock().expect("inbox lock poisoned") = Some(tx);
        self.pipeline.running.store(true, Ordering::SeqCst);

        let pipeline = self.pipeline.clone();
        *worker = Some(tokio::spawn(async move {
            pipeline.worker_loop(rx).await;
        }));
        info!("Graph memory updater started: graph_id={}", self.pipeline.graph_id);
    }

    /// Enqueue one activity. `DO_NOTHING` actions are counted as skipped and
    /// dropped before the queue.
    pub fn add_activity(&self, activity: Activity) {
        if activity.action_type == "DO_NOTHING" {
            self.pipeline.counters.lock().expect("counters poisoned").skipped += 1;
            return;
        }

        let sent = {
            let inbox = self.inbox.lock().expect("inbox lock poisoned");
            match inbox.as_ref() {
                Some(tx) => tx.send(activity).is_ok(),
                None => false,
            }
        };
        if sent {
            let mut counters = self.pipeline.counters.lock().expect("counters poisoned");
            counters.total_activities += 1;
            counters.queue_depth += 1;
        } else {
            debug!(
                "Updater for graph {} is not accepting activities",
                self.pipeline.graph_id
            );
        }
    }

    /// Build an activity from a raw record and enqueue it. Records carrying
    /// an `event_type` marker are meta-events and are ignored.
    pub fn add_activity_from_dict(&self, data: &serde_json::Value, platform: &str) {
        if let Some(activity) = Activity::from_value(data, platform) {
            self.add_activity(activity);
        }
    }

    /// Stop the updater: close the inbox, let the worker drain the queue and
    /// flush partial buffers, then join it with a timeout.
    pub async fn stop(&self) {
        self.pipeline.stopped.store(true, Ordering::SeqCst);
        let sender = self.inbox.lock().expect("inbox lock poisoned").take();
        drop(sender);

        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!(
                    "Worker for graph {} did not stop within {:?}; detaching",
                    self.pipeline.graph_id, STOP_JOIN_TIMEOUT
                );
            }
        }

        let stats = self.get_stats();
        info!(
            "Graph memory updater stopped: graph_id={}, total_activities={}, processed={}, \
             entities={}, relations={}, failed={}, skipped={}",
            stats.graph_id,
            stats.total_activities,
            stats.processed,
            stats.entities_extracted,
            stats.relations_extracted,
            stats.failed_count,
            stats.skipped_count
        );
    }

    /// Snapshot of counters, buffer sizes, queue depth and the running flag.
    pub fn get_stats(&self) -> UpdaterStats {
        let counters = self.pipeline.counters.lock().expect("counters poisoned");
        UpdaterStats {
            graph_id: self.pipeline.graph_id.as_str().to_string(),
            batch_size: BATCH_SIZE,
            total_activities: counters.total_activities,
            processed: counters.processed,
            entities_extracted: counters.entities,
            relations_extracted: counters.relations,
            failed_count: counters.failed,
            skipped_count: counters.skipped,
            queue_size: counters.queue_depth,
            buffer_sizes: counters.buffer_sizes.clone(),
            running: self.pipeline.running.load(Ordering::SeqCst),
        }
    }
}

impl Pipeline {
    /// Worker loop: pull activities into per-platform buffers, process full
    /// batches as they form, and on inbox close drain then flush.
    async fn worker_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Activity>) {
        let mut buffers: HashMap<String, Vec<Activity>> = HashMap::new();
        buffers.insert("twitter".to_string(), Vec::new());
        buffers.insert("reddit".to_string(), Vec::new());

        loop {
            match timeout(QUEUE_POLL_TIMEOUT, rx.recv()).await {
                Ok(Some(activity)) => {
                    {
                        let mut counters = self.counters.lock().expect("counters poisoned");
                        counters.queue_depth = counters.queue_depth.saturating_sub(1);
                    }
                    let platform = activity.platform.to_lowercase();
                    let buffer = buffers.entry(platform.clone()).or_default();
                    buffer.push(activity);

                    if buffer.len() >= BATCH_SIZE {
                        let batch: Vec<Activity> = buffer.drain(..BATCH_SIZE).collect();
                        self.publish_buffer_sizes(&buffers);
                        self.process_batch(&batch, &platform).await;
                        sleep(PROCESS_INTERVAL).await;
                    } else {
                        self.publish_buffer_sizes(&buffers);
                    }
                }
                // Inbox closed and fully drained: leave the loop and flush.
                Ok(None) => break,
                // Poll timeout; buffers below BATCH_SIZE keep waiting.
                Err(_) => continue,
            }
        }

        for (platform, buffer) in buffers.iter_mut() {
            if buffer.is_empty() {
                continue;
            }
            let batch: Vec<Activity> = std::mem::take(buffer);
            info!(
                "Flushing {} remaining {} activities for graph {}",
                batch.len(),
                platform,
                self.graph_id
            );
            self.process_batch(&batch, platform).await;
        }
        self.publish_buffer_sizes(&buffers);
        self.running.store(false, Ordering::SeqCst);
    }

    fn publish_buffer_sizes(&self, buffers: &HashMap<String, Vec<Activity>>) {
        let mut counters = self.counters.lock().expect("counters poisoned");
        counters.buffer_sizes = buffers
            .iter()
            .map(|(platform, buffer)| (platform.clone(), buffer.len()))
            .collect();
    }

    /// Process one batch with bounded retries. A batch that exhausts its
    /// attempts is counted as failed and not re-enqueued; the worker keeps
    /// going.
    async fn process_batch(&self, activities: &[Activity], platform: &str) {
        if activities.is_empty() {
            return;
        }

        let combined_text = activities
            .iter()
            .map(Activity::episode_text)
            .collect::<Vec<_>>()
            .join("\n");
        let episode_id = format!("ep_{}", random_hex16());
        let timestamp = Utc::now();

        for attempt in 1..=MAX_RETRIES {
            match self
                .process_once(&combined_text, &episode_id, timestamp, activities.len(), platform)
                .await
            {
                Ok(()) => return,
                Err(e) if attempt < MAX_RETRIES => {
                    warn!(
                        "Batch processing failed (attempt {}/{}): {}",
                        attempt, MAX_RETRIES, e
                    );
                    sleep(RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    error!(
                        "Batch processing failed after {} attempts: {}",
                        MAX_RETRIES, e
                    );
                    self.counters.lock().expect("counters poisoned").failed += 1;
                }
            }
        }
    }

    async fn process_once(
        &self,
        combined_text: &str,
        episode_id: &str,
        timestamp: DateTime<Utc>,
        activity_count: usize,
        platform: &str,
    ) -> Result<(), MemoryError> {
        let outcome = self.extractor.extract(combined_text, &self.ontology).await?;

        if outcome.is_empty() {
            debug!("Batch produced no entities or relations; skipping");
            self.counters.lock().expect("counters poisoned").processed += activity_count as u64;
            return Ok(());
        }

        let entity_map = self
            .process_entities(&outcome.entities, combined_text, timestamp)
            .await?;
        self.process_relations(&outcome.relations, &entity_map, episode_id, timestamp)
            .await?;

        {
            let mut counters = self.counters.lock().expect("counters poisoned");
            counters.processed += activity_count as u64;
            counters.entities += outcome.entities.len() as u64;
            counters.relations += outcome.relations.len() as u64;
        }
        info!(
            "Processed {} {} activities into graph {} (entities={}, relations={})",
            activity_count,
            platform,
            self.graph_id,
            outcome.entities.len(),
            outcome.relations.len()
        );
        Ok(())
    }

    /// Resolve each extracted entity, upsert the new ones, apply summary and
    /// type updates to the matched ones, and return the `name:type -> uuid`
    /// map used by relation processing.
    async fn process_entities(
        &self,
        entities: &[ExtractedEntity],
        context: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<HashMap<String, String>, MemoryError> {
        self.resolver.clear_cache();

        let mut entity_map: HashMap<String, String> = HashMap::new();
        let mut new_entities: Vec<Entity> = Vec::new();
        // (uuid, replacement summary, types to append)
        let mut updates: Vec<(String, Option<String>, Vec<String>)> = Vec::new();

        for extracted in entities {
            let name = extracted.name.trim();
            if name.is_empty() {
                continue;
            }
            let entity_type = {
                let t = extracted.entity_type.trim();
                if t.is_empty() {
                    "Entity"
                } else {
                    t
                }
            };

            let resolved = self
                .resolver
                .resolve(&self.graph_id, name, entity_type, &extracted.summary, context)
                .await?;
            let key = format!("{}:{}", name, entity_type);

            if resolved.is_new {
                let mut entity = Entity::new(
                    self.project_id.clone(),
                    self.graph_id.clone(),
                    resolved.name.clone(),
                    entity_type,
                )
                .with_summary(extracted.summary.clone())
                .with_source_types(vec![entity_type.to_string()]);
                if let Some(attributes) = &extracted.attributes {
                    entity.attributes = attributes.clone();
                }
                entity.created_at = timestamp;

                debug!("Creating entity '{}' (type={})", name, entity_type);
                entity_map.insert(key, entity.uuid.clone());
                new_entities.push(entity);
            } else {
                let matched = resolved
                    .matched_uuid
                    .clone()
                    .unwrap_or_else(|| resolved.uuid.clone());
                debug!(
                    "Reusing entity '{}' -> {} (score={:.2})",
                    name, matched, resolved.match_score
                );
                entity_map.insert(key, matched.clone());

                if resolved.should_update_summary && !extracted.summary.is_empty() {
                    updates.push((
                        matched,
                        Some(extracted.summary.clone()),
                        vec![entity_type.to_string()],
                    ));
                } else {
                    updates.push((matched, None, vec![entity_type.to_string()]));
                }
            }
        }

        if !new_entities.is_empty() {
            self.store.upsert_entities(&new_entities).await?;
        }
        for (uuid, summary, types) in updates {
            if let Err(e) = self
                .store
                .update_entity_summary(&uuid, summary.as_deref(), &types)
                .await
            {
                warn!("Failed to update entity summary for {}: {}", uuid, e);
            }
        }

        Ok(entity_map)
    }

    /// For each extracted relation: resolve endpoints, drop duplicates of
    /// active facts, invalidate contradicted edges, then insert the new
    /// fact.
    async fn process_relations(
        &self,
        relations: &[ExtractedRelation],
        entity_map: &HashMap<String, String>,
        episode_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), MemoryError> {
        let mut new_relations: Vec<Relation> = Vec::new();

        for extracted in relations {
            let source_name = extracted.source.trim();
            let target_name = extracted.target.trim();
            let relation_name = extracted.relation.trim();
            if source_name.is_empty() || target_name.is_empty() || relation_name.is_empty() {
                continue;
            }
            let fact = extracted.fact.trim();
            let source_type = non_empty_or(&extracted.source_type, "Entity");
            let target_type = non_empty_or(&extracted.target_type, "Entity");

            let source_uuid = match self
                .endpoint_uuid(entity_map, source_name, source_type)
                .await?
            {
                Some(uuid) => uuid,
                None => {
                    debug!(
                        "Skipping relation; unresolved source '{}' -> '{}'",
                        source_name, target_name
                    );
                    continue;
                }
            };
            let target_uuid = match self
                .endpoint_uuid(entity_map, target_name, target_type)
                .await?
            {
                Some(uuid) => uuid,
                None => {
                    debug!(
                        "Skipping relation; unresolved target '{}' -> '{}'",
                        source_name, target_name
                    );
                    continue;
                }
            };

            let existing = self
                .store
                .get_edges_between_entities(&self.graph_id, &source_uuid, &target_uuid, false)
                .await?;

            if !existing.is_empty() {
                if is_duplicate_fact(&existing, relation_name, fact) {
                    debug!("Skipping duplicate fact: {}", relation_name);
                    continue;
                }
                self.invalidate_contradicted(
                    &existing,
                    &source_uuid,
                    &target_uuid,
                    relation_name,
                    fact,
                    timestamp,
                )
                .await;
            }

            let mut relation = Relation::new(
                self.project_id.clone(),
                self.graph_id.clone(),
                source_uuid,
                target_uuid,
                relation_name,
                timestamp,
            )
            .with_fact(fact)
            .with_episodes(vec![episode_id.to_string()]);
            if let Some(attributes) = &extracted.attributes {
                relation.attributes = attributes.clone();
            }
            relation.created_at = timestamp;
            new_relations.push(relation);
        }

        if !new_relations.is_empty() {
            self.store.upsert_relations(&new_relations).await?;
        }
        Ok(())
    }

    /// Endpoint lookup: the batch map first, then the resolver against
    /// existing nodes only (never creating).
    async fn endpoint_uuid(
        &self,
        entity_map: &HashMap<String, String>,
        name: &str,
        entity_type: &str,
    ) -> Result<Option<String>, MemoryError> {
        let key = format!("{}:{}", name, entity_type);
        if let Some(uuid) = entity_map.get(&key) {
            return Ok(Some(uuid.clone()));
        }
        Ok(self
            .resolver
            .find_existing(&self.graph_id, name, entity_type)
            .await?)
    }

    /// Run rule-based contradiction detection against the fetched edges and
    /// invalidate the contradicted ones. Detection problems never fail the
    /// batch.
    async fn invalidate_contradicted(
        &self,
        existing: &[Relation],
        source_uuid: &str,
        target_uuid: &str,
        relation_name: &str,
        fact: &str,
        timestamp: DateTime<Utc>,
    ) {
        let source_name = match self.store.get_entity_by_uuid(source_uuid).await {
            Ok(Some(entity)) => entity.name,
            _ => String::new(),
        };
        let target_name = match self.store.get_entity_by_uuid(target_uuid).await {
            Ok(Some(entity)) => entity.name,
            _ => String::new(),
        };

        let new_edge = EdgeFact::new("", &source_name, &target_name, relation_name, fact);
        let existing_facts: Vec<EdgeFact> = existing
            .iter()
            .map(|r| EdgeFact::new(&r.uuid, &source_name, &target_name, &r.name, &r.fact))
            .collect();

        let contradicted = self.invalidator.detect(&new_edge, &existing_facts);
        for edge_uuid in contradicted {
            match self.store.invalidate_edge(&edge_uuid, timestamp).await {
                Ok(_) => info!(
                    "Invalidated contradicted edge {} (new relation: {})",
                    edge_uuid, relation_name
                ),
                Err(e) => warn!("Failed to invalidate edge {}: {}", edge_uuid, e),
            }
        }
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback
    } else {
        trimmed
    }
}

/// The new fact duplicates an active edge when the relation names are near
/// identical and the fact texts clear the duplicate threshold (a pair of
/// empty facts counts as duplicate).
fn is_duplicate_fact(existing: &[Relation], relation_name: &str, fact: &str) -> bool {
    let new_relation = normalize(relation_name);
    let new_fact = normalize(fact);

    for edge in existing {
        let relation_similarity = sequence_ratio(&new_relation, &normalize(&edge.name));
        if relation_similarity < DUPLICATE_RELATION_SIMILARITY {
            continue;
        }

        let existing_fact = normalize(&edge.fact);
        if new_fact.is_empty() && existing_fact.is_empty() {
            return true;
        }
        if sequence_ratio(&new_fact, &existing_fact) >= DUPLICATE_FACT_THRESHOLD {
            return true;
        }
    }
    false
}
