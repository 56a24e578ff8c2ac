//! Contradiction detection between a new edge and the existing edges of the
//! same entity pair. Contradicted edges are soft-deleted by the updater via
//! `invalidate_edge`.

use async_trait::async_trait;
use engram_core::prelude::*;
use engram_connector_openai::{ChatMessage, ChatOptions, RotatingLlmClient, Stage};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Relations mutually exclusive with the given one. Comparison is
/// case-insensitive; callers pass the uppercased label.
fn contradicting_relations(relation: &str) -> &'static [&'static str] {
    match relation {
        // Sentiment
        "LIKES" => &["DISLIKES", "HATES", "OPPOSES"],
        "DISLIKES" => &["LIKES", "LOVES", "SUPPORTS"],
        "LOVES" => &["HATES", "DISLIKES"],
        "HATES" => &["LOVES", "LIKES"],
        // Stance
        "SUPPORTS" => &["OPPOSES", "AGAINST", "REJECTS", "CRITICIZES"],
        "OPPOSES" => &["SUPPORTS", "FOR", "ENDORSES", "ADVOCATES"],
        "TRUSTS" => &["DISTRUSTS", "MISTRUSTS"],
        "DISTRUSTS" => &["TRUSTS"],
        "ENDORSES" => &["OPPOSES", "REJECTS", "CRITICIZES"],
        "REJECTS" => &["ACCEPTS", "ENDORSES", "SUPPORTS"],
        "ACCEPTS" => &["REJECTS", "REFUSES"],
        "REFUSES" => &["ACCEPTS", "AGREES_TO"],
        // Opinion
        "AGREES_WITH" => &["DISAGREES_WITH", "OPPOSES"],
        "DISAGREES_WITH" => &["AGREES_WITH", "SUPPORTS"],
        "CRITICIZES" => &["PRAISES", "SUPPORTS", "ENDORSES"],
        "PRAISES" => &["CRITICIZES", "OPPOSES"],
        // Social
        "FOLLOWS" => &["UNFOLLOWS", "BLOCKS"],
        "UNFOLLOWS" => &["FOLLOWS"],
        "BLOCKS" => &["FOLLOWS", "UNBLOCKS"],
        "UNBLOCKS" => &["BLOCKS"],
        // Membership and employment
        "JOINED" => &["LEFT", "QUIT", "RESIGNED_FROM"],
        "LEFT" => &["JOINED", "REJOINED"],
        "QUIT" => &["JOINED", "REJOINED"],
        "RESIGNED_FROM" => &["JOINED", "HIRED_BY"],
        "HIRED_BY" => &["FIRED_FROM", "RESIGNED_FROM", "LEFT"],
        "FIRED_FROM" => &["HIRED_BY", "WORKS_FOR"],
        // Ownership and investment
        "OWNS" => &["SOLD", "DIVESTED", "LOST"],
        "SOLD" => &["OWNS", "ACQUIRED", "BOUGHT"],
        "ACQUIRED" => &["SOLD", "DIVESTED"],
        "DIVESTED" => &["ACQUIRED", "OWNS", "INVESTED_IN"],
        "INVESTED_IN" => &["DIVESTED_FROM", "WITHDREW_FROM"],
        "DIVESTED_FROM" => &["INVESTED_IN", "INVESTS_IN"],
        "WITHDREW_FROM" => &["INVESTED_IN", "INVESTS_IN"],
        "INVESTS_IN" => &["DIVESTED_FROM", "WITHDREW_FROM"],
        // Cooperation and competition
        "COLLABORATES_WITH" => &["COMPETES_WITH", "CONFLICTS_WITH"],
        "COMPETES_WITH" => &["COLLABORATES_WITH", "PARTNERS_WITH"],
        "PARTNERS_WITH" => &["COMPETES_WITH", "BREAKS_WITH"],
        "WORKS_WITH" => &["CONFLICTS_WITH", "OPPOSES"],
        "CONFLICTS_WITH" => &["COLLABORATES_WITH", "WORKS_WITH"],
        // State transitions
        "STARTED" => &["STOPPED", "ENDED", "CANCELLED"],
        "STOPPED" => &["STARTED", "RESUMED", "CONTINUED"],
        "ENDED" => &["STARTED", "BEGAN"],
        "BEGAN" => &["ENDED", "STOPPED"],
        "CANCELLED" => &["CONFIRMED", "APPROVED"],
        "CONFIRMED" => &["CANCELLED", "DENIED"],
        "APPROVED" => &["REJECTED", "DENIED", "CANCELLED"],
        "DENIED" => &["APPROVED", "CONFIRMED"],
        _ => &[],
    }
}

/// Paired positive/negative lexicons for detecting contradictions inside the
/// same relation type by substring presence in the facts. A fact containing
/// a word from one side contradicts a fact containing a word from the other.
const SEMANTIC_CONTRADICTION_PAIRS: &[(&[&str], &[&str])] = &[
    (
        &["支持", "赞成", "同意", "support", "supports", "favor", "approve", "endorse"],
        &["反对", "不赞成", "不同意", "oppose", "opposes", "against", "reject", "disapprove"],
    ),
    (
        &["喜欢", "喜爱", "爱", "like", "likes", "love", "loves", "enjoy"],
        &["讨厌", "厌恶", "恨", "hate", "hates", "dislike", "dislikes", "detest"],
    ),
    (
        &["信任", "相信", "trust", "trusts", "believe", "believes"],
        &["不信任", "怀疑", "distrust", "distrusts", "doubt", "doubts", "mistrust"],
    ),
    (
        &["合作", "协作", "collaborate", "collaborates", "cooperate", "partner"],
        &["竞争", "对抗", "compete", "competes", "rival", "conflict"],
    ),
    (
        &["接受", "同意", "accept", "accepts", "agree", "agrees"],
        &["拒绝", "否决", "reject", "rejects", "refuse", "refuses", "decline"],
    ),
    (
        &["加入", "join", "joins", "joined", "enter", "entered"],
        &["退出", "离开", "leave", "leaves", "left", "quit", "quits", "exit"],
    ),
    (
        &["买", "购买", "收购", "buy", "buys", "bought", "acquire", "acquires", "acquired"],
        &["卖", "出售", "sell", "sells", "sold", "divest", "divests"],
    ),
    (
        &["开始", "启动", "start", "starts", "started", "begin", "begins", "began", "launch"],
        &["结束", "停止", "stop", "stops", "stopped", "end", "ends", "ended", "terminate"],
    ),
];

/// Rule-based contradiction detector. Fast, deterministic, no LLM calls;
/// suited to high-frequency ingestion and as the first stage of the hybrid
/// detector.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedEdgeInvalidator;

impl RuleBasedEdgeInvalidator {
    pub fn new() -> Self {
        Self
    }

    /// Detection strategy, per existing edge with the same endpoint names:
    /// 1. relation-pair mutual exclusion;
    /// 2. same relation type but facts carrying paired opposite lexemes.
    pub fn detect(&self, new_edge: &EdgeFact, existing_edges: &[EdgeFact]) -> Vec<String> {
        if existing_edges.is_empty() {
            return Vec::new();
        }

        let new_source = new_edge.source_name.to_lowercase();
        let new_target = new_edge.target_name.to_lowercase();
        let new_relation = new_edge.relation_name.to_uppercase();
        let new_fact = new_edge.fact.to_lowercase();
        let contradicting = contradicting_relations(&new_relation);

        let mut contradicted = Vec::new();
        for edge in existing_edges {
            if edge.uuid.is_empty() {
                continue;
            }
            if edge.source_name.to_lowercase() != new_source
                || edge.target_name.to_lowercase() != new_target
            {
                continue;
            }

            let edge_relation = edge.relation_name.to_uppercase();
            if contradicting.contains(&edge_relation.as_str()) {
                contradicted.push(edge.uuid.clone());
                continue;
            }

            if edge_relation == new_relation && !new_fact.is_empty() {
                let edge_fact = edge.fact.to_lowercase();
                if !edge_fact.is_empty() && facts_semantically_contradict(&edge_fact, &new_fact) {
                    contradicted.push(edge.uuid.clone());
                }
            }
        }
        contradicted
    }
}

fn facts_semantically_contradict(old_fact: &str, new_fact: &str) -> bool {
    for (positive, negative) in SEMANTIC_CONTRADICTION_PAIRS {
        let old_positive = positive.iter().any(|w| old_fact.contains(w));
        let new_negative = negative.iter().any(|w| new_fact.contains(w));
        if old_positive && new_negative {
            return true;
        }
        let old_negative = negative.iter().any(|w| old_fact.contains(w));
        let new_positive = positive.iter().any(|w| new_fact.contains(w));
        if old_negative && new_positive {
            return true;
        }
    }
    false
}

#[async_trait]
impl ContradictionDetector for RuleBasedEdgeInvalidator {
    async fn detect_contradictions(
        &self,
        new_edge: &EdgeFact,
        existing_edges: &[EdgeFact],
    ) -> Vec<String> {
        self.detect(new_edge, existing_edges)
    }
}

/// LLM-based contradiction detector for cases the rule tables cannot see.
/// Failures are logged and yield no invalidation.
pub struct LlmEdgeInvalidator {
    client: Arc<RotatingLlmClient>,
}

impl LlmEdgeInvalidator {
    pub fn new(client: Arc<RotatingLlmClient>) -> Self {
        Self { client }
    }

    fn format_edge(edge: &EdgeFact, idx: Option<usize>) -> String {
        let head = match idx {
            Some(idx) => format!("[{}] ", idx),
            None => String::new(),
        };
        if edge.fact.is_empty() {
            format!(
                "{}{} --{}--> {}",
                head, edge.source_name, edge.relation_name, edge.target_name
            )
        } else {
            format!(
                "{}{} --{}--> {}: {}",
                head, edge.source_name, edge.relation_name, edge.target_name, edge.fact
            )
        }
    }

    fn build_prompt(new_edge: &EdgeFact, existing_edges: &[EdgeFact]) -> String {
        let existing_text = existing_edges
            .iter()
            .enumerate()
            .map(|(i, edge)| Self::format_edge(edge, Some(i + 1)))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Given the existing facts and a new fact, decide which existing \
             facts the new fact contradicts.\n\n\
             A contradiction means, for the same pair of entities:\n\
             - the relation semantics are opposite (e.g. likes vs hates), or\n\
             - the fact descriptions conflict (e.g. supports X vs opposes X), or\n\
             - a state has flipped (e.g. followed vs unfollowed).\n\n\
             Not a contradiction:\n\
             - the new fact refines or adds detail to an existing one\n\
             - the facts describe different aspects\n\n\
             <existing facts>\n{}\n</existing facts>\n\n\
             <new fact>\n{}\n</new fact>\n\n\
             Return a JSON object with a single field `contradicted_ids`: an \
             array of the numeric ids of contradicted existing facts, or [] \
             when there is no contradiction. Example: {{\"contradicted_ids\": [1, 3]}}",
            existing_text,
            Self::format_edge(new_edge, None)
        )
    }
}

#[async_trait]
impl ContradictionDetector for LlmEdgeInvalidator {
    async fn detect_contradictions(
        &self,
        new_edge: &EdgeFact,
        existing_edges: &[EdgeFact],
    ) -> Vec<String> {
        if existing_edges.is_empty() {
            return Vec::new();
        }

        let messages = [
            ChatMessage::system("You are an assistant that judges whether facts contradict."),
            ChatMessage::user(Self::build_prompt(new_edge, existing_edges)),
        ];

        let value = match self
            .client
            .chat_json(&messages, &ChatOptions::json(Stage::JsonStructure))
            .await
        {
            Ok(value) => value,
            Err(e) => {
                warn!("LLM contradiction detection failed: {}", e);
                return Vec::new();
            }
        };

        let ids = value
            .get("contradicted_ids")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        // Ids are 1-indexed into the formatted list; out-of-range drops.
        let contradicted: Vec<String> = ids
            .iter()
            .filter_map(|v| v.as_i64())
            .filter(|&idx| idx >= 1 && (idx as usize) <= existing_edges.len())
            .map(|idx| existing_edges[idx as usize - 1].uuid.clone())
            .filter(|uuid| !uuid.is_empty())
            .collect();

        if !contradicted.is_empty() {
            info!("LLM flagged {} contradicted edges", contradicted.len());
        }
        contradicted
    }
}

/// Rules first, LLM as fallback: when the rule tables already found a
/// contradiction the LLM is skipped; `use_llm=false` short-circuits to rules
/// only.
pub struct HybridEdgeInvalidator {
    rules: RuleBasedEdgeInvalidator,
    llm: LlmEdgeInvalidator,
    use_llm: bool,
}

impl HybridEdgeInvalidator {
    pub fn new(client: Arc<RotatingLlmClient>, use_llm: bool) -> Self {
        Self {
            rules: RuleBasedEdgeInvalidator::new(),
            llm: LlmEdgeInvalidator::new(client),
            use_llm,
        }
    }
}

#[async_trait]
impl ContradictionDetector for HybridEdgeInvalidator {
    async fn detect_contradictions(
        &self,
        new_edge: &EdgeFact,
        existing_edges: &[EdgeFact],
    ) -> Vec<String> {
        let rule_result = self.rules.detect(new_edge, existing_edges);
        if !self.use_llm || !rule_result.is_empty() {
            if !rule_result.is_empty() {
                debug!("Rule tables found {} contradictions", rule_result.len());
            }
            return rule_result;
        }
        self.llm.detect_contradictions(new_edge, existing_edges).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(uuid: &str, relation: &str, fact: &str) -> EdgeFact {
        EdgeFact::new(uuid, "Alice", "Bluesky", relation, fact)
    }

    #[test]
    fn mutually_exclusive_relations_contradict() {
        let detector = RuleBasedEdgeInvalidator::new();
        let new_edge = edge("", "DISLIKES", "Alice now dislikes Bluesky");
        let existing = vec![edge("rel_1", "LIKES", "Alice likes Bluesky")];
        assert_eq!(detector.detect(&new_edge, &existing), vec!["rel_1"]);
    }

    #[test]
    fn relation_comparison_is_case_insensitive() {
        let detector = RuleBasedEdgeInvalidator::new();
        let new_edge = EdgeFact::new("", "alice", "bluesky", "unfollows", "");
        let existing = vec![EdgeFact::new("rel_1", "Alice", "Bluesky", "Follows", "")];
        assert_eq!(detector.detect(&new_edge, &existing), vec!["rel_1"]);
    }

    #[test]
    fn different_entity_pair_is_kept() {
        let detector = RuleBasedEdgeInvalidator::new();
        let new_edge = edge("", "DISLIKES", "");
        let existing = vec![EdgeFact::new("rel_1", "Bob", "Bluesky", "LIKES", "")];
        assert!(detector.detect(&new_edge, &existing).is_empty());
    }

    #[test]
    fn same_relation_with_opposed_facts_contradicts() {
        let detector = RuleBasedEdgeInvalidator::new();
        let new_edge = edge("", "DISCUSSES", "Alice opposes the new policy");
        let existing = vec![edge("rel_1", "DISCUSSES", "Alice supports the new policy")];
        assert_eq!(detector.detect(&new_edge, &existing), vec!["rel_1"]);
    }

    #[test]
    fn bilingual_lexicons_are_checked() {
        let detector = RuleBasedEdgeInvalidator::new();
        let new_edge = edge("", "DISCUSSES", "Alice 反对这个提案");
        let existing = vec![edge("rel_1", "DISCUSSES", "Alice 支持这个提案")];
        assert_eq!(detector.detect(&new_edge, &existing), vec!["rel_1"]);
    }

    #[test]
    fn unrelated_facts_are_kept() {
        let detector = RuleBasedEdgeInvalidator::new();
        let new_edge = edge("", "DISCUSSES", "Alice mentioned the release schedule");
        let existing = vec![edge("rel_1", "DISCUSSES", "Alice asked about pricing")];
        assert!(detector.detect(&new_edge, &existing).is_empty());
    }

    #[test]
    fn empty_facts_never_semantically_contradict() {
        let detector = RuleBasedEdgeInvalidator::new();
        let new_edge = edge("", "DISCUSSES", "");
        let existing = vec![edge("rel_1", "DISCUSSES", "Alice supports the plan")];
        assert!(detector.detect(&new_edge, &existing).is_empty());
    }

    #[test]
    fn multiple_existing_edges_checked_independently() {
        let detector = RuleBasedEdgeInvalidator::new();
        let new_edge = edge("", "DISLIKES", "Alice hates the redesign");
        let existing = vec![
            edge("rel_1", "LIKES", "Alice likes Bluesky"),
            edge("rel_2", "DISCUSSES", "Alice discusses Bluesky"),
            edge("rel_3", "LOVES", "Alice loves the app"),
        ];
        assert_eq!(detector.detect(&new_edge, &existing), vec!["rel_1", "rel_3"]);
    }

    #[test]
    fn employment_transitions_contradict() {
        let detector = RuleBasedEdgeInvalidator::new();
        let new_edge = EdgeFact::new("", "Alice", "Acme", "FIRED_FROM", "");
        let existing = vec![EdgeFact::new("rel_1", "Alice", "Acme", "HIRED_BY", "")];
        assert_eq!(detector.detect(&new_edge, &existing), vec!["rel_1"]);
    }
}
