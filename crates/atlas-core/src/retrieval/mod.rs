//! Retrieval & assembly - intent-weighted traversal and working memory
//!
//! Pulls the pieces together: classify intent, select seeds, run one
//! traversal per intent, merge with a multi-signal boost, decay-score, bound,
//! attach provenance, and ship the Atlas response. Access-count updates are
//! dispatched fire-and-forget so the response path never blocks on them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::config::{RetrievalConfig, ScoringConfig};
use crate::domain::{
    AtlasEdge, AtlasMeta, AtlasNode, AtlasResponse, Capacity, EdgeKind, Episode, NodeKind,
    NodeScores, Provenance, RetrievalReason,
};
use crate::embeddings::Embedder;
use crate::eventstore::EventStore;
use crate::graph::{
    GraphError, GraphStore, LineageDirection, StoredNode, TraversalOptions, TraversedNode,
};
use crate::intent::{classify_intent, intent_weight, select_seeds, Intent, ScoredIntent};
use crate::metrics::Metrics;
use crate::scoring::{score_node, AffinityContext, ScoreBreakdown};

/// Weight of secondary intents in the multi-signal boost
const MULTI_SIGNAL_BOOST: f64 = 0.2;

/// Intent-aware retrieval request (the `/v1/query/subgraph` body)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubgraphRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub max_nodes: Option<usize>,
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Explicit intent bypasses classification
    #[serde(default)]
    pub intent: Option<String>,
    /// Caller-supplied seeds bypass seed selection
    #[serde(default)]
    pub seed_nodes: Option<Vec<String>>,
}

/// The retrieval engine over both stores
pub struct RetrievalEngine {
    graph: Arc<GraphStore>,
    events: Arc<EventStore>,
    embedder: Arc<Embedder>,
    retrieval: RetrievalConfig,
    scoring: ScoringConfig,
    metrics: Arc<Metrics>,
}

impl RetrievalEngine {
    pub fn new(
        graph: Arc<GraphStore>,
        events: Arc<EventStore>,
        embedder: Arc<Embedder>,
        retrieval: RetrievalConfig,
        scoring: ScoringConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            graph,
            events,
            embedder,
            retrieval,
            scoring,
            metrics,
        }
    }

    // ========================================================================
    // SUBGRAPH QUERY
    // ========================================================================

    /// Multi-intent traversal: one weighted expansion per inferred intent,
    /// merged with a multi-signal boost before decay ranking
    pub fn query_subgraph(&self, request: &SubgraphRequest) -> Result<AtlasResponse, GraphError> {
        let started = Instant::now();
        let now = Utc::now();

        // 1. Intent distribution: override or classify
        let (intents, intent_override) = match request
            .intent
            .as_deref()
            .and_then(Intent::parse_name)
        {
            Some(intent) => (
                vec![ScoredIntent {
                    intent,
                    confidence: 1.0,
                }],
                Some(intent.as_str().to_string()),
            ),
            None => (classify_intent(&request.query), None),
        };

        // 2. Seeds: caller override or internal selection
        let seeds = match &request.seed_nodes {
            Some(seeds) if !seeds.is_empty() => seeds.clone(),
            _ => select_seeds(
                &self.graph,
                &self.embedder,
                &request.query,
                request.user_id.as_deref(),
                request.agent_id.as_deref(),
                now,
            ),
        };

        let max_nodes = request.max_nodes.unwrap_or(self.retrieval.max_nodes);
        let max_depth = request
            .max_depth
            .unwrap_or(self.retrieval.max_depth)
            .min(self.retrieval.max_depth_cap);
        let total_timeout = Duration::from_millis(request.timeout_ms.unwrap_or(self.retrieval.timeout_ms));
        let per_intent_timeout = total_timeout / intents.len().max(1) as u32;

        // 3. One traversal per intent, then merge with the multi-signal boost
        let mut merged: HashMap<String, MergedCandidate> = HashMap::new();
        let mut edges: Vec<(String, String, EdgeKind, Value)> = Vec::new();
        let mut seen_edges: HashSet<(String, String, &'static str)> = HashSet::new();
        let mut truncated = false;

        for scored in &intents {
            let options = TraversalOptions {
                max_depth,
                max_nodes,
                timeout: per_intent_timeout,
                weight_threshold: self.retrieval.weight_threshold,
                ..TraversalOptions::default()
            };
            let weight = |edge: EdgeKind| intent_weight(scored.intent, edge);
            let subgraph = self.graph.get_subgraph(&seeds, &weight, &options)?;
            truncated |= subgraph.truncated;

            for reached in subgraph.nodes {
                let intent_score = reached.path_score * scored.confidence;
                merged
                    .entry(reached.node.id.clone())
                    .and_modify(|candidate| candidate.intent_scores.push(intent_score))
                    .or_insert_with(|| MergedCandidate {
                        reached,
                        intent_scores: vec![intent_score],
                    });
            }
            for edge in subgraph.edges {
                if seen_edges.insert((edge.source.clone(), edge.target.clone(), edge.kind.as_str())) {
                    edges.push((edge.source, edge.target, edge.kind, edge.props));
                }
            }
        }

        // 4-5. Decay score the merged set, rank by composite, truncate
        let query_embedding = self.embedder.embed(&request.query).ok();
        let affinity = self.affinity_context(request, now);
        let mut ranked: Vec<(MergedCandidate, ScoreBreakdown, f64)> = merged
            .into_values()
            .map(|candidate| {
                let node_entities = self.referenced_entities(&candidate.reached.node.id);
                let breakdown = score_node(
                    &candidate.reached.node,
                    query_embedding.as_ref().map(|e| e.vector.as_slice()),
                    &node_entities,
                    &affinity,
                    &self.scoring.weights,
                    &self.scoring.decay,
                    now,
                );
                let intent_combined = combined_intent_score(&candidate.intent_scores);
                let composite = breakdown.combined + intent_combined;
                (candidate, breakdown, composite)
            })
            .collect();
        ranked.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        if ranked.len() > max_nodes {
            ranked.truncate(max_nodes);
            truncated = true;
        }
        self.record_decay_p50(&ranked);

        // 6. Proactive additions from the top nodes' SIMILAR_TO neighborhoods
        let mut response = AtlasResponse::empty(0);
        let seed_set: HashSet<&String> = seeds.iter().collect();
        let mut included: HashSet<String> = HashSet::new();
        for (candidate, breakdown, composite) in &ranked {
            let node = &candidate.reached.node;
            included.insert(node.id.clone());
            let reason = if seed_set.contains(&node.id) {
                RetrievalReason::Seed
            } else {
                RetrievalReason::Traversal
            };
            response.push_node(self.atlas_node(node, breakdown, *composite, reason)?);
        }

        let proactive = self.proactive_nodes(&ranked, &included, max_nodes)?;
        let proactive_count = proactive.len();
        for (node, edge) in proactive {
            let breakdown = score_node(
                &node,
                query_embedding.as_ref().map(|e| e.vector.as_slice()),
                &HashSet::new(),
                &affinity,
                &self.scoring.weights,
                &self.scoring.decay,
                now,
            );
            included.insert(node.id.clone());
            response.push_node(self.atlas_node(
                &node,
                &breakdown,
                breakdown.combined,
                RetrievalReason::Proactive,
            )?);
            if seen_edges.insert((edge.source.clone(), edge.target.clone(), edge.kind.as_str())) {
                edges.push((edge.source, edge.target, edge.kind, edge.props));
            }
        }

        // Keep only edges whose both endpoints made the cut
        for (source, target, kind, props) in edges {
            if included.contains(&source) && included.contains(&target) {
                response.edges.push(AtlasEdge {
                    source,
                    target,
                    kind,
                    properties: props,
                });
            }
        }

        // 8. Fire-and-forget reinforcement
        self.dispatch_access_updates(included.into_iter().collect(), now);

        response.meta = AtlasMeta {
            query_ms: started.elapsed().as_millis() as u64,
            nodes_returned: response.nodes.len(),
            truncated,
            inferred_intents: intents
                .iter()
                .map(|s| (s.intent.as_str().to_string(), s.confidence))
                .collect(),
            intent_override,
            seed_nodes: seeds,
            proactive_nodes_count: proactive_count,
            scoring_weights: serde_json::to_value(self.scoring.weights).ok(),
            capacity: Capacity {
                max_nodes,
                used_nodes: response.nodes.len(),
                max_depth,
            },
        };
        Ok(response)
    }

    // ========================================================================
    // WORKING MEMORY (context path)
    // ========================================================================

    /// Decay-ranked session context, optionally query-biased and chunked
    /// into trace episodes. Unknown sessions return an empty response.
    pub fn context(
        &self,
        session_id: &str,
        query: Option<&str>,
        max_nodes: usize,
        _max_depth: usize,
    ) -> Result<AtlasResponse, GraphError> {
        let started = Instant::now();
        let now = Utc::now();

        let mut nodes = self.graph.get_context(session_id, max_nodes.max(64))?;

        // Older sessions may be pruned from the graph; fall back to the
        // event store documents.
        if nodes.is_empty() {
            nodes = self.context_from_event_store(session_id, max_nodes)?;
        }
        if nodes.is_empty() {
            let mut response = AtlasResponse::empty(started.elapsed().as_millis() as u64);
            response.meta.capacity.max_nodes = max_nodes;
            return Ok(response);
        }

        let query_embedding = query.and_then(|q| self.embedder.embed(q).ok());
        let affinity = AffinityContext {
            session_id: Some(session_id.to_string()),
            recent_session_ids: HashSet::from([session_id.to_string()]),
            ..AffinityContext::default()
        };

        let mut ranked: Vec<(StoredNode, ScoreBreakdown)> = nodes
            .into_iter()
            .map(|node| {
                let breakdown = score_node(
                    &node,
                    query_embedding.as_ref().map(|e| e.vector.as_slice()),
                    &HashSet::new(),
                    &affinity,
                    &self.scoring.weights,
                    &self.scoring.decay,
                    now,
                );
                (node, breakdown)
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.1.combined
                .partial_cmp(&a.1.combined)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let truncated = ranked.len() > max_nodes;
        ranked.truncate(max_nodes);

        // Chunk by trace into episodes
        let mut episodes: BTreeMap<String, Vec<&StoredNode>> = BTreeMap::new();
        for (node, _) in &ranked {
            if let Some(trace) = node.attrs.get("traceId").and_then(Value::as_str) {
                episodes.entry(trace.to_string()).or_default().push(node);
            }
        }
        let episodes: Vec<Episode> = episodes
            .into_iter()
            .filter_map(|(trace_id, members)| {
                let times: Vec<DateTime<Utc>> = members.iter().filter_map(|n| n.occurred_at).collect();
                let start = times.iter().min().copied()?;
                let end = times.iter().max().copied()?;
                Some(Episode {
                    trace_id,
                    node_ids: members.iter().map(|n| n.id.clone()).collect(),
                    summary: None,
                    time_range_start: start,
                    time_range_end: end,
                })
            })
            .collect();

        let mut response = AtlasResponse::empty(0);
        let ids: Vec<String> = ranked.iter().map(|(n, _)| n.id.clone()).collect();
        for (node, breakdown) in &ranked {
            response.push_node(self.atlas_node(
                node,
                breakdown,
                breakdown.combined,
                RetrievalReason::Traversal,
            )?);
        }
        if !episodes.is_empty() {
            response.episodes = Some(episodes);
        }

        self.dispatch_access_updates(ids, now);

        response.meta.query_ms = started.elapsed().as_millis() as u64;
        response.meta.truncated = truncated;
        response.meta.capacity = Capacity {
            max_nodes,
            used_nodes: response.nodes.len(),
            max_depth: 0,
        };
        Ok(response)
    }

    // ========================================================================
    // LINEAGE
    // ========================================================================

    /// Bounded causal lineage; broader intents widen the relation set
    pub fn lineage(
        &self,
        node_id: &str,
        direction: LineageDirection,
        max_depth: Option<usize>,
        intent: Option<Intent>,
    ) -> Result<AtlasResponse, GraphError> {
        let started = Instant::now();
        let intent = intent.unwrap_or(Intent::Why);
        let extra: &[EdgeKind] = match intent {
            Intent::Why => &[],
            Intent::When | Intent::HowDoes => &[EdgeKind::Follows],
            _ => &[EdgeKind::Follows, EdgeKind::References],
        };

        let max_depth = max_depth
            .unwrap_or(self.retrieval.max_depth)
            .min(self.retrieval.max_depth_cap);
        let options = TraversalOptions {
            max_depth,
            max_nodes: self.retrieval.max_nodes,
            timeout: Duration::from_millis(self.retrieval.timeout_ms),
            ..TraversalOptions::default()
        };
        let lineage = self.graph.get_lineage(node_id, direction, extra, &options)?;

        let now = Utc::now();
        let affinity = AffinityContext::default();
        let mut response = AtlasResponse::empty(0);
        for reached in &lineage.nodes {
            let breakdown = score_node(
                &reached.node,
                None,
                &HashSet::new(),
                &affinity,
                &self.scoring.weights,
                &self.scoring.decay,
                now,
            );
            response.push_node(self.atlas_node(
                &reached.node,
                &breakdown,
                reached.path_score,
                if reached.depth == 0 {
                    RetrievalReason::Seed
                } else {
                    RetrievalReason::Traversal
                },
            )?);
        }
        for edge in lineage.edges {
            response.edges.push(AtlasEdge {
                source: edge.source,
                target: edge.target,
                kind: edge.kind,
                properties: edge.props,
            });
        }

        response.meta.query_ms = started.elapsed().as_millis() as u64;
        response.meta.truncated = lineage.truncated;
        response.meta.inferred_intents =
            BTreeMap::from([(intent.as_str().to_string(), 1.0)]);
        response.meta.capacity = Capacity {
            max_nodes: self.retrieval.max_nodes,
            used_nodes: response.nodes.len(),
            max_depth,
        };
        Ok(response)
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn context_from_event_store(
        &self,
        session_id: &str,
        max_nodes: usize,
    ) -> Result<Vec<StoredNode>, GraphError> {
        let events = self
            .events
            .get_by_session(session_id, None, None, max_nodes)
            .map_err(|e| GraphError::Unavailable(e.to_string()))?;
        Ok(events
            .iter()
            .map(|event| {
                let attrs = serde_json::to_value(crate::domain::EventNodeAttrs::from_event(event))
                    .unwrap_or(Value::Null);
                StoredNode {
                    id: crate::domain::event_node_id(&event.event_id),
                    kind: NodeKind::Event,
                    attrs,
                    importance: event.importance_hint.map(f64::from),
                    access_count: 0,
                    last_accessed_at: None,
                    stability_hours: None,
                    occurred_at: Some(event.occurred_at),
                    session_id: Some(event.session_id.clone()),
                    agent_id: Some(event.agent_id.clone()),
                    user_id: None,
                    created_at: event.occurred_at,
                    embedding: None,
                }
            })
            .collect())
    }

    /// Entities a node REFERENCES, for the affinity entity-overlap term
    fn referenced_entities(&self, node_id: &str) -> HashSet<String> {
        self.graph
            .edges_of(node_id, true, false, &[EdgeKind::References])
            .map(|edges| edges.into_iter().map(|e| e.target).collect())
            .unwrap_or_default()
    }

    fn affinity_context(&self, request: &SubgraphRequest, now: DateTime<Utc>) -> AffinityContext {
        let mut recent_session_ids = HashSet::new();
        if let Some(session) = &request.session_id {
            recent_session_ids.insert(session.clone());
        }
        // The user's other recent sessions, from the event store
        if let Some(agent) = &request.agent_id {
            if let Ok(page) = self.events.search(
                &crate::eventstore::EventQuery {
                    agent_id: Some(agent.clone()),
                    from: Some(now - ChronoDuration::days(7)),
                    ..crate::eventstore::EventQuery::default()
                },
                crate::eventstore::SortOrder::Desc,
                200,
                None,
            ) {
                for event in page.events {
                    recent_session_ids.insert(event.session_id);
                }
            }
        }

        let user_entities = request
            .user_id
            .as_deref()
            .map(|user| {
                let user_entity = crate::domain::entity_id(user, crate::domain::EntityType::User);
                let mut set: HashSet<String> = self
                    .graph
                    .edges_of(&user_entity, true, false, &[EdgeKind::InterestedIn])
                    .map(|edges| edges.into_iter().map(|e| e.target).collect())
                    .unwrap_or_default();
                set.insert(user_entity);
                set
            })
            .unwrap_or_default();

        AffinityContext {
            session_id: request.session_id.clone(),
            recent_session_ids,
            user_entities,
            prior_retrievals: HashMap::new(),
        }
    }

    /// Recurring-pattern SIMILAR_TO hits of the strongest results
    fn proactive_nodes(
        &self,
        ranked: &[(MergedCandidate, ScoreBreakdown, f64)],
        included: &HashSet<String>,
        max_nodes: usize,
    ) -> Result<Vec<(StoredNode, crate::graph::StoredEdge)>, GraphError> {
        let mut proactive = Vec::new();
        let budget = self
            .retrieval
            .proactive_limit
            .min(max_nodes.saturating_sub(included.len()));
        if budget == 0 {
            return Ok(proactive);
        }

        'outer: for (candidate, _, _) in ranked.iter().take(5) {
            let edges = self.graph.edges_of(
                &candidate.reached.node.id,
                true,
                true,
                &[EdgeKind::SimilarTo],
            )?;
            for edge in edges {
                let neighbor_id = if edge.source == candidate.reached.node.id {
                    edge.target.clone()
                } else {
                    edge.source.clone()
                };
                if included.contains(&neighbor_id)
                    || proactive
                        .iter()
                        .any(|(n, _): &(StoredNode, _)| n.id == neighbor_id)
                {
                    continue;
                }
                if let Some(node) = self.graph.get_node(&neighbor_id)? {
                    proactive.push((node, edge));
                    if proactive.len() >= budget {
                        break 'outer;
                    }
                }
            }
        }
        Ok(proactive)
    }

    /// Build the response node with provenance resolved through DERIVED_FROM
    fn atlas_node(
        &self,
        node: &StoredNode,
        breakdown: &ScoreBreakdown,
        composite: f64,
        reason: RetrievalReason,
    ) -> Result<AtlasNode, GraphError> {
        Ok(AtlasNode {
            id: node.id.clone(),
            kind: node.kind,
            attributes: node.attrs.clone(),
            provenance: self.provenance_of(node)?,
            scores: NodeScores {
                recency: breakdown.recency,
                importance: breakdown.importance,
                relevance: breakdown.relevance,
                affinity: breakdown.affinity,
                combined: composite,
            },
            retrieval_reason: reason,
        })
    }

    fn provenance_of(&self, node: &StoredNode) -> Result<Option<Provenance>, GraphError> {
        let (event_attrs, source) = match node.kind {
            NodeKind::Event => (node.attrs.clone(), node.attrs["eventType"].as_str().map(String::from)),
            _ => {
                let mut derived = self
                    .graph
                    .edges_of(&node.id, true, false, &[EdgeKind::DerivedFrom])?;
                let Some(edge) = derived.pop() else {
                    return Ok(None);
                };
                let Some(event_node) = self.graph.get_node(&edge.target)? else {
                    return Ok(None);
                };
                let method = edge
                    .props
                    .get("derivationMethod")
                    .and_then(Value::as_str)
                    .map(String::from);
                (event_node.attrs, method)
            }
        };

        let occurred_at = event_attrs
            .get("occurredAt")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc));
        let field = |key: &str| {
            event_attrs
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let Some(occurred_at) = occurred_at else {
            return Ok(None);
        };
        Ok(Some(Provenance {
            event_id: field("eventId"),
            global_position: field("globalPosition"),
            source: source.unwrap_or_else(|| "unknown".to_string()),
            occurred_at,
            session_id: field("sessionId"),
            agent_id: field("agentId"),
            trace_id: field("traceId"),
        }))
    }

    /// Dispatch access updates without blocking the response path
    fn dispatch_access_updates(&self, ids: Vec<String>, now: DateTime<Utc>) {
        let graph = Arc::clone(&self.graph);
        let boost = self.scoring.decay.s_boost_hours;
        let update = move || {
            for id in &ids {
                if let Err(error) = graph.update_access(id, now, boost) {
                    tracing::debug!(%error, node = %id, "access update failed");
                }
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(update);
            }
            // No runtime (sync tests): the update is cheap, run it inline
            Err(_) => update(),
        }
    }

    fn record_decay_p50(&self, ranked: &[(MergedCandidate, ScoreBreakdown, f64)]) {
        if ranked.is_empty() {
            return;
        }
        let mut scores: Vec<f64> = ranked.iter().map(|(_, b, _)| b.combined).collect();
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.metrics.set_decay_score_p50(scores[scores.len() / 2]);
    }
}

struct MergedCandidate {
    reached: TraversedNode,
    intent_scores: Vec<f64>,
}

/// Max over intents plus a boost for every additional supporting intent
fn combined_intent_score(scores: &[f64]) -> f64 {
    let max = scores.iter().copied().fold(0.0f64, f64::max);
    let sum: f64 = scores.iter().sum();
    max + MULTI_SIGNAL_BOOST * (sum - max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_signal_boost_rewards_agreement() {
        let single = combined_intent_score(&[0.8]);
        let agreed = combined_intent_score(&[0.8, 0.5]);
        assert_eq!(single, 0.8);
        assert!((agreed - (0.8 + 0.2 * 0.5)).abs() < 1e-9);
    }

    #[test]
    fn subgraph_request_rejects_unknown_fields() {
        let raw = r#"{"query": "why", "surprise": 1}"#;
        assert!(serde_json::from_str::<SubgraphRequest>(raw).is_err());
    }
}
