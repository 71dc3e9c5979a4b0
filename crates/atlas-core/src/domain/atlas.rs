//! Atlas response - the canonical graph-query response shape
//!
//! Every retrieval surface (subgraph, context, lineage, user views) returns
//! this shape: nodes keyed by id with per-node provenance and scores, the
//! connecting edges, optional trace episodes, and query metadata.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::edge::EdgeKind;
use super::node::NodeKind;

/// Back-pointer from a returned node to its source event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub event_id: String,
    /// Opaque; clients must not parse it
    pub global_position: String,
    /// How the node came to exist (event type or derivation method)
    pub source: String,
    pub occurred_at: DateTime<Utc>,
    pub session_id: String,
    pub agent_id: String,
    pub trace_id: String,
}

/// Per-node component scores plus the composite used for ranking
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeScores {
    pub recency: f64,
    pub importance: f64,
    pub relevance: f64,
    pub affinity: f64,
    pub combined: f64,
}

/// Why a node was included in the response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalReason {
    Seed,
    Traversal,
    Proactive,
}

impl RetrievalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalReason::Seed => "seed",
            RetrievalReason::Traversal => "traversal",
            RetrievalReason::Proactive => "proactive",
        }
    }
}

/// A node in an Atlas response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtlasNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Kind-specific attribute document
    pub attributes: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    pub scores: NodeScores,
    pub retrieval_reason: RetrievalReason,
}

/// An edge in an Atlas response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtlasEdge {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub kind: EdgeKind,
    pub properties: Value,
}

/// A trace-grouped episode of events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub trace_id: String,
    pub node_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub time_range_start: DateTime<Utc>,
    pub time_range_end: DateTime<Utc>,
}

/// Capacity envelope echoed back to the caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capacity {
    pub max_nodes: usize,
    pub used_nodes: usize,
    pub max_depth: usize,
}

/// Query metadata on every Atlas response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtlasMeta {
    pub query_ms: u64,
    pub nodes_returned: usize,
    pub truncated: bool,
    /// Intent distribution the query ran under
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inferred_intents: BTreeMap<String, f64>,
    /// Set when the caller bypassed classification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_override: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seed_nodes: Vec<String>,
    pub proactive_nodes_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scoring_weights: Option<Value>,
    pub capacity: Capacity,
}

/// Cursor-based pagination handle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub cursor: String,
}

/// The canonical graph-query response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtlasResponse {
    pub nodes: BTreeMap<String, AtlasNode>,
    pub edges: Vec<AtlasEdge>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episodes: Option<Vec<Episode>>,
    pub meta: AtlasMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

impl AtlasResponse {
    /// An empty response carrying only timing metadata
    pub fn empty(query_ms: u64) -> Self {
        Self {
            meta: AtlasMeta {
                query_ms,
                ..AtlasMeta::default()
            },
            ..Self::default()
        }
    }

    /// Insert a node, keeping `nodes_returned` consistent
    pub fn push_node(&mut self, node: AtlasNode) {
        self.nodes.insert(node.id.clone(), node);
        self.meta.nodes_returned = self.nodes.len();
        self.meta.capacity.used_nodes = self.nodes.len();
    }
}
