//! Decay scoring - Ebbinghaus recency with access-driven reinforcement
//!
//! The composite score ranks candidates in every retrieval surface:
//!
//! ```text
//! score = w_r * recency + w_i * importance + w_v * relevance + w_u * affinity
//! recency = exp(-t_elapsed / S)
//! ```
//!
//! `t_elapsed` counts hours since the later of the node's occurrence and its
//! last access; `S` starts at a per-kind base stability and grows by a boost
//! on each access, so frequently retrieved nodes forget slower.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::PreferenceCategory;
use crate::graph::StoredNode;

// ============================================================================
// CONFIG
// ============================================================================

/// Component weights for the composite score
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ScoringWeights {
    pub recency: f64,
    pub importance: f64,
    pub relevance: f64,
    pub affinity: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            recency: 1.0,
            importance: 1.0,
            relevance: 1.0,
            affinity: 0.5,
        }
    }
}

/// Stability parameters for the forgetting curve
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct DecayConfig {
    /// Base stability for event nodes, in hours
    pub s_base_hours: f64,
    /// Stability added on each access, in hours
    pub s_boost_hours: f64,
    /// Relevance used when no query or no embeddings are available
    pub neutral_relevance: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            s_base_hours: 168.0,
            s_boost_hours: 24.0,
            neutral_relevance: 0.5,
        }
    }
}

/// Per-category base stability for preference nodes
pub fn preference_base_stability_hours(category: PreferenceCategory) -> f64 {
    match category {
        // Communication and style preferences are the most durable
        PreferenceCategory::Communication | PreferenceCategory::Style => 30.0 * 24.0,
        PreferenceCategory::Tool | PreferenceCategory::Environment => 14.0 * 24.0,
        PreferenceCategory::Workflow | PreferenceCategory::Domain => 7.0 * 24.0,
    }
}

// ============================================================================
// COMPONENTS
// ============================================================================

/// Exponential recency with reinforcement.
///
/// The clock starts at the later of occurrence and last access; stability is
/// the node's accumulated value or the configured base.
pub fn recency(node: &StoredNode, now: DateTime<Utc>, config: &DecayConfig) -> f64 {
    let anchor = match (node.occurred_at, node.last_accessed_at) {
        (Some(occurred), Some(accessed)) => occurred.max(accessed),
        (Some(occurred), None) => occurred,
        (None, Some(accessed)) => accessed,
        (None, None) => node.created_at,
    };
    let elapsed_hours = (now - anchor).num_seconds().max(0) as f64 / 3600.0;
    let stability = node
        .stability_hours
        .filter(|s| *s > 0.0)
        .map(|s| config.s_base_hours + s)
        .unwrap_or(config.s_base_hours);
    (-elapsed_hours / stability).exp()
}

/// Importance normalized from the 1..=10 scale to [0, 1]
pub fn importance(node: &StoredNode) -> f64 {
    node.importance.map(|i| (i / 10.0).clamp(0.0, 1.0)).unwrap_or(0.0)
}

/// Cosine relevance against the query embedding; neutral when either side
/// is missing
pub fn relevance(node: &StoredNode, query_embedding: Option<&[f32]>, config: &DecayConfig) -> f64 {
    match (query_embedding, node.embedding.as_deref()) {
        (Some(query), Some(node_vec)) => {
            crate::embeddings::cosine_similarity(query, node_vec).clamp(0.0, 1.0)
        }
        _ => config.neutral_relevance,
    }
}

// ============================================================================
// USER AFFINITY
// ============================================================================

/// Context for computing user affinity over a candidate set
#[derive(Debug, Clone, Default)]
pub struct AffinityContext {
    /// The querying session
    pub session_id: Option<String>,
    /// The user's sessions from the last 7 days (including the current one)
    pub recent_session_ids: HashSet<String>,
    /// Entity ids referenced by the user's events
    pub user_entities: HashSet<String>,
    /// Node id -> times returned in this session's prior retrievals
    pub prior_retrievals: HashMap<String, u32>,
}

/// Weighted mean of session proximity, retrieval recurrence, and entity
/// overlap.
///
/// `node_entities` are the entity ids the node REFERENCES (empty for nodes
/// without references).
pub fn user_affinity(node: &StoredNode, node_entities: &HashSet<String>, ctx: &AffinityContext) -> f64 {
    let session_proximity = match (&node.session_id, &ctx.session_id) {
        (Some(node_session), Some(current)) if node_session == current => 1.0,
        (Some(node_session), _) if ctx.recent_session_ids.contains(node_session) => 0.7,
        (Some(_), _) => 0.3,
        (None, _) => 0.3,
    };

    let recurrence = ctx
        .prior_retrievals
        .get(&node.id)
        .map(|count| (*count as f64 / 5.0).min(1.0))
        .unwrap_or(0.0);

    let entity_overlap = if ctx.user_entities.is_empty() || node_entities.is_empty() {
        0.0
    } else {
        let shared = ctx.user_entities.intersection(node_entities).count() as f64;
        shared / ctx.user_entities.len().max(node_entities.len()) as f64
    };

    (session_proximity * 2.0 + recurrence + entity_overlap) / 4.0
}

// ============================================================================
// COMPOSITE
// ============================================================================

/// Component scores and the weighted composite for one node
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreBreakdown {
    pub recency: f64,
    pub importance: f64,
    pub relevance: f64,
    pub affinity: f64,
    pub combined: f64,
}

/// Score a node against the query context
pub fn score_node(
    node: &StoredNode,
    query_embedding: Option<&[f32]>,
    node_entities: &HashSet<String>,
    ctx: &AffinityContext,
    weights: &ScoringWeights,
    config: &DecayConfig,
    now: DateTime<Utc>,
) -> ScoreBreakdown {
    let recency = recency(node, now, config);
    let importance = importance(node);
    let relevance = relevance(node, query_embedding, config);
    let affinity = user_affinity(node, node_entities, ctx);
    ScoreBreakdown {
        recency,
        importance,
        relevance,
        affinity,
        combined: weights.recency * recency
            + weights.importance * importance
            + weights.relevance * relevance
            + weights.affinity * affinity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn node_at(hours_ago: i64) -> StoredNode {
        let occurred = Utc::now() - Duration::hours(hours_ago);
        StoredNode {
            id: "evt_x".to_string(),
            kind: crate::domain::NodeKind::Event,
            attrs: json!({}),
            importance: Some(5.0),
            access_count: 0,
            last_accessed_at: None,
            stability_hours: None,
            occurred_at: Some(occurred),
            session_id: Some("s1".to_string()),
            agent_id: Some("a1".to_string()),
            user_id: None,
            created_at: occurred,
            embedding: None,
        }
    }

    #[test]
    fn recency_decays_with_age() {
        let config = DecayConfig::default();
        let fresh = recency(&node_at(0), Utc::now(), &config);
        let week = recency(&node_at(168), Utc::now(), &config);
        let month = recency(&node_at(720), Utc::now(), &config);
        assert!(fresh > 0.99);
        assert!((week - (-1.0f64).exp()).abs() < 0.01);
        assert!(month < week && week < fresh);
    }

    #[test]
    fn access_reinforcement_slows_decay() {
        let config = DecayConfig::default();
        let mut reinforced = node_at(168);
        reinforced.stability_hours = Some(96.0);
        let plain = recency(&node_at(168), Utc::now(), &config);
        let boosted = recency(&reinforced, Utc::now(), &config);
        assert!(boosted > plain);
    }

    #[test]
    fn last_access_resets_the_clock() {
        let config = DecayConfig::default();
        let mut accessed = node_at(168);
        accessed.last_accessed_at = Some(Utc::now() - Duration::hours(1));
        assert!(recency(&accessed, Utc::now(), &config) > 0.9);
    }

    #[test]
    fn importance_normalizes_to_unit_range() {
        let mut node = node_at(0);
        node.importance = Some(10.0);
        assert_eq!(importance(&node), 1.0);
        node.importance = None;
        assert_eq!(importance(&node), 0.0);
    }

    #[test]
    fn relevance_is_neutral_without_embeddings() {
        let config = DecayConfig::default();
        let node = node_at(0);
        assert_eq!(relevance(&node, None, &config), 0.5);
        assert_eq!(relevance(&node, Some(&[1.0, 0.0]), &config), 0.5);
    }

    #[test]
    fn affinity_prefers_current_session() {
        let node = node_at(0);
        let mut other = node_at(0);
        other.session_id = Some("s_other".to_string());

        let ctx = AffinityContext {
            session_id: Some("s1".to_string()),
            recent_session_ids: HashSet::from(["s1".to_string()]),
            ..AffinityContext::default()
        };
        let same = user_affinity(&node, &HashSet::new(), &ctx);
        let far = user_affinity(&other, &HashSet::new(), &ctx);
        assert!(same > far);
    }

    #[test]
    fn composite_uses_configured_weights() {
        let node = node_at(0);
        let ctx = AffinityContext::default();
        let zeroed = ScoringWeights {
            recency: 0.0,
            importance: 0.0,
            relevance: 0.0,
            affinity: 0.0,
        };
        let breakdown = score_node(
            &node,
            None,
            &HashSet::new(),
            &ctx,
            &zeroed,
            &DecayConfig::default(),
            Utc::now(),
        );
        assert_eq!(breakdown.combined, 0.0);
        assert!(breakdown.recency > 0.0);
    }

    #[test]
    fn preference_stability_tiers() {
        assert!(
            preference_base_stability_hours(PreferenceCategory::Communication)
                > preference_base_stability_hours(PreferenceCategory::Tool)
        );
        assert!(
            preference_base_stability_hours(PreferenceCategory::Tool)
                > preference_base_stability_hours(PreferenceCategory::Workflow)
        );
    }
}
