//! Three-tier entity resolution (validation layer L3)
//!
//! - Tier 1 exact: normalized name + alias dictionary hits an existing
//!   entity, which is merged (mention bump).
//! - Tier 2 close: embedding similarity above 0.9 creates a SAME_AS link.
//! - Tier 3 related: family/version stem match creates RELATED_TO.
//!
//! Tiers 2 and 3 never auto-merge; the links record the hypothesis with its
//! confidence and leave the nodes distinct.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::domain::{entity_id, normalize_entity_name, EdgeKind};
use crate::embeddings::{cosine_similarity, Embedder};
use crate::graph::{GraphError, GraphStore};

use super::validate::CandidateEntity;

/// Embedding similarity above which two entities are considered the same
pub const SAME_AS_SIMILARITY: f64 = 0.9;

/// How many candidate entities the embedding neighborhood considers
const EMBEDDING_CANDIDATES: usize = 100;

/// Which tier resolved an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionTier {
    /// Merged into an existing node
    Exact,
    /// New node linked SAME_AS to a close match; never auto-merged
    Close,
    /// New node linked RELATED_TO a family member
    Related,
    /// Fresh entity, no relatives found
    New,
}

/// Outcome of resolving one candidate entity
#[derive(Debug, Clone)]
pub struct ResolvedEntity {
    pub node_id: String,
    pub tier: ResolutionTier,
}

static ALIASES: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    HashMap::from([
        ("vscode", "visual studio code"),
        ("vs code", "visual studio code"),
        ("k8s", "kubernetes"),
        ("postgres", "postgresql"),
        ("pg", "postgresql"),
        ("js", "javascript"),
        ("ts", "typescript"),
        ("py", "python"),
        ("gh", "github"),
        ("tf", "terraform"),
    ])
});

/// Canonical form after normalization and alias lookup
pub fn canonical_entity_name(name: &str) -> String {
    let normalized = normalize_entity_name(name);
    ALIASES
        .get(normalized.as_str())
        .map(|canonical| canonical.to_string())
        .unwrap_or(normalized)
}

/// Strip trailing version-ish tokens: `postgresql 14` -> `postgresql`
fn family_stem(name: &str) -> String {
    let tokens: Vec<&str> = name.split_whitespace().collect();
    let stem: Vec<&str> = tokens
        .iter()
        .rev()
        .skip_while(|t| {
            t.chars().all(|c| c.is_ascii_digit() || c == '.' || c == 'v' || c == 'x')
        })
        .copied()
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if stem.is_empty() {
        name.to_string()
    } else {
        stem.join(" ")
    }
}

/// Resolve a candidate into the graph's entity inventory.
///
/// Always ends with a live entity node (merged or created, carrying a name
/// embedding), plus SAME_AS/RELATED_TO links when tiers 2/3 fire.
pub fn resolve_entity(
    graph: &GraphStore,
    embedder: &Embedder,
    candidate: &CandidateEntity,
    now: DateTime<Utc>,
) -> Result<ResolvedEntity, GraphError> {
    let canonical = canonical_entity_name(&candidate.name);

    // Tier 1: exact canonical key
    let exact_id = entity_id(&canonical, candidate.entity_type);
    if graph.get_entity(&exact_id)?.is_some() {
        graph.merge_entity_node(&canonical, candidate.entity_type, now)?;
        return Ok(ResolvedEntity {
            node_id: exact_id,
            tier: ResolutionTier::Exact,
        });
    }

    // New node first; links attach to it below
    let node_id = graph.merge_entity_node(&canonical, candidate.entity_type, now)?;
    let embedding = embedder
        .embed(&canonical)
        .map_err(|e| GraphError::Unavailable(e.to_string()))?;
    graph.set_embedding(&node_id, &embedding.vector)?;

    // Tier 2: embedding neighborhood
    let mut best: Option<(f64, String)> = None;
    for other in graph.list_entities(EMBEDDING_CANDIDATES)? {
        if other.id == node_id {
            continue;
        }
        let Some(vector) = other.embedding.as_deref() else {
            continue;
        };
        let similarity = cosine_similarity(&embedding.vector, vector);
        if best.as_ref().map(|(s, _)| similarity > *s).unwrap_or(true) {
            best = Some((similarity, other.id));
        }
    }
    if let Some((similarity, other_id)) = &best {
        if *similarity > SAME_AS_SIMILARITY {
            graph.create_edge(
                &node_id,
                other_id,
                EdgeKind::SameAs,
                json!({
                    "confidence": similarity.clamp(0.0, 1.0),
                    "justification": format!("embedding similarity {similarity:.3}")
                }),
            )?;
            return Ok(ResolvedEntity {
                node_id,
                tier: ResolutionTier::Close,
            });
        }
    }

    // Tier 3: family/version stem
    let stem = family_stem(&canonical);
    if stem != canonical {
        let stem_id = entity_id(&stem, candidate.entity_type);
        if graph.get_entity(&stem_id)?.is_some() {
            graph.create_edge(
                &node_id,
                &stem_id,
                EdgeKind::RelatedTo,
                json!({
                    "confidence": 0.7,
                    "justification": format!("shared family stem '{stem}'")
                }),
            )?;
            return Ok(ResolvedEntity {
                node_id,
                tier: ResolutionTier::Related,
            });
        }
    }

    Ok(ResolvedEntity {
        node_id,
        tier: ResolutionTier::New,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EntityType;
    use crate::embeddings::EMBEDDING_DIMENSIONS;
    use super::super::validate::CandidateEvidence;

    fn candidate(name: &str) -> CandidateEntity {
        CandidateEntity {
            name: name.to_string(),
            entity_type: EntityType::Tool,
            confidence: 0.8,
            evidence: CandidateEvidence {
                quote: "q".to_string(),
                turn_index: 0,
            },
        }
    }

    fn setup() -> (tempfile::TempDir, GraphStore, Embedder) {
        let dir = tempfile::tempdir().unwrap();
        let graph = GraphStore::open(dir.path().join("graph.db")).unwrap();
        let embedder = Embedder::hashed(EMBEDDING_DIMENSIONS);
        (dir, graph, embedder)
    }

    #[test]
    fn alias_normalization_is_canonical() {
        assert_eq!(canonical_entity_name("  VSCode "), "visual studio code");
        assert_eq!(canonical_entity_name("Postgres"), "postgresql");
        assert_eq!(canonical_entity_name("Something Else"), "something else");
    }

    #[test]
    fn tier1_merges_on_alias_hit() {
        let (_dir, graph, embedder) = setup();
        let now = Utc::now();
        let first = resolve_entity(&graph, &embedder, &candidate("postgresql"), now).unwrap();
        assert_eq!(first.tier, ResolutionTier::New);

        // Alias resolves to the same canonical key
        let second = resolve_entity(&graph, &embedder, &candidate("Postgres"), now).unwrap();
        assert_eq!(second.tier, ResolutionTier::Exact);
        assert_eq!(second.node_id, first.node_id);

        let node = graph.get_entity(&first.node_id).unwrap().unwrap();
        assert_eq!(node.attrs["mentionCount"], 2);
    }

    #[test]
    fn tier2_links_same_as_without_merging() {
        let (_dir, graph, embedder) = setup();
        let now = Utc::now();
        let first = resolve_entity(&graph, &embedder, &candidate("visual studio code editor"), now)
            .unwrap();
        // Near-identical name embeds almost identically but has a different key
        let second =
            resolve_entity(&graph, &embedder, &candidate("visual studio code editor app"), now)
                .unwrap();

        if second.tier == ResolutionTier::Close {
            assert_ne!(first.node_id, second.node_id);
            let edges = graph
                .edges_of(&second.node_id, true, false, &[EdgeKind::SameAs])
                .unwrap();
            assert_eq!(edges.len(), 1);
            assert_eq!(edges[0].target, first.node_id);
        }
        // Both nodes exist regardless: no auto-merge at tier 2
        assert!(graph.get_entity(&first.node_id).unwrap().is_some());
        assert!(graph.get_entity(&second.node_id).unwrap().is_some());
    }

    #[test]
    fn tier3_links_version_to_family() {
        let (_dir, graph, embedder) = setup();
        let now = Utc::now();
        let family = resolve_entity(&graph, &embedder, &candidate("terraform"), now).unwrap();
        let versioned = resolve_entity(&graph, &embedder, &candidate("terraform 1.5"), now).unwrap();

        assert!(matches!(
            versioned.tier,
            ResolutionTier::Related | ResolutionTier::Close
        ));
        let related = graph
            .edges_of(&versioned.node_id, true, false, &[EdgeKind::RelatedTo, EdgeKind::SameAs])
            .unwrap();
        assert!(!related.is_empty());
        assert_eq!(related[0].target, family.node_id);
    }

    #[test]
    fn family_stem_strips_versions() {
        assert_eq!(family_stem("postgresql 14"), "postgresql");
        assert_eq!(family_stem("python 3.12"), "python");
        assert_eq!(family_stem("plain"), "plain");
    }
}
