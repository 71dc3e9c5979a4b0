//! Query-intent classification and the intent/edge weight matrix
//!
//! The caller supplies a natural-language query; the system derives a
//! distribution over eight intents with keyword patterns (fast, explainable).
//! An explicit `intent` in the request bypasses classification. Each intent
//! biases traversal through a per-edge-kind weight table.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{entity_id, EdgeKind, EntityType};
use crate::embeddings::{cosine_similarity, Embedder};
use crate::graph::GraphStore;

/// Intents below this confidence are dropped from the distribution
pub const DECOMPOSITION_THRESHOLD: f64 = 0.3;

// ============================================================================
// INTENT
// ============================================================================

/// The eight query intents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Why,
    When,
    What,
    Related,
    General,
    WhoIs,
    HowDoes,
    Personalize,
}

/// All intents, for iteration
pub const ALL_INTENTS: [Intent; 8] = [
    Intent::Why,
    Intent::When,
    Intent::What,
    Intent::Related,
    Intent::General,
    Intent::WhoIs,
    Intent::HowDoes,
    Intent::Personalize,
];

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Why => "why",
            Intent::When => "when",
            Intent::What => "what",
            Intent::Related => "related",
            Intent::General => "general",
            Intent::WhoIs => "who_is",
            Intent::HowDoes => "how_does",
            Intent::Personalize => "personalize",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "why" => Some(Intent::Why),
            "when" => Some(Intent::When),
            "what" => Some(Intent::What),
            "related" => Some(Intent::Related),
            "general" => Some(Intent::General),
            "who_is" => Some(Intent::WhoIs),
            "how_does" => Some(Intent::HowDoes),
            "personalize" => Some(Intent::Personalize),
            _ => None,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// EDGE-WEIGHT MATRIX
// ============================================================================

/// Traversal priority of an edge kind under an intent.
///
/// Unlisted combinations default to 1.0; `general` treats every relation
/// equally at 2.0.
pub fn intent_weight(intent: Intent, edge: EdgeKind) -> f64 {
    use EdgeKind::*;
    match intent {
        Intent::Why => match edge {
            CausedBy => 5.0,
            Follows => 1.0,
            SimilarTo => 1.5,
            References => 2.0,
            Summarizes => 1.0,
            DerivedFrom => 2.0,
            _ => 1.0,
        },
        Intent::When => match edge {
            CausedBy => 1.0,
            Follows => 5.0,
            SimilarTo => 0.5,
            References => 1.0,
            Summarizes => 0.5,
            _ => 1.0,
        },
        Intent::What => match edge {
            CausedBy => 2.0,
            Follows => 1.0,
            SimilarTo => 2.0,
            References => 5.0,
            Summarizes => 2.0,
            About => 2.0,
            _ => 1.0,
        },
        Intent::Related => match edge {
            CausedBy => 1.5,
            Follows => 0.5,
            SimilarTo => 5.0,
            References => 2.0,
            Summarizes => 1.5,
            SameAs => 3.0,
            RelatedTo => 3.0,
            _ => 1.0,
        },
        Intent::General => 2.0,
        Intent::WhoIs => match edge {
            References => 3.0,
            HasProfile => 5.0,
            HasPreference => 5.0,
            HasSkill => 5.0,
            ExhibitsPattern => 4.0,
            InterestedIn => 4.0,
            About => 3.0,
            SameAs => 4.0,
            RelatedTo => 3.0,
            _ => 1.0,
        },
        Intent::HowDoes => match edge {
            Follows => 3.0,
            CausedBy => 2.0,
            ExhibitsPattern => 5.0,
            AbstractedFrom => 4.0,
            HasSkill => 3.0,
            Summarizes => 2.0,
            ParentSkill => 2.0,
            _ => 1.0,
        },
        Intent::Personalize => match edge {
            HasProfile => 4.0,
            HasPreference => 5.0,
            HasSkill => 4.0,
            ExhibitsPattern => 3.0,
            InterestedIn => 4.0,
            DerivedFrom => 3.0,
            About => 3.0,
            _ => 1.0,
        },
    }
}

// ============================================================================
// CLASSIFIER
// ============================================================================

/// An intent with its classification confidence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredIntent {
    pub intent: Intent,
    pub confidence: f64,
}

struct IntentPattern {
    intent: Intent,
    regex: &'static LazyLock<Regex>,
    weight: f64,
}

macro_rules! pattern_re {
    ($name:ident, $re:expr) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($re).expect("valid pattern"));
    };
}

pattern_re!(RE_WHY, r"(?i)\b(why|cause[ds]?|reason|because|led to|root cause)\b");
pattern_re!(
    RE_WHEN,
    r"(?i)\b(when|before|after|during|timeline|sequence|order of|first|last time)\b"
);
pattern_re!(RE_WHAT, r"(?i)\b(what|which|describe|show me|details? (of|about)|tell me about)\b");
pattern_re!(RE_RELATED, r"(?i)\b(related|similar|like this|comparable|connected|associated)\b");
pattern_re!(RE_WHO, r"(?i)\b(who is|who'?s|whose|profile|about (me|the user)|know about)\b");
pattern_re!(
    RE_HOW,
    r"(?i)\b(how (do|does|did|to)|workflow|procedure|steps|process|usually|typically)\b"
);
pattern_re!(
    RE_PERSONALIZE,
    r"(?i)\b(prefer|preference|personali[sz]e|my (style|settings|setup)|i (like|want|hate|use)|for me)\b"
);

static PATTERNS: LazyLock<Vec<IntentPattern>> = LazyLock::new(|| {
    vec![
        IntentPattern { intent: Intent::Why, regex: &RE_WHY, weight: 0.7 },
        IntentPattern { intent: Intent::When, regex: &RE_WHEN, weight: 0.6 },
        IntentPattern { intent: Intent::What, regex: &RE_WHAT, weight: 0.5 },
        IntentPattern { intent: Intent::Related, regex: &RE_RELATED, weight: 0.7 },
        IntentPattern { intent: Intent::WhoIs, regex: &RE_WHO, weight: 0.7 },
        IntentPattern { intent: Intent::HowDoes, regex: &RE_HOW, weight: 0.6 },
        IntentPattern { intent: Intent::Personalize, regex: &RE_PERSONALIZE, weight: 0.6 },
    ]
});

/// Classify a query into an intent distribution.
///
/// Each matching pattern contributes its weight, plus a bonus for repeated
/// hits; scores are capped at 1.0. Falls back to `{general: 1.0}` when
/// nothing clears the decomposition threshold.
pub fn classify_intent(query: &str) -> Vec<ScoredIntent> {
    let mut scored: Vec<ScoredIntent> = Vec::new();

    for pattern in PATTERNS.iter() {
        let hits = pattern.regex.find_iter(query).count();
        if hits == 0 {
            continue;
        }
        let confidence = (pattern.weight + 0.15 * (hits as f64 - 1.0)).min(1.0);
        if confidence >= DECOMPOSITION_THRESHOLD {
            scored.push(ScoredIntent {
                intent: pattern.intent,
                confidence,
            });
        }
    }

    scored.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(3);

    if scored.is_empty() {
        scored.push(ScoredIntent {
            intent: Intent::General,
            confidence: 1.0,
        });
    }
    scored
}

// ============================================================================
// SEED SELECTION
// ============================================================================

/// How many high-importance recent events to add as seeds
const TOP_K_RECENT_EVENTS: usize = 3;

/// Recency window for seed events
const SEED_EVENT_WINDOW_DAYS: i64 = 7;

/// Embedding-similarity floor for entity seed matches
const SEED_ENTITY_SIMILARITY: f64 = 0.55;

/// Select traversal seeds for a query.
///
/// Named entities are matched by keyword and by embedding against the entity
/// inventory; the user entity (from the session's agent) is always included;
/// top-K recent high-importance events round out the set. Caller-supplied
/// seeds bypass all of this.
pub fn select_seeds(
    graph: &GraphStore,
    embedder: &Embedder,
    query: &str,
    user_id: Option<&str>,
    agent_id: Option<&str>,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut seeds: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut push = |seeds: &mut Vec<String>, seen: &mut HashSet<String>, id: String| {
        if seen.insert(id.clone()) {
            seeds.push(id);
        }
    };

    // The querying user's entity is always a seed
    if let Some(user) = user_id {
        let id = entity_id(user, EntityType::User);
        if let Ok(Some(_)) = graph.get_entity(&id) {
            push(&mut seeds, &mut seen, id);
        }
    }

    // Keyword match: query tokens against entity names
    for token in query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
        .filter(|t| t.len() >= 3 && !STOPWORDS.contains(t))
    {
        if let Ok(matches) = graph.entities_matching(token, 3) {
            for node in matches {
                push(&mut seeds, &mut seen, node.id);
            }
        }
    }

    // Embedding match against the entity inventory
    if let Ok(query_embedding) = embedder.embed(query) {
        if let Ok(entities) = graph.list_entities(200) {
            let mut ranked: Vec<(f64, String)> = entities
                .into_iter()
                .filter_map(|node| {
                    let vector = node.embedding.as_deref()?;
                    let similarity = cosine_similarity(&query_embedding.vector, vector);
                    (similarity > SEED_ENTITY_SIMILARITY).then_some((similarity, node.id))
                })
                .collect();
            ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            for (_, id) in ranked.into_iter().take(3) {
                push(&mut seeds, &mut seen, id);
            }
        }
    }

    // Top-K high-importance recent events in the agent's neighborhood
    let since = now - Duration::days(SEED_EVENT_WINDOW_DAYS);
    if let Ok(events) = graph.top_recent_events(agent_id, since, TOP_K_RECENT_EVENTS) {
        for node in events {
            push(&mut seeds, &mut seen, node.id);
        }
    }

    seeds
}

static STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "the", "and", "for", "with", "that", "this", "what", "when", "why", "how", "who", "did",
        "does", "are", "was", "were", "have", "has", "about", "from", "into", "get", "all",
    ])
});

// ============================================================================
// TESTS
// ============================================================================
