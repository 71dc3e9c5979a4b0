//! Graph edge vocabulary - 16 typed relations
//!
//! Edges are idempotent on (source, target, type). Endpoint legality and
//! property enums are enforced by the graph adapter at write time, since the
//! underlying engine cannot.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node::NodeKind;

// ============================================================================
// EDGE KIND
// ============================================================================

/// The 16 typed relations of the semantic graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    Follows,
    CausedBy,
    SimilarTo,
    References,
    Summarizes,
    SameAs,
    RelatedTo,
    HasProfile,
    HasPreference,
    HasSkill,
    DerivedFrom,
    ExhibitsPattern,
    InterestedIn,
    About,
    AbstractedFrom,
    ParentSkill,
}

/// All edge kinds, for weight-matrix iteration
pub const ALL_EDGE_KINDS: [EdgeKind; 16] = [
    EdgeKind::Follows,
    EdgeKind::CausedBy,
    EdgeKind::SimilarTo,
    EdgeKind::References,
    EdgeKind::Summarizes,
    EdgeKind::SameAs,
    EdgeKind::RelatedTo,
    EdgeKind::HasProfile,
    EdgeKind::HasPreference,
    EdgeKind::HasSkill,
    EdgeKind::DerivedFrom,
    EdgeKind::ExhibitsPattern,
    EdgeKind::InterestedIn,
    EdgeKind::About,
    EdgeKind::AbstractedFrom,
    EdgeKind::ParentSkill,
];

impl EdgeKind {
    /// Convert to string representation (graph-store relation label)
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Follows => "FOLLOWS",
            EdgeKind::CausedBy => "CAUSED_BY",
            EdgeKind::SimilarTo => "SIMILAR_TO",
            EdgeKind::References => "REFERENCES",
            EdgeKind::Summarizes => "SUMMARIZES",
            EdgeKind::SameAs => "SAME_AS",
            EdgeKind::RelatedTo => "RELATED_TO",
            EdgeKind::HasProfile => "HAS_PROFILE",
            EdgeKind::HasPreference => "HAS_PREFERENCE",
            EdgeKind::HasSkill => "HAS_SKILL",
            EdgeKind::DerivedFrom => "DERIVED_FROM",
            EdgeKind::ExhibitsPattern => "EXHIBITS_PATTERN",
            EdgeKind::InterestedIn => "INTERESTED_IN",
            EdgeKind::About => "ABOUT",
            EdgeKind::AbstractedFrom => "ABSTRACTED_FROM",
            EdgeKind::ParentSkill => "PARENT_SKILL",
        }
    }

    /// Parse from the relation label
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "FOLLOWS" => Some(EdgeKind::Follows),
            "CAUSED_BY" => Some(EdgeKind::CausedBy),
            "SIMILAR_TO" => Some(EdgeKind::SimilarTo),
            "REFERENCES" => Some(EdgeKind::References),
            "SUMMARIZES" => Some(EdgeKind::Summarizes),
            "SAME_AS" => Some(EdgeKind::SameAs),
            "RELATED_TO" => Some(EdgeKind::RelatedTo),
            "HAS_PROFILE" => Some(EdgeKind::HasProfile),
            "HAS_PREFERENCE" => Some(EdgeKind::HasPreference),
            "HAS_SKILL" => Some(EdgeKind::HasSkill),
            "DERIVED_FROM" => Some(EdgeKind::DerivedFrom),
            "EXHIBITS_PATTERN" => Some(EdgeKind::ExhibitsPattern),
            "INTERESTED_IN" => Some(EdgeKind::InterestedIn),
            "ABOUT" => Some(EdgeKind::About),
            "ABSTRACTED_FROM" => Some(EdgeKind::AbstractedFrom),
            "PARENT_SKILL" => Some(EdgeKind::ParentSkill),
            _ => None,
        }
    }

    /// Legal source node kinds for this relation
    pub fn legal_sources(&self) -> &'static [NodeKind] {
        match self {
            EdgeKind::Follows | EdgeKind::CausedBy | EdgeKind::SimilarTo | EdgeKind::References => {
                &[NodeKind::Event]
            }
            EdgeKind::Summarizes => &[NodeKind::Summary],
            EdgeKind::SameAs | EdgeKind::RelatedTo => &[NodeKind::Entity],
            EdgeKind::HasProfile
            | EdgeKind::HasPreference
            | EdgeKind::HasSkill
            | EdgeKind::ExhibitsPattern
            | EdgeKind::InterestedIn => &[NodeKind::Entity],
            EdgeKind::DerivedFrom => &[
                NodeKind::Preference,
                NodeKind::Skill,
                NodeKind::Workflow,
                NodeKind::BehavioralPattern,
                NodeKind::Entity,
                NodeKind::UserProfile,
            ],
            EdgeKind::About => &[NodeKind::Preference],
            EdgeKind::AbstractedFrom => &[NodeKind::Workflow],
            EdgeKind::ParentSkill => &[NodeKind::Skill],
        }
    }

    /// Legal target node kinds for this relation
    pub fn legal_targets(&self) -> &'static [NodeKind] {
        match self {
            EdgeKind::Follows | EdgeKind::CausedBy | EdgeKind::SimilarTo => &[NodeKind::Event],
            EdgeKind::References => &[NodeKind::Entity],
            EdgeKind::Summarizes => &[NodeKind::Event, NodeKind::Summary],
            EdgeKind::SameAs | EdgeKind::RelatedTo | EdgeKind::InterestedIn | EdgeKind::About => {
                &[NodeKind::Entity]
            }
            EdgeKind::HasProfile => &[NodeKind::UserProfile],
            EdgeKind::HasPreference => &[NodeKind::Preference],
            EdgeKind::HasSkill => &[NodeKind::Skill],
            EdgeKind::DerivedFrom => &[NodeKind::Event],
            EdgeKind::ExhibitsPattern => &[NodeKind::BehavioralPattern],
            EdgeKind::AbstractedFrom => &[NodeKind::Workflow],
            EdgeKind::ParentSkill => &[NodeKind::Skill],
        }
    }

    /// Whether (source_kind, target_kind) is a legal endpoint pair
    pub fn endpoints_legal(&self, source: NodeKind, target: NodeKind) -> bool {
        self.legal_sources().contains(&source) && self.legal_targets().contains(&target)
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// PROPERTY ENUMS
// ============================================================================

/// How a causal link was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CausalMechanism {
    Direct,
    Inferred,
}

impl CausalMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            CausalMechanism::Direct => "direct",
            CausalMechanism::Inferred => "inferred",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(CausalMechanism::Direct),
            "inferred" => Some(CausalMechanism::Inferred),
            _ => None,
        }
    }
}

/// Semantic role of an entity in an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceRole {
    Agent,
    Instrument,
    Object,
    Result,
    Participant,
}

impl ReferenceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceRole::Agent => "agent",
            ReferenceRole::Instrument => "instrument",
            ReferenceRole::Object => "object",
            ReferenceRole::Result => "result",
            ReferenceRole::Participant => "participant",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(ReferenceRole::Agent),
            "instrument" => Some(ReferenceRole::Instrument),
            "object" => Some(ReferenceRole::Object),
            "result" => Some(ReferenceRole::Result),
            "participant" => Some(ReferenceRole::Participant),
            _ => None,
        }
    }
}

/// How a derived node was obtained from its source events.
///
/// Union of the method sets used across the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationMethod {
    Stated,
    RuleExtraction,
    LlmExtraction,
    FrequencyAnalysis,
    StatisticalInference,
    PatternMatch,
    GraphPattern,
    HierarchyPropagation,
}

impl DerivationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DerivationMethod::Stated => "stated",
            DerivationMethod::RuleExtraction => "rule_extraction",
            DerivationMethod::LlmExtraction => "llm_extraction",
            DerivationMethod::FrequencyAnalysis => "frequency_analysis",
            DerivationMethod::StatisticalInference => "statistical_inference",
            DerivationMethod::PatternMatch => "pattern_match",
            DerivationMethod::GraphPattern => "graph_pattern",
            DerivationMethod::HierarchyPropagation => "hierarchy_propagation",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "stated" => Some(DerivationMethod::Stated),
            "rule_extraction" => Some(DerivationMethod::RuleExtraction),
            "llm_extraction" => Some(DerivationMethod::LlmExtraction),
            "frequency_analysis" => Some(DerivationMethod::FrequencyAnalysis),
            "statistical_inference" => Some(DerivationMethod::StatisticalInference),
            "pattern_match" => Some(DerivationMethod::PatternMatch),
            "graph_pattern" => Some(DerivationMethod::GraphPattern),
            "hierarchy_propagation" => Some(DerivationMethod::HierarchyPropagation),
            _ => None,
        }
    }
}

// ============================================================================
// PROPERTY RECORDS
// ============================================================================

/// FOLLOWS: temporal successor within a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowsProps {
    pub session_id: String,
    pub delta_ms: i64,
}

/// CAUSED_BY: effect points at its cause
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CausedByProps {
    pub mechanism: CausalMechanism,
}

/// SIMILAR_TO: embedding proximity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarToProps {
    pub score: f64,
}

/// REFERENCES: an event mentions an entity in a role
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferencesProps {
    pub role: ReferenceRole,
}

/// SAME_AS / RELATED_TO: entity resolution links (never auto-merged)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityLinkProps {
    pub confidence: f64,
    pub justification: String,
}

/// HAS_SKILL: assessed proficiency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HasSkillProps {
    pub proficiency: f64,
    pub confidence: f64,
    pub last_assessed_at: DateTime<Utc>,
    pub assessment_count: i64,
    pub source: super::node::KnowledgeSource,
}

/// DERIVED_FROM: the provenance back-pointer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedFromProps {
    pub derivation_method: DerivationMethod,
    pub derived_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_quote: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_turn_index: Option<u32>,
}

/// INTERESTED_IN: weighted topical interest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterestedInProps {
    pub weight: f64,
    pub source: super::node::KnowledgeSource,
    pub last_updated: DateTime<Utc>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_kind_roundtrip() {
        for kind in ALL_EDGE_KINDS {
            assert_eq!(EdgeKind::parse_name(kind.as_str()), Some(kind));
        }
        assert_eq!(EdgeKind::parse_name("KNOWS"), None);
    }

    #[test]
    fn endpoint_legality() {
        assert!(EdgeKind::Follows.endpoints_legal(NodeKind::Event, NodeKind::Event));
        assert!(!EdgeKind::Follows.endpoints_legal(NodeKind::Event, NodeKind::Entity));
        assert!(EdgeKind::References.endpoints_legal(NodeKind::Event, NodeKind::Entity));
        assert!(EdgeKind::Summarizes.endpoints_legal(NodeKind::Summary, NodeKind::Summary));
        assert!(EdgeKind::DerivedFrom.endpoints_legal(NodeKind::Preference, NodeKind::Event));
        assert!(!EdgeKind::DerivedFrom.endpoints_legal(NodeKind::Event, NodeKind::Event));
        assert!(EdgeKind::HasPreference.endpoints_legal(NodeKind::Entity, NodeKind::Preference));
        assert!(EdgeKind::About.endpoints_legal(NodeKind::Preference, NodeKind::Entity));
    }

    #[test]
    fn derivation_method_union_is_closed() {
        let all = [
            "stated",
            "rule_extraction",
            "llm_extraction",
            "frequency_analysis",
            "statistical_inference",
            "pattern_match",
            "graph_pattern",
            "hierarchy_propagation",
        ];
        for name in all {
            let parsed = DerivationMethod::parse_name(name).expect(name);
            assert_eq!(parsed.as_str(), name);
        }
        assert_eq!(DerivationMethod::parse_name("guessed"), None);
    }
}
