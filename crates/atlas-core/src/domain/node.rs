//! Graph node kinds - the semantic projection vocabulary
//!
//! A tagged union with a `kind` discriminator and per-kind attribute records.
//! Every derived node carries back-pointers to its source events via
//! DERIVED_FROM edges; scoring state (access_count, last_accessed_at,
//! stability) lives on graph nodes only.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::event::{Event, EventStatus};

// ============================================================================
// NODE KIND
// ============================================================================

/// Discriminator for the eight node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Event,
    Entity,
    Summary,
    UserProfile,
    Preference,
    Skill,
    Workflow,
    BehavioralPattern,
}

impl NodeKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Event => "event",
            NodeKind::Entity => "entity",
            NodeKind::Summary => "summary",
            NodeKind::UserProfile => "user_profile",
            NodeKind::Preference => "preference",
            NodeKind::Skill => "skill",
            NodeKind::Workflow => "workflow",
            NodeKind::BehavioralPattern => "behavioral_pattern",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "event" => Some(NodeKind::Event),
            "entity" => Some(NodeKind::Entity),
            "summary" => Some(NodeKind::Summary),
            "user_profile" => Some(NodeKind::UserProfile),
            "preference" => Some(NodeKind::Preference),
            "skill" => Some(NodeKind::Skill),
            "workflow" => Some(NodeKind::Workflow),
            "behavioral_pattern" => Some(NodeKind::BehavioralPattern),
            _ => None,
        }
    }

    /// Whether nodes of this kind are derived (require DERIVED_FROM provenance)
    pub fn is_derived(&self) -> bool {
        matches!(
            self,
            NodeKind::Preference | NodeKind::Skill | NodeKind::Workflow | NodeKind::BehavioralPattern
        )
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// SUPPORTING ENUMS
// ============================================================================

/// Entity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Agent,
    User,
    Tool,
    Service,
    Resource,
    Concept,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Agent => "agent",
            EntityType::User => "user",
            EntityType::Tool => "tool",
            EntityType::Service => "service",
            EntityType::Resource => "resource",
            EntityType::Concept => "concept",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(EntityType::Agent),
            "user" => Some(EntityType::User),
            "tool" => Some(EntityType::Tool),
            "service" => Some(EntityType::Service),
            "resource" => Some(EntityType::Resource),
            "concept" => Some(EntityType::Concept),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scope of a summary node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryScope {
    Episode,
    Session,
    Agent,
}

impl SummaryScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryScope::Episode => "episode",
            SummaryScope::Session => "session",
            SummaryScope::Agent => "agent",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "episode" => Some(SummaryScope::Episode),
            "session" => Some(SummaryScope::Session),
            "agent" => Some(SummaryScope::Agent),
            _ => None,
        }
    }
}

/// Preference category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferenceCategory {
    Tool,
    Workflow,
    Communication,
    Domain,
    Environment,
    Style,
}

impl PreferenceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreferenceCategory::Tool => "tool",
            PreferenceCategory::Workflow => "workflow",
            PreferenceCategory::Communication => "communication",
            PreferenceCategory::Domain => "domain",
            PreferenceCategory::Environment => "environment",
            PreferenceCategory::Style => "style",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "tool" => Some(PreferenceCategory::Tool),
            "workflow" => Some(PreferenceCategory::Workflow),
            "communication" => Some(PreferenceCategory::Communication),
            "domain" => Some(PreferenceCategory::Domain),
            "environment" => Some(PreferenceCategory::Environment),
            "style" => Some(PreferenceCategory::Style),
            _ => None,
        }
    }
}

/// Polarity of a preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Positive,
    Negative,
    Neutral,
}

impl Polarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Polarity::Positive => "positive",
            Polarity::Negative => "negative",
            Polarity::Neutral => "neutral",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "positive" => Some(Polarity::Positive),
            "negative" => Some(Polarity::Negative),
            "neutral" => Some(Polarity::Neutral),
            _ => None,
        }
    }

    /// Whether two polarities contradict each other for the same key
    pub fn contradicts(&self, other: Polarity) -> bool {
        matches!(
            (self, other),
            (Polarity::Positive, Polarity::Negative) | (Polarity::Negative, Polarity::Positive)
        )
    }
}

/// How a piece of knowledge was obtained.
///
/// Orders from most to least reliable; ceilings and floors in the extraction
/// pipeline are keyed off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeSource {
    Explicit,
    ImplicitIntentional,
    ImplicitUnintentional,
    Inferred,
}

impl KnowledgeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeSource::Explicit => "explicit",
            KnowledgeSource::ImplicitIntentional => "implicit_intentional",
            KnowledgeSource::ImplicitUnintentional => "implicit_unintentional",
            KnowledgeSource::Inferred => "inferred",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "explicit" => Some(KnowledgeSource::Explicit),
            "implicit_intentional" => Some(KnowledgeSource::ImplicitIntentional),
            "implicit_unintentional" => Some(KnowledgeSource::ImplicitUnintentional),
            "inferred" => Some(KnowledgeSource::Inferred),
            _ => None,
        }
    }

    /// Initial-confidence ceiling for this source type
    pub fn confidence_ceiling(&self) -> f64 {
        match self {
            KnowledgeSource::Explicit => 0.95,
            KnowledgeSource::ImplicitIntentional => 0.75,
            KnowledgeSource::ImplicitUnintentional => 0.6,
            KnowledgeSource::Inferred => 0.5,
        }
    }

    /// Minimum acceptable confidence; items below are rejected
    pub fn confidence_floor(&self) -> f64 {
        match self {
            KnowledgeSource::Explicit => 0.7,
            KnowledgeSource::ImplicitIntentional => 0.4,
            KnowledgeSource::ImplicitUnintentional => 0.3,
            KnowledgeSource::Inferred => 0.15,
        }
    }
}

/// Scope at which a preference applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferenceScope {
    Global,
    Agent,
    Session,
}

impl PreferenceScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreferenceScope::Global => "global",
            PreferenceScope::Agent => "agent",
            PreferenceScope::Session => "session",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "global" => Some(PreferenceScope::Global),
            "agent" => Some(PreferenceScope::Agent),
            "session" => Some(PreferenceScope::Session),
            _ => None,
        }
    }
}

/// Workflow abstraction level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbstractionLevel {
    Case,
    Strategy,
    Skill,
}

impl AbstractionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbstractionLevel::Case => "case",
            AbstractionLevel::Strategy => "strategy",
            AbstractionLevel::Skill => "skill",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "case" => Some(AbstractionLevel::Case),
            "strategy" => Some(AbstractionLevel::Strategy),
            "skill" => Some(AbstractionLevel::Skill),
            _ => None,
        }
    }
}

/// Behavioral pattern classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    Delegation,
    Escalation,
    Routine,
    Avoidance,
    Exploration,
    Specialization,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Delegation => "delegation",
            PatternType::Escalation => "escalation",
            PatternType::Routine => "routine",
            PatternType::Avoidance => "avoidance",
            PatternType::Exploration => "exploration",
            PatternType::Specialization => "specialization",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "delegation" => Some(PatternType::Delegation),
            "escalation" => Some(PatternType::Escalation),
            "routine" => Some(PatternType::Routine),
            "avoidance" => Some(PatternType::Avoidance),
            "exploration" => Some(PatternType::Exploration),
            "specialization" => Some(PatternType::Specialization),
            _ => None,
        }
    }
}

// ============================================================================
// PER-KIND ATTRIBUTE RECORDS
// ============================================================================

/// Event node attributes: the event envelope plus enrichment-derived fields
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventNodeAttrs {
    pub event_id: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub session_id: String,
    pub agent_id: String,
    pub trace_id: String,
    pub payload_ref: String,
    pub global_position: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance_hint: Option<u8>,
    // Derived by enrichment
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl EventNodeAttrs {
    /// Build node attributes from an appended event (position must be assigned)
    pub fn from_event(event: &Event) -> Self {
        Self {
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            occurred_at: event.occurred_at,
            session_id: event.session_id.clone(),
            agent_id: event.agent_id.clone(),
            trace_id: event.trace_id.clone(),
            payload_ref: event.payload_ref.clone(),
            global_position: event
                .global_position
                .map(|p| p.to_string())
                .unwrap_or_default(),
            tool_name: event.tool_name.clone(),
            parent_event_id: event.parent_event_id.clone(),
            ended_at: event.ended_at,
            status: event.status,
            importance_hint: event.importance_hint,
            keywords: Vec::new(),
            summary: None,
        }
    }
}

/// Entity node attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityNodeAttrs {
    pub entity_id: String,
    pub name: String,
    pub entity_type: EntityType,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub mention_count: i64,
    /// Set when the entity name was erased for GDPR
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tombstoned: bool,
}

/// Summary node attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryNodeAttrs {
    pub summary_id: String,
    pub scope: SummaryScope,
    pub scope_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub event_count: i64,
    pub time_range_start: DateTime<Utc>,
    pub time_range_end: DateTime<Utc>,
}

/// User profile node attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfileNodeAttrs {
    pub profile_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub communication_style: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical_level: Option<String>,
}

/// Preference node attributes.
///
/// Supersession is append-only: a contradicting preference never overwrites,
/// it sets `superseded_by` on the older node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceNodeAttrs {
    pub preference_id: String,
    pub category: PreferenceCategory,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub polarity: Polarity,
    pub strength: f64,
    pub confidence: f64,
    pub source: KnowledgeSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub scope: PreferenceScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    pub observation_count: i64,
    pub first_observed_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

/// Skill node attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillNodeAttrs {
    pub skill_id: String,
    pub name: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Workflow node attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNodeAttrs {
    pub workflow_id: String,
    pub name: String,
    pub abstraction_level: AbstractionLevel,
    pub success_rate: f64,
    pub execution_count: i64,
    pub avg_duration_ms: f64,
    pub source_session_ids: Vec<String>,
}

/// Behavioral pattern node attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehavioralPatternNodeAttrs {
    pub pattern_id: String,
    pub pattern_type: PatternType,
    pub description: String,
    pub confidence: f64,
    pub observation_count: i64,
    pub involved_agents: Vec<String>,
    pub first_detected_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
}

// ============================================================================
// DETERMINISTIC IDS
// ============================================================================

/// Normalize an entity name for canonical-key matching: lowercase, trim,
/// collapse internal whitespace.
pub fn normalize_entity_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic entity id from normalized name + type, so replay and
/// concurrent writers converge on one node per real-world entity.
pub fn entity_id(name: &str, entity_type: EntityType) -> String {
    let canonical = format!("{}:{}", normalize_entity_name(name), entity_type.as_str());
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(24);
    for byte in digest.iter().take(12) {
        hex.push_str(&format!("{:02x}", byte));
    }
    format!("ent_{}", hex)
}

/// Node id for an event's graph projection (stable across replays)
pub fn event_node_id(event_id: &str) -> String {
    format!("evt_{}", event_id)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_kind_roundtrip() {
        for kind in [
            NodeKind::Event,
            NodeKind::Entity,
            NodeKind::Summary,
            NodeKind::UserProfile,
            NodeKind::Preference,
            NodeKind::Skill,
            NodeKind::Workflow,
            NodeKind::BehavioralPattern,
        ] {
            assert_eq!(NodeKind::parse_name(kind.as_str()), Some(kind));
        }
        assert_eq!(NodeKind::parse_name("nonsense"), None);
    }

    #[test]
    fn derived_kinds_require_provenance() {
        assert!(NodeKind::Preference.is_derived());
        assert!(NodeKind::Workflow.is_derived());
        assert!(!NodeKind::Event.is_derived());
        assert!(!NodeKind::Entity.is_derived());
    }

    #[test]
    fn entity_id_is_deterministic_and_normalized() {
        let a = entity_id("  Visual  Studio Code ", EntityType::Tool);
        let b = entity_id("visual studio code", EntityType::Tool);
        assert_eq!(a, b);
        assert!(a.starts_with("ent_"));
        // Different type yields a different entity
        assert_ne!(a, entity_id("visual studio code", EntityType::Concept));
    }

    #[test]
    fn source_ceilings_dominate_floors() {
        for source in [
            KnowledgeSource::Explicit,
            KnowledgeSource::ImplicitIntentional,
            KnowledgeSource::ImplicitUnintentional,
            KnowledgeSource::Inferred,
        ] {
            assert!(source.confidence_floor() < source.confidence_ceiling());
        }
    }

    #[test]
    fn polarity_contradiction() {
        assert!(Polarity::Positive.contradicts(Polarity::Negative));
        assert!(!Polarity::Positive.contradicts(Polarity::Neutral));
        assert!(!Polarity::Neutral.contradicts(Polarity::Neutral));
    }
}
