//! Domain model - typed records, enum closures, envelope validation
//!
//! Pure and side-effect free: validation is independent of any transport
//! framework, and every enum is closed (unknown values are rejected at the
//! boundary, never stored).

mod atlas;
mod edge;
mod event;
mod node;

pub use atlas::{
    AtlasEdge, AtlasMeta, AtlasNode, AtlasResponse, Capacity, Episode, NodeScores, Pagination,
    Provenance, RetrievalReason,
};
pub use edge::{
    CausalMechanism, CausedByProps, DerivationMethod, DerivedFromProps, EdgeKind, EntityLinkProps,
    FollowsProps, HasSkillProps, InterestedInProps, ReferenceRole, ReferencesProps, SimilarToProps,
    ALL_EDGE_KINDS,
};
pub use event::{
    normalize_event_type, validate_event, Event, EventInput, EventStatus, GlobalPosition,
    ValidationIssue, PREFERENCE_STATED_EVENT_TYPE, REFLECTION_EVENT_TYPE, SESSION_END_ALIAS,
    SESSION_END_EVENT_TYPE,
};
pub use node::{
    entity_id, event_node_id, normalize_entity_name, AbstractionLevel, BehavioralPatternNodeAttrs,
    EntityNodeAttrs, EntityType, EventNodeAttrs, KnowledgeSource, NodeKind, PatternType, Polarity,
    PreferenceCategory, PreferenceNodeAttrs, PreferenceScope, SkillNodeAttrs, SummaryNodeAttrs,
    SummaryScope, UserProfileNodeAttrs, WorkflowNodeAttrs,
};
