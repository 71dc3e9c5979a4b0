//! Session knowledge extraction
//!
//! Turns session transcripts into validated personalization knowledge:
//! schema-as-prompt extraction through a provider seam, four-layer
//! validation with evidence grounding, and three-tier entity resolution.

mod provider;
mod resolve;
mod schema;
mod transcript;
mod validate;

pub use provider::{
    ExtractionError, ExtractionProvider, HttpExtractionProvider, RuleBasedExtractor,
    PROMPT_VERSION,
};
pub use resolve::{
    canonical_entity_name, resolve_entity, ResolutionTier, ResolvedEntity, SAME_AS_SIMILARITY,
};
pub use schema::{
    extraction_tool_schemas, ExtractedEntity, ExtractedInterest, ExtractedPreference,
    ExtractedSkill, SessionExtractionResult,
};
pub use transcript::{Transcript, TranscriptTurn, TurnRole};
pub use validate::{
    fuzzy_contains_ratio, validate_extraction, CandidateEntity, CandidateEvidence,
    CandidateInterest, CandidatePreference, CandidateSkill, RejectedItem, ValidatedExtraction,
    EVIDENCE_RATIO_FLOOR,
};
