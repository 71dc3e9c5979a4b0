//! Extraction result schema - the "schema-as-prompt" contract
//!
//! Each extraction target type is exposed to the LLM as a callable tool with
//! a strictly typed schema. Enum fields arrive as raw strings and are closed
//! by L1 validation; nothing here is trusted.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// An entity mentioned in the session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
    pub confidence: f64,
    pub source_quote: String,
    pub source_turn_index: u32,
}

/// A user preference observed or stated in the session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExtractedPreference {
    pub category: String,
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    pub polarity: String,
    #[serde(default = "default_strength")]
    pub strength: f64,
    pub confidence: f64,
    pub source: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default)]
    pub scope_id: Option<String>,
    /// Entity the preference is about, when entity-scoped
    #[serde(default)]
    pub about_entity: Option<String>,
    pub source_quote: String,
    pub source_turn_index: u32,
}

fn default_strength() -> f64 {
    0.5
}

fn default_scope() -> String {
    "global".to_string()
}

/// A demonstrated or stated skill
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExtractedSkill {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_strength")]
    pub proficiency: f64,
    pub confidence: f64,
    pub source: String,
    pub source_quote: String,
    pub source_turn_index: u32,
}

/// A topical interest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExtractedInterest {
    pub topic: String,
    #[serde(default = "default_strength")]
    pub weight: f64,
    pub confidence: f64,
    pub source: String,
    pub source_quote: String,
    pub source_turn_index: u32,
}

/// Everything an extraction pass can yield for one session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionExtractionResult {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub preferences: Vec<ExtractedPreference>,
    #[serde(default)]
    pub skills: Vec<ExtractedSkill>,
    #[serde(default)]
    pub interests: Vec<ExtractedInterest>,
}

impl SessionExtractionResult {
    /// Total number of extraction items across all target types
    pub fn item_count(&self) -> usize {
        self.entities.len() + self.preferences.len() + self.skills.len() + self.interests.len()
    }
}

/// JSON Schemas for the four extraction tools, sent to the provider so the
/// schema is enforced at the function-calling layer
pub fn extraction_tool_schemas() -> Vec<(&'static str, Value)> {
    let quote_fields = json!({
        "sourceQuote": {"type": "string", "description": "verbatim quote from the transcript"},
        "sourceTurnIndex": {"type": "integer", "minimum": 0}
    });
    vec![
        (
            "record_entities",
            json!({
                "type": "object",
                "properties": {"entities": {"type": "array", "items": {
                    "type": "object",
                    "required": ["name", "entityType", "confidence", "sourceQuote", "sourceTurnIndex"],
                    "properties": {
                        "name": {"type": "string"},
                        "entityType": {"enum": ["agent", "user", "tool", "service", "resource", "concept"]},
                        "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                        "sourceQuote": quote_fields["sourceQuote"],
                        "sourceTurnIndex": quote_fields["sourceTurnIndex"]
                    }
                }}},
                "required": ["entities"]
            }),
        ),
        (
            "record_preferences",
            json!({
                "type": "object",
                "properties": {"preferences": {"type": "array", "items": {
                    "type": "object",
                    "required": ["category", "key", "polarity", "confidence", "source",
                                 "sourceQuote", "sourceTurnIndex"],
                    "properties": {
                        "category": {"enum": ["tool", "workflow", "communication", "domain", "environment", "style"]},
                        "key": {"type": "string"},
                        "value": {"type": "string"},
                        "polarity": {"enum": ["positive", "negative", "neutral"]},
                        "strength": {"type": "number", "minimum": 0, "maximum": 1},
                        "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                        "source": {"enum": ["explicit", "implicit_intentional", "implicit_unintentional", "inferred"]},
                        "context": {"type": "string"},
                        "scope": {"enum": ["global", "agent", "session"]},
                        "scopeId": {"type": "string"},
                        "aboutEntity": {"type": "string"},
                        "sourceQuote": quote_fields["sourceQuote"],
                        "sourceTurnIndex": quote_fields["sourceTurnIndex"]
                    }
                }}},
                "required": ["preferences"]
            }),
        ),
        (
            "record_skills",
            json!({
                "type": "object",
                "properties": {"skills": {"type": "array", "items": {
                    "type": "object",
                    "required": ["name", "category", "confidence", "source", "sourceQuote", "sourceTurnIndex"],
                    "properties": {
                        "name": {"type": "string"},
                        "category": {"type": "string"},
                        "description": {"type": "string"},
                        "proficiency": {"type": "number", "minimum": 0, "maximum": 1},
                        "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                        "source": {"enum": ["explicit", "implicit_intentional", "implicit_unintentional", "inferred"]},
                        "sourceQuote": quote_fields["sourceQuote"],
                        "sourceTurnIndex": quote_fields["sourceTurnIndex"]
                    }
                }}},
                "required": ["skills"]
            }),
        ),
        (
            "record_interests",
            json!({
                "type": "object",
                "properties": {"interests": {"type": "array", "items": {
                    "type": "object",
                    "required": ["topic", "confidence", "source", "sourceQuote", "sourceTurnIndex"],
                    "properties": {
                        "topic": {"type": "string"},
                        "weight": {"type": "number", "minimum": 0, "maximum": 1},
                        "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                        "source": {"enum": ["explicit", "implicit_intentional", "implicit_unintentional", "inferred"]},
                        "sourceQuote": quote_fields["sourceQuote"],
                        "sourceTurnIndex": quote_fields["sourceTurnIndex"]
                    }
                }}},
                "required": ["interests"]
            }),
        ),
    ]
}
