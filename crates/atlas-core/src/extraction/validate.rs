//! Four-layer extraction validation
//!
//! Applied per item independently; valid items are kept even when siblings
//! fail. The layers:
//!
//! - **L1 Schema**: enum closure, range checks, required fields.
//! - **Evidence grounding**: the `source_quote` must appear in the
//!   reconstructed transcript (fuzzy ratio >= 0.8), the hallucination gate.
//! - **L2 Ontology**: source/confidence alignment (ceilings), cross-field
//!   consistency.
//! - **L4 Confidence gate**: post-ceiling confidence below the source-type
//!   floor rejects the item.
//!
//! L3 (graph-level resolution and supersession) needs store access and lives
//! in [`super::resolve`].

use crate::domain::{
    EntityType, KnowledgeSource, Polarity, PreferenceCategory, PreferenceScope,
};

use super::schema::{
    ExtractedEntity, ExtractedInterest, ExtractedPreference, ExtractedSkill,
    SessionExtractionResult,
};
use super::transcript::Transcript;

/// Minimum fuzzy ratio for a quote to count as present in the transcript
pub const EVIDENCE_RATIO_FLOOR: f64 = 0.8;

// ============================================================================
// CANDIDATES (post-validation, typed)
// ============================================================================

/// Provenance shared by every accepted candidate
#[derive(Debug, Clone)]
pub struct CandidateEvidence {
    pub quote: String,
    pub turn_index: u32,
}

#[derive(Debug, Clone)]
pub struct CandidateEntity {
    pub name: String,
    pub entity_type: EntityType,
    pub confidence: f64,
    pub evidence: CandidateEvidence,
}

#[derive(Debug, Clone)]
pub struct CandidatePreference {
    pub category: PreferenceCategory,
    pub key: String,
    pub value: Option<String>,
    pub polarity: Polarity,
    pub strength: f64,
    pub confidence: f64,
    pub source: KnowledgeSource,
    pub context: Option<String>,
    pub scope: PreferenceScope,
    pub scope_id: Option<String>,
    pub about_entity: Option<String>,
    pub evidence: CandidateEvidence,
}

#[derive(Debug, Clone)]
pub struct CandidateSkill {
    pub name: String,
    pub category: String,
    pub description: Option<String>,
    pub proficiency: f64,
    pub confidence: f64,
    pub source: KnowledgeSource,
    pub evidence: CandidateEvidence,
}

#[derive(Debug, Clone)]
pub struct CandidateInterest {
    pub topic: String,
    pub weight: f64,
    pub confidence: f64,
    pub source: KnowledgeSource,
    pub evidence: CandidateEvidence,
}

/// A rejected item with the layer and reason, for the extraction log
#[derive(Debug, Clone)]
pub struct RejectedItem {
    pub target: &'static str,
    pub reason: String,
}

/// Per-item validation outcome for a whole extraction result
#[derive(Debug, Clone, Default)]
pub struct ValidatedExtraction {
    pub entities: Vec<CandidateEntity>,
    pub preferences: Vec<CandidatePreference>,
    pub skills: Vec<CandidateSkill>,
    pub interests: Vec<CandidateInterest>,
    pub rejected: Vec<RejectedItem>,
}

impl ValidatedExtraction {
    /// Number of accepted items
    pub fn accepted_count(&self) -> usize {
        self.entities.len() + self.preferences.len() + self.skills.len() + self.interests.len()
    }
}

// ============================================================================
// VALIDATION
// ============================================================================

/// Run L1/L2/L4 plus evidence grounding over every extraction item
pub fn validate_extraction(
    result: &SessionExtractionResult,
    transcript: &Transcript,
) -> ValidatedExtraction {
    let haystack = normalize(&transcript.full_text());
    let mut out = ValidatedExtraction::default();

    for item in &result.entities {
        match validate_entity(item, &haystack) {
            Ok(candidate) => out.entities.push(candidate),
            Err(reason) => out.rejected.push(RejectedItem { target: "entity", reason }),
        }
    }
    for item in &result.preferences {
        match validate_preference(item, &haystack) {
            Ok(candidate) => out.preferences.push(candidate),
            Err(reason) => out.rejected.push(RejectedItem { target: "preference", reason }),
        }
    }
    for item in &result.skills {
        match validate_skill(item, &haystack) {
            Ok(candidate) => out.skills.push(candidate),
            Err(reason) => out.rejected.push(RejectedItem { target: "skill", reason }),
        }
    }
    for item in &result.interests {
        match validate_interest(item, &haystack) {
            Ok(candidate) => out.interests.push(candidate),
            Err(reason) => out.rejected.push(RejectedItem { target: "interest", reason }),
        }
    }
    out
}

fn validate_evidence(
    quote: &str,
    turn_index: u32,
    haystack: &str,
) -> Result<CandidateEvidence, String> {
    if quote.trim().is_empty() {
        return Err("empty source_quote".to_string());
    }
    let ratio = fuzzy_contains_ratio(haystack, &normalize(quote));
    if ratio < EVIDENCE_RATIO_FLOOR {
        return Err(format!(
            "source_quote not grounded in transcript (ratio {ratio:.2})"
        ));
    }
    Ok(CandidateEvidence {
        quote: quote.to_string(),
        turn_index,
    })
}

/// L2 source alignment + L4 floor gate; returns the post-ceiling confidence
fn gate_confidence(reported: f64, source: KnowledgeSource) -> Result<f64, String> {
    if !(0.0..=1.0).contains(&reported) {
        return Err(format!("confidence {reported} outside [0, 1]"));
    }
    let capped = reported.min(source.confidence_ceiling());
    if capped < source.confidence_floor() {
        return Err(format!(
            "confidence {capped:.2} below {} floor {:.2}",
            source.as_str(),
            source.confidence_floor()
        ));
    }
    Ok(capped)
}

fn parse_source(raw: &str) -> Result<KnowledgeSource, String> {
    KnowledgeSource::parse_name(raw).ok_or_else(|| format!("unknown source '{raw}'"))
}

fn require_unit(value: f64, field: &str) -> Result<f64, String> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{field} {value} outside [0, 1]"))
    }
}

fn validate_entity(item: &ExtractedEntity, haystack: &str) -> Result<CandidateEntity, String> {
    if item.name.trim().is_empty() {
        return Err("empty entity name".to_string());
    }
    let entity_type = EntityType::parse_name(&item.entity_type)
        .ok_or_else(|| format!("unknown entity type '{}'", item.entity_type))?;
    let confidence = require_unit(item.confidence, "confidence")?;
    let evidence = validate_evidence(&item.source_quote, item.source_turn_index, haystack)?;
    Ok(CandidateEntity {
        name: item.name.trim().to_string(),
        entity_type,
        confidence,
        evidence,
    })
}

fn validate_preference(
    item: &ExtractedPreference,
    haystack: &str,
) -> Result<CandidatePreference, String> {
    let category = PreferenceCategory::parse_name(&item.category)
        .ok_or_else(|| format!("unknown category '{}'", item.category))?;
    if item.key.trim().is_empty() {
        return Err("empty preference key".to_string());
    }
    let polarity = Polarity::parse_name(&item.polarity)
        .ok_or_else(|| format!("unknown polarity '{}'", item.polarity))?;
    let strength = require_unit(item.strength, "strength")?;
    let source = parse_source(&item.source)?;
    let scope = PreferenceScope::parse_name(&item.scope)
        .ok_or_else(|| format!("unknown scope '{}'", item.scope))?;

    // Cross-field consistency: a non-global scope must name its scope id
    if scope != PreferenceScope::Global && item.scope_id.as_deref().unwrap_or("").is_empty() {
        return Err(format!("scope '{}' without scope_id", item.scope));
    }

    let confidence = gate_confidence(item.confidence, source)?;
    let evidence = validate_evidence(&item.source_quote, item.source_turn_index, haystack)?;

    Ok(CandidatePreference {
        category,
        key: item.key.trim().to_string(),
        value: item.value.clone(),
        polarity,
        strength,
        confidence,
        source,
        context: item.context.clone(),
        scope,
        scope_id: item.scope_id.clone(),
        about_entity: item.about_entity.clone(),
        evidence,
    })
}

fn validate_skill(item: &ExtractedSkill, haystack: &str) -> Result<CandidateSkill, String> {
    if item.name.trim().is_empty() {
        return Err("empty skill name".to_string());
    }
    let proficiency = require_unit(item.proficiency, "proficiency")?;
    let source = parse_source(&item.source)?;
    let confidence = gate_confidence(item.confidence, source)?;
    let evidence = validate_evidence(&item.source_quote, item.source_turn_index, haystack)?;
    Ok(CandidateSkill {
        name: item.name.trim().to_string(),
        category: item.category.trim().to_string(),
        description: item.description.clone(),
        proficiency,
        confidence,
        source,
        evidence,
    })
}

fn validate_interest(item: &ExtractedInterest, haystack: &str) -> Result<CandidateInterest, String> {
    if item.topic.trim().is_empty() {
        return Err("empty interest topic".to_string());
    }
    let weight = require_unit(item.weight, "weight")?;
    let source = parse_source(&item.source)?;
    let confidence = gate_confidence(item.confidence, source)?;
    let evidence = validate_evidence(&item.source_quote, item.source_turn_index, haystack)?;
    Ok(CandidateInterest {
        topic: item.topic.trim().to_string(),
        weight,
        confidence,
        source,
        evidence,
    })
}

// ============================================================================
// FUZZY MATCHING
// ============================================================================

fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Best similarity of `needle` against any window of `haystack`.
///
/// Exact substring scores 1.0; otherwise a sliding window of the needle's
/// length is compared by normalized edit distance.
pub fn fuzzy_contains_ratio(haystack: &str, needle: &str) -> f64 {
    if needle.is_empty() {
        return 0.0;
    }
    if haystack.contains(needle) {
        return 1.0;
    }
    let haystack: Vec<char> = haystack.chars().collect();
    let needle: Vec<char> = needle.chars().collect();
    if haystack.len() < needle.len() {
        return similarity(&haystack, &needle);
    }

    let step = (needle.len() / 4).max(1);
    let mut best = 0.0f64;
    let mut start = 0;
    while start + needle.len() <= haystack.len() {
        let window = &haystack[start..start + needle.len()];
        best = best.max(similarity(window, &needle));
        if best >= 1.0 {
            break;
        }
        start += step;
    }
    best
}

fn similarity(a: &[char], b: &[char]) -> f64 {
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Event;
    use chrono::Utc;

    fn transcript_with(text: &str) -> Transcript {
        let event = Event {
            event_id: "e1".to_string(),
            event_type: "user.message".to_string(),
            occurred_at: Utc::now(),
            session_id: "s1".to_string(),
            agent_id: "a1".to_string(),
            trace_id: "t1".to_string(),
            payload_ref: "p1".to_string(),
            global_position: None,
            tool_name: None,
            parent_event_id: None,
            ended_at: None,
            status: None,
            schema_version: None,
            importance_hint: None,
        };
        Transcript::from_events("s1", &[(event, Some(text.to_string()))])
    }

    fn preference(confidence: f64, source: &str, quote: &str) -> ExtractedPreference {
        ExtractedPreference {
            category: "communication".to_string(),
            key: "notification_method".to_string(),
            value: Some("email".to_string()),
            polarity: "positive".to_string(),
            strength: 0.8,
            confidence,
            source: source.to_string(),
            context: None,
            scope: "global".to_string(),
            scope_id: None,
            about_entity: Some("email".to_string()),
            source_quote: quote.to_string(),
            source_turn_index: 0,
        }
    }

    #[test]
    fn grounded_preference_passes_with_capped_confidence() {
        let transcript = transcript_with("Please send me notifications by email, always.");
        let result = SessionExtractionResult {
            preferences: vec![preference(0.99, "explicit", "send me notifications by email")],
            ..SessionExtractionResult::default()
        };
        let validated = validate_extraction(&result, &transcript);
        assert_eq!(validated.preferences.len(), 1);
        // 0.99 reported, explicit ceiling 0.95
        assert!((validated.preferences[0].confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn hallucinated_quote_is_rejected() {
        let transcript = transcript_with("We talked about the weather today.");
        let result = SessionExtractionResult {
            preferences: vec![preference(0.9, "explicit", "I demand all alerts via carrier pigeon")],
            ..SessionExtractionResult::default()
        };
        let validated = validate_extraction(&result, &transcript);
        assert!(validated.preferences.is_empty());
        assert_eq!(validated.rejected.len(), 1);
        assert!(validated.rejected[0].reason.contains("not grounded"));
    }

    #[test]
    fn near_verbatim_quote_passes_the_fuzzy_gate() {
        let transcript = transcript_with("Please send me notifications by email, always.");
        // Quote differs in one word from the transcript text
        let result = SessionExtractionResult {
            preferences: vec![preference(0.9, "explicit", "send me notification by email")],
            ..SessionExtractionResult::default()
        };
        let validated = validate_extraction(&result, &transcript);
        assert_eq!(validated.preferences.len(), 1);
    }

    #[test]
    fn below_floor_confidence_is_rejected_with_no_side_effect() {
        let transcript = transcript_with("maybe email is fine sometimes");
        let result = SessionExtractionResult {
            preferences: vec![preference(0.2, "inferred", "maybe email is fine")],
            ..SessionExtractionResult::default()
        };
        let validated = validate_extraction(&result, &transcript);
        assert!(validated.preferences.is_empty());
        assert!(validated.rejected[0].reason.contains("below"));
    }

    #[test]
    fn unknown_enum_rejects_only_that_item() {
        let transcript = transcript_with("I prefer email and I know rust quite well");
        let mut bad = preference(0.9, "explicit", "I prefer email");
        bad.polarity = "lukewarm".to_string();
        let result = SessionExtractionResult {
            preferences: vec![bad, preference(0.9, "explicit", "I prefer email")],
            skills: vec![ExtractedSkill {
                name: "rust".to_string(),
                category: "language".to_string(),
                description: None,
                proficiency: 0.7,
                confidence: 0.8,
                source: "implicit_intentional".to_string(),
                source_quote: "I know rust quite well".to_string(),
                source_turn_index: 0,
            }],
            ..SessionExtractionResult::default()
        };
        let validated = validate_extraction(&result, &transcript);
        assert_eq!(validated.preferences.len(), 1);
        assert_eq!(validated.skills.len(), 1);
        assert_eq!(validated.rejected.len(), 1);
    }

    #[test]
    fn non_global_scope_requires_scope_id() {
        let transcript = transcript_with("for this session use email");
        let mut item = preference(0.9, "explicit", "use email");
        item.scope = "session".to_string();
        let result = SessionExtractionResult {
            preferences: vec![item],
            ..SessionExtractionResult::default()
        };
        let validated = validate_extraction(&result, &transcript);
        assert!(validated.preferences.is_empty());
    }

    #[test]
    fn fuzzy_ratio_behaves() {
        assert_eq!(fuzzy_contains_ratio("abc def ghi", "def"), 1.0);
        assert!(fuzzy_contains_ratio("abc def ghi", "xyz") < 0.5);
        assert!(fuzzy_contains_ratio("the quick brown fox", "quick brwn fox") >= 0.8);
        assert_eq!(fuzzy_contains_ratio("anything", ""), 0.0);
    }
}
