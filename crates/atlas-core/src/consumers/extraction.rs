//! Consumer 2 - session knowledge extraction
//!
//! Triggered by `system.session_end` or by a session's turn counter crossing
//! the threshold. Reconstructs the transcript, invokes the extraction
//! provider, runs the four validation layers, resolves entities, and writes
//! the personalization subgraph with full DERIVED_FROM provenance.
//!
//! Extraction is best-effort: a session where every item is rejected is
//! logged and acknowledged. Provider outages requeue.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::domain::{
    event_node_id, DerivationMethod, DerivedFromProps, EdgeKind, EntityType, Event, NodeKind,
    Polarity, PreferenceNodeAttrs, SkillNodeAttrs,
};
use crate::extraction::{
    resolve_entity, validate_extraction, CandidateEvidence, CandidateInterest, CandidatePreference,
    CandidateSkill, ExtractionError, Transcript, ValidatedExtraction,
};
use crate::graph::{GraphError, NodeRecord, StoredNode};
use crate::scoring::preference_base_stability_hours;

use super::{deterministic_id, ensure_user_nodes, ConsumerContext, GROUP_EXTRACTION};

enum Outcome {
    Processed,
    Requeue(String),
}

/// Session extraction consumer
pub struct ExtractionConsumer {
    ctx: ConsumerContext,
    consumer_name: String,
    /// Turns seen per session since the last extraction pass
    turn_counts: Mutex<HashMap<String, u64>>,
}

impl ExtractionConsumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self {
            ctx,
            consumer_name: "extraction-1".to_string(),
            turn_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Long-running loop; exits on shutdown signal
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let poll = Duration::from_millis(self.ctx.config.consumers.poll_interval_ms);
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.run_once().await {
                Ok(0) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(%error, "extraction batch failed");
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }

    /// Process one delivery batch
    pub async fn run_once(&self) -> crate::eventstore::Result<usize> {
        let batch = self.ctx.events.read_group(
            GROUP_EXTRACTION,
            &self.consumer_name,
            self.ctx.config.consumers.batch_size,
            Duration::from_millis(self.ctx.config.consumers.claim_idle_ms),
            None,
        )?;
        let count = batch.len();

        for entry in batch {
            let event = &entry.event;
            let outcome = if event.is_session_end() {
                self.extract_session(&event.session_id).await
            } else if self.bump_turn_counter(event) {
                self.extract_session(&event.session_id).await
            } else {
                Outcome::Processed
            };

            match outcome {
                Outcome::Processed => {
                    self.ctx.events.ack(GROUP_EXTRACTION, entry.position)?;
                }
                Outcome::Requeue(reason) => {
                    tracing::debug!(%reason, session = %event.session_id, "extraction requeue");
                }
            }
        }
        Ok(count)
    }

    /// Count user turns; true when the threshold is crossed
    fn bump_turn_counter(&self, event: &Event) -> bool {
        let is_turn = matches!(
            crate::extraction::TurnRole::from_event_type(&event.event_type),
            crate::extraction::TurnRole::User
        );
        if !is_turn {
            return false;
        }
        let threshold = self.ctx.config.extraction.turn_threshold.max(1);
        let Ok(mut counts) = self.turn_counts.lock() else {
            return false;
        };
        let count = counts.entry(event.session_id.clone()).or_insert(0);
        *count += 1;
        if *count >= threshold {
            *count = 0;
            true
        } else {
            false
        }
    }

    // ========================================================================
    // THE EXTRACTION PASS
    // ========================================================================

    async fn extract_session(&self, session_id: &str) -> Outcome {
        // 1. Collect session events and reconstruct the transcript
        let events = match self.ctx.events.get_by_session(session_id, None, None, 2048) {
            Ok(events) => events,
            Err(error) => return Outcome::Requeue(error.to_string()),
        };
        let with_payloads: Vec<(Event, Option<String>)> = events
            .into_iter()
            .map(|event| {
                let payload = self.ctx.payloads.get(&event.payload_ref).ok().flatten();
                (event, payload)
            })
            .collect();
        let transcript = Transcript::from_events(session_id, &with_payloads);
        if !transcript.has_user_turns() {
            return Outcome::Processed;
        }

        // 2. Invoke the provider with the known-entity inventory
        let known_entities: Vec<String> = self
            .ctx
            .graph
            .list_entities(50)
            .map(|entities| {
                entities
                    .iter()
                    .filter_map(|e| e.attrs["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let result = match self
            .ctx
            .provider
            .extract_from_session(&transcript, &known_entities)
            .await
        {
            Ok(result) => result,
            Err(ExtractionError::Unavailable(reason)) => return Outcome::Requeue(reason),
            Err(ExtractionError::RateLimited(after)) => {
                return Outcome::Requeue(format!("rate limited for {after:?}"))
            }
            Err(error @ ExtractionError::SchemaViolation(_)) => {
                // Best-effort: the session yields nothing this pass
                tracing::warn!(%error, session = %session_id, "extraction gave up");
                return Outcome::Processed;
            }
            Err(error) => {
                tracing::warn!(%error, session = %session_id, "extraction failed");
                return Outcome::Processed;
            }
        };

        // 3-5. Four-layer validation with evidence grounding and ceilings
        let validated = validate_extraction(&result, &transcript);
        self.ctx
            .metrics
            .record_extraction_session(validated.rejected.len() as u64);
        if validated.accepted_count() == 0 {
            if !validated.rejected.is_empty() {
                tracing::info!(
                    session = %session_id,
                    rejected = validated.rejected.len(),
                    "every extraction item was rejected"
                );
            }
            return Outcome::Processed;
        }

        // 6-8. Entity resolution and the write phase
        match self.write_validated(session_id, &transcript, &validated, &with_payloads) {
            Ok(()) => Outcome::Processed,
            Err(GraphError::Unavailable(reason)) => Outcome::Requeue(reason),
            Err(error) => {
                tracing::warn!(%error, session = %session_id, "extraction write failed");
                Outcome::Processed
            }
        }
    }

    /// Persist validated knowledge; per-item failures never sink the batch
    fn write_validated(
        &self,
        session_id: &str,
        transcript: &Transcript,
        validated: &ValidatedExtraction,
        events: &[(Event, Option<String>)],
    ) -> Result<(), GraphError> {
        let now = Utc::now();
        let user_id = detect_user_id(events);
        let (user_entity, _) = ensure_user_nodes(&self.ctx.graph, &user_id, now)?;

        for candidate in &validated.entities {
            let resolved = resolve_entity(&self.ctx.graph, &self.ctx.embedder, candidate, now)?;
            if let Some(event_node) = self.evidence_node(transcript, candidate.evidence.turn_index) {
                self.ctx.graph.create_edge(
                    &event_node,
                    &resolved.node_id,
                    EdgeKind::References,
                    json!({"role": "object"}),
                )?;
            }
        }

        for candidate in &validated.preferences {
            if let Err(error) =
                self.write_preference(session_id, transcript, &user_entity, &user_id, candidate, now)
            {
                tracing::warn!(%error, key = %candidate.key, "preference write failed");
            }
        }
        for candidate in &validated.skills {
            if let Err(error) = self.write_skill(transcript, &user_entity, candidate, now) {
                tracing::warn!(%error, skill = %candidate.name, "skill write failed");
            }
        }
        for candidate in &validated.interests {
            if let Err(error) = self.write_interest(transcript, &user_entity, candidate, now) {
                tracing::warn!(%error, topic = %candidate.topic, "interest write failed");
            }
        }
        Ok(())
    }

    /// Conflict resolution per key: reinforce confirmations, supersede
    /// contradictions, insert fresh observations
    fn write_preference(
        &self,
        session_id: &str,
        transcript: &Transcript,
        user_entity: &str,
        user_id: &str,
        candidate: &CandidatePreference,
        now: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        let existing = self.ctx.graph.targets_of(user_entity, EdgeKind::HasPreference)?;
        let active: Vec<&StoredNode> = existing
            .iter()
            .map(|(_, node)| node)
            .filter(|node| {
                node.attrs["key"].as_str() == Some(candidate.key.as_str())
                    && node.attrs["supersededBy"].is_null()
            })
            .collect();

        // Confirmation: reinforce and attach the new evidence
        if let Some(same) = active
            .iter()
            .find(|node| node.attrs["polarity"].as_str() == Some(candidate.polarity.as_str()))
        {
            self.ctx.graph.reinforce_preference(
                &same.id,
                now,
                self.ctx.config.scoring.decay.s_boost_hours,
            )?;
            if let Some(event_node) = self.evidence_node(transcript, candidate.evidence.turn_index) {
                self.ctx.graph.create_edge(
                    &same.id,
                    &event_node,
                    EdgeKind::DerivedFrom,
                    self.derived_from_props(candidate.source_method(), &candidate.evidence)?,
                )?;
            }
            return Ok(());
        }

        // New observation
        let preference_id = deterministic_id(
            "pref",
            &[
                user_id,
                candidate.category.as_str(),
                &candidate.key,
                candidate.polarity.as_str(),
                session_id,
            ],
        );
        let attrs = PreferenceNodeAttrs {
            preference_id: preference_id.clone(),
            category: candidate.category,
            key: candidate.key.clone(),
            value: candidate.value.clone(),
            polarity: candidate.polarity,
            strength: candidate.strength,
            confidence: candidate.confidence,
            source: candidate.source,
            context: candidate.context.clone(),
            scope: candidate.scope,
            scope_id: candidate.scope_id.clone(),
            observation_count: 1,
            first_observed_at: now,
            last_confirmed_at: now,
            superseded_by: None,
        };
        self.ctx.graph.put_node(&NodeRecord {
            occurred_at: Some(now),
            session_id: Some(session_id.to_string()),
            user_id: Some(user_id.to_string()),
            stability_hours: Some(preference_base_stability_hours(candidate.category)),
            ..NodeRecord::new(
                preference_id.clone(),
                NodeKind::Preference,
                serde_json::to_value(&attrs)?,
            )
        })?;
        self.ctx
            .graph
            .create_edge(user_entity, &preference_id, EdgeKind::HasPreference, json!({}))?;

        if let Some(about) = &candidate.about_entity {
            let about_id = self.ctx.graph.merge_entity_node(about, EntityType::Concept, now)?;
            self.ctx
                .graph
                .create_edge(&preference_id, &about_id, EdgeKind::About, json!({}))?;
        }
        if let Some(event_node) = self.evidence_node(transcript, candidate.evidence.turn_index) {
            self.ctx.graph.create_edge(
                &preference_id,
                &event_node,
                EdgeKind::DerivedFrom,
                self.derived_from_props(candidate.source_method(), &candidate.evidence)?,
            )?;
        }

        // Contradiction: append-only supersession of the older polarity
        for contradicted in active.iter().filter(|node| {
            node.attrs["polarity"]
                .as_str()
                .and_then(Polarity::parse_name)
                .map(|p| p.contradicts(candidate.polarity))
                .unwrap_or(false)
        }) {
            self.ctx.graph.set_superseded(&contradicted.id, &preference_id)?;
        }
        Ok(())
    }

    fn write_skill(
        &self,
        transcript: &Transcript,
        user_entity: &str,
        candidate: &CandidateSkill,
        now: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        let skill_id = deterministic_id("skill", &[&candidate.name, &candidate.category]);
        if self.ctx.graph.get_node(&skill_id)?.is_none() {
            let attrs = SkillNodeAttrs {
                skill_id: skill_id.clone(),
                name: candidate.name.clone(),
                category: candidate.category.clone(),
                description: candidate.description.clone(),
            };
            self.ctx.graph.put_node(&NodeRecord::new(
                skill_id.clone(),
                NodeKind::Skill,
                serde_json::to_value(attrs)?,
            ))?;
        }
        self.ctx.graph.create_edge(
            user_entity,
            &skill_id,
            EdgeKind::HasSkill,
            json!({
                "proficiency": candidate.proficiency,
                "confidence": candidate.confidence,
                "lastAssessedAt": now.to_rfc3339(),
                "assessmentCount": 1,
                "source": candidate.source.as_str(),
            }),
        )?;
        if let Some(event_node) = self.evidence_node(transcript, candidate.evidence.turn_index) {
            self.ctx.graph.create_edge(
                &skill_id,
                &event_node,
                EdgeKind::DerivedFrom,
                self.derived_from_props(self.method(), &candidate.evidence)?,
            )?;
        }
        Ok(())
    }

    fn write_interest(
        &self,
        transcript: &Transcript,
        user_entity: &str,
        candidate: &CandidateInterest,
        now: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        let topic_id = self
            .ctx
            .graph
            .merge_entity_node(&candidate.topic, EntityType::Concept, now)?;
        self.ctx.graph.create_edge(
            user_entity,
            &topic_id,
            EdgeKind::InterestedIn,
            json!({
                "weight": candidate.weight,
                "source": candidate.source.as_str(),
                "lastUpdated": now.to_rfc3339(),
            }),
        )?;
        if let Some(event_node) = self.evidence_node(transcript, candidate.evidence.turn_index) {
            self.ctx.graph.create_edge(
                &topic_id,
                &event_node,
                EdgeKind::DerivedFrom,
                self.derived_from_props(self.method(), &candidate.evidence)?,
            )?;
        }
        Ok(())
    }

    /// The graph node behind a transcript turn
    fn evidence_node(&self, transcript: &Transcript, turn_index: u32) -> Option<String> {
        transcript
            .event_id_for_turn(turn_index)
            .or_else(|| transcript.turns.first().map(|t| t.event_id.as_str()))
            .map(event_node_id)
    }

    fn method(&self) -> DerivationMethod {
        if self.ctx.provider.model_id() == "rule-based" {
            DerivationMethod::RuleExtraction
        } else {
            DerivationMethod::LlmExtraction
        }
    }

    fn derived_from_props(
        &self,
        method: DerivationMethod,
        evidence: &CandidateEvidence,
    ) -> Result<Value, GraphError> {
        Ok(serde_json::to_value(DerivedFromProps {
            derivation_method: method,
            derived_at: Utc::now(),
            model_id: Some(self.ctx.provider.model_id().to_string()),
            prompt_version: Some(self.ctx.provider.prompt_version().to_string()),
            evidence_quote: Some(evidence.quote.clone()),
            source_turn_index: Some(evidence.turn_index),
        })?)
    }
}

impl CandidatePreference {
    /// Stated preferences keep the `stated` method even through extraction
    fn source_method(&self) -> DerivationMethod {
        match self.source {
            crate::domain::KnowledgeSource::Explicit => DerivationMethod::Stated,
            _ => DerivationMethod::LlmExtraction,
        }
    }
}

/// The session's user: first `user_id` field found in a payload, else the
/// acting agent
fn detect_user_id(events: &[(Event, Option<String>)]) -> String {
    for (_, payload) in events {
        if let Some(raw) = payload {
            if let Ok(value) = serde_json::from_str::<Value>(raw) {
                if let Some(user_id) = value.get("user_id").and_then(Value::as_str) {
                    return user_id.to_string();
                }
            }
        }
    }
    events
        .first()
        .map(|(e, _)| e.agent_id.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

// ============================================================================
// TESTS
// ============================================================================
