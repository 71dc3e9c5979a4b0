//! Consumer 3 - enrichment
//!
//! Derives keywords, embeddings and importance for projected events, links
//! SIMILAR_TO on embedding proximity, creates rule-based REFERENCES, and
//! accumulates importance toward the reflection trigger.
//!
//! Ordering: this consumer only reads entries at or below the projection
//! group's acknowledged floor, so an event is never enriched before its
//! node exists.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use crate::domain::{
    event_node_id, EdgeKind, EntityType, Event, EventStatus, REFLECTION_EVENT_TYPE,
};
use crate::embeddings::cosine_similarity;
use crate::eventstore::DeliveredEntry;
use crate::graph::GraphError;

use super::{ConsumerContext, GROUP_ENRICHMENT, GROUP_PROJECTION};

/// Candidate pool size for SIMILAR_TO comparisons
const SIMILARITY_CANDIDATES: usize = 100;

/// Enrichment consumer
pub struct EnrichmentConsumer {
    ctx: ConsumerContext,
    consumer_name: String,
    /// Importance accumulated since the last reflection trigger
    reflection_accumulator: Mutex<f64>,
}

impl EnrichmentConsumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self {
            ctx,
            consumer_name: "enrichment-1".to_string(),
            reflection_accumulator: Mutex::new(0.0),
        }
    }

    /// Long-running loop; exits on shutdown signal
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let poll = Duration::from_millis(self.ctx.config.consumers.poll_interval_ms);
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.run_once() {
                Ok(0) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(%error, "enrichment batch failed");
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }

    /// Process one delivery batch behind the projection floor
    pub fn run_once(&self) -> crate::eventstore::Result<usize> {
        let floor = self.ctx.events.acked_floor(GROUP_PROJECTION)?;
        let batch = self.ctx.events.read_group(
            GROUP_ENRICHMENT,
            &self.consumer_name,
            self.ctx.config.consumers.batch_size,
            Duration::from_millis(self.ctx.config.consumers.claim_idle_ms),
            Some(floor),
        )?;
        let count = batch.len();

        for entry in batch {
            match self.enrich(&entry) {
                Ok(()) => {
                    self.ctx.events.ack(GROUP_ENRICHMENT, entry.position)?;
                    let lag = (Utc::now() - entry.event.occurred_at).num_seconds().max(0) as u64;
                    self.ctx.metrics.set_enrichment_lag_seconds(lag);
                }
                Err(GraphError::Unavailable(reason)) => {
                    tracing::debug!(%reason, "enrichment requeue");
                }
                Err(error) => {
                    self.ctx.events.record_poison(
                        GROUP_ENRICHMENT,
                        entry.position,
                        Some(&entry.event.event_id),
                        &error.to_string(),
                    )?;
                    self.ctx.metrics.record_poison();
                }
            }
        }
        Ok(count)
    }

    fn enrich(&self, entry: &DeliveredEntry) -> Result<(), GraphError> {
        let event = &entry.event;
        let node_id = event_node_id(&event.event_id);

        // Reflection triggers are bookkeeping events, nothing to enrich
        if event.event_type == REFLECTION_EVENT_TYPE {
            return Ok(());
        }
        if self.ctx.graph.get_node(&node_id)?.is_none() {
            return Err(GraphError::Unavailable(format!(
                "event node {node_id} not yet projected"
            )));
        }

        let payload_text = self
            .ctx
            .payloads
            .get(&event.payload_ref)
            .ok()
            .flatten()
            .unwrap_or_default();

        // Keywords + embedding + importance written as node properties
        let keywords = extract_keywords(event, &payload_text);
        let importance = importance_score(event);
        let embed_text = format!("{} {} {}", event.event_type, keywords.join(" "), payload_text);
        let embedding = self
            .ctx
            .embedder
            .embed(embed_text.trim())
            .map_err(|e| GraphError::Unavailable(e.to_string()))?;
        self.ctx.graph.set_event_enrichment(
            &node_id,
            &keywords,
            None,
            importance,
            Some(&embedding.vector),
        )?;

        // SIMILAR_TO against the recent embedded neighborhood
        let threshold = self.ctx.config.retrieval.similarity_threshold;
        for candidate in self.ctx.graph.recent_embedded_events(SIMILARITY_CANDIDATES)? {
            if candidate.id == node_id {
                continue;
            }
            let Some(vector) = candidate.embedding.as_deref() else {
                continue;
            };
            let score = cosine_similarity(&embedding.vector, vector).clamp(0.0, 1.0);
            if score > threshold {
                self.ctx.graph.create_edge(
                    &node_id,
                    &candidate.id,
                    EdgeKind::SimilarTo,
                    json!({"score": score}),
                )?;
            }
        }

        // Rule-based REFERENCES: the acting agent and the instrument tool
        let agent_entity =
            self.ctx
                .graph
                .merge_entity_node(&event.agent_id, EntityType::Agent, event.occurred_at)?;
        self.ctx
            .graph
            .create_edge(&node_id, &agent_entity, EdgeKind::References, json!({"role": "agent"}))?;
        if let Some(tool) = &event.tool_name {
            let tool_entity =
                self.ctx
                    .graph
                    .merge_entity_node(tool, EntityType::Tool, event.occurred_at)?;
            self.ctx.graph.create_edge(
                &node_id,
                &tool_entity,
                EdgeKind::References,
                json!({"role": "instrument"}),
            )?;
        }

        self.accumulate_reflection(importance);
        Ok(())
    }

    /// Sum importance since the last reflection; past the threshold, publish
    /// the trigger event that makes Consumer 4 run immediately
    fn accumulate_reflection(&self, importance: f64) {
        let threshold = self.ctx.config.consolidation.reflection_threshold;
        let fire = {
            let Ok(mut accumulated) = self.reflection_accumulator.lock() else {
                return;
            };
            *accumulated += importance;
            if *accumulated > threshold {
                *accumulated = 0.0;
                true
            } else {
                false
            }
        };
        if !fire {
            return;
        }

        let trigger = Event {
            event_id: format!("reflect_{}", Uuid::new_v4()),
            event_type: REFLECTION_EVENT_TYPE.to_string(),
            occurred_at: Utc::now(),
            session_id: "system".to_string(),
            agent_id: "system".to_string(),
            trace_id: "system".to_string(),
            payload_ref: "system".to_string(),
            global_position: None,
            tool_name: None,
            parent_event_id: None,
            ended_at: None,
            status: None,
            schema_version: None,
            importance_hint: None,
        };
        match self.ctx.events.append(&trigger) {
            Ok(_) => {
                self.ctx.metrics.record_reflection_trigger();
                tracing::info!("reflection threshold crossed, consolidation trigger published");
            }
            Err(error) => tracing::warn!(%error, "failed to publish reflection trigger"),
        }
    }
}

// ============================================================================
// DERIVATION RULES
// ============================================================================

/// Deterministic keywords from the type hierarchy, tool and payload
fn extract_keywords(event: &Event, payload_text: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    fn push(raw: &str, keywords: &mut Vec<String>, seen: &mut HashSet<String>) {
        let token = raw.trim().to_lowercase();
        if token.len() >= 3 && !STOPWORDS.contains(token.as_str()) && seen.insert(token.clone()) {
            keywords.push(token);
        }
    }

    for segment in event.event_type.split('.') {
        push(segment, &mut keywords, &mut seen);
    }
    if let Some(tool) = &event.tool_name {
        push(tool, &mut keywords, &mut seen);
    }
    for token in payload_text
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .take(64)
    {
        push(token, &mut keywords, &mut seen);
        if keywords.len() >= 12 {
            break;
        }
    }
    keywords
}

static STOPWORDS: std::sync::LazyLock<HashSet<&'static str>> = std::sync::LazyLock::new(|| {
    HashSet::from([
        "the", "and", "for", "with", "that", "this", "from", "into", "was", "were", "are", "have",
    ])
});

/// Rule-table importance in 1..=10, blended with the producer's hint
fn importance_score(event: &Event) -> f64 {
    let base = match event.type_namespace() {
        "user" => 6.0,
        "observation" => 5.0,
        "llm" | "assistant" => 4.0,
        "tool" => 3.0,
        "system" => 2.0,
        _ => 3.0,
    };
    let status_bump = match event.status {
        Some(EventStatus::Failed) | Some(EventStatus::Timeout) => 2.0,
        _ => 0.0,
    };
    let rule = base + status_bump;
    let blended = match event.importance_hint {
        Some(hint) => (rule + f64::from(hint)) / 2.0,
        None => rule,
    };
    blended.clamp(1.0, 10.0)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumers::tests_support::{append_event, make_ctx, make_event};
    use crate::consumers::ProjectionConsumer;

    #[test]
    fn waits_for_projection_before_enriching() {
        let (_dir, ctx) = make_ctx();
        let enrichment = EnrichmentConsumer::new(ctx.clone());
        append_event(&ctx, &make_event("e1", "s1", "tool.call", 0), None);

        // Projection has not acked: nothing is delivered to enrichment
        assert_eq!(enrichment.run_once().unwrap(), 0);

        ProjectionConsumer::new(ctx.clone()).run_once().unwrap();
        assert_eq!(enrichment.run_once().unwrap(), 1);

        let node = ctx.graph.get_node(&event_node_id("e1")).unwrap().unwrap();
        assert!(node.importance.is_some());
        assert!(node.embedding.is_some());
        assert!(!node.attrs["keywords"].as_array().unwrap().is_empty());
    }

    #[test]
    fn links_similar_events_and_references() {
        let (_dir, ctx) = make_ctx();
        let projection = ProjectionConsumer::new(ctx.clone());
        let enrichment = EnrichmentConsumer::new(ctx.clone());

        let mut a = make_event("a", "s1", "tool.call", 0);
        a.tool_name = Some("grep".to_string());
        let mut b = make_event("b", "s1", "tool.call", 1);
        b.tool_name = Some("grep".to_string());
        append_event(&ctx, &a, Some("search the logs for timeout errors"));
        append_event(&ctx, &b, Some("search the logs for timeout errors"));
        projection.run_once().unwrap();
        enrichment.run_once().unwrap();

        // Near-identical payloads embed nearly identically
        let similar = ctx
            .graph
            .edges_of(&event_node_id("b"), true, true, &[EdgeKind::SimilarTo])
            .unwrap();
        assert!(!similar.is_empty());
        assert!(similar[0].props["score"].as_f64().unwrap() > 0.85);

        let refs = ctx
            .graph
            .edges_of(&event_node_id("a"), true, false, &[EdgeKind::References])
            .unwrap();
        let roles: HashSet<&str> = refs
            .iter()
            .filter_map(|e| e.props["role"].as_str())
            .collect();
        assert!(roles.contains("agent"));
        assert!(roles.contains("instrument"));
    }

    #[test]
    fn importance_blends_rule_and_hint() {
        let mut event = make_event("e", "s1", "tool.call", 0);
        assert_eq!(importance_score(&event), 3.0);
        event.importance_hint = Some(9);
        assert_eq!(importance_score(&event), 6.0);
        event.status = Some(EventStatus::Failed);
        assert_eq!(importance_score(&event), 7.0);
    }

    #[test]
    fn reflection_trigger_fires_past_threshold() {
        let (_dir, ctx) = make_ctx();
        let projection = ProjectionConsumer::new(ctx.clone());
        let enrichment = EnrichmentConsumer::new(ctx.clone());

        // 30 high-hint user events: blended importance 7.0 each, sum 210 > 150
        for i in 0..30 {
            let mut event = make_event(&format!("e{i}"), "s1", "user.message", i);
            event.importance_hint = Some(8);
            append_event(&ctx, &event, Some("important work"));
        }
        projection.run_once().unwrap();
        while enrichment.run_once().unwrap() > 0 {}

        assert_eq!(ctx.metrics.reflection_triggers_total(), 1);
        // The trigger event itself landed on the stream
        let page = ctx
            .events
            .search(
                &crate::eventstore::EventQuery {
                    event_type: Some(REFLECTION_EVENT_TYPE.to_string()),
                    ..crate::eventstore::EventQuery::default()
                },
                crate::eventstore::SortOrder::Asc,
                10,
                None,
            )
            .unwrap();
        assert_eq!(page.events.len(), 1);
    }
}
