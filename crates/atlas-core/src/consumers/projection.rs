//! Consumer 1 - structural projection
//!
//! Reads the global stream and projects every event into the graph: the
//! Event node itself, FOLLOWS from its per-session predecessor, CAUSED_BY
//! to its parent, and - for explicit structured knowledge events like
//! `user.preference.stated` - the preference subgraph with `stated`
//! provenance.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::domain::{
    event_node_id, DerivationMethod, EdgeKind, EntityType, Event, KnowledgeSource, NodeKind,
    Polarity, PreferenceCategory, PreferenceNodeAttrs, PreferenceScope,
    PREFERENCE_STATED_EVENT_TYPE,
};
use crate::eventstore::DeliveredEntry;
use crate::graph::{GraphError, NodeRecord};
use crate::scoring::preference_base_stability_hours;

use super::{deterministic_id, ConsumerContext, GROUP_PROJECTION};

/// What processing one entry concluded
enum Outcome {
    Processed,
    /// Structural failure: record to the poison channel and move on
    Poison(String),
    /// Transient failure: leave in the pending list for redelivery
    Requeue(String),
}

/// Structural projection consumer
pub struct ProjectionConsumer {
    ctx: ConsumerContext,
    consumer_name: String,
    /// Per-session "previous event" cursor; recoverable from the event store
    prev_by_session: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl ProjectionConsumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self {
            ctx,
            consumer_name: "projection-1".to_string(),
            prev_by_session: Mutex::new(HashMap::new()),
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
                    tracing::warn!(%error, "projection batch failed");
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }

    /// Process one delivery batch; returns how many entries were handled.
    ///
    /// Separated from the loop so tests can drive the consumer to quiescence.
    pub fn run_once(&self) -> crate::eventstore::Result<usize> {
        let batch = self.ctx.events.read_group(
            GROUP_PROJECTION,
            &self.consumer_name,
            self.ctx.config.consumers.batch_size,
            Duration::from_millis(self.ctx.config.consumers.claim_idle_ms),
            None,
        )?;
        let count = batch.len();

        for entry in batch {
            match self.project(&entry) {
                Outcome::Processed => {
                    self.ctx.events.ack(GROUP_PROJECTION, entry.position)?;
                }
                Outcome::Poison(reason) => {
                    tracing::warn!(
                        event_id = %entry.event.event_id,
                        %reason,
                        "poison message in projection"
                    );
                    self.ctx.events.record_poison(
                        GROUP_PROJECTION,
                        entry.position,
                        Some(&entry.event.event_id),
                        &reason,
                    )?;
                    self.ctx.metrics.record_poison();
                }
                Outcome::Requeue(reason) => {
                    tracing::debug!(
                        event_id = %entry.event.event_id,
                        %reason,
                        "projection requeue"
                    );
                    // No ack: the pending entry will be redelivered
                }
            }
        }
        Ok(count)
    }

    fn project(&self, entry: &DeliveredEntry) -> Outcome {
        let event = &entry.event;

        // Reflection triggers are pipeline bookkeeping, not episodic memory
        if event.is_reflection_trigger() {
            return Outcome::Processed;
        }

        // 1. The event node itself
        let node_id = match self.ctx.graph.merge_event_node(event) {
            Ok(id) => id,
            Err(GraphError::Unavailable(reason)) => return Outcome::Requeue(reason),
            Err(error) => return Outcome::Poison(error.to_string()),
        };

        // 2. FOLLOWS from the session predecessor
        if let Err(outcome) = self.link_follows(event, &node_id) {
            return outcome;
        }

        // 3. CAUSED_BY to the parent
        if let Some(parent_id) = &event.parent_event_id {
            let parent_node = event_node_id(parent_id);
            match self.ctx.graph.get_node(&parent_node) {
                Ok(Some(_)) => {
                    if let Err(error) = self.ctx.graph.create_edge(
                        &node_id,
                        &parent_node,
                        EdgeKind::CausedBy,
                        json!({"mechanism": "direct"}),
                    ) {
                        return Outcome::Poison(error.to_string());
                    }
                }
                // Parent never projected (out-of-order producer); the chain
                // stalls for this event only, not the session
                Ok(None) => {
                    tracing::debug!(parent = %parent_id, "parent event not projected, skipping CAUSED_BY");
                }
                Err(GraphError::Unavailable(reason)) => return Outcome::Requeue(reason),
                Err(error) => return Outcome::Poison(error.to_string()),
            }
        }

        // 4. Explicit structured knowledge
        if event.event_type == PREFERENCE_STATED_EVENT_TYPE {
            match self.project_stated_preference(event) {
                Ok(()) => {}
                Err(Outcome::Processed) => {}
                Err(outcome) => return outcome,
            }
        }

        Outcome::Processed
    }

    fn link_follows(&self, event: &Event, node_id: &str) -> Result<(), Outcome> {
        let previous = self.previous_in_session(event);

        if let Some((prev_event_id, prev_occurred)) = previous {
            let prev_node = event_node_id(&prev_event_id);
            let delta_ms = (event.occurred_at - prev_occurred).num_milliseconds();
            match self.ctx.graph.create_edge(
                &prev_node,
                node_id,
                EdgeKind::Follows,
                json!({"sessionId": event.session_id, "deltaMs": delta_ms}),
            ) {
                Ok(_) => {}
                Err(GraphError::NotFound(_)) => {
                    // Predecessor pruned from the graph; nothing to chain to
                }
                Err(GraphError::Unavailable(reason)) => return Err(Outcome::Requeue(reason)),
                Err(error) => return Err(Outcome::Poison(error.to_string())),
            }
        }

        if let Ok(mut cursors) = self.prev_by_session.lock() {
            cursors.insert(
                event.session_id.clone(),
                (event.event_id.clone(), event.occurred_at),
            );
        }
        Ok(())
    }

    /// Session predecessor from the local cursor cache, recovered from the
    /// event store on a cold start
    fn previous_in_session(&self, event: &Event) -> Option<(String, DateTime<Utc>)> {
        if let Ok(cursors) = self.prev_by_session.lock() {
            if let Some(entry) = cursors.get(&event.session_id) {
                if entry.0 != event.event_id {
                    return Some(entry.clone());
                }
                return None;
            }
        }
        let candidates = self
            .ctx
            .events
            .get_by_session(&event.session_id, None, Some(event.occurred_at), 512)
            .ok()?;
        candidates
            .into_iter()
            .filter(|e| {
                e.event_id != event.event_id
                    && (e.occurred_at, &e.event_id) < (event.occurred_at, &event.event_id)
            })
            .max_by(|a, b| {
                (a.occurred_at, a.event_id.clone()).cmp(&(b.occurred_at, b.event_id.clone()))
            })
            .map(|e| (e.event_id, e.occurred_at))
    }

    /// Upsert the preference subgraph for a `user.preference.stated` event
    fn project_stated_preference(&self, event: &Event) -> Result<(), Outcome> {
        let payload = match self.ctx.payloads.get(&event.payload_ref) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                return Err(Outcome::Poison("stated preference without payload".to_string()))
            }
            Err(error) => return Err(Outcome::Requeue(error.to_string())),
        };
        let body: Value = match serde_json::from_str(&payload) {
            Ok(body) => body,
            Err(error) => return Err(Outcome::Poison(format!("unparseable payload: {error}"))),
        };

        let field = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);
        let Some(user_id) = field("user_id") else {
            return Err(Outcome::Poison("stated preference missing user_id".to_string()));
        };
        let Some(key) = field("key") else {
            return Err(Outcome::Poison("stated preference missing key".to_string()));
        };
        let category = field("category")
            .and_then(|raw| PreferenceCategory::parse_name(&raw))
            .ok_or_else(|| Outcome::Poison("unknown preference category".to_string()))?;
        let polarity = field("polarity")
            .and_then(|raw| Polarity::parse_name(&raw))
            .unwrap_or(Polarity::Positive);
        let value = field("value");

        let write = || -> Result<(), GraphError> {
            let now = event.occurred_at;
            let (user_entity, _profile_id) =
                super::ensure_user_nodes(&self.ctx.graph, &user_id, now)?;

            let source = KnowledgeSource::Explicit;
            let preference_id = deterministic_id(
                "pref",
                &[&user_id, category.as_str(), &key, polarity.as_str(), &event.event_id],
            );
            let attrs = PreferenceNodeAttrs {
                preference_id: preference_id.clone(),
                category,
                key: key.clone(),
                value: value.clone(),
                polarity,
                strength: 0.9,
                confidence: source.confidence_ceiling(),
                source,
                context: None,
                scope: PreferenceScope::Global,
                scope_id: None,
                observation_count: 1,
                first_observed_at: now,
                last_confirmed_at: now,
                superseded_by: None,
            };
            self.ctx.graph.put_node(&NodeRecord {
                occurred_at: Some(now),
                session_id: Some(event.session_id.clone()),
                user_id: Some(user_id.clone()),
                stability_hours: Some(preference_base_stability_hours(category)),
                ..NodeRecord::new(
                    preference_id.clone(),
                    NodeKind::Preference,
                    serde_json::to_value(&attrs)?,
                )
            })?;
            self.ctx
                .graph
                .create_edge(&user_entity, &preference_id, EdgeKind::HasPreference, json!({}))?;

            // ABOUT the value's entity, when one is named
            if let Some(value) = &value {
                let about = self.ctx.graph.merge_entity_node(value, EntityType::Concept, now)?;
                self.ctx
                    .graph
                    .create_edge(&preference_id, &about, EdgeKind::About, json!({}))?;
            }

            self.ctx.graph.create_edge(
                &preference_id,
                &event_node_id(&event.event_id),
                EdgeKind::DerivedFrom,
                serde_json::to_value(crate::domain::DerivedFromProps {
                    derivation_method: DerivationMethod::Stated,
                    derived_at: Utc::now(),
                    model_id: None,
                    prompt_version: None,
                    evidence_quote: Some(payload.clone()),
                    source_turn_index: None,
                })?,
            )?;
            Ok(())
        };

        match write() {
            Ok(()) => Ok(()),
            Err(GraphError::Unavailable(reason)) => Err(Outcome::Requeue(reason)),
            Err(error) => Err(Outcome::Poison(error.to_string())),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumers::tests_support::{append_event, make_ctx, make_event};
    use crate::domain::entity_id;

    #[test]
    fn projects_follows_and_caused_by() {
        let (_dir, ctx) = make_ctx();
        let consumer = ProjectionConsumer::new(ctx.clone());

        let e1 = make_event("e1", "s1", "observation.input", 0);
        append_event(&ctx, &e1, None);
        let mut e2 = make_event("e2", "s1", "tool.call", 1);
        e2.parent_event_id = Some("e1".to_string());
        append_event(&ctx, &e2, None);

        assert_eq!(consumer.run_once().unwrap(), 2);

        let follows = ctx
            .graph
            .edges_of(&event_node_id("e1"), true, false, &[EdgeKind::Follows])
            .unwrap();
        assert_eq!(follows.len(), 1);
        assert_eq!(follows[0].target, event_node_id("e2"));
        assert_eq!(follows[0].props["deltaMs"], 1000);

        let caused = ctx
            .graph
            .edges_of(&event_node_id("e2"), true, false, &[EdgeKind::CausedBy])
            .unwrap();
        assert_eq!(caused.len(), 1);
        assert_eq!(caused[0].target, event_node_id("e1"));
        assert_eq!(caused[0].props["mechanism"], "direct");

        // No pending entries remain
        assert_eq!(ctx.events.pending(GROUP_PROJECTION).unwrap().count, 0);
    }

    #[test]
    fn replay_creates_no_extra_graph_writes() {
        let (_dir, ctx) = make_ctx();
        let consumer = ProjectionConsumer::new(ctx.clone());
        append_event(&ctx, &make_event("e1", "s1", "observation.input", 0), None);
        append_event(&ctx, &make_event("e2", "s1", "tool.call", 1), None);
        consumer.run_once().unwrap();

        // Same events re-appended are duplicates; nothing new to deliver
        append_event(&ctx, &make_event("e1", "s1", "observation.input", 0), None);
        assert_eq!(consumer.run_once().unwrap(), 0);
        assert_eq!(ctx.graph.count_nodes_by_kind().unwrap()["event"], 2);
    }

    #[test]
    fn stated_preference_builds_subgraph_with_provenance() {
        let (_dir, ctx) = make_ctx();
        let consumer = ProjectionConsumer::new(ctx.clone());

        let event = make_event("x1", "s1", PREFERENCE_STATED_EVENT_TYPE, 0);
        append_event(
            &ctx,
            &event,
            Some(
                r#"{"user_id":"u1","category":"communication","key":"notification_method","value":"email","polarity":"positive"}"#,
            ),
        );
        consumer.run_once().unwrap();

        let user_entity = entity_id("u1", EntityType::User);
        let prefs = ctx.graph.targets_of(&user_entity, EdgeKind::HasPreference).unwrap();
        assert_eq!(prefs.len(), 1);
        let (_, pref) = &prefs[0];
        assert_eq!(pref.attrs["source"], "explicit");
        assert!(pref.attrs["confidence"].as_f64().unwrap() >= 0.7);

        let about = ctx.graph.edges_of(&pref.id, true, false, &[EdgeKind::About]).unwrap();
        assert_eq!(about.len(), 1);
        assert_eq!(about[0].target, entity_id("email", EntityType::Concept));

        let derived = ctx
            .graph
            .edges_of(&pref.id, true, false, &[EdgeKind::DerivedFrom])
            .unwrap();
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].target, event_node_id("x1"));
        assert_eq!(derived[0].props["derivationMethod"], "stated");
        assert!(derived[0].props["evidenceQuote"].as_str().unwrap().contains("email"));
    }

    #[test]
    fn malformed_stated_preference_is_poisoned_not_stuck() {
        let (_dir, ctx) = make_ctx();
        let consumer = ProjectionConsumer::new(ctx.clone());

        let event = make_event("bad1", "s1", PREFERENCE_STATED_EVENT_TYPE, 0);
        append_event(&ctx, &event, Some(r#"{"user_id":"u1","category":"astrology","key":"k"}"#));
        consumer.run_once().unwrap();

        // Acked via the poison channel; the stream is not stalled
        assert_eq!(ctx.events.pending(GROUP_PROJECTION).unwrap().count, 0);
        assert_eq!(ctx.events.stats().unwrap().poison_count, 1);
    }

    #[test]
    fn cursor_cache_recovers_from_store_after_restart() {
        let (_dir, ctx) = make_ctx();
        let first = ProjectionConsumer::new(ctx.clone());
        append_event(&ctx, &make_event("e1", "s1", "observation.input", 0), None);
        first.run_once().unwrap();

        // A fresh consumer (empty cache) picks up the session mid-stream
        let second = ProjectionConsumer::new(ctx.clone());
        append_event(&ctx, &make_event("e2", "s1", "tool.call", 5), None);
        second.run_once().unwrap();

        let follows = ctx
            .graph
            .edges_of(&event_node_id("e1"), true, false, &[EdgeKind::Follows])
            .unwrap();
        assert_eq!(follows.len(), 1);
        assert_eq!(follows[0].props["deltaMs"], 5000);
    }
}
