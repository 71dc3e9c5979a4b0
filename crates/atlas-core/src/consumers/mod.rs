//! The consolidation pipeline - four asynchronous consumers
//!
//! Each consumer owns a consumer group on the global stream:
//!
//! | Group | Consumer | Work |
//! |---|---|---|
//! | `projection` | [`ProjectionConsumer`] | Event nodes, FOLLOWS, CAUSED_BY, stated preferences |
//! | `extraction` | [`ExtractionConsumer`] | Session-end LLM extraction with 4-layer validation |
//! | `enrichment` | [`EnrichmentConsumer`] | Keywords, embeddings, importance, SIMILAR_TO, REFERENCES |
//! | `consolidation` | [`ConsolidationConsumer`] | Patterns, workflows, summaries, active forgetting |
//!
//! Delivery is at-least-once with explicit acks; transient failures requeue
//! by not acking, structural failures go to the poison channel and ack so
//! the stream never stalls. Enrichment reads behind projection's
//! acknowledged floor, which enforces the consumer-ordering invariant.

mod consolidation;
mod enrichment;
mod extraction;
mod projection;

pub use consolidation::{ConsolidationConsumer, ConsolidationReport};
pub use enrichment::EnrichmentConsumer;
pub use extraction::ExtractionConsumer;
pub use projection::ProjectionConsumer;

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AtlasConfig;
use crate::embeddings::Embedder;
use crate::eventstore::EventStore;
use crate::extraction::ExtractionProvider;
use crate::graph::GraphStore;
use crate::metrics::Metrics;
use crate::payloads::PayloadStore;

/// Consumer group names on the global stream
pub const GROUP_PROJECTION: &str = "projection";
pub const GROUP_EXTRACTION: &str = "extraction";
pub const GROUP_ENRICHMENT: &str = "enrichment";
pub const GROUP_CONSOLIDATION: &str = "consolidation";

/// Shared handles every consumer needs
#[derive(Clone)]
pub struct ConsumerContext {
    pub events: Arc<EventStore>,
    pub graph: Arc<GraphStore>,
    pub payloads: Arc<PayloadStore>,
    pub embedder: Arc<Embedder>,
    pub provider: Arc<dyn ExtractionProvider>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<AtlasConfig>,
}

impl ConsumerContext {
    /// Create the four consumer groups (idempotent)
    pub fn ensure_groups(&self) -> crate::eventstore::Result<()> {
        for group in [
            GROUP_PROJECTION,
            GROUP_EXTRACTION,
            GROUP_ENRICHMENT,
            GROUP_CONSOLIDATION,
        ] {
            self.events.create_group(group)?;
        }
        Ok(())
    }
}

/// Running consumer tasks plus their shutdown signal
pub struct ConsumerSet {
    pub handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl ConsumerSet {
    /// Signal every consumer to stop after its current batch
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Spawn the four consumers plus background maintenance as tokio tasks
pub fn spawn_consumers(ctx: ConsumerContext) -> crate::eventstore::Result<ConsumerSet> {
    ctx.ensure_groups()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    let projection = ProjectionConsumer::new(ctx.clone());
    let rx = shutdown_rx.clone();
    handles.push(tokio::spawn(async move { projection.run(rx).await }));

    let extraction = ExtractionConsumer::new(ctx.clone());
    let rx = shutdown_rx.clone();
    handles.push(tokio::spawn(async move { extraction.run(rx).await }));

    let enrichment = EnrichmentConsumer::new(ctx.clone());
    let rx = shutdown_rx.clone();
    handles.push(tokio::spawn(async move { enrichment.run(rx).await }));

    let consolidation = ConsolidationConsumer::new(ctx);
    handles.push(tokio::spawn(async move { consolidation.run(shutdown_rx).await }));

    Ok(ConsumerSet {
        handles,
        shutdown: shutdown_tx,
    })
}

/// Ensure the user Entity and a minimal UserProfile exist; returns
/// (entity node id, profile node id). Never clobbers an enriched profile.
pub(crate) fn ensure_user_nodes(
    graph: &GraphStore,
    user_id: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(String, String), crate::graph::GraphError> {
    use crate::domain::{EdgeKind, EntityType, NodeKind, UserProfileNodeAttrs};

    let user_entity = graph.merge_entity_node(user_id, EntityType::User, now)?;
    let profile_id = deterministic_id("prof", &[user_id]);
    if graph.get_node(&profile_id)?.is_none() {
        let attrs = UserProfileNodeAttrs {
            profile_id: profile_id.clone(),
            user_id: user_id.to_string(),
            display_name: None,
            timezone: None,
            language: None,
            communication_style: None,
            technical_level: None,
        };
        graph.put_node(&crate::graph::NodeRecord {
            user_id: Some(user_id.to_string()),
            ..crate::graph::NodeRecord::new(
                profile_id.clone(),
                NodeKind::UserProfile,
                serde_json::to_value(attrs)?,
            )
        })?;
    }
    graph.create_edge(&user_entity, &profile_id, EdgeKind::HasProfile, serde_json::json!({}))?;
    Ok((user_entity, profile_id))
}

/// Deterministic derived-node id so replays converge on the same node
pub(crate) fn deterministic_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(24);
    for byte in digest.iter().take(12) {
        hex.push_str(&format!("{:02x}", byte));
    }
    format!("{prefix}_{hex}")
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::domain::Event;
    use crate::eventstore::EventStoreOptions;
    use crate::extraction::RuleBasedExtractor;
    use chrono::{Duration as ChronoDuration, Utc};

    /// Fully wired context over temp stores, rule-based extraction, hashed
    /// embeddings
    pub fn make_ctx() -> (tempfile::TempDir, ConsumerContext) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AtlasConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();

        let events = Arc::new(
            EventStore::open(config.event_store_path(), EventStoreOptions::default())
                .expect("event store"),
        );
        let graph = Arc::new(GraphStore::open(config.graph_store_path()).expect("graph store"));
        let payloads = Arc::new(
            PayloadStore::open(config.payload_store_path(), config.payload_key_dir())
                .expect("payload store"),
        );
        let ctx = ConsumerContext {
            events,
            graph,
            payloads,
            embedder: Arc::new(Embedder::hashed(crate::embeddings::EMBEDDING_DIMENSIONS)),
            provider: Arc::new(RuleBasedExtractor),
            metrics: Arc::new(Metrics::new()),
            config: Arc::new(config),
        };
        ctx.ensure_groups().expect("groups");
        (dir, ctx)
    }

    /// An event `offset_secs` after a fixed recent base time
    pub fn make_event(event_id: &str, session_id: &str, event_type: &str, offset_secs: i64) -> Event {
        Event {
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            occurred_at: Utc::now() - ChronoDuration::minutes(10)
                + ChronoDuration::seconds(offset_secs),
            session_id: session_id.to_string(),
            agent_id: "a1".to_string(),
            trace_id: "t1".to_string(),
            payload_ref: format!("p_{event_id}"),
            global_position: None,
            tool_name: None,
            parent_event_id: None,
            ended_at: None,
            status: None,
            schema_version: None,
            importance_hint: None,
        }
    }

    /// Store the payload (when given) and append the event
    pub fn append_event(ctx: &ConsumerContext, event: &Event, payload: Option<&str>) {
        if let Some(payload) = payload {
            ctx.payloads
                .put(&event.payload_ref, &event.session_id, payload)
                .expect("payload put");
        }
        ctx.events.append(event).expect("append");
    }
}
