//! Test harness
//!
//! Wires a full pipeline over temporary stores: event store, graph store,
//! payload store, hashed embedder, rule-based extraction, all four
//! consumers, and the retrieval engine. `settle` drives the consumers until
//! the stream is drained so scenarios can assert on the converged graph.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use atlas_core::config::AtlasConfig;
use atlas_core::consumers::{
    ConsolidationConsumer, ConsumerContext, EnrichmentConsumer, ExtractionConsumer,
    ProjectionConsumer,
};
use atlas_core::embeddings::{Embedder, EMBEDDING_DIMENSIONS};
use atlas_core::eventstore::{AppendOutcome, EventStore, EventStoreOptions};
use atlas_core::extraction::RuleBasedExtractor;
use atlas_core::graph::GraphStore;
use atlas_core::metrics::Metrics;
use atlas_core::payloads::PayloadStore;
use atlas_core::retrieval::RetrievalEngine;
use atlas_core::{Event, GlobalPosition};

/// A complete pipeline over temporary storage.
///
/// The databases live in a temp directory that is deleted on drop.
pub struct TestAtlas {
    _dir: TempDir,
    pub ctx: ConsumerContext,
    pub projection: ProjectionConsumer,
    pub extraction: ExtractionConsumer,
    pub enrichment: EnrichmentConsumer,
    pub consolidation: ConsolidationConsumer,
    pub engine: RetrievalEngine,
}

impl TestAtlas {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp directory");
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
        let embedder = Arc::new(Embedder::hashed(EMBEDDING_DIMENSIONS));
        let metrics = Arc::new(Metrics::new());
        let config = Arc::new(config);

        let ctx = ConsumerContext {
            events: Arc::clone(&events),
            graph: Arc::clone(&graph),
            payloads: Arc::clone(&payloads),
            embedder: Arc::clone(&embedder),
            provider: Arc::new(RuleBasedExtractor),
            metrics: Arc::clone(&metrics),
            config: Arc::clone(&config),
        };
        ctx.ensure_groups().expect("consumer groups");

        let engine = RetrievalEngine::new(
            Arc::clone(&graph),
            Arc::clone(&events),
            Arc::clone(&embedder),
            config.retrieval.clone(),
            config.scoring.clone(),
            Arc::clone(&metrics),
        );

        Self {
            projection: ProjectionConsumer::new(ctx.clone()),
            extraction: ExtractionConsumer::new(ctx.clone()),
            enrichment: EnrichmentConsumer::new(ctx.clone()),
            consolidation: ConsolidationConsumer::new(ctx.clone()),
            engine,
            ctx,
            _dir: dir,
        }
    }

    /// Append, storing an optional inline payload first
    pub fn append(&self, event: &Event, payload: Option<&str>) -> AppendOutcome {
        if let Some(payload) = payload {
            self.ctx
                .payloads
                .put(&event.payload_ref, &event.session_id, payload)
                .expect("payload put");
        }
        self.ctx.events.append(event).expect("append")
    }

    /// Drive projection, extraction and enrichment until the stream drains
    pub async fn settle(&self) {
        loop {
            let mut progressed = 0usize;
            progressed += self.projection.run_once().expect("projection");
            progressed += self.extraction.run_once().await.expect("extraction");
            progressed += self.enrichment.run_once().expect("enrichment");
            if progressed == 0 {
                return;
            }
        }
    }

    /// Drain reflection triggers; true when a trigger was seen
    pub fn drain_triggers(&self) -> bool {
        self.consolidation.drain_triggers().expect("drain triggers")
    }

    /// Destroy the graph and replay the whole stream through projection and
    /// enrichment (replay-correctness support)
    pub async fn replay_graph(&self) {
        self.ctx.graph.clear_all().expect("clear graph");
        self.ctx
            .events
            .reset_group(atlas_core::consumers::GROUP_PROJECTION)
            .expect("reset projection");
        self.ctx
            .events
            .reset_group(atlas_core::consumers::GROUP_ENRICHMENT)
            .expect("reset enrichment");
        loop {
            let mut progressed = 0usize;
            progressed += self.projection.run_once().expect("projection");
            progressed += self.enrichment.run_once().expect("enrichment");
            if progressed == 0 {
                return;
            }
        }
    }

    /// Last assigned stream position
    pub fn last_position(&self) -> Option<GlobalPosition> {
        self.ctx.events.last_position().expect("last position")
    }
}

impl Default for TestAtlas {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for test events
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    pub fn new(event_id: &str, session_id: &str, event_type: &str) -> Self {
        Self {
            event: Event {
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                occurred_at: Utc::now() - Duration::minutes(5),
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
            },
        }
    }

    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.event.occurred_at = at;
        self
    }

    pub fn offset_secs(mut self, secs: i64) -> Self {
        self.event.occurred_at += Duration::seconds(secs);
        self
    }

    pub fn agent(mut self, agent_id: &str) -> Self {
        self.event.agent_id = agent_id.to_string();
        self
    }

    pub fn trace(mut self, trace_id: &str) -> Self {
        self.event.trace_id = trace_id.to_string();
        self
    }

    pub fn parent(mut self, parent_event_id: &str) -> Self {
        self.event.parent_event_id = Some(parent_event_id.to_string());
        self
    }

    pub fn tool(mut self, tool_name: &str) -> Self {
        self.event.tool_name = Some(tool_name.to_string());
        self
    }

    pub fn importance_hint(mut self, hint: u8) -> Self {
        self.event.importance_hint = Some(hint);
        self
    }

    pub fn build(self) -> Event {
        self.event
    }
}

/// Path of the event store inside a config's data dir (for reopen tests)
pub fn event_store_path(config: &AtlasConfig) -> PathBuf {
    config.event_store_path()
}
