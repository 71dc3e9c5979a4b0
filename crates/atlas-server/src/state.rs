//! Shared application state

use std::sync::Arc;

use atlas_core::config::AtlasConfig;
use atlas_core::consumers::{ConsolidationConsumer, ConsumerContext};
use atlas_core::eventstore::EventStore;
use atlas_core::graph::GraphStore;
use atlas_core::metrics::Metrics;
use atlas_core::payloads::PayloadStore;
use atlas_core::retrieval::RetrievalEngine;

/// Handles shared by every route handler
#[derive(Clone)]
pub struct AppState {
    pub events: Arc<EventStore>,
    pub graph: Arc<GraphStore>,
    pub payloads: Arc<PayloadStore>,
    pub engine: Arc<RetrievalEngine>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<AtlasConfig>,
    /// Admin-triggered consolidation shares the consumer implementation
    pub consolidation: Arc<ConsolidationConsumer>,
}

impl AppState {
    /// Wire state from a consumer context plus the retrieval engine
    pub fn new(ctx: &ConsumerContext, engine: Arc<RetrievalEngine>) -> Self {
        Self {
            events: Arc::clone(&ctx.events),
            graph: Arc::clone(&ctx.graph),
            payloads: Arc::clone(&ctx.payloads),
            engine,
            metrics: Arc::clone(&ctx.metrics),
            config: Arc::clone(&ctx.config),
            consolidation: Arc::new(ConsolidationConsumer::new(ctx.clone())),
        }
    }
}
