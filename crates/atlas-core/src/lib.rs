//! # Atlas Core
//!
//! Provenance-annotated context graph engine for AI agents:
//!
//! - **Episodic memory**: durable append-only event log with idempotent
//!   ingestion, per-session substreams, secondary indexes, and crash-safe
//!   consumer groups
//! - **Semantic memory**: a derived property graph (8 node kinds, 16 typed
//!   relations) rebuildable from the event log at any time
//! - **Consolidation pipeline**: four asynchronous consumers for structural
//!   projection, session knowledge extraction, enrichment, and periodic
//!   re-consolidation with active forgetting
//! - **Intent-aware retrieval**: query-intent classification, edge-weighted
//!   multi-view traversal, Ebbinghaus decay scoring with access
//!   reinforcement, and full back-traceability to source events
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use atlas_core::{validate_event, EventInput, EventStore, EventStoreOptions};
//!
//! let store = EventStore::open("atlas-data/events.db".into(), EventStoreOptions::default())?;
//! let event = validate_event(&input, chrono::Utc::now())?;
//! let outcome = store.append(&event)?;
//! println!("appended at {}", outcome.position);
//! ```
//!
//! ## Feature Flags
//!
//! - `embeddings`: local ONNX embedding inference with fastembed. Without
//!   it a deterministic feature-hashed embedder keeps the whole pipeline
//!   runnable offline.

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod consumers;
pub mod domain;
pub mod embeddings;
pub mod eventstore;
pub mod extraction;
pub mod graph;
pub mod intent;
pub mod metrics;
pub mod payloads;
pub mod retrieval;
pub mod scoring;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Domain model
pub use domain::{
    entity_id, event_node_id, validate_event, AtlasResponse, EdgeKind, Event, EventInput,
    EventStatus, GlobalPosition, NodeKind, Provenance, ValidationIssue,
};

// Event store
pub use eventstore::{
    AppendOutcome, AppendStatus, EventQuery, EventStore, EventStoreError, EventStoreOptions,
    FsyncPolicy, SortOrder,
};

// Graph store
pub use graph::{GraphError, GraphStore, LineageDirection, StoredNode, TraversalOptions};

// Embeddings
pub use embeddings::{cosine_similarity, Embedder, Embedding, EMBEDDING_DIMENSIONS};

// Extraction
pub use extraction::{
    ExtractionProvider, HttpExtractionProvider, RuleBasedExtractor, SessionExtractionResult,
    Transcript,
};

// Scoring & intent
pub use intent::{classify_intent, intent_weight, Intent};
pub use scoring::{DecayConfig, ScoringWeights};

// Retrieval
pub use retrieval::{RetrievalEngine, SubgraphRequest};

// Consumers
pub use consumers::{
    spawn_consumers, ConsolidationConsumer, ConsumerContext, ConsumerSet, EnrichmentConsumer,
    ExtractionConsumer, ProjectionConsumer,
};

// Config & metrics
pub use config::AtlasConfig;
pub use metrics::{Metrics, MetricsSnapshot};

// Payloads
pub use payloads::PayloadStore;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        classify_intent, validate_event, AtlasConfig, AtlasResponse, ConsumerContext, Embedder,
        Event, EventInput, EventStore, EventStoreOptions, GraphStore, Intent, Metrics,
        PayloadStore, RetrievalEngine, SubgraphRequest,
    };
}
