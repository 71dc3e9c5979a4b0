//! Graph Store - the derived semantic projection
//!
//! A labeled property graph over SQLite. Every node is rebuildable from the
//! event log; all writes are insert-or-merge by stable key so replay is safe.
//! Constraints the engine cannot enforce (endpoint kinds, property enums,
//! value ranges) are validated by the adapter before write.

mod migrations;
mod sqlite;

pub use sqlite::{
    GraphError, GraphStore, Lineage, LineageDirection, NodeRecord, Result, SessionEventStats,
    StoredEdge, StoredNode, Subgraph, TraversalOptions, TraversedNode,
};
