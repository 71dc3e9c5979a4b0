//! Event Store - durable append-only episodic memory
//!
//! Exclusively owns event records. Backed by SQLite in WAL mode with:
//! - a global ordered stream (AUTOINCREMENT position = total order)
//! - a per-session substream index for cheap session scans
//! - a document table with secondary indexes for tag/range/sort queries
//! - a TTL dedup set making `append` idempotent by `event_id`
//! - consumer groups with a pending-entry list for at-least-once delivery
//!
//! The idempotent append protocol runs inside a single transaction, so a
//! crash mid-sequence produces either all effects or none.

mod migrations;
mod sqlite;

pub use sqlite::{
    AppendOutcome, AppendStatus, DeliveredEntry, EventPage, EventQuery, EventStore,
    EventStoreError, EventStoreOptions, FsyncPolicy, GroupStats, PendingSummary, Result,
    RetentionReport, SortOrder, StreamStats,
};
