//! Event store schema migrations

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Initial schema: global stream, documents, dedup, consumer groups",
    up: MIGRATION_V1_UP,
}];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL
);

-- ============================================================================
-- GLOBAL STREAM
-- ============================================================================
-- The AUTOINCREMENT rowid is the global position: strictly increasing in
-- append order on a single node, never reused after trim.
CREATE TABLE IF NOT EXISTS stream (
    position INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    appended_at TEXT NOT NULL
);

-- Per-session substream: cheap ordered session scans
CREATE INDEX IF NOT EXISTS idx_stream_session ON stream(session_id, position);

-- ============================================================================
-- DOCUMENT STORE
-- ============================================================================
-- Full event records for secondary queries; survives stream trimming.
CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    global_position INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    occurred_at TEXT NOT NULL,
    occurred_at_ms INTEGER NOT NULL,
    session_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    payload_ref TEXT NOT NULL,
    tool_name TEXT,
    parent_event_id TEXT,
    ended_at TEXT,
    status TEXT,
    schema_version INTEGER,
    importance_hint INTEGER,
    tombstoned INTEGER NOT NULL DEFAULT 0
);

-- Secondary indexes: tag queries + sortable time-range queries
CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id, occurred_at_ms);
CREATE INDEX IF NOT EXISTS idx_events_agent ON events(agent_id, occurred_at_ms);
CREATE INDEX IF NOT EXISTS idx_events_trace ON events(trace_id, occurred_at_ms);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type, occurred_at_ms);
CREATE INDEX IF NOT EXISTS idx_events_tool ON events(tool_name) WHERE tool_name IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_events_occurred ON events(occurred_at_ms);
CREATE INDEX IF NOT EXISTS idx_events_position ON events(global_position);

-- ============================================================================
-- DEDUP SET
-- ============================================================================
-- Recently-seen event ids with TTL housekeeping. The document PK remains the
-- authoritative first-writer-wins backstop after TTL expiry.
CREATE TABLE IF NOT EXISTS dedup (
    event_id TEXT PRIMARY KEY,
    global_position INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dedup_expiry ON dedup(expires_at_ms);

-- ============================================================================
-- CONSUMER GROUPS
-- ============================================================================
CREATE TABLE IF NOT EXISTS consumer_groups (
    group_name TEXT PRIMARY KEY,
    last_delivered INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

-- Pending-entry list: delivered but unacknowledged entries per group
CREATE TABLE IF NOT EXISTS pending_entries (
    group_name TEXT NOT NULL,
    position INTEGER NOT NULL,
    consumer TEXT NOT NULL,
    delivered_at_ms INTEGER NOT NULL,
    delivery_count INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (group_name, position)
);

CREATE INDEX IF NOT EXISTS idx_pending_delivered ON pending_entries(group_name, delivered_at_ms);

-- ============================================================================
-- POISON CHANNEL
-- ============================================================================
-- Structurally invalid entries, recorded then acknowledged so the stream
-- never stalls.
CREATE TABLE IF NOT EXISTS poison_messages (
    group_name TEXT NOT NULL,
    position INTEGER NOT NULL,
    event_id TEXT,
    reason TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (group_name, position)
);

INSERT INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                "Applying event store migration: {}",
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}
