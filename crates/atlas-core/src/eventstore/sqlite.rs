//! SQLite event store implementation

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::domain::{Event, EventStatus, GlobalPosition, ValidationIssue};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Event store error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Event violates an envelope invariant
    #[error("Validation failed: {0:?}")]
    ValidationFailed(Vec<ValidationIssue>),
    /// Event not found
    #[error("Event not found: {0}")]
    NotFound(String),
    /// Store unreachable or a lock was poisoned; retriable
    #[error("Event store unavailable: {0}")]
    Unavailable(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Event store result type
pub type Result<T> = std::result::Result<T, EventStoreError>;

// ============================================================================
// OPTIONS AND RESULT TYPES
// ============================================================================

/// Durability policy for the persistent log.
///
/// `EverySecond` (the default) documents a bounded data-loss window of at
/// most one second; `Always` waits for fsync on every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    #[default]
    EverySecond,
    Always,
}

/// Store configuration
#[derive(Debug, Clone)]
pub struct EventStoreOptions {
    pub fsync: FsyncPolicy,
    /// TTL for dedup set entries
    pub dedup_ttl: Duration,
}

impl Default for EventStoreOptions {
    fn default() -> Self {
        Self {
            fsync: FsyncPolicy::EverySecond,
            dedup_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Whether an append created a new record or hit the dedup set
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppendStatus {
    New,
    Duplicate,
}

/// Outcome of an append; duplicates return the original position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub status: AppendStatus,
    pub position: GlobalPosition,
}

/// Secondary-index query over the document store
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub trace_id: Option<String>,
    pub event_type: Option<String>,
    pub tool_name: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Sort direction for search results (by `occurred_at`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// One page of search results with an opaque continuation cursor
#[derive(Debug, Clone)]
pub struct EventPage {
    pub events: Vec<Event>,
    pub next_cursor: Option<String>,
}

/// An entry delivered to a consumer group member
#[derive(Debug, Clone)]
pub struct DeliveredEntry {
    pub position: GlobalPosition,
    pub event: Event,
    pub delivery_count: i64,
}

/// Pending-entry list summary for a group
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingSummary {
    pub count: u64,
    pub oldest_position: Option<GlobalPosition>,
}

/// Per-group stream statistics
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStats {
    pub name: String,
    pub last_delivered: String,
    pub pending: u64,
}

/// Stream-level statistics
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub stream_length: u64,
    pub document_count: u64,
    pub last_position: Option<String>,
    pub poison_count: u64,
    pub groups: Vec<GroupStats>,
}

/// Result of a retention-tier enforcement pass
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub stream_entries_trimmed: u64,
    pub documents_deleted: u64,
    pub dedup_swept: u64,
}

// ============================================================================
// EVENT STORE
// ============================================================================

/// Durable append-only event log with idempotent ingestion.
///
/// Uses separate reader/writer connections for interior mutability. All
/// methods take `&self`, making the store `Send + Sync` behind an `Arc`.
pub struct EventStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    dedup_ttl_ms: i64,
}

impl EventStore {
    /// Apply PRAGMAs for the chosen durability policy
    fn configure_connection(conn: &Connection, fsync: FsyncPolicy) -> Result<()> {
        let synchronous = match fsync {
            FsyncPolicy::EverySecond => "NORMAL",
            FsyncPolicy::Always => "FULL",
        };
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = {synchronous};
             PRAGMA cache_size = -32000;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;"
        ))?;
        Ok(())
    }

    /// Open (or create) the store at the given path
    pub fn open(path: PathBuf, options: EventStoreOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer_conn = Connection::open(&path)?;
        Self::configure_connection(&writer_conn, options.fsync)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn, options.fsync)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            dedup_ttl_ms: options.dedup_ttl.as_millis() as i64,
        })
    }

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| EventStoreError::Unavailable("writer lock poisoned".to_string()))
    }

    fn lock_reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| EventStoreError::Unavailable("reader lock poisoned".to_string()))
    }

    // ========================================================================
    // APPEND
    // ========================================================================

    /// Idempotent atomic append: dedup check, stream entry, document write
    /// and dedup insert commit together or not at all.
    ///
    /// Idempotency is defined by `event_id`, not content; the first writer
    /// wins and duplicates return the original position without side effects.
    pub fn append(&self, event: &Event) -> Result<AppendOutcome> {
        let mut conn = self.lock_writer()?;
        let tx = conn.transaction()?;
        let outcome = Self::append_in_tx(&tx, event, Utc::now(), self.dedup_ttl_ms)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Batched append; per-event atomic, partial success allowed
    pub fn append_batch(&self, events: &[Event]) -> Vec<Result<AppendOutcome>> {
        events.iter().map(|e| self.append(e)).collect()
    }

    fn append_in_tx(
        tx: &rusqlite::Transaction<'_>,
        event: &Event,
        now: DateTime<Utc>,
        dedup_ttl_ms: i64,
    ) -> Result<AppendOutcome> {
        // 1. Dedup set hit: return the original position, no side effects
        let deduped: Option<i64> = tx
            .query_row(
                "SELECT global_position FROM dedup WHERE event_id = ?1",
                params![event.event_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(position) = deduped {
            return Ok(AppendOutcome {
                status: AppendStatus::Duplicate,
                position: GlobalPosition::new(position),
            });
        }

        // Document PK is the backstop once the dedup entry has expired
        let existing: Option<i64> = tx
            .query_row(
                "SELECT global_position FROM events WHERE event_id = ?1",
                params![event.event_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(position) = existing {
            return Ok(AppendOutcome {
                status: AppendStatus::Duplicate,
                position: GlobalPosition::new(position),
            });
        }

        // 2a. Global stream entry; rowid becomes the global position
        tx.execute(
            "INSERT INTO stream (event_id, session_id, appended_at) VALUES (?1, ?2, ?3)",
            params![event.event_id, event.session_id, now.to_rfc3339()],
        )?;
        let position = tx.last_insert_rowid();

        // 2b/2c. Document write (the per-session substream is the index on
        // the stream table, written by 2a)
        tx.execute(
            "INSERT INTO events (
                event_id, global_position, event_type, occurred_at, occurred_at_ms,
                session_id, agent_id, trace_id, payload_ref, tool_name,
                parent_event_id, ended_at, status, schema_version, importance_hint
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                event.event_id,
                position,
                event.event_type,
                event.occurred_at.to_rfc3339(),
                event.occurred_at.timestamp_millis(),
                event.session_id,
                event.agent_id,
                event.trace_id,
                event.payload_ref,
                event.tool_name,
                event.parent_event_id,
                event.ended_at.map(|t| t.to_rfc3339()),
                event.status.map(|s| s.as_str()),
                event.schema_version,
                event.importance_hint,
            ],
        )?;

        // 2d. Dedup set entry with TTL
        tx.execute(
            "INSERT INTO dedup (event_id, global_position, expires_at_ms) VALUES (?1, ?2, ?3)",
            params![
                event.event_id,
                position,
                now.timestamp_millis() + dedup_ttl_ms
            ],
        )?;

        Ok(AppendOutcome {
            status: AppendStatus::New,
            position: GlobalPosition::new(position),
        })
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Fetch a single event document by id
    pub fn get_by_id(&self, event_id: &str) -> Result<Option<Event>> {
        let conn = self.lock_reader()?;
        conn.query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = ?1"),
            params![event_id],
            row_to_event,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Events of a session in `occurred_at` order
    pub fn get_by_session(
        &self,
        session_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let conn = self.lock_reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE session_id = ?1
               AND occurred_at_ms >= ?2 AND occurred_at_ms <= ?3
             ORDER BY occurred_at_ms ASC, global_position ASC
             LIMIT ?4"
        ))?;
        let from_ms = from.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);
        let to_ms = to.map(|t| t.timestamp_millis()).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![session_id, from_ms, to_ms, limit as i64], row_to_event)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Number of events recorded for a session
    pub fn count_by_session(&self, session_id: &str) -> Result<u64> {
        let conn = self.lock_reader()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Paginated secondary-index search.
    ///
    /// The cursor is opaque keyset state; pass it back verbatim to continue.
    pub fn search(
        &self,
        query: &EventQuery,
        sort: SortOrder,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<EventPage> {
        let mut clauses: Vec<String> = vec!["1=1".to_string()];
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        let mut push_eq = |clauses: &mut Vec<String>,
                           args: &mut Vec<Box<dyn rusqlite::types::ToSql>>,
                           column: &str,
                           value: &Option<String>| {
            if let Some(v) = value {
                args.push(Box::new(v.clone()));
                clauses.push(format!("{} = ?{}", column, args.len()));
            }
        };
        push_eq(&mut clauses, &mut args, "session_id", &query.session_id);
        push_eq(&mut clauses, &mut args, "agent_id", &query.agent_id);
        push_eq(&mut clauses, &mut args, "trace_id", &query.trace_id);
        push_eq(&mut clauses, &mut args, "event_type", &query.event_type);
        push_eq(&mut clauses, &mut args, "tool_name", &query.tool_name);

        if let Some(from) = query.from {
            args.push(Box::new(from.timestamp_millis()));
            clauses.push(format!("occurred_at_ms >= ?{}", args.len()));
        }
        if let Some(to) = query.to {
            args.push(Box::new(to.timestamp_millis()));
            clauses.push(format!("occurred_at_ms <= ?{}", args.len()));
        }

        if let Some(cursor) = cursor {
            let (ms, pos) = decode_cursor(cursor)
                .ok_or_else(|| EventStoreError::Init(format!("bad cursor '{}'", cursor)))?;
            args.push(Box::new(ms));
            let ms_idx = args.len();
            args.push(Box::new(ms));
            let ms_idx2 = args.len();
            args.push(Box::new(pos));
            let pos_idx = args.len();
            match sort {
                SortOrder::Asc => clauses.push(format!(
                    "(occurred_at_ms > ?{ms_idx} OR (occurred_at_ms = ?{ms_idx2} AND global_position > ?{pos_idx}))"
                )),
                SortOrder::Desc => clauses.push(format!(
                    "(occurred_at_ms < ?{ms_idx} OR (occurred_at_ms = ?{ms_idx2} AND global_position < ?{pos_idx}))"
                )),
            }
        }

        let order = match sort {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE {} \
             ORDER BY occurred_at_ms {order}, global_position {order} LIMIT {}",
            clauses.join(" AND "),
            limit + 1
        );

        let conn = self.lock_reader()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter().map(|a| a.as_ref())), row_to_event)?;
        let mut events = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        let next_cursor = if events.len() > limit {
            events.truncate(limit);
            events.last().map(|e| {
                encode_cursor(
                    e.occurred_at.timestamp_millis(),
                    e.global_position.map(|p| p.raw()).unwrap_or(0),
                )
            })
        } else {
            None
        };

        Ok(EventPage { events, next_cursor })
    }

    /// Number of entries currently in the global stream
    pub fn stream_length(&self) -> Result<u64> {
        let conn = self.lock_reader()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM stream", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Highest assigned global position, if any
    pub fn last_position(&self) -> Result<Option<GlobalPosition>> {
        let conn = self.lock_reader()?;
        let max: Option<i64> =
            conn.query_row("SELECT MAX(position) FROM stream", [], |row| row.get(0))?;
        Ok(max.map(GlobalPosition::new))
    }

    /// Read events with positions in `[from, to]` in stream order.
    ///
    /// Large cold-store replays should use cursor-paginated `search` instead;
    /// this walks the (hot) stream window.
    pub fn read_range(&self, from: GlobalPosition, to: GlobalPosition) -> Result<Vec<Event>> {
        let conn = self.lock_reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE global_position >= ?1 AND global_position <= ?2
             ORDER BY global_position ASC"
        ))?;
        let rows = stmt.query_map(params![from.raw(), to.raw()], row_to_event)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ========================================================================
    // TRIMMING, TIERING, GDPR
    // ========================================================================

    /// Remove stream entries below `before`, leaving documents in place.
    ///
    /// Never trims entries a consumer group has not acknowledged: the
    /// effective bound is clamped to the lowest unacked position.
    pub fn trim(&self, before: GlobalPosition) -> Result<u64> {
        let conn = self.lock_writer()?;

        let min_pending: Option<i64> =
            conn.query_row("SELECT MIN(position) FROM pending_entries", [], |row| row.get(0))?;
        let min_undelivered: Option<i64> = conn.query_row(
            "SELECT MIN(last_delivered) + 1 FROM consumer_groups",
            [],
            |row| row.get(0),
        )?;

        let mut effective = before.raw();
        if let Some(p) = min_pending {
            effective = effective.min(p);
        }
        if let Some(p) = min_undelivered {
            effective = effective.min(p);
        }

        let deleted = conn.execute("DELETE FROM stream WHERE position < ?1", params![effective])?;
        Ok(deleted as u64)
    }

    /// GDPR cold-tier deletion of a document
    pub fn delete_document(&self, event_id: &str) -> Result<bool> {
        let conn = self.lock_writer()?;
        let deleted = conn.execute("DELETE FROM events WHERE event_id = ?1", params![event_id])?;
        Ok(deleted > 0)
    }

    /// Soft-erase: tombstone the document's payload pointer, keep the envelope
    pub fn tombstone_document(&self, event_id: &str) -> Result<bool> {
        let conn = self.lock_writer()?;
        let updated = conn.execute(
            "UPDATE events SET tombstoned = 1, payload_ref = '' WHERE event_id = ?1",
            params![event_id],
        )?;
        Ok(updated > 0)
    }

    /// Drop expired dedup entries
    pub fn sweep_dedup(&self, now: DateTime<Utc>) -> Result<u64> {
        let conn = self.lock_writer()?;
        let deleted = conn.execute(
            "DELETE FROM dedup WHERE expires_at_ms < ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(deleted as u64)
    }

    /// Enforce the hot/cold/ceiling tiering policy.
    ///
    /// Hot window: stream entries + documents. Cold: documents only. Beyond
    /// the ceiling documents are deleted (graph summaries preserve residue).
    pub fn enforce_retention(
        &self,
        now: DateTime<Utc>,
        hot_days: i64,
        ceiling_days: i64,
    ) -> Result<RetentionReport> {
        let hot_boundary = now - chrono::Duration::days(hot_days);
        let ceiling_boundary = now - chrono::Duration::days(ceiling_days);

        // Find the highest position older than the hot window, then trim
        // below it (trim itself protects unacked entries).
        let trim_before: Option<i64> = {
            let conn = self.lock_reader()?;
            conn.query_row(
                "SELECT MAX(position) FROM stream WHERE appended_at < ?1",
                params![hot_boundary.to_rfc3339()],
                |row| row.get(0),
            )?
        };
        let stream_entries_trimmed = match trim_before {
            Some(position) => self.trim(GlobalPosition::new(position + 1))?,
            None => 0,
        };

        let documents_deleted = {
            let conn = self.lock_writer()?;
            conn.execute(
                "DELETE FROM events WHERE occurred_at_ms < ?1",
                params![ceiling_boundary.timestamp_millis()],
            )? as u64
        };

        let dedup_swept = self.sweep_dedup(now)?;

        Ok(RetentionReport {
            stream_entries_trimmed,
            documents_deleted,
            dedup_swept,
        })
    }

    // ========================================================================
    // CONSUMER GROUPS
    // ========================================================================

    /// Create a consumer group positioned at the start of the stream.
    ///
    /// Idempotent: an existing group keeps its cursor.
    pub fn create_group(&self, group: &str) -> Result<()> {
        let conn = self.lock_writer()?;
        conn.execute(
            "INSERT INTO consumer_groups (group_name, last_delivered, created_at)
             VALUES (?1, 0, ?2)
             ON CONFLICT(group_name) DO NOTHING",
            params![group, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Deliver up to `max_count` entries to a group member.
    ///
    /// Redelivers pending entries idle longer than `claim_idle` first (crash
    /// recovery), then new entries past the group cursor, recording each in
    /// the pending-entry list. `up_to` bounds delivery to positions at or
    /// below another group's acknowledged floor (consumer-ordering handshake).
    pub fn read_group(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        claim_idle: Duration,
        up_to: Option<GlobalPosition>,
    ) -> Result<Vec<DeliveredEntry>> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let mut conn = self.lock_writer()?;
        let tx = conn.transaction()?;
        let mut delivered: Vec<(i64, i64)> = Vec::new();

        // Claim idle pending entries for redelivery
        {
            let claim_before = now_ms - claim_idle.as_millis() as i64;
            let mut stmt = tx.prepare(
                "SELECT position, delivery_count FROM pending_entries
                 WHERE group_name = ?1 AND delivered_at_ms <= ?2
                 ORDER BY position ASC LIMIT ?3",
            )?;
            let idle: Vec<(i64, i64)> = stmt
                .query_map(params![group, claim_before, max_count as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            for (position, count) in idle {
                tx.execute(
                    "UPDATE pending_entries
                     SET consumer = ?1, delivered_at_ms = ?2, delivery_count = delivery_count + 1
                     WHERE group_name = ?3 AND position = ?4",
                    params![consumer, now_ms, group, position],
                )?;
                delivered.push((position, count + 1));
            }
        }

        // Deliver new entries past the group cursor
        if delivered.len() < max_count {
            let last_delivered: i64 = tx
                .query_row(
                    "SELECT last_delivered FROM consumer_groups WHERE group_name = ?1",
                    params![group],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| EventStoreError::NotFound(format!("consumer group '{group}'")))?;

            let ceiling = up_to.map(|p| p.raw()).unwrap_or(i64::MAX);
            let remaining = max_count - delivered.len();
            let mut stmt = tx.prepare(
                "SELECT position FROM stream
                 WHERE position > ?1 AND position <= ?2
                 ORDER BY position ASC LIMIT ?3",
            )?;
            let fresh: Vec<i64> = stmt
                .query_map(params![last_delivered, ceiling, remaining as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            for position in &fresh {
                tx.execute(
                    "INSERT INTO pending_entries
                     (group_name, position, consumer, delivered_at_ms, delivery_count)
                     VALUES (?1, ?2, ?3, ?4, 1)
                     ON CONFLICT(group_name, position) DO UPDATE SET
                       consumer = excluded.consumer,
                       delivered_at_ms = excluded.delivered_at_ms,
                       delivery_count = delivery_count + 1",
                    params![group, position, consumer, now_ms],
                )?;
                delivered.push((*position, 1));
            }
            if let Some(max_fresh) = fresh.last() {
                tx.execute(
                    "UPDATE consumer_groups SET last_delivered = ?1 WHERE group_name = ?2",
                    params![max_fresh, group],
                )?;
            }
        }

        // Join documents inside the same transaction
        let mut entries = Vec::with_capacity(delivered.len());
        for (position, delivery_count) in delivered {
            let event: Option<Event> = tx
                .query_row(
                    &format!("SELECT {EVENT_COLUMNS} FROM events WHERE global_position = ?1"),
                    params![position],
                    row_to_event,
                )
                .optional()?;
            match event {
                Some(event) => entries.push(DeliveredEntry {
                    position: GlobalPosition::new(position),
                    event,
                    delivery_count,
                }),
                // Document erased (GDPR/ceiling) while still on the stream:
                // nothing to process, drop the pending entry.
                None => {
                    tx.execute(
                        "DELETE FROM pending_entries WHERE group_name = ?1 AND position = ?2",
                        params![group, position],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(entries)
    }

    /// Rewind a group to the start of the stream and clear its pending
    /// list. Replaying through the consumers rebuilds the graph projection.
    pub fn reset_group(&self, group: &str) -> Result<()> {
        let mut conn = self.lock_writer()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE consumer_groups SET last_delivered = 0 WHERE group_name = ?1",
            params![group],
        )?;
        if updated == 0 {
            return Err(EventStoreError::NotFound(format!("consumer group '{group}'")));
        }
        tx.execute(
            "DELETE FROM pending_entries WHERE group_name = ?1",
            params![group],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Acknowledge a delivered entry, removing it from the pending list
    pub fn ack(&self, group: &str, position: GlobalPosition) -> Result<bool> {
        let conn = self.lock_writer()?;
        let deleted = conn.execute(
            "DELETE FROM pending_entries WHERE group_name = ?1 AND position = ?2",
            params![group, position.raw()],
        )?;
        Ok(deleted > 0)
    }

    /// Pending-entry summary for a group
    pub fn pending(&self, group: &str) -> Result<PendingSummary> {
        let conn = self.lock_reader()?;
        let (count, oldest): (i64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MIN(position) FROM pending_entries WHERE group_name = ?1",
            params![group],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(PendingSummary {
            count: count as u64,
            oldest_position: oldest.map(GlobalPosition::new),
        })
    }

    /// Highest position a group has fully acknowledged: everything at or
    /// below this position was delivered and acked.
    pub fn acked_floor(&self, group: &str) -> Result<GlobalPosition> {
        let conn = self.lock_reader()?;
        let last_delivered: i64 = conn
            .query_row(
                "SELECT last_delivered FROM consumer_groups WHERE group_name = ?1",
                params![group],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        let min_pending: Option<i64> = conn.query_row(
            "SELECT MIN(position) FROM pending_entries WHERE group_name = ?1",
            params![group],
            |row| row.get(0),
        )?;
        let floor = match min_pending {
            Some(p) => (p - 1).min(last_delivered),
            None => last_delivered,
        };
        Ok(GlobalPosition::new(floor))
    }

    /// Record a poison message and acknowledge it so the stream never stalls
    pub fn record_poison(
        &self,
        group: &str,
        position: GlobalPosition,
        event_id: Option<&str>,
        reason: &str,
    ) -> Result<()> {
        let mut conn = self.lock_writer()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO poison_messages (group_name, position, event_id, reason, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(group_name, position) DO UPDATE SET reason = excluded.reason",
            params![group, position.raw(), event_id, reason, Utc::now().to_rfc3339()],
        )?;
        tx.execute(
            "DELETE FROM pending_entries WHERE group_name = ?1 AND position = ?2",
            params![group, position.raw()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Stream and group statistics for admin surfaces
    pub fn stats(&self) -> Result<StreamStats> {
        let conn = self.lock_reader()?;
        let stream_length: i64 = conn.query_row("SELECT COUNT(*) FROM stream", [], |r| r.get(0))?;
        let document_count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
        let last_position: Option<i64> =
            conn.query_row("SELECT MAX(position) FROM stream", [], |r| r.get(0))?;
        let poison_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM poison_messages", [], |r| r.get(0))?;

        let mut stmt = conn.prepare(
            "SELECT g.group_name, g.last_delivered,
                    (SELECT COUNT(*) FROM pending_entries p WHERE p.group_name = g.group_name)
             FROM consumer_groups g ORDER BY g.group_name",
        )?;
        let groups = stmt
            .query_map([], |row| {
                Ok(GroupStats {
                    name: row.get(0)?,
                    last_delivered: row.get::<_, i64>(1)?.to_string(),
                    pending: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(StreamStats {
            stream_length: stream_length as u64,
            document_count: document_count as u64,
            last_position: last_position.map(|p| p.to_string()),
            poison_count: poison_count as u64,
            groups,
        })
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

const EVENT_COLUMNS: &str = "event_id, global_position, event_type, occurred_at, session_id, \
                             agent_id, trace_id, payload_ref, tool_name, parent_event_id, \
                             ended_at, status, schema_version, importance_hint";

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let occurred_at: String = row.get(3)?;
    let ended_at: Option<String> = row.get(10)?;
    let status: Option<String> = row.get(11)?;
    Ok(Event {
        event_id: row.get(0)?,
        global_position: Some(GlobalPosition::new(row.get(1)?)),
        event_type: row.get(2)?,
        occurred_at: parse_rfc3339(&occurred_at, 3)?,
        session_id: row.get(4)?,
        agent_id: row.get(5)?,
        trace_id: row.get(6)?,
        payload_ref: row.get(7)?,
        tool_name: row.get(8)?,
        parent_event_id: row.get(9)?,
        ended_at: ended_at.as_deref().map(|s| parse_rfc3339(s, 10)).transpose()?,
        status: status.as_deref().and_then(EventStatus::parse_name),
        schema_version: row.get(12)?,
        importance_hint: row.get(13)?,
    })
}

fn parse_rfc3339(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn encode_cursor(occurred_at_ms: i64, position: i64) -> String {
    format!("{occurred_at_ms}:{position}")
}

fn decode_cursor(cursor: &str) -> Option<(i64, i64)> {
    let (ms, pos) = cursor.split_once(':')?;
    Some((ms.parse().ok()?, pos.parse().ok()?))
}

// ============================================================================
// TESTS
// ============================================================================
