//! SQLite graph store implementation

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::domain::{
    entity_id, event_node_id, EdgeKind, EntityNodeAttrs, EntityType, Event, EventNodeAttrs,
    NodeKind,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Graph store error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Node not found
    #[error("Node not found: {0}")]
    NotFound(String),
    /// Edge endpoints violate the relation's legality table
    #[error("Illegal edge {edge} from {source_kind} to {target_kind}")]
    IllegalEdge {
        edge: &'static str,
        source_kind: &'static str,
        target_kind: &'static str,
    },
    /// Edge or node property violates an enum/range constraint
    #[error("Invalid property: {0}")]
    InvalidProperty(String),
    /// Store unreachable or a lock was poisoned; retriable
    #[error("Graph store unavailable: {0}")]
    Unavailable(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Graph store result type
pub type Result<T> = std::result::Result<T, GraphError>;

// ============================================================================
// RECORD TYPES
// ============================================================================

/// Input record for an insert-or-merge node write
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: String,
    pub kind: NodeKind,
    pub attrs: Value,
    pub importance: Option<f64>,
    pub stability_hours: Option<f64>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub embedding: Option<Vec<f32>>,
}

impl NodeRecord {
    /// Minimal record: id, kind, attribute document
    pub fn new(id: impl Into<String>, kind: NodeKind, attrs: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            attrs,
            importance: None,
            stability_hours: None,
            occurred_at: None,
            session_id: None,
            agent_id: None,
            user_id: None,
            embedding: None,
        }
    }
}

/// A node as stored, with its scoring state
#[derive(Debug, Clone)]
pub struct StoredNode {
    pub id: String,
    pub kind: NodeKind,
    pub attrs: Value,
    pub importance: Option<f64>,
    pub access_count: i64,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub stability_hours: Option<f64>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub embedding: Option<Vec<f32>>,
}

/// A typed edge as stored
#[derive(Debug, Clone)]
pub struct StoredEdge {
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
    pub props: Value,
    pub created_at: DateTime<Utc>,
}

/// A node reached by traversal, with how it was reached
#[derive(Debug, Clone)]
pub struct TraversedNode {
    pub node: StoredNode,
    pub depth: usize,
    /// Product of hop decay and normalized edge weights along the path;
    /// seeds start at 1.0
    pub path_score: f64,
    pub via: Option<EdgeKind>,
}

/// Bounded traversal result
#[derive(Debug, Clone, Default)]
pub struct Subgraph {
    pub nodes: Vec<TraversedNode>,
    pub edges: Vec<StoredEdge>,
    pub truncated: bool,
}

impl Default for TraversalOptions {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_nodes: 50,
            timeout: Duration::from_millis(500),
            weight_threshold: 0.5,
            hop_decay: 0.8,
            weight_norm: 5.0,
        }
    }
}

/// Traversal bounds; every query carries them
#[derive(Debug, Clone)]
pub struct TraversalOptions {
    pub max_depth: usize,
    pub max_nodes: usize,
    pub timeout: Duration,
    /// Edges with effective weight below this are not followed
    pub weight_threshold: f64,
    /// Per-hop attenuation of the path score
    pub hop_decay: f64,
    /// Weight considered "full strength" when normalizing path scores
    pub weight_norm: f64,
}

/// Direction of lineage traversal over CAUSED_BY
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineageDirection {
    Backward,
    Forward,
    Both,
}

impl LineageDirection {
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "backward" => Some(LineageDirection::Backward),
            "forward" => Some(LineageDirection::Forward),
            "both" => Some(LineageDirection::Both),
            _ => None,
        }
    }
}

/// Bounded lineage result
#[derive(Debug, Clone, Default)]
pub struct Lineage {
    pub nodes: Vec<TraversedNode>,
    pub edges: Vec<StoredEdge>,
    pub truncated: bool,
}

/// Aggregate view of one session's projected events
#[derive(Debug, Clone)]
pub struct SessionEventStats {
    pub session_id: String,
    pub agent_id: Option<String>,
    pub event_count: u64,
    pub first_ms: i64,
    pub last_ms: i64,
}

// ============================================================================
// GRAPH STORE
// ============================================================================

/// Property-graph adapter with idempotent merge writes.
///
/// Same interior-mutability layout as the event store: writer/reader
/// connections behind mutexes, `&self` methods, `Send + Sync`.
pub struct GraphStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl GraphStore {
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -32000;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) the graph store at the given path
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer_conn = Connection::open(&path)?;
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| GraphError::Unavailable("writer lock poisoned".to_string()))
    }

    fn lock_reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| GraphError::Unavailable("reader lock poisoned".to_string()))
    }

    // ========================================================================
    // NODE WRITES
    // ========================================================================

    /// Insert-or-merge a node by stable id.
    ///
    /// Existing scoring state (access_count, last_accessed_at) is preserved;
    /// attrs/importance/embedding take the incoming value when present.
    pub fn put_node(&self, record: &NodeRecord) -> Result<()> {
        let conn = self.lock_writer()?;
        conn.execute(
            "INSERT INTO nodes (
                id, kind, attrs, importance, stability_hours, occurred_at, occurred_at_ms,
                session_id, agent_id, user_id, created_at, embedding
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                attrs = excluded.attrs,
                importance = COALESCE(excluded.importance, nodes.importance),
                stability_hours = COALESCE(excluded.stability_hours, nodes.stability_hours),
                embedding = COALESCE(excluded.embedding, nodes.embedding)",
            params![
                record.id,
                record.kind.as_str(),
                record.attrs.to_string(),
                record.importance,
                record.stability_hours,
                record.occurred_at.map(|t| t.to_rfc3339()),
                record.occurred_at.map(|t| t.timestamp_millis()),
                record.session_id,
                record.agent_id,
                record.user_id,
                Utc::now().to_rfc3339(),
                record.embedding.as_deref().map(embedding_to_bytes),
            ],
        )?;
        Ok(())
    }

    /// Merge the graph projection of an event; idempotent by `event_id`.
    ///
    /// A replayed event never clobbers enrichment-derived attributes.
    pub fn merge_event_node(&self, event: &Event) -> Result<String> {
        let id = event_node_id(&event.event_id);
        let attrs = serde_json::to_value(EventNodeAttrs::from_event(event))?;
        let conn = self.lock_writer()?;
        conn.execute(
            "INSERT INTO nodes (
                id, kind, attrs, importance, occurred_at, occurred_at_ms,
                session_id, agent_id, created_at
            ) VALUES (?1, 'event', ?2, NULL, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO NOTHING",
            params![
                id,
                attrs.to_string(),
                event.occurred_at.to_rfc3339(),
                event.occurred_at.timestamp_millis(),
                event.session_id,
                event.agent_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    /// Merge an entity by canonical (name, type) key.
    ///
    /// New entities start at mention_count 1; existing ones get the count
    /// bumped and `last_seen` advanced.
    pub fn merge_entity_node(&self, name: &str, entity_type: EntityType, now: DateTime<Utc>) -> Result<String> {
        let id = entity_id(name, entity_type);
        let attrs = EntityNodeAttrs {
            entity_id: id.clone(),
            name: name.trim().to_string(),
            entity_type,
            first_seen: now,
            last_seen: now,
            mention_count: 1,
            tombstoned: false,
        };
        let user_id = match entity_type {
            EntityType::User => Some(name.trim().to_string()),
            _ => None,
        };
        let conn = self.lock_writer()?;
        conn.execute(
            "INSERT INTO nodes (id, kind, attrs, occurred_at, occurred_at_ms, user_id, created_at)
             VALUES (?1, 'entity', ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                attrs = json_set(nodes.attrs,
                    '$.mentionCount', json_extract(nodes.attrs, '$.mentionCount') + 1,
                    '$.lastSeen', ?3)",
            params![
                id,
                serde_json::to_value(&attrs)?.to_string(),
                now.to_rfc3339(),
                now.timestamp_millis(),
                user_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    /// Write enrichment-derived attributes onto an event node
    pub fn set_event_enrichment(
        &self,
        node_id: &str,
        keywords: &[String],
        summary: Option<&str>,
        importance: f64,
        embedding: Option<&[f32]>,
    ) -> Result<()> {
        if !(1.0..=10.0).contains(&importance) {
            return Err(GraphError::InvalidProperty(format!(
                "importance_score {importance} outside 1..=10"
            )));
        }
        let conn = self.lock_writer()?;
        let updated = conn.execute(
            "UPDATE nodes SET
                attrs = json_set(attrs, '$.keywords', json(?2), '$.summary', ?3),
                importance = ?4,
                embedding = COALESCE(?5, embedding)
             WHERE id = ?1",
            params![
                node_id,
                serde_json::to_value(keywords)?.to_string(),
                summary,
                importance,
                embedding.map(embedding_to_bytes),
            ],
        )?;
        if updated == 0 {
            return Err(GraphError::NotFound(node_id.to_string()));
        }
        Ok(())
    }

    /// Store an embedding on any node
    pub fn set_embedding(&self, node_id: &str, embedding: &[f32]) -> Result<()> {
        let conn = self.lock_writer()?;
        let updated = conn.execute(
            "UPDATE nodes SET embedding = ?2 WHERE id = ?1",
            params![node_id, embedding_to_bytes(embedding)],
        )?;
        if updated == 0 {
            return Err(GraphError::NotFound(node_id.to_string()));
        }
        Ok(())
    }

    /// Reinforcement on retrieval: bump access_count, stamp
    /// last_accessed_at, extend stability
    pub fn update_access(&self, node_id: &str, now: DateTime<Utc>, stability_boost_hours: f64) -> Result<()> {
        let conn = self.lock_writer()?;
        conn.execute(
            "UPDATE nodes SET
                access_count = access_count + 1,
                last_accessed_at = ?2,
                stability_hours = COALESCE(stability_hours, 0) + ?3
             WHERE id = ?1",
            params![node_id, now.to_rfc3339(), stability_boost_hours],
        )?;
        Ok(())
    }

    /// Append-only supersession: point the older preference at its successor
    pub fn set_superseded(&self, preference_id: &str, superseded_by: &str) -> Result<()> {
        let conn = self.lock_writer()?;
        let updated = conn.execute(
            "UPDATE nodes SET attrs = json_set(attrs, '$.supersededBy', ?2) WHERE id = ?1",
            params![preference_id, superseded_by],
        )?;
        if updated == 0 {
            return Err(GraphError::NotFound(preference_id.to_string()));
        }
        Ok(())
    }

    /// Reinforce a confirmed preference: observation_count++, confidence
    /// nudged up (capped at 1.0), last_confirmed_at stamped, stability boosted
    pub fn reinforce_preference(
        &self,
        preference_id: &str,
        now: DateTime<Utc>,
        stability_boost_hours: f64,
    ) -> Result<()> {
        let conn = self.lock_writer()?;
        let updated = conn.execute(
            "UPDATE nodes SET
                attrs = json_set(attrs,
                    '$.observationCount', json_extract(attrs, '$.observationCount') + 1,
                    '$.lastConfirmedAt', ?2,
                    '$.confidence', min(1.0, json_extract(attrs, '$.confidence') + 0.05)),
                stability_hours = COALESCE(stability_hours, 0) + ?3
             WHERE id = ?1",
            params![preference_id, now.to_rfc3339(), stability_boost_hours],
        )?;
        if updated == 0 {
            return Err(GraphError::NotFound(preference_id.to_string()));
        }
        Ok(())
    }

    /// Delete nodes and every edge touching them
    pub fn delete_nodes(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock_writer()?;
        let tx = conn.transaction()?;
        let mut deleted = 0u64;
        for id in ids {
            tx.execute("DELETE FROM edges WHERE source = ?1 OR target = ?1", params![id])?;
            deleted += tx.execute("DELETE FROM nodes WHERE id = ?1", params![id])? as u64;
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Destroy the whole projection (replay support)
    pub fn clear_all(&self) -> Result<()> {
        let conn = self.lock_writer()?;
        conn.execute_batch("DELETE FROM edges; DELETE FROM nodes;")?;
        Ok(())
    }

    // ========================================================================
    // EDGE WRITES
    // ========================================================================

    /// Create a typed edge; idempotent on (source, target, type).
    ///
    /// Endpoint kinds and property enums are validated here because the
    /// engine cannot. Returns whether the edge was newly created.
    pub fn create_edge(&self, source: &str, target: &str, kind: EdgeKind, props: Value) -> Result<bool> {
        let source_node = self
            .get_node(source)?
            .ok_or_else(|| GraphError::NotFound(source.to_string()))?;
        let target_node = self
            .get_node(target)?
            .ok_or_else(|| GraphError::NotFound(target.to_string()))?;

        if !kind.endpoints_legal(source_node.kind, target_node.kind) {
            return Err(GraphError::IllegalEdge {
                edge: kind.as_str(),
                source_kind: source_node.kind.as_str(),
                target_kind: target_node.kind.as_str(),
            });
        }
        validate_edge_props(kind, &props)?;

        let conn = self.lock_writer()?;
        let inserted = conn.execute(
            "INSERT INTO edges (source, target, edge_type, props, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source, target, edge_type) DO NOTHING",
            params![source, target, kind.as_str(), props.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    /// Batched edge creation; the batch is one transactional group
    pub fn create_edges_batch(&self, edges: &[(String, String, EdgeKind, Value)]) -> Result<u64> {
        // Validate outside the write transaction
        for (source, target, kind, props) in edges {
            let source_node = self
                .get_node(source)?
                .ok_or_else(|| GraphError::NotFound(source.clone()))?;
            let target_node = self
                .get_node(target)?
                .ok_or_else(|| GraphError::NotFound(target.clone()))?;
            if !kind.endpoints_legal(source_node.kind, target_node.kind) {
                return Err(GraphError::IllegalEdge {
                    edge: kind.as_str(),
                    source_kind: source_node.kind.as_str(),
                    target_kind: target_node.kind.as_str(),
                });
            }
            validate_edge_props(*kind, props)?;
        }

        let mut conn = self.lock_writer()?;
        let tx = conn.transaction()?;
        let mut created = 0u64;
        for (source, target, kind, props) in edges {
            created += tx.execute(
                "INSERT INTO edges (source, target, edge_type, props, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(source, target, edge_type) DO NOTHING",
                params![source, target, kind.as_str(), props.to_string(), Utc::now().to_rfc3339()],
            )? as u64;
        }
        tx.commit()?;
        Ok(created)
    }

    /// Delete SIMILAR_TO edges below a score whose source node is older than
    /// the cutoff (warm-tier forgetting)
    pub fn delete_weak_similarity(&self, min_score: f64, older_than: DateTime<Utc>) -> Result<u64> {
        let conn = self.lock_writer()?;
        let deleted = conn.execute(
            "DELETE FROM edges WHERE edge_type = 'SIMILAR_TO'
               AND json_extract(props, '$.score') < ?1
               AND source IN (SELECT id FROM nodes WHERE occurred_at_ms < ?2)",
            params![min_score, older_than.timestamp_millis()],
        )?;
        Ok(deleted as u64)
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Fetch a node by id
    pub fn get_node(&self, id: &str) -> Result<Option<StoredNode>> {
        let conn = self.lock_reader()?;
        conn.query_row(
            &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
            params![id],
            row_to_node,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Fetch an entity node by its deterministic id
    pub fn get_entity(&self, entity_id: &str) -> Result<Option<StoredNode>> {
        match self.get_node(entity_id)? {
            Some(node) if node.kind == NodeKind::Entity => Ok(Some(node)),
            _ => Ok(None),
        }
    }

    /// Edges touching a node. `outgoing`/`incoming` select direction; kinds
    /// filters when non-empty.
    pub fn edges_of(
        &self,
        node_id: &str,
        outgoing: bool,
        incoming: bool,
        kinds: &[EdgeKind],
    ) -> Result<Vec<StoredEdge>> {
        let conn = self.lock_reader()?;
        let mut edges = Vec::new();
        let kind_filter: HashSet<&str> = kinds.iter().map(|k| k.as_str()).collect();

        if outgoing {
            let mut stmt = conn.prepare(
                "SELECT source, target, edge_type, props, created_at FROM edges WHERE source = ?1",
            )?;
            collect_edges(&mut stmt, node_id, &kind_filter, &mut edges)?;
        }
        if incoming {
            let mut stmt = conn.prepare(
                "SELECT source, target, edge_type, props, created_at FROM edges WHERE target = ?1",
            )?;
            collect_edges(&mut stmt, node_id, &kind_filter, &mut edges)?;
        }
        Ok(edges)
    }

    /// Total degree (in + out), the centrality signal for importance recalc
    pub fn degree(&self, node_id: &str) -> Result<u64> {
        let conn = self.lock_reader()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM edges WHERE source = ?1 OR target = ?1",
            params![node_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Node counts by kind for the stats surface
    pub fn count_nodes_by_kind(&self) -> Result<std::collections::BTreeMap<String, u64>> {
        let conn = self.lock_reader()?;
        let mut stmt = conn.prepare("SELECT kind, COUNT(*) FROM nodes GROUP BY kind")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = std::collections::BTreeMap::new();
        for row in rows {
            let (kind, count) = row?;
            counts.insert(kind, count as u64);
        }
        Ok(counts)
    }

    /// Event nodes of a session, newest first (working-memory source)
    pub fn get_context(&self, session_id: &str, max_nodes: usize) -> Result<Vec<StoredNode>> {
        let conn = self.lock_reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE kind = 'event' AND session_id = ?1
             ORDER BY occurred_at_ms DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![session_id, max_nodes as i64], row_to_node)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Recent event nodes that carry embeddings (SIMILAR_TO candidates)
    pub fn recent_embedded_events(&self, limit: usize) -> Result<Vec<StoredNode>> {
        let conn = self.lock_reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE kind = 'event' AND embedding IS NOT NULL
             ORDER BY occurred_at_ms DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_node)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Entities whose name contains the token (case-insensitive)
    pub fn entities_matching(&self, token: &str, limit: usize) -> Result<Vec<StoredNode>> {
        let conn = self.lock_reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE kind = 'entity'
               AND lower(json_extract(attrs, '$.name')) LIKE ?1
             ORDER BY json_extract(attrs, '$.mentionCount') DESC LIMIT ?2"
        ))?;
        let pattern = format!("%{}%", token.to_lowercase());
        let rows = stmt.query_map(params![pattern, limit as i64], row_to_node)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// All entity nodes (bounded), for tier-2 embedding resolution
    pub fn list_entities(&self, limit: usize) -> Result<Vec<StoredNode>> {
        let conn = self.lock_reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE kind = 'entity'
             ORDER BY json_extract(attrs, '$.mentionCount') DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_node)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Nodes of a kind linked from a source via an edge kind (user views)
    pub fn targets_of(&self, source: &str, edge: EdgeKind) -> Result<Vec<(StoredEdge, StoredNode)>> {
        let conn = self.lock_reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT e.source, e.target, e.edge_type, e.props, e.created_at, {}
             FROM edges e JOIN nodes n ON n.id = e.target
             WHERE e.source = ?1 AND e.edge_type = ?2",
            NODE_COLUMNS_PREFIXED
        ))?;
        let rows = stmt.query_map(params![source, edge.as_str()], |row| {
            Ok((row_to_edge_at(row, 0)?, row_to_node_at(row, 5)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Top event nodes by importance in a recency window (seed candidates)
    pub fn top_recent_events(
        &self,
        agent_id: Option<&str>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredNode>> {
        let conn = self.lock_reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE kind = 'event' AND occurred_at_ms >= ?1
               AND (?2 IS NULL OR agent_id = ?2)
             ORDER BY COALESCE(importance, 0) DESC, occurred_at_ms DESC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![since.timestamp_millis(), agent_id, limit as i64],
            row_to_node,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Event nodes older than the cutoff failing both retention predicates
    pub fn prunable_events(
        &self,
        older_than: DateTime<Utc>,
        importance_floor: f64,
        access_floor: i64,
        keep_if_summarized: bool,
    ) -> Result<Vec<StoredNode>> {
        let conn = self.lock_reader()?;
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE kind = 'event' AND occurred_at_ms < ?1
               AND COALESCE(importance, 0) < ?2
               AND access_count < ?3
               AND (?4 = 0 OR id NOT IN
                    (SELECT target FROM edges WHERE edge_type = 'SUMMARIZES'))"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                older_than.timestamp_millis(),
                importance_floor,
                access_floor,
                keep_if_summarized as i64
            ],
            row_to_node,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Event nodes older than the cutoff regardless of score (archive tier).
    /// Callers decide which survivors to keep; summaries must exist first.
    pub fn archivable_events(&self, older_than: DateTime<Utc>) -> Result<Vec<StoredNode>> {
        let conn = self.lock_reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE kind = 'event' AND occurred_at_ms < ?1"
        ))?;
        let rows = stmt.query_map(params![older_than.timestamp_millis()], row_to_node)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Overwrite a node's importance score (consolidation recalculation)
    pub fn set_importance(&self, node_id: &str, importance: f64) -> Result<()> {
        if !(1.0..=10.0).contains(&importance) {
            return Err(GraphError::InvalidProperty(format!(
                "importance_score {importance} outside 1..=10"
            )));
        }
        let conn = self.lock_writer()?;
        let updated = conn.execute(
            "UPDATE nodes SET importance = ?2 WHERE id = ?1",
            params![node_id, importance],
        )?;
        if updated == 0 {
            return Err(GraphError::NotFound(node_id.to_string()));
        }
        Ok(())
    }

    /// Per-session aggregates over projected event nodes
    pub fn session_event_stats(&self, limit: usize) -> Result<Vec<SessionEventStats>> {
        let conn = self.lock_reader()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, MIN(agent_id), COUNT(*), MIN(occurred_at_ms), MAX(occurred_at_ms)
             FROM nodes WHERE kind = 'event' AND session_id IS NOT NULL
             GROUP BY session_id ORDER BY MAX(occurred_at_ms) DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(SessionEventStats {
                session_id: row.get(0)?,
                agent_id: row.get(1)?,
                event_count: row.get::<_, i64>(2)? as u64,
                first_ms: row.get(3)?,
                last_ms: row.get(4)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// All nodes of a kind for a user (GDPR export)
    pub fn nodes_for_user(&self, user_id: &str) -> Result<Vec<StoredNode>> {
        let conn = self.lock_reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE user_id = ?1"
        ))?;
        let rows = stmt.query_map(params![user_id], row_to_node)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ========================================================================
    // TRAVERSAL
    // ========================================================================

    /// Bounded multi-seed traversal with per-edge-kind weights.
    ///
    /// Expands breadth-first in both edge directions; an edge is followed
    /// when `weight(kind) * edge_quality` clears the threshold. Stops at
    /// max_depth/max_nodes/timeout and reports truncation instead of erroring.
    pub fn get_subgraph(
        &self,
        seeds: &[String],
        weight: &dyn Fn(EdgeKind) -> f64,
        options: &TraversalOptions,
    ) -> Result<Subgraph> {
        let started = Instant::now();
        let mut result = Subgraph::default();
        let mut visited: HashMap<String, usize> = HashMap::new();
        let mut seen_edges: HashSet<(String, String, &'static str)> = HashSet::new();
        let mut queue: VecDeque<(String, usize, f64)> = VecDeque::new();

        for seed in seeds {
            if visited.contains_key(seed) {
                continue;
            }
            if let Some(node) = self.get_node(seed)? {
                visited.insert(seed.clone(), 0);
                result.nodes.push(TraversedNode {
                    node,
                    depth: 0,
                    path_score: 1.0,
                    via: None,
                });
                queue.push_back((seed.clone(), 0, 1.0));
            }
        }

        while let Some((current, depth, score)) = queue.pop_front() {
            if depth >= options.max_depth {
                continue;
            }
            if result.nodes.len() >= options.max_nodes {
                result.truncated = true;
                break;
            }
            if started.elapsed() >= options.timeout {
                result.truncated = true;
                break;
            }

            let mut candidates: Vec<(StoredEdge, String, f64)> = Vec::new();
            for edge in self.edges_of(&current, true, true, &[])? {
                let effective = weight(edge.kind) * edge_quality(&edge);
                if effective < options.weight_threshold {
                    continue;
                }
                let neighbor = if edge.source == current {
                    edge.target.clone()
                } else {
                    edge.source.clone()
                };
                candidates.push((edge, neighbor, effective));
            }
            // Deterministic expansion: strongest edges first
            candidates.sort_by(|a, b| {
                b.2.partial_cmp(&a.2)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.1.cmp(&b.1))
            });

            for (edge, neighbor, effective) in candidates {
                let edge_key = (edge.source.clone(), edge.target.clone(), edge.kind.as_str());
                let neighbor_new = !visited.contains_key(&neighbor);
                if neighbor_new && result.nodes.len() >= options.max_nodes {
                    result.truncated = true;
                    continue;
                }
                if seen_edges.insert(edge_key) {
                    result.edges.push(edge.clone());
                }
                if !neighbor_new {
                    continue;
                }
                let Some(node) = self.get_node(&neighbor)? else {
                    continue;
                };
                let child_score =
                    score * options.hop_decay * (effective / options.weight_norm).min(1.0);
                visited.insert(neighbor.clone(), depth + 1);
                result.nodes.push(TraversedNode {
                    node,
                    depth: depth + 1,
                    path_score: child_score,
                    via: Some(edge.kind),
                });
                queue.push_back((neighbor, depth + 1, child_score));
            }
        }

        Ok(result)
    }

    /// Bounded causal lineage over CAUSED_BY (plus optional extra relations).
    ///
    /// Backward follows outgoing CAUSED_BY (effect to cause); forward follows
    /// incoming ones.
    pub fn get_lineage(
        &self,
        node_id: &str,
        direction: LineageDirection,
        extra_kinds: &[EdgeKind],
        options: &TraversalOptions,
    ) -> Result<Lineage> {
        let started = Instant::now();
        let mut lineage = Lineage::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();

        let Some(root) = self.get_node(node_id)? else {
            return Err(GraphError::NotFound(node_id.to_string()));
        };
        visited.insert(node_id.to_string());
        lineage.nodes.push(TraversedNode {
            node: root,
            depth: 0,
            path_score: 1.0,
            via: None,
        });
        queue.push_back((node_id.to_string(), 0));

        let mut kinds = vec![EdgeKind::CausedBy];
        kinds.extend_from_slice(extra_kinds);

        while let Some((current, depth)) = queue.pop_front() {
            if lineage.nodes.len() >= options.max_nodes || started.elapsed() >= options.timeout {
                lineage.truncated = true;
                break;
            }

            let (outgoing, incoming) = match direction {
                LineageDirection::Backward => (true, false),
                LineageDirection::Forward => (false, true),
                LineageDirection::Both => (true, true),
            };

            let onward = self.edges_of(&current, outgoing, incoming, &kinds)?;
            if depth >= options.max_depth {
                // Only report truncation when the cut actually dropped edges
                if onward.iter().any(|edge| {
                    let neighbor = if edge.source == current { &edge.target } else { &edge.source };
                    !visited.contains(neighbor)
                }) {
                    lineage.truncated = true;
                }
                continue;
            }

            for edge in onward {
                let neighbor = if edge.source == current {
                    edge.target.clone()
                } else {
                    edge.source.clone()
                };
                if lineage.nodes.len() >= options.max_nodes {
                    lineage.truncated = true;
                    break;
                }
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                let Some(node) = self.get_node(&neighbor)? else {
                    continue;
                };
                lineage.edges.push(edge.clone());
                lineage.nodes.push(TraversedNode {
                    node,
                    depth: depth + 1,
                    path_score: options.hop_decay.powi((depth + 1) as i32),
                    via: Some(edge.kind),
                });
                queue.push_back((neighbor, depth + 1));
            }
        }

        Ok(lineage)
    }

    // ========================================================================
    // GDPR
    // ========================================================================

    /// Cascade-erase a user's personalization subgraph.
    ///
    /// Deletes profile and preference nodes, removes skill/pattern/interest
    /// edges (shared nodes survive), and tombstones the user entity's name.
    pub fn erase_user(&self, user_entity_id: &str) -> Result<u64> {
        let mut to_delete: Vec<String> = Vec::new();
        for (_, node) in self.targets_of(user_entity_id, EdgeKind::HasProfile)? {
            to_delete.push(node.id);
        }
        for (_, node) in self.targets_of(user_entity_id, EdgeKind::HasPreference)? {
            to_delete.push(node.id);
        }
        let removed_nodes = self.delete_nodes(&to_delete)?;

        let conn = self.lock_writer()?;
        conn.execute(
            "DELETE FROM edges WHERE source = ?1
               AND edge_type IN ('HAS_SKILL', 'EXHIBITS_PATTERN', 'INTERESTED_IN')",
            params![user_entity_id],
        )?;
        conn.execute(
            "UPDATE nodes SET attrs = json_set(attrs, '$.name', '[erased]', '$.tombstoned', json('true'))
             WHERE id = ?1",
            params![user_entity_id],
        )?;
        Ok(removed_nodes)
    }
}

// ============================================================================
// EDGE PROPERTY VALIDATION
// ============================================================================

fn require_number(props: &Value, key: &str, min: f64, max: f64) -> Result<()> {
    match props.get(key).and_then(Value::as_f64) {
        Some(v) if (min..=max).contains(&v) => Ok(()),
        Some(v) => Err(GraphError::InvalidProperty(format!(
            "{key} = {v} outside [{min}, {max}]"
        ))),
        None => Err(GraphError::InvalidProperty(format!("missing numeric {key}"))),
    }
}

fn require_enum(props: &Value, key: &str, parse: impl Fn(&str) -> bool) -> Result<()> {
    match props.get(key).and_then(Value::as_str) {
        Some(v) if parse(v) => Ok(()),
        Some(v) => Err(GraphError::InvalidProperty(format!(
            "unknown {key} value '{v}'"
        ))),
        None => Err(GraphError::InvalidProperty(format!("missing {key}"))),
    }
}

/// Validate the property document for an edge kind before write
fn validate_edge_props(kind: EdgeKind, props: &Value) -> Result<()> {
    use crate::domain::{CausalMechanism, DerivationMethod, ReferenceRole};
    match kind {
        EdgeKind::Follows => {
            if props.get("sessionId").and_then(Value::as_str).is_none() {
                return Err(GraphError::InvalidProperty("missing sessionId".to_string()));
            }
            if props.get("deltaMs").and_then(Value::as_i64).is_none() {
                return Err(GraphError::InvalidProperty("missing deltaMs".to_string()));
            }
            Ok(())
        }
        EdgeKind::CausedBy => require_enum(props, "mechanism", |v| {
            CausalMechanism::parse_name(v).is_some()
        }),
        EdgeKind::SimilarTo => require_number(props, "score", 0.0, 1.0),
        EdgeKind::References => {
            require_enum(props, "role", |v| ReferenceRole::parse_name(v).is_some())
        }
        EdgeKind::SameAs | EdgeKind::RelatedTo => require_number(props, "confidence", 0.0, 1.0),
        EdgeKind::HasSkill => {
            require_number(props, "proficiency", 0.0, 1.0)?;
            require_number(props, "confidence", 0.0, 1.0)
        }
        EdgeKind::DerivedFrom => require_enum(props, "derivationMethod", |v| {
            DerivationMethod::parse_name(v).is_some()
        }),
        EdgeKind::InterestedIn => require_number(props, "weight", 0.0, 1.0),
        EdgeKind::Summarizes
        | EdgeKind::HasProfile
        | EdgeKind::HasPreference
        | EdgeKind::ExhibitsPattern
        | EdgeKind::About
        | EdgeKind::AbstractedFrom
        | EdgeKind::ParentSkill => Ok(()),
    }
}

/// Intrinsic edge quality used as a traversal multiplier
fn edge_quality(edge: &StoredEdge) -> f64 {
    match edge.kind {
        EdgeKind::SimilarTo => edge.props.get("score").and_then(Value::as_f64).unwrap_or(0.5),
        EdgeKind::SameAs | EdgeKind::RelatedTo => edge
            .props
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5),
        _ => 1.0,
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

const NODE_COLUMNS: &str = "id, kind, attrs, importance, access_count, last_accessed_at, \
                            stability_hours, occurred_at, session_id, agent_id, user_id, \
                            created_at, embedding";

const NODE_COLUMNS_PREFIXED: &str = "n.id, n.kind, n.attrs, n.importance, n.access_count, \
                                     n.last_accessed_at, n.stability_hours, n.occurred_at, \
                                     n.session_id, n.agent_id, n.user_id, n.created_at, n.embedding";

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredNode> {
    row_to_node_at(row, 0)
}

fn row_to_node_at(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<StoredNode> {
    let kind_raw: String = row.get(offset + 1)?;
    let attrs_raw: String = row.get(offset + 2)?;
    let last_accessed: Option<String> = row.get(offset + 5)?;
    let occurred: Option<String> = row.get(offset + 7)?;
    let created: String = row.get(offset + 11)?;
    let embedding_raw: Option<Vec<u8>> = row.get(offset + 12)?;

    Ok(StoredNode {
        id: row.get(offset)?,
        kind: NodeKind::parse_name(&kind_raw).unwrap_or(NodeKind::Event),
        attrs: serde_json::from_str(&attrs_raw).unwrap_or(Value::Null),
        importance: row.get(offset + 3)?,
        access_count: row.get(offset + 4)?,
        last_accessed_at: last_accessed.as_deref().and_then(parse_ts),
        stability_hours: row.get(offset + 6)?,
        occurred_at: occurred.as_deref().and_then(parse_ts),
        session_id: row.get(offset + 8)?,
        agent_id: row.get(offset + 9)?,
        user_id: row.get(offset + 10)?,
        created_at: parse_ts(&created).unwrap_or_else(Utc::now),
        embedding: embedding_raw.as_deref().map(embedding_from_bytes),
    })
}

fn row_to_edge_at(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<StoredEdge> {
    let kind_raw: String = row.get(offset + 2)?;
    let props_raw: String = row.get(offset + 3)?;
    let created: String = row.get(offset + 4)?;
    Ok(StoredEdge {
        source: row.get(offset)?,
        target: row.get(offset + 1)?,
        kind: EdgeKind::parse_name(&kind_raw).unwrap_or(EdgeKind::RelatedTo),
        props: serde_json::from_str(&props_raw).unwrap_or(Value::Null),
        created_at: parse_ts(&created).unwrap_or_else(Utc::now),
    })
}

fn collect_edges(
    stmt: &mut rusqlite::Statement<'_>,
    node_id: &str,
    kind_filter: &HashSet<&str>,
    out: &mut Vec<StoredEdge>,
) -> rusqlite::Result<()> {
    let rows = stmt.query_map(params![node_id], |row| row_to_edge_at(row, 0))?;
    for row in rows {
        let edge = row?;
        if kind_filter.is_empty() || kind_filter.contains(edge.kind.as_str()) {
            out.push(edge);
        }
    }
    Ok(())
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Pack an f32 vector into little-endian bytes
pub(crate) fn embedding_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Unpack little-endian bytes into an f32 vector
pub(crate) fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_graph() -> (tempfile::TempDir, GraphStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let graph = GraphStore::open(dir.path().join("graph.db")).expect("open graph");
        (dir, graph)
    }

    fn make_event(event_id: &str, session_id: &str) -> Event {
        Event {
            event_id: event_id.to_string(),
            event_type: "tool.call".to_string(),
            occurred_at: Utc::now(),
            session_id: session_id.to_string(),
            agent_id: "a1".to_string(),
            trace_id: "t1".to_string(),
            payload_ref: format!("p_{event_id}"),
            global_position: Some(crate::domain::GlobalPosition::new(1)),
            tool_name: None,
            parent_event_id: None,
            ended_at: None,
            status: None,
            schema_version: None,
            importance_hint: None,
        }
    }

    #[test]
    fn merge_event_node_is_idempotent() {
        let (_dir, graph) = temp_graph();
        let event = make_event("e1", "s1");
        let id1 = graph.merge_event_node(&event).unwrap();

        // Enrich, then replay the merge: derived attributes survive
        graph
            .set_event_enrichment(&id1, &["alpha".to_string()], None, 7.0, None)
            .unwrap();
        let id2 = graph.merge_event_node(&event).unwrap();
        assert_eq!(id1, id2);

        let node = graph.get_node(&id1).unwrap().unwrap();
        assert_eq!(node.importance, Some(7.0));
        assert_eq!(node.attrs["keywords"][0], "alpha");
        assert_eq!(graph.count_nodes_by_kind().unwrap()["event"], 1);
    }

    #[test]
    fn merge_entity_bumps_mentions() {
        let (_dir, graph) = temp_graph();
        let now = Utc::now();
        let id1 = graph.merge_entity_node("Postgres", EntityType::Tool, now).unwrap();
        let id2 = graph.merge_entity_node("postgres", EntityType::Tool, now).unwrap();
        assert_eq!(id1, id2);

        let node = graph.get_entity(&id1).unwrap().unwrap();
        assert_eq!(node.attrs["mentionCount"], 2);
    }

    #[test]
    fn edge_creation_is_idempotent_and_validated() {
        let (_dir, graph) = temp_graph();
        let e1 = graph.merge_event_node(&make_event("e1", "s1")).unwrap();
        let e2 = graph.merge_event_node(&make_event("e2", "s1")).unwrap();

        let props = json!({"sessionId": "s1", "deltaMs": 120});
        assert!(graph.create_edge(&e1, &e2, EdgeKind::Follows, props.clone()).unwrap());
        assert!(!graph.create_edge(&e1, &e2, EdgeKind::Follows, props).unwrap());

        // Endpoint violation
        let entity = graph
            .merge_entity_node("grep", EntityType::Tool, Utc::now())
            .unwrap();
        let err = graph
            .create_edge(&entity, &e1, EdgeKind::Follows, json!({"sessionId": "s1", "deltaMs": 1}))
            .unwrap_err();
        assert!(matches!(err, GraphError::IllegalEdge { .. }));

        // Enum violation
        let err = graph
            .create_edge(&e2, &e1, EdgeKind::CausedBy, json!({"mechanism": "psychic"}))
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidProperty(_)));

        // Range violation
        let err = graph
            .create_edge(&e1, &e2, EdgeKind::SimilarTo, json!({"score": 1.5}))
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidProperty(_)));
    }

    #[test]
    fn subgraph_respects_bounds_and_weights() {
        let (_dir, graph) = temp_graph();
        // Chain: e0 <- e1 <- e2 <- e3 via CAUSED_BY
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(graph.merge_event_node(&make_event(&format!("e{i}"), "s1")).unwrap());
        }
        for i in 1..4 {
            graph
                .create_edge(&ids[i], &ids[i - 1], EdgeKind::CausedBy, json!({"mechanism": "direct"}))
                .unwrap();
        }

        let weight = |kind: EdgeKind| if kind == EdgeKind::CausedBy { 5.0 } else { 1.0 };
        let options = TraversalOptions {
            max_depth: 2,
            ..TraversalOptions::default()
        };
        let subgraph = graph.get_subgraph(&[ids[3].clone()], &weight, &options).unwrap();

        // Depth 2 from e3: e3, e2, e1 but not e0
        let reached: Vec<&str> = subgraph.nodes.iter().map(|n| n.node.id.as_str()).collect();
        assert!(reached.contains(&ids[3].as_str()));
        assert!(reached.contains(&ids[1].as_str()));
        assert!(!reached.contains(&ids[0].as_str()));

        // Zero weight prunes the relation entirely
        let no_weight = |_: EdgeKind| 0.0;
        let pruned = graph.get_subgraph(&[ids[3].clone()], &no_weight, &options).unwrap();
        assert_eq!(pruned.nodes.len(), 1);
    }

    #[test]
    fn subgraph_truncates_at_max_nodes() {
        let (_dir, graph) = temp_graph();
        let hub = graph.merge_event_node(&make_event("hub", "s1")).unwrap();
        for i in 0..10 {
            let spoke = graph.merge_event_node(&make_event(&format!("s{i}"), "s1")).unwrap();
            graph
                .create_edge(&hub, &spoke, EdgeKind::SimilarTo, json!({"score": 0.95}))
                .unwrap();
        }

        let options = TraversalOptions {
            max_nodes: 5,
            ..TraversalOptions::default()
        };
        let subgraph = graph.get_subgraph(&[hub], &|_| 2.0, &options).unwrap();
        assert!(subgraph.truncated);
        assert!(subgraph.nodes.len() <= 5);
    }

    #[test]
    fn lineage_backward_walks_causes() {
        let (_dir, graph) = temp_graph();
        let cause = graph.merge_event_node(&make_event("cause", "s1")).unwrap();
        let mid = graph.merge_event_node(&make_event("mid", "s1")).unwrap();
        let effect = graph.merge_event_node(&make_event("effect", "s1")).unwrap();
        graph
            .create_edge(&mid, &cause, EdgeKind::CausedBy, json!({"mechanism": "direct"}))
            .unwrap();
        graph
            .create_edge(&effect, &mid, EdgeKind::CausedBy, json!({"mechanism": "direct"}))
            .unwrap();

        let lineage = graph
            .get_lineage(&effect, LineageDirection::Backward, &[], &TraversalOptions::default())
            .unwrap();
        assert_eq!(lineage.nodes.len(), 3);
        assert_eq!(lineage.edges.len(), 2);
        assert!(!lineage.truncated);

        // Depth 1 truncates the chain
        let shallow = graph
            .get_lineage(
                &effect,
                LineageDirection::Backward,
                &[],
                &TraversalOptions {
                    max_depth: 1,
                    ..TraversalOptions::default()
                },
            )
            .unwrap();
        assert_eq!(shallow.nodes.len(), 2);
        assert!(shallow.truncated);
    }

    #[test]
    fn access_update_reinforces() {
        let (_dir, graph) = temp_graph();
        let id = graph.merge_event_node(&make_event("e1", "s1")).unwrap();
        graph.update_access(&id, Utc::now(), 24.0).unwrap();
        graph.update_access(&id, Utc::now(), 24.0).unwrap();

        let node = graph.get_node(&id).unwrap().unwrap();
        assert_eq!(node.access_count, 2);
        assert_eq!(node.stability_hours, Some(48.0));
        assert!(node.last_accessed_at.is_some());
    }

    #[test]
    fn erase_user_removes_personalization() {
        let (_dir, graph) = temp_graph();
        let now = Utc::now();
        let user = graph.merge_entity_node("u1", EntityType::User, now).unwrap();
        let pref = NodeRecord {
            user_id: Some("u1".to_string()),
            ..NodeRecord::new("pref_1", NodeKind::Preference, json!({"key": "notification_method"}))
        };
        graph.put_node(&pref).unwrap();
        graph
            .create_edge(&user, "pref_1", EdgeKind::HasPreference, json!({}))
            .unwrap();

        let removed = graph.erase_user(&user).unwrap();
        assert_eq!(removed, 1);
        assert!(graph.get_node("pref_1").unwrap().is_none());
        let entity = graph.get_node(&user).unwrap().unwrap();
        assert_eq!(entity.attrs["name"], "[erased]");
    }

    #[test]
    fn embedding_roundtrip() {
        let vector = vec![0.25f32, -1.5, 3.125];
        let bytes = embedding_to_bytes(&vector);
        assert_eq!(embedding_from_bytes(&bytes), vector);
    }
}
