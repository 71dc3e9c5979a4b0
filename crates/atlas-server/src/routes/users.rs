//! User personalization views plus GDPR export and erasure

use std::collections::HashSet;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use atlas_core::domain::{entity_id, EdgeKind, EntityType};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// GET /v1/users/{user_id}/{view} for view in
/// profile|preferences|skills|patterns|interests
pub async fn get_user_view(
    State(state): State<AppState>,
    Path((user_id, view)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let started = Instant::now();
    let user_entity = require_user(&state, &user_id)?;

    let edge = match view.as_str() {
        "profile" => EdgeKind::HasProfile,
        "preferences" => EdgeKind::HasPreference,
        "skills" => EdgeKind::HasSkill,
        "patterns" => EdgeKind::ExhibitsPattern,
        "interests" => EdgeKind::InterestedIn,
        other => return Err(ApiError::BadRequest(format!("unknown view '{other}'"))),
    };

    let items: Vec<Value> = state
        .graph
        .targets_of(&user_entity, edge)?
        .into_iter()
        .map(|(link, node)| {
            json!({
                "id": node.id,
                "attributes": node.attrs,
                "edge": link.props,
            })
        })
        .collect();

    Ok(Json(json!({
        "userId": user_id,
        "view": view,
        "items": items,
        "meta": {"queryMs": started.elapsed().as_millis() as u64},
    })))
}

/// GET /v1/users/{user_id}/data - GDPR export of everything held about the
/// user
pub async fn export_user_data(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let started = Instant::now();
    let user_entity = require_user(&state, &user_id)?;

    let mut export = json!({"userId": user_id});
    for (name, edge) in [
        ("profile", EdgeKind::HasProfile),
        ("preferences", EdgeKind::HasPreference),
        ("skills", EdgeKind::HasSkill),
        ("patterns", EdgeKind::ExhibitsPattern),
        ("interests", EdgeKind::InterestedIn),
    ] {
        let items: Vec<Value> = state
            .graph
            .targets_of(&user_entity, edge)?
            .into_iter()
            .map(|(link, node)| json!({"id": node.id, "attributes": node.attrs, "edge": link.props}))
            .collect();
        export[name] = Value::Array(items);
    }

    // The user's sessions and their events, via provenance
    let sessions = user_sessions(&state, &user_entity)?;
    let mut events = Vec::new();
    for session in &sessions {
        for event in state.events.get_by_session(session, None, None, 1000)? {
            events.push(serde_json::to_value(&event).unwrap_or(Value::Null));
        }
    }
    export["sessions"] = json!(sessions);
    export["events"] = Value::Array(events);
    export["meta"] = json!({"queryMs": started.elapsed().as_millis() as u64});

    Ok(Json(export))
}

/// DELETE /v1/users/{user_id}/data - GDPR erasure cascade.
///
/// Order matters: crypto-shred payloads first, tombstone event documents,
/// then remove the personalization subgraph and tombstone the entity name.
/// After this, provenance chains no longer resolve to live content.
pub async fn erase_user_data(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let started = Instant::now();
    let user_entity = require_user(&state, &user_id)?;

    let sessions = user_sessions(&state, &user_entity)?;
    let payloads_erased = state.payloads.erase_sessions(&sessions)?;

    let mut events_tombstoned = 0u64;
    for session in &sessions {
        for event in state.events.get_by_session(session, None, None, 10_000)? {
            if state.events.tombstone_document(&event.event_id)? {
                events_tombstoned += 1;
            }
        }
    }

    let nodes_removed = state.graph.erase_user(&user_entity)?;

    tracing::info!(
        user = %user_id,
        sessions = sessions.len(),
        nodes_removed,
        events_tombstoned,
        "GDPR erasure complete"
    );
    Ok(Json(json!({
        "userId": user_id,
        "sessionsErased": sessions.len(),
        "payloadsErased": payloads_erased,
        "eventsTombstoned": events_tombstoned,
        "graphNodesRemoved": nodes_removed,
        "meta": {"queryMs": started.elapsed().as_millis() as u64},
    })))
}

fn require_user(state: &AppState, user_id: &str) -> Result<String, ApiError> {
    let id = entity_id(user_id, EntityType::User);
    state
        .graph
        .get_entity(&id)?
        .map(|node| node.id)
        .ok_or_else(|| ApiError::NotFound(format!("user '{user_id}'")))
}

/// Sessions associated with a user: nodes carrying the user_id plus the
/// sessions of events their knowledge was derived from
fn user_sessions(state: &AppState, user_entity: &str) -> Result<Vec<String>, ApiError> {
    let mut sessions: HashSet<String> = HashSet::new();

    let user_node = state.graph.get_node(user_entity)?;
    let raw_user_id = user_node
        .as_ref()
        .and_then(|n| n.user_id.clone())
        .unwrap_or_default();
    if !raw_user_id.is_empty() {
        for node in state.graph.nodes_for_user(&raw_user_id)? {
            if let Some(session) = node.session_id {
                sessions.insert(session);
            }
        }
    }

    for edge_kind in [EdgeKind::HasPreference, EdgeKind::HasSkill] {
        for (_, node) in state.graph.targets_of(user_entity, edge_kind)? {
            for derived in state
                .graph
                .edges_of(&node.id, true, false, &[EdgeKind::DerivedFrom])?
            {
                if let Some(event_node) = state.graph.get_node(&derived.target)? {
                    if let Some(session) = event_node.attrs["sessionId"].as_str() {
                        sessions.insert(session.to_string());
                    }
                }
            }
        }
    }

    let mut sessions: Vec<String> = sessions.into_iter().collect();
    sessions.sort();
    Ok(sessions)
}
