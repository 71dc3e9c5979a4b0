//! Retrieval routes: working memory, subgraph queries, lineage, entities

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Instant;

use atlas_core::domain::EdgeKind;
use atlas_core::graph::LineageDirection;
use atlas_core::intent::Intent;
use atlas_core::retrieval::SubgraphRequest;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ContextParams {
    pub max_nodes: Option<usize>,
    pub max_depth: Option<usize>,
    pub query: Option<String>,
}

/// GET /v1/context/{session_id} - decay-ranked working memory
pub async fn get_context(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<ContextParams>,
) -> ApiResult<Json<Value>> {
    let max_nodes = params
        .max_nodes
        .unwrap_or(state.config.retrieval.max_nodes)
        .clamp(1, 500);
    let max_depth = params
        .max_depth
        .unwrap_or(state.config.retrieval.max_depth)
        .min(state.config.retrieval.max_depth_cap);
    let response = state
        .engine
        .context(&session_id, params.query.as_deref(), max_nodes, max_depth)?;
    Ok(Json(serde_json::to_value(response).map_err(|e| ApiError::Internal(e.to_string()))?))
}

/// POST /v1/query/subgraph - intent-aware retrieval
pub async fn query_subgraph(
    State(state): State<AppState>,
    Json(request): Json<SubgraphRequest>,
) -> ApiResult<Json<Value>> {
    if request.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".to_string()));
    }
    if let Some(raw) = &request.intent {
        if Intent::parse_name(raw).is_none() {
            return Err(ApiError::BadRequest(format!("unknown intent '{raw}'")));
        }
    }
    let response = state.engine.query_subgraph(&request)?;
    Ok(Json(serde_json::to_value(response).map_err(|e| ApiError::Internal(e.to_string()))?))
}

#[derive(Debug, Deserialize)]
pub struct LineageParams {
    pub direction: Option<String>,
    pub max_depth: Option<usize>,
    pub intent: Option<String>,
}

/// GET /v1/nodes/{id}/lineage - bounded causal lineage
pub async fn get_lineage(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(params): Query<LineageParams>,
) -> ApiResult<Json<Value>> {
    let direction = match params.direction.as_deref() {
        None => LineageDirection::Backward,
        Some(raw) => LineageDirection::parse_name(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown direction '{raw}'")))?,
    };
    let intent = match params.intent.as_deref() {
        None => None,
        Some(raw) => Some(
            Intent::parse_name(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown intent '{raw}'")))?,
        ),
    };
    let response = state
        .engine
        .lineage(&node_id, direction, params.max_depth, intent)?;
    Ok(Json(serde_json::to_value(response).map_err(|e| ApiError::Internal(e.to_string()))?))
}

/// GET /v1/entities/{entity_id} - an entity with its connected events
pub async fn get_entity(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let started = Instant::now();
    let entity = state
        .graph
        .get_entity(&entity_id)?
        .ok_or(ApiError::NotFound(entity_id.clone()))?;

    // Events that mention the entity
    let mut events = Vec::new();
    for edge in state
        .graph
        .edges_of(&entity_id, false, true, &[EdgeKind::References])?
    {
        if let Some(node) = state.graph.get_node(&edge.source)? {
            events.push(json!({
                "id": node.id,
                "attributes": node.attrs,
                "role": edge.props["role"],
            }));
        }
    }

    Ok(Json(json!({
        "entity": {
            "id": entity.id,
            "attributes": entity.attrs,
            "accessCount": entity.access_count,
        },
        "events": events,
        "meta": {"queryMs": started.elapsed().as_millis() as u64},
    })))
}
