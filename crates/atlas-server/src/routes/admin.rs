//! Admin surfaces: forced consolidation, retention enforcement, stats

use std::time::Instant;

use axum::extract::State;
use axum::Json;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /v1/admin/reconsolidate - force a consolidation pass
pub async fn reconsolidate(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let started = Instant::now();
    let consolidation = state.consolidation.clone();
    let report = tokio::task::spawn_blocking(move || consolidation.run_pass(Utc::now()))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(json!({
        "report": report,
        "meta": {"queryMs": started.elapsed().as_millis() as u64},
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PruneRequest {
    pub dry_run: bool,
}

/// POST /v1/admin/prune - force retention enforcement; `dryRun` reports
/// candidates without touching anything
pub async fn prune(
    State(state): State<AppState>,
    body: Option<Json<PruneRequest>>,
) -> ApiResult<Json<Value>> {
    let started = Instant::now();
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let now = Utc::now();

    let cold_candidates = state
        .graph
        .prunable_events(now - ChronoDuration::days(7), 5.0, 3, false)?;
    let archive_candidates: Vec<_> = state
        .graph
        .archivable_events(now - ChronoDuration::days(30))?
        .into_iter()
        .filter(|node| !(node.importance.unwrap_or(0.0) >= 5.0 && node.access_count >= 3))
        .collect();

    if request.dry_run {
        return Ok(Json(json!({
            "dryRun": true,
            "coldCandidates": cold_candidates.len(),
            "archiveCandidates": archive_candidates.len(),
            "meta": {"queryMs": started.elapsed().as_millis() as u64},
        })));
    }

    let consolidation = state.consolidation.clone();
    let report = tokio::task::spawn_blocking(move || consolidation.run_pass(now))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(json!({
        "dryRun": false,
        "report": report,
        "meta": {"queryMs": started.elapsed().as_millis() as u64},
    })))
}

/// GET /v1/admin/stats - stream, graph and pipeline metrics
pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let started = Instant::now();
    let stream = state.events.stats()?;
    let nodes_by_kind = state.graph.count_nodes_by_kind()?;
    let metrics = state.metrics.snapshot();
    Ok(Json(json!({
        "stream": stream,
        "graphNodesTotal": nodes_by_kind,
        "metrics": metrics,
        "meta": {"queryMs": started.elapsed().as_millis() as u64},
    })))
}
