//! Event ingestion routes
//!
//! Ingestion is append-and-return: validation, payload offload, atomic
//! append. No extraction, enrichment or scoring runs on this path; the
//! consumers pick the event up from the stream.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Instant;

use atlas_core::domain::{validate_event, Event, EventInput};
use atlas_core::eventstore::AppendStatus;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /v1/events - append one event
pub async fn append_event(
    State(state): State<AppState>,
    Json(input): Json<EventInput>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let started = Instant::now();
    let event = prepare(&state, &input)?;
    let outcome = state.events.append(&event)?;
    match outcome.status {
        AppendStatus::New => state.metrics.record_append(),
        AppendStatus::Duplicate => state.metrics.record_duplicate(),
    }

    let status = match outcome.status {
        AppendStatus::New => StatusCode::CREATED,
        // Duplicates are success with the original position, never an error
        AppendStatus::Duplicate => StatusCode::OK,
    };
    Ok((
        status,
        Json(json!({
            "status": outcome.status,
            "globalPosition": outcome.position.to_string(),
            "meta": {"queryMs": started.elapsed().as_millis() as u64},
        })),
    ))
}

/// POST /v1/events/batch - append N events; per-event atomic, partial
/// success allowed
pub async fn append_batch(
    State(state): State<AppState>,
    Json(inputs): Json<Vec<EventInput>>,
) -> ApiResult<Json<Value>> {
    let started = Instant::now();
    let mut results = Vec::with_capacity(inputs.len());

    for input in &inputs {
        let item = match prepare(&state, input) {
            Ok(event) => match state.events.append(&event) {
                Ok(outcome) => {
                    match outcome.status {
                        AppendStatus::New => state.metrics.record_append(),
                        AppendStatus::Duplicate => state.metrics.record_duplicate(),
                    }
                    json!({
                        "eventId": input.event_id,
                        "status": outcome.status,
                        "globalPosition": outcome.position.to_string(),
                    })
                }
                Err(error) => json!({
                    "eventId": input.event_id,
                    "status": "error",
                    "reason": error.to_string(),
                }),
            },
            Err(ApiError::Validation(issues)) => json!({
                "eventId": input.event_id,
                "status": "rejected",
                "issues": issues,
            }),
            Err(error) => return Err(error),
        };
        results.push(item);
    }

    Ok(Json(json!({
        "results": results,
        "meta": {"queryMs": started.elapsed().as_millis() as u64},
    })))
}

/// GET /v1/events/{event_id} - fetch a single event document
pub async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let started = Instant::now();
    let event = state
        .events
        .get_by_id(&event_id)?
        .ok_or(ApiError::NotFound(event_id))?;
    Ok(Json(json!({
        "event": event,
        "meta": {"queryMs": started.elapsed().as_millis() as u64},
    })))
}

/// Validate the envelope and move any inline payload into the forgettable
/// payload store before the event reaches the log
fn prepare(state: &AppState, input: &EventInput) -> Result<Event, ApiError> {
    let event = validate_event(input, Utc::now()).map_err(ApiError::Validation)?;
    if let Some(payload) = &input.payload {
        let text = match payload {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        state
            .payloads
            .put(&event.payload_ref, &event.session_id, &text)?;
    }
    Ok(event)
}
