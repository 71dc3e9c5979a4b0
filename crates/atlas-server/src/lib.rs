//! # Atlas Server
//!
//! Thin HTTP facade over `atlas-core`: validates ingress, dispatches to the
//! stores and the retrieval engine, and returns Atlas-shaped responses. The
//! four consumers run as tokio tasks in the same process by default, but
//! nothing here assumes colocation - they only touch the stores through the
//! core's APIs.

pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

pub use state::AppState;

/// Build the full API router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Ingestion
        .route("/v1/events", post(routes::events::append_event))
        .route("/v1/events/batch", post(routes::events::append_batch))
        .route("/v1/events/{event_id}", get(routes::events::get_event))
        // Retrieval
        .route("/v1/context/{session_id}", get(routes::query::get_context))
        .route("/v1/query/subgraph", post(routes::query::query_subgraph))
        .route("/v1/nodes/{node_id}/lineage", get(routes::query::get_lineage))
        .route("/v1/entities/{entity_id}", get(routes::query::get_entity))
        // Personalization + GDPR
        .route(
            "/v1/users/{user_id}/data",
            get(routes::users::export_user_data).delete(routes::users::erase_user_data),
        )
        .route("/v1/users/{user_id}/{view}", get(routes::users::get_user_view))
        // Admin
        .route("/v1/admin/reconsolidate", post(routes::admin::reconsolidate))
        .route("/v1/admin/prune", post(routes::admin::prune))
        .route("/v1/admin/stats", get(routes::admin::stats))
        // Health
        .route("/v1/health", get(routes::health::health))
        .route("/v1/health/detailed", get(routes::health::health_detailed))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
