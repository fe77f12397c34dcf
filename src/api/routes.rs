//! API route table.

use axum::routing::get;
use axum::Router;

use super::handlers::{self, ApiState};

/// Build the v1 API router.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/groups", get(handlers::groups))
        .route("/groups/:machine/:test/summaries", get(handlers::summaries))
        .route("/groups/:machine/:test/flags", get(handlers::flags))
        .route("/groups/:machine/:test/limits", get(handlers::limits))
        .route("/groups/:machine/:test/series", get(handlers::series))
        .route("/rejected", get(handlers::rejected))
        .route("/failures", get(handlers::failures))
        .route("/config", get(handlers::config))
        .with_state(state)
}
