use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::require_token;
use crate::handler;
use crate::state::ServerState;

/// Build the axum router with every object API endpoint.
pub fn build_router(state: Arc<ServerState>) -> Router {
    let limit = state.config().max_upload_bytes;
    let protected = Router::new()
        .route("/api/getobjects/:stream", post(handler::get_objects))
        .route("/api/diff/:stream", post(handler::diff))
        .route("/objects/:stream", post(handler::upload))
        .route("/objects/:stream/:id/single", get(handler::single))
        .route("/api/stream/:stream/blob", post(handler::blob_upload))
        .route("/api/stream/:stream/blob/diff", post(handler::blob_diff))
        .route("/api/stream/:stream/blob/:id", get(handler::blob_download))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/api/ping", get(handler::ping))
        .merge(protected)
        .layer(DefaultBodyLimit::max(limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
