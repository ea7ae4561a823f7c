mod middleware;
mod snapshot;

pub use middleware::{REQUEST_ID_HEADER, RequestId, trace_requests};
pub use snapshot::{SNAPSHOT_HEADER, SnapshotState, snapshot_layer};

use axum::{Router, http::StatusCode, middleware::from_fn, middleware::from_fn_with_state};

/// Router that serves snapshots and answers everything else with 404.
pub fn build_router(state: SnapshotState) -> Router {
    Router::new()
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(from_fn_with_state(state, snapshot_layer))
        .layer(from_fn(trace_requests))
}
