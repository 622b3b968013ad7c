//! HTTP surface
//!
//! Server-to-server federation endpoints only: ActivityPub documents and
//! inboxes, well-known discovery, and metrics export. Client-facing APIs
//! are outside this node's scope.

mod activitypub;
mod wellknown;

use axum::{Router, routing::get};

use crate::AppState;

pub use activitypub::activitypub_router;
pub use wellknown::wellknown_router;

/// Router for the Prometheus exposition endpoint.
pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics))
}

async fn metrics() -> ([(&'static str, &'static str); 1], String) {
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        crate::metrics::render(),
    )
}
