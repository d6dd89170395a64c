//! Defines routes for notification intake, sweeps and probes.
//!
//! ## Structure
//! - `POST /events`: source-store change notifications (direct, event-bus or batch form)
//! - `POST /sweep`: run one Cleaner pass
//! - `GET /healthz`, `GET /readyz`: probes

use crate::{
    AppState,
    handlers::{
        event_handlers::{post_events, post_sweep},
        health_handlers::{healthz, readyz},
    },
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/events", post(post_events))
        .route("/sweep", post(post_sweep))
}
