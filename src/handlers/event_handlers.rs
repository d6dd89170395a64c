//! HTTP entry points for the Replicator and the Cleaner.
//! Both are thin: decode, delegate, and report what happened.

use crate::{
    AppState,
    errors::AppError,
    models::notification::NotificationEnvelope,
    services::{cleaner::SweepReport, replicator::ReplicationOutcome},
};
use axum::{Json, body::Bytes, extract::State};
use serde::Serialize;

#[derive(Serialize, Debug)]
pub struct EventsResponse {
    pub status: &'static str,
    pub outcomes: Vec<ReplicationOutcome>,
}

/// `POST /events`: handle one notification envelope.
///
/// Notifications in a batch are applied in order. The first failure aborts
/// the request and the sender redelivers the whole batch.
pub async fn post_events(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<EventsResponse>, AppError> {
    let notifications = NotificationEnvelope::from_slice(&body)?
        .into_notifications(state.source_bucket.as_deref())?;

    let mut outcomes = Vec::with_capacity(notifications.len());
    for notification in &notifications {
        tracing::debug!("handling {:?}", notification);
        outcomes.push(state.replicator.handle(notification).await?);
    }

    Ok(Json(EventsResponse {
        status: "ok",
        outcomes,
    }))
}

/// `POST /sweep`: run the Cleaner once.
pub async fn post_sweep(State(state): State<AppState>) -> Result<Json<SweepReport>, AppError> {
    Ok(Json(state.cleaner.run_once().await?))
}
