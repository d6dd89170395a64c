//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the mapping table and both object stores

use crate::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe. Always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that runs the mapping store's connectivity query and the
/// source/destination store probes. HTTP 200 when all checks pass, HTTP 503
/// when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mapping = CheckStatus::from_result(state.store.health_check().await);
    let source = CheckStatus::from_result(state.replica.source().health_check().await);
    let destination = CheckStatus::from_result(state.replica.destination().health_check().await);

    let overall_ok = mapping.ok && source.ok && destination.ok;

    let mut checks = HashMap::new();
    checks.insert("mapping_store", mapping);
    checks.insert("source", source);
    checks.insert("destination", destination);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn from_result<E: std::fmt::Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self {
                ok: true,
                error: None,
            },
            Err(e) => Self {
                ok: false,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status_reports_bare_error_message() {
        let failed = CheckStatus::from_result(Err::<(), _>("disk full"));
        assert!(!failed.ok);
        assert_eq!(failed.error.as_deref(), Some("disk full"));

        let passed = CheckStatus::from_result(Ok::<(), String>(()));
        assert!(passed.ok);
        assert_eq!(passed.error, None);
    }
}
