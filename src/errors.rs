use crate::{
    models::notification::NotificationError,
    services::{cleaner::CleanerError, replicator::ReplicationError},
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<NotificationError> for AppError {
    fn from(err: NotificationError) -> Self {
        AppError::bad_request(err.to_string())
    }
}

impl From<ReplicationError> for AppError {
    fn from(err: ReplicationError) -> Self {
        match &err {
            // The record stays PENDING; the sender should redeliver.
            ReplicationError::CopyFailed { .. } => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            ReplicationError::InvariantViolation { .. } => {
                tracing::error!("invariant violation: {}", err);
                AppError::internal(err.to_string())
            }
            _ => AppError::internal(err.to_string()),
        }
    }
}

impl From<CleanerError> for AppError {
    fn from(err: CleanerError) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::object_store::StorageError;

    #[test]
    fn test_copy_failure_maps_to_unavailable() {
        let err = AppError::from(ReplicationError::CopyFailed {
            src_key: "a".into(),
            dst_key: "a.copy.1".into(),
            source: StorageError::ObjectNotFound("a".into()),
        });
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.message.contains("a.copy.1"));
    }

    #[test]
    fn test_invalid_notification_maps_to_bad_request() {
        let err = AppError::from(NotificationError::TimestampOutOfRange(-1));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
