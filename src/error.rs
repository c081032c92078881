//! Typed error taxonomy shared by the stream store and the memory engine.
//!
//! [`HindsightError`] covers every failure the public surfaces can report.
//! Corruption of individual log records is NOT represented here on the read
//! path — corrupt lines are skipped and logged, and only surface as
//! [`HindsightError::Corruption`] when nothing readable remains.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HindsightError {
    /// Stream, record, bank, or memory unit absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Create-config mismatch or a producer sequence gap.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A producer with a stale epoch has been fenced out.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Unreadable data where readable data was required.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Long-poll bound reached with no data. A normal outcome, not a failure.
    #[error("timeout waiting for data")]
    Timeout,

    /// Payload or budget limits exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, HindsightError>;

impl From<anyhow::Error> for HindsightError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl HindsightError {
    /// Detail message for a producer sequence gap, carrying enough for the
    /// producer to resync.
    pub fn sequence_gap(expected: u64, received: u64) -> Self {
        Self::Conflict(format!(
            "sequence gap: expected seq {expected}, received {received}"
        ))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Corruption(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Timeout => StatusCode::NO_CONTENT,
            Self::ResourceExhausted(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Io(_) | Self::Db(_) | Self::Serde(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for HindsightError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error");
        }
        let body = match &self {
            // No body on the long-poll timeout path; 204 carries none.
            Self::Timeout => String::new(),
            other => other.to_string(),
        };
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_gap_reports_expected_and_received() {
        let err = HindsightError::sequence_gap(3, 5);
        let msg = err.to_string();
        assert!(msg.contains("expected seq 3"));
        assert!(msg.contains("received 5"));
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn timeout_maps_to_no_content() {
        assert_eq!(HindsightError::Timeout.status_code(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn taxonomy_maps_to_expected_statuses() {
        assert_eq!(
            HindsightError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            HindsightError::Forbidden("zombie".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            HindsightError::ResourceExhausted("too big".into()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}
