//! Error taxonomy shared by every component of the engine.

use axum::http::StatusCode;
use thiserror::Error;

/// Failures surfaced by the store, the tool adapter, the orchestrator and the
/// HTTP layer. Variants carry human-readable messages only so job snapshots can
/// be cloned freely.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("unsupported source: {0}")]
    UnsupportedSource(String),

    #[error("tool crashed: {0}")]
    ToolCrashed(String),

    #[error("timed out after {0} seconds")]
    Timeout(u64),

    #[error("commit failed: {0}")]
    CommitFailed(String),

    #[error("canceled")]
    Canceled,

    #[error("too many downloads in progress")]
    Busy,

    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl MediaError {
    pub fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        Self::Io(format!("{context}: {err}"))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::UnsupportedSource(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NetworkError(_) | Self::ToolCrashed(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Canceled => StatusCode::CONFLICT,
            Self::Busy => StatusCode::SERVICE_UNAVAILABLE,
            Self::InsufficientStorage(_) => StatusCode::INSUFFICIENT_STORAGE,
            Self::CommitFailed(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type MediaResult<T> = Result<T, MediaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(
            MediaError::InvalidRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(MediaError::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(MediaError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(MediaError::Timeout(5).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(MediaError::Busy.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn messages_are_human_readable() {
        assert_eq!(MediaError::Timeout(30).to_string(), "timed out after 30 seconds");
        let err = MediaError::io(
            "reading /tmp/x",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.to_string(), "I/O error: reading /tmp/x: gone");
    }
}
