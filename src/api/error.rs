// src/api/error.rs
// HTTP error taxonomy. Handlers return ApiResult<T>; the kind picks the
// status code at the boundary and the reason travels in the body. The
// request-id middleware stamps x-request-id on these responses like any
// other.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// The error kinds this API distinguishes.
///
/// Retrieval and chat handlers report collaborator outages as
/// `UpstreamUnavailable` rather than `Internal` so clients can tell a down
/// embedder/vector store apart from a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed ids, empty queries, out-of-range numbers.
    BadRequest,
    /// Missing thread or card, or a feature surface that is switched off.
    NotFound,
    /// Owner mismatch, or a delete-locked singleton card.
    Forbidden,
    /// Optimistic-concurrency failure on a card upsert.
    Conflict,
    /// Embedder, chat provider, vector store, or WS peer is down.
    UpstreamUnavailable,
    /// Everything else.
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Conflict => "conflict",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub reason: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self { kind, reason: reason.into() }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, reason)
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, reason)
    }

    /// Ownership violations and singleton delete-locks.
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, reason)
    }

    /// `if_match_updated_at` mismatches; never silently overwritten.
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, reason)
    }

    pub fn upstream_unavailable(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnavailable, reason)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, reason)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.reason)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let body = json!({
            "status": status.as_u16(),
            "error": self.kind.code(),
            "reason": self.reason,
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Collapse an arbitrary failure into a logged Internal error. Database
/// writes that have no user-recoverable failure mode use this.
pub trait OrInternal<T> {
    fn or_internal(self, reason: &str) -> ApiResult<T>;
}

impl<T, E> OrInternal<T> for Result<T, E>
where
    E: std::fmt::Debug,
{
    fn or_internal(self, reason: &str) -> ApiResult<T> {
        self.map_err(|e| {
            error!("{}: {:?}", reason, e);
            ApiError::internal(reason)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_their_status_codes() {
        assert_eq!(ApiError::bad_request("missing query").kind.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::not_found("not found").kind.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::upstream_unavailable("embed failed").kind.status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ApiError::internal("oops").kind.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn singleton_delete_lock_is_forbidden() {
        let err = ApiError::forbidden("singleton_locked: card_id=abc");
        assert_eq!(err.kind, ErrorKind::Forbidden);
        assert_eq!(err.kind.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.to_string(), "forbidden: singleton_locked: card_id=abc");
    }

    #[test]
    fn stale_card_write_is_conflict() {
        let err = ApiError::conflict("updated_at_mismatch: current=2026-07-01T00:00:00Z");
        assert_eq!(err.kind.status(), StatusCode::CONFLICT);
        assert_eq!(err.kind.code(), "conflict");
    }

    #[test]
    fn or_internal_swallows_the_cause_but_keeps_the_reason() {
        let result: Result<(), &str> = Err("connection reset");
        let err = result.or_internal("telemetry insert failed").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(err.reason, "telemetry insert failed");
    }
}
