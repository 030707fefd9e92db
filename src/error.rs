// Error handling for the media queue HTTP layer
//
// This module defines the errors returned by route handlers and how each one
// maps to an HTTP status code.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

use crate::models::ErrorResponse;
use crate::queue_engine::QueueError;

/// Errors that can occur in the route handlers
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The path names a queue this server does not run
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// Error raised by the queue itself
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// HTTP status for a failure category reported in a `QueueResponse`
pub fn status_for_kind(kind: Option<&str>) -> StatusCode {
    match kind {
        Some("validation") => StatusCode::BAD_REQUEST,
        Some("not_found") => StatusCode::NOT_FOUND,
        Some("conflict") => StatusCode::CONFLICT,
        Some("unavailable") => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ResponseError for HandlerError {
    fn status_code(&self) -> StatusCode {
        match self {
            HandlerError::UnknownQueue(_) => StatusCode::NOT_FOUND,
            HandlerError::Queue(e) => status_for_kind(Some(e.kind())),
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            HandlerError::UnknownQueue("music".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            HandlerError::from(QueueError::Conflict("busy".to_string())).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            HandlerError::from(QueueError::Validation("bad id".to_string())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for_kind(Some("persistence")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status_for_kind(None), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
