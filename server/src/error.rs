//! Error taxonomy for the hub.
//!
//! Handshake failures are recovered at the HTTP boundary and turned into status
//! codes with a JSON body. Failures on a live connection are reported in-band
//! with an `error` envelope instead (see `ws::protocol::ErrorKind`).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::StoreError;

/// Message for every authentication failure, whatever the underlying cause.
pub const FORBIDDEN_MESSAGE: &str = "Forbidden";

#[derive(Debug, Error)]
pub enum HubError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("forbidden")]
    Forbidden,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store failure: {0}")]
    StoreFailure(String),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("hub is shutting down")]
    ShuttingDown,
}

impl HubError {
    pub fn status(&self) -> StatusCode {
        match self {
            HubError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HubError::Forbidden => StatusCode::FORBIDDEN,
            HubError::Conflict(_) => StatusCode::CONFLICT,
            HubError::NotFound(_) => StatusCode::NOT_FOUND,
            HubError::StoreFailure(_) | HubError::ProtocolError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            HubError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            HubError::BadRequest(_) => "bad_request",
            HubError::Forbidden => "forbidden",
            HubError::Conflict(_) => "conflict",
            HubError::NotFound(_) => "not_found",
            HubError::StoreFailure(_) => "store_failure",
            HubError::ProtocolError(_) => "protocol_error",
            HubError::ShuttingDown => "shutting_down",
        }
    }
}

impl From<StoreError> for HubError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => HubError::NotFound(what),
            StoreError::Conflict(what) => HubError::Conflict(what),
            StoreError::Backend(detail) => HubError::StoreFailure(detail),
        }
    }
}

/// JSON body returned with every handshake failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            HubError::Forbidden => FORBIDDEN_MESSAGE.to_string(),
            HubError::StoreFailure(detail) | HubError::ProtocolError(detail) => {
                // Detail stays in the server log
                tracing::error!(error = %detail, code = self.code(), "Handshake failed internally");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        (
            status,
            Json(ErrorBody {
                error: self.code().to_string(),
                message,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        assert!(matches!(
            HubError::from(StoreError::NotFound("user".into())),
            HubError::NotFound(_)
        ));
        assert!(matches!(
            HubError::from(StoreError::Conflict("gopher".into())),
            HubError::Conflict(_)
        ));
        assert!(matches!(
            HubError::from(StoreError::Backend("disk".into())),
            HubError::StoreFailure(_)
        ));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(HubError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(HubError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(HubError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            HubError::StoreFailure("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(HubError::ShuttingDown.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
