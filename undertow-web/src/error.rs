//! JSON error responses for the REST API

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use undertow_core::{EngineError, ErrorKind, TorrentError};

/// Errors returned by API handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    BadRequest { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Torrent(#[from] TorrentError),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            message: message.into(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal {
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        let kind = match self {
            ApiError::BadRequest { .. } => ErrorKind::Validation,
            ApiError::Internal { .. } => ErrorKind::Fatal,
            ApiError::Engine(e) => e.kind(),
            ApiError::Torrent(e) => e.kind(),
        };
        status_for(kind)
    }
}

/// Validation maps to 400, missing entities to 404, the rest to 500.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("API request failed: {}", self);
        }
        let body = json!({
            "error": {
                "handled": status.is_client_error(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use undertow_core::InfoHash;

    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::bad_request("nope").status(),
            StatusCode::BAD_REQUEST
        );
        let missing = EngineError::DownloadNotFound {
            infohash: InfoHash::new([1; 20]),
        };
        assert_eq!(ApiError::from(missing).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::from(EngineError::ManagerShutdown).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
