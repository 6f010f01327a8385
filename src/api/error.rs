//! HTTP mapping of service errors.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{AdapterFailure, Error};

/// JSON error body: `{"error": "...", "code": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

/// Error returned by handlers.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(Error::InvalidArgument(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(Error::InvalidArgument(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError(Error::InvalidArgument(rejection.body_text()))
    }
}

impl ApiError {
    /// Status code and stable error code for the wrapped error.
    pub fn classify(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            Error::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "InvalidArgumentError"),
            Error::IndexNotReady => (StatusCode::SERVICE_UNAVAILABLE, "IndexNotReadyError"),
            Error::BuildInProgress { .. } => (StatusCode::CONFLICT, "BuildInProgressError"),
            Error::Unauthorized => (StatusCode::UNAUTHORIZED, "UnauthorizedError"),
            Error::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "RateLimitedError"),
            Error::Adapter {
                failure: AdapterFailure::Timeout,
                ..
            } => (StatusCode::GATEWAY_TIMEOUT, "UpstreamTimeoutError"),
            Error::Adapter { .. } => (StatusCode::BAD_GATEWAY, "UpstreamError"),
            Error::Config(_)
            | Error::Snapshot(_)
            | Error::Serialization(_)
            | Error::Io(_)
            | Error::Api(_)
            | Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.classify();
        let message = match &self.0 {
            Error::Adapter { source_kind, .. } => {
                warn!("Request failed: {}", self.0);
                format!("{} request failed", source_kind)
            }
            err if status.is_server_error() => {
                error!("Request failed: {}", err);
                "internal error".to_string()
            }
            err => err.to_string(),
        };
        (
            status,
            Json(ErrorBody {
                error: message,
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}
