//! Bearer-token guard for admin routes.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;
use tracing::warn;

use super::error::ApiError;
use super::AppState;
use crate::error::Error;

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Constant-time comparison of the presented token with the expected one.
pub fn token_matches(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Reject the request with 401 unless it carries the admin token.
/// Open when no token is configured.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = state.admin_token.as_deref() {
        let authorized = bearer_token(request.headers())
            .is_some_and(|presented| token_matches(expected, presented));
        if !authorized {
            warn!(path = %request.uri().path(), "Rejected admin request without valid token");
            return Err(Error::Unauthorized.into());
        }
    }
    Ok(next.run(request).await)
}
