//! Global request rate limiting for search routes.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use tracing::debug;

use super::error::ApiError;
use super::AppState;
use crate::error::{Error, Result};

/// Rate limit settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimitConfig {
    /// Requests per minute across all clients; 0 disables limiting.
    pub requests_per_minute: u32,
}

/// Token-bucket limiter shared by all search requests.
pub struct RateLimitService {
    limiter: Option<DefaultDirectRateLimiter>,
}

impl RateLimitService {
    pub fn new(config: RateLimitConfig) -> Self {
        let limiter = NonZeroU32::new(config.requests_per_minute)
            .map(|rpm| RateLimiter::direct(Quota::per_minute(rpm)));
        Self { limiter }
    }

    pub fn disabled() -> Self {
        Self { limiter: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Take one token, failing with `RateLimited` when none is left.
    pub fn check(&self) -> Result<()> {
        match &self.limiter {
            Some(limiter) => limiter.check().map_err(|_| Error::RateLimited),
            None => Ok(()),
        }
    }
}

pub async fn enforce(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    if let Err(e) = state.rate_limiter.check() {
        debug!(path = %request.uri().path(), "Rate limit exceeded");
        metrics::counter!("rate_limited_requests_total").increment(1);
        return Err(e.into());
    }
    Ok(next.run(request).await)
}
