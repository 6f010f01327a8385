//! HTTP transport shared by the store and embedding adapters.
//!
//! Configures the client stack with:
//! - a per-request timeout
//! - default headers (credentials live only here, never in error messages)
//! - a single bounded retry for transient failures

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{AdapterFailure, Error, Result};

/// Pause before the one permitted retry.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Build an HTTP client with the given timeout and default headers.
pub fn build_client(timeout: Duration, headers: HeaderMap) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))
}

/// Map a transport-level error to an adapter failure kind.
pub fn classify(err: &reqwest::Error) -> AdapterFailure {
    if err.is_timeout() {
        AdapterFailure::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        AdapterFailure::Unavailable
    } else {
        AdapterFailure::Rejected
    }
}

/// Map a non-success HTTP status to an adapter failure kind.
pub fn classify_status(status: StatusCode) -> AdapterFailure {
    if status == StatusCode::GATEWAY_TIMEOUT || status == StatusCode::REQUEST_TIMEOUT {
        AdapterFailure::Timeout
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        AdapterFailure::Unavailable
    } else {
        AdapterFailure::Rejected
    }
}

/// Turn a reqwest error into an adapter error, dropping the URL it carries.
pub fn adapter_error(
    err: reqwest::Error,
    make: fn(AdapterFailure, String) -> Error,
    context: &str,
) -> Error {
    let failure = classify(&err);
    make(failure, format!("{}: {}", context, err.without_url()))
}

/// Run `call`, retrying once after `backoff` when the failure is transient.
pub async fn with_retry<T, F, Fut>(operation: &str, backoff: Duration, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match call().await {
        Ok(value) => Ok(value),
        Err(err) if err.is_retryable() => {
            warn!("{} failed ({}), retrying once in {:?}", operation, err, backoff);
            tokio::time::sleep(backoff).await;
            call().await
        }
        Err(err) => Err(err),
    }
}
