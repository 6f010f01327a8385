//! Error types for the listing search service.

use thiserror::Error;

/// Which external collaborator an adapter error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterSource {
    /// The document store holding listings.
    DocumentStore,
    /// The embedding provider.
    EmbeddingProvider,
}

impl std::fmt::Display for AdapterSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterSource::DocumentStore => write!(f, "document store"),
            AdapterSource::EmbeddingProvider => write!(f, "embedding provider"),
        }
    }
}

/// How an adapter call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterFailure {
    /// Connection refused, DNS failure, 5xx after retry.
    Unavailable,
    /// The call did not complete within its timeout.
    Timeout,
    /// The collaborator answered but rejected the request or sent garbage.
    Rejected,
}

/// Errors that can occur in the listing search service.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request (bad limit, empty query, dimension mismatch).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No index snapshot has been built or loaded yet.
    #[error("Index not ready")]
    IndexNotReady,

    /// A build was requested while another one is running.
    #[error("Index build already in progress (job {job_id})")]
    BuildInProgress { job_id: String },

    /// Document store or embedding provider failure.
    ///
    /// `message` must never contain credentials; adapters build it from
    /// status codes and response shapes only.
    #[error("{source_kind} {failure:?}: {message}")]
    Adapter {
        source_kind: AdapterSource,
        failure: AdapterFailure,
        message: String,
    },

    /// Missing or wrong admin token.
    #[error("Unauthorized")]
    Unauthorized,

    /// Request rejected by the rate limiter.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Snapshot on disk is unusable (corrupt, wrong model, wrong format).
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// API errors
    #[error("API error: {0}")]
    Api(String),

    /// Anything else that should never happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a document store failure.
    pub fn store(failure: AdapterFailure, message: impl Into<String>) -> Self {
        Error::Adapter {
            source_kind: AdapterSource::DocumentStore,
            failure,
            message: message.into(),
        }
    }

    /// Shorthand for an embedding provider failure.
    pub fn embedding(failure: AdapterFailure, message: impl Into<String>) -> Self {
        Error::Adapter {
            source_kind: AdapterSource::EmbeddingProvider,
            failure,
            message: message.into(),
        }
    }

    /// Whether one more attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Adapter {
                failure: AdapterFailure::Unavailable | AdapterFailure::Timeout,
                ..
            }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
