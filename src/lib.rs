//! # Listing Search
//!
//! Hybrid lexical and semantic search over marketplace listings.
//!
//! Listings are pulled from a document store, rendered to text, embedded and
//! kept in an in-memory snapshot that is persisted to disk. Queries combine an
//! exact-vector nearest-neighbour scan with a lexical phrase matcher over the
//! title, description and resolved criteria.
//!
//! ## Modules
//!
//! - [`source`]: document store adapters (Appwrite, JSON file, in-memory)
//! - [`embedding`]: embedding providers (OpenAI-compatible, local ONNX, hashing)
//! - [`index`]: snapshot, vector index, builder and build supervisor
//! - [`search`]: lexical matcher, hybrid ranker and the query service
//! - [`api`]: HTTP routes, admin guard and rate limiting
//! - [`config`], [`error`], [`metrics`]: ambient concerns

pub mod api;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod metrics;
pub mod model;
pub mod search;
pub mod source;
pub mod transport;

pub use api::{ApiConfig, ApiError, ApiServer, AppState, RateLimitConfig, RateLimitService};
pub use config::{
    DeletionPolicy, EmbeddingConfig, EmbeddingProviderKind, IndexConfig, MetricsConfig,
    SearchConfig, ServerConfig, ServiceConfig, SourceConfig, SourceKind,
};
pub use embedding::{Embedding, EmbeddingProvider, HashEmbedder, LocalEmbedder, OpenAiEmbedder};
pub use error::{AdapterFailure, AdapterSource, Error, Result};
pub use index::{
    BuildKind, BuildReport, BuildState, BuildStatus, BuildSupervisor, BuildTicket, IndexBuilder,
    IndexHandle, IndexSnapshot, Manifest,
};
pub use metrics::MetricsService;
pub use model::{CriterionValue, IndexedListing, Listing, ListingSummary, ResolvedCriterion};
pub use search::{
    HealthResponse, MatchType, SearchHit, SearchRequest, SearchResponse, SearchService,
    StatsResponse,
};
pub use source::{AppwriteSource, DocumentSource, FileSource, InMemorySource, SourceFile};
