//! Hybrid listing search.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!   query ───────▶│ SearchService│──── embed ───▶ EmbeddingProvider
//!                 └──────┬───────┘                 (moka query cache)
//!                        │ Arc<IndexSnapshot>
//!           ┌────────────┴────────────┐
//!           ▼                         ▼
//!   ┌──────────────┐          ┌───────────────┐
//!   │ VectorIndex  │          │LexicalMatcher │  (skipped on the fast path)
//!   └──────┬───────┘          └───────┬───────┘
//!          └────────────┬─────────────┘
//!                       ▼
//!               ┌──────────────┐
//!               │ HybridRanker │
//!               └──────────────┘
//! ```

mod lexical;
mod ranker;
mod service;

pub use lexical::{normalize, LexicalMatcher, MatchedField};
pub use ranker::{
    matches_filters, similarity, HybridRanker, MatchType, RankedHit, RankingWeights,
    SearchFilters,
};
pub use service::{
    HealthResponse, IndexContentResponse, IndexedDocument, QueryStats, SearchHit, SearchMode,
    SearchRequest, SearchResponse, SearchService, StatsResponse,
};
