//! Query service: request validation, hybrid and fast search, stats, health
//! and admin triggers.

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

use super::lexical::{LexicalMatcher, MatchedField};
use super::ranker::{matches_filters, HybridRanker, MatchType, RankedHit, RankingWeights, SearchFilters};
use crate::config::SearchConfig;
use crate::embedding::{Embedding, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::index::{BuildKind, BuildStatus, BuildSupervisor, BuildTicket, IndexHandle, IndexSnapshot};
use crate::model::ListingSummary;

/// Characters of the embedded document shown by the index preview.
const PREVIEW_CHARS: usize = 100;

/// Search request body (`POST /search`, `POST /search/fast`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    /// Signed so that negative values reach validation instead of failing
    /// deserialization.
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub filters: Option<SearchFilters>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub listing: ListingSummary,
    pub score: f32,
    pub match_type: MatchType,
    pub matched_fields: Vec<MatchedField>,
    pub vector_similarity: Option<f32>,
}

impl SearchHit {
    pub fn is_lexical(&self) -> bool {
        !self.matched_fields.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
    pub total_results: usize,
    /// Results carrying a lexical match.
    pub text_results: usize,
    /// Results carrying a vector similarity.
    pub semantic_results: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub ready: bool,
    pub listing_count: usize,
    pub building: bool,
}

/// Query counters since startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    pub hybrid_queries: u64,
    pub fast_queries: u64,
    /// Times the lexical matcher ran.
    pub lexical_evaluations: u64,
}

#[derive(Debug, Default)]
struct QueryCounters {
    hybrid: AtomicU64,
    fast: AtomicU64,
    lexical: AtomicU64,
}

impl QueryCounters {
    fn snapshot(&self) -> QueryStats {
        QueryStats {
            hybrid_queries: self.hybrid.load(Ordering::Relaxed),
            fast_queries: self.fast.load(Ordering::Relaxed),
            lexical_evaluations: self.lexical.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsResponse {
    pub ready: bool,
    pub listing_count: usize,
    pub built_at: Option<DateTime<Utc>>,
    pub source_cutoff: Option<DateTime<Utc>>,
    pub embedding_model: Option<String>,
    pub dimension: Option<usize>,
    pub format_version: Option<u32>,
    pub build: BuildStatus,
    pub queries: QueryStats,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: String,
    pub title: String,
    /// Start of the embedded document text.
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexContentResponse {
    pub total_documents: usize,
    pub documents: Vec<IndexedDocument>,
}

/// Hybrid vs vector-only search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Hybrid,
    Fast,
}

impl SearchMode {
    fn label(self) -> &'static str {
        match self {
            SearchMode::Hybrid => "hybrid",
            SearchMode::Fast => "fast",
        }
    }
}

/// Everything the HTTP layer needs to answer requests.
pub struct SearchService {
    config: SearchConfig,
    handle: Arc<IndexHandle>,
    supervisor: Arc<BuildSupervisor>,
    embedder: Arc<dyn EmbeddingProvider>,
    matcher: LexicalMatcher,
    ranker: HybridRanker,
    query_cache: Option<Cache<String, Arc<Embedding>>>,
    counters: QueryCounters,
    started: Instant,
}

impl SearchService {
    pub fn new(
        config: SearchConfig,
        handle: Arc<IndexHandle>,
        supervisor: Arc<BuildSupervisor>,
    ) -> Self {
        let embedder = Arc::clone(supervisor.builder().embedder());
        let query_cache = (config.query_cache_ttl_secs > 0 && config.query_cache_capacity > 0)
            .then(|| {
                Cache::builder()
                    .max_capacity(config.query_cache_capacity)
                    .time_to_live(Duration::from_secs(config.query_cache_ttl_secs))
                    .build()
            });
        Self {
            ranker: HybridRanker::new(RankingWeights::from(&config)),
            config,
            handle,
            supervisor,
            embedder,
            matcher: LexicalMatcher::new(),
            query_cache,
            counters: QueryCounters::default(),
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn handle(&self) -> &Arc<IndexHandle> {
        &self.handle
    }

    pub fn supervisor(&self) -> &Arc<BuildSupervisor> {
        &self.supervisor
    }

    /// Resolve the effective limit: default when absent, otherwise `1..=max_limit`.
    pub fn validate_limit(&self, limit: Option<i64>) -> Result<usize> {
        let Some(limit) = limit else {
            return Ok(self.config.default_limit);
        };
        if limit < 1 {
            return Err(Error::InvalidArgument(format!(
                "limit must be a positive integer, got {}",
                limit
            )));
        }
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        if limit > self.config.max_limit {
            return Err(Error::InvalidArgument(format!(
                "limit must not exceed {}, got {}",
                self.config.max_limit, limit
            )));
        }
        Ok(limit)
    }

    /// Hybrid search: vector and lexical signals merged by the ranker.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.execute(request, SearchMode::Hybrid).await
    }

    /// Vector-only search; the lexical matcher is never consulted.
    pub async fn fast_search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.execute(request, SearchMode::Fast).await
    }

    #[instrument(skip(self, request, mode), fields(query = %request.query, mode = mode.label()))]
    async fn execute(&self, request: &SearchRequest, mode: SearchMode) -> Result<SearchResponse> {
        let started = Instant::now();
        let query = request.query.trim();
        if query.is_empty() {
            return Err(Error::InvalidArgument("query must not be empty".into()));
        }
        let limit = self.validate_limit(request.limit)?;
        let filters = request.filters.clone().unwrap_or_default();

        // Held for the whole request; a concurrent publish does not affect it.
        let snapshot = self.handle.current().await?;
        match mode {
            SearchMode::Hybrid => self.counters.hybrid.fetch_add(1, Ordering::Relaxed),
            SearchMode::Fast => self.counters.fast.fetch_add(1, Ordering::Relaxed),
        };

        let ranked = if snapshot.is_empty() {
            Vec::new()
        } else {
            self.rank(&snapshot, query, &filters, limit, mode).await?
        };
        let response = build_response(query, &snapshot, ranked);

        let elapsed = started.elapsed();
        metrics::counter!("search_requests_total", "mode" => mode.label()).increment(1);
        metrics::histogram!("search_duration_seconds", "mode" => mode.label())
            .record(elapsed.as_secs_f64());
        debug!(
            results = response.total_results,
            elapsed_ms = elapsed.as_millis() as u64,
            "Search complete"
        );
        Ok(response)
    }

    async fn rank(
        &self,
        snapshot: &IndexSnapshot,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
        mode: SearchMode,
    ) -> Result<Vec<RankedHit>> {
        let query_vector = self.embed_query(query).await?;
        let candidates = if filters.is_empty() {
            (limit * 2).max(self.config.vector_candidates)
        } else {
            snapshot.len()
        };
        let k = candidates.min(snapshot.len()).max(1);

        let mut vector_hits = snapshot.search_vectors(&query_vector, k)?;
        let keep = |id: &str| {
            filters.is_empty()
                || snapshot
                    .listing(id)
                    .is_some_and(|listing| matches_filters(listing, filters))
        };
        vector_hits.retain(|hit| keep(hit.listing_id.as_str()));

        Ok(match mode {
            SearchMode::Fast => self.ranker.rank_vector_only(&vector_hits, limit),
            SearchMode::Hybrid => {
                self.counters.lexical.fetch_add(1, Ordering::Relaxed);
                let mut lexical_hits: BTreeMap<String, Vec<MatchedField>> =
                    self.matcher.find_matches(query, snapshot.listings());
                lexical_hits.retain(|id, _| keep(id.as_str()));
                self.ranker.rank(&vector_hits, &lexical_hits, limit)
            }
        })
    }

    async fn embed_query(&self, query: &str) -> Result<Arc<Embedding>> {
        let Some(cache) = &self.query_cache else {
            return Ok(Arc::new(self.embedder.embed(query).await?));
        };
        if let Some(hit) = cache.get(query).await {
            metrics::counter!("query_embedding_cache_hits_total").increment(1);
            return Ok(hit);
        }
        let vector = Arc::new(self.embedder.embed(query).await?);
        cache.insert(query.to_string(), Arc::clone(&vector)).await;
        Ok(vector)
    }

    pub async fn health(&self) -> HealthResponse {
        let snapshot = self.handle.try_current().await;
        let building = self.supervisor.status().state.is_building();
        HealthResponse {
            status: if snapshot.is_some() { "ready" } else { "not_ready" }.to_string(),
            ready: snapshot.is_some(),
            listing_count: snapshot.map_or(0, |s| s.len()),
            building,
        }
    }

    pub async fn stats(&self) -> StatsResponse {
        let snapshot = self.handle.try_current().await;
        let manifest = snapshot.as_ref().map(|s| s.manifest().clone());
        StatsResponse {
            ready: snapshot.is_some(),
            listing_count: snapshot.as_ref().map_or(0, |s| s.len()),
            built_at: manifest.as_ref().map(|m| m.built_at),
            source_cutoff: manifest.as_ref().map(|m| m.source_cutoff),
            embedding_model: manifest.as_ref().map(|m| m.embedding_model.clone()),
            dimension: manifest.as_ref().map(|m| m.dimension),
            format_version: manifest.as_ref().map(|m| m.format_version),
            build: self.supervisor.status(),
            queries: self.counters.snapshot(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }

    pub fn build_status(&self) -> BuildStatus {
        self.supervisor.status()
    }

    pub fn trigger_update(&self) -> Result<BuildTicket> {
        self.supervisor.trigger(BuildKind::Update)
    }

    pub fn trigger_rebuild(&self) -> Result<BuildTicket> {
        self.supervisor.trigger(BuildKind::Rebuild)
    }

    /// Id, title and the first characters of every embedded document.
    pub async fn index_content(&self) -> IndexContentResponse {
        let Some(snapshot) = self.handle.try_current().await else {
            return IndexContentResponse {
                total_documents: 0,
                documents: Vec::new(),
            };
        };
        let documents: Vec<IndexedDocument> = snapshot
            .listings()
            .map(|l| IndexedDocument {
                id: l.id().to_string(),
                title: l.listing.title.clone(),
                content: preview(&l.document),
            })
            .collect();
        IndexContentResponse {
            total_documents: documents.len(),
            documents,
        }
    }
}

fn build_response(query: &str, snapshot: &IndexSnapshot, ranked: Vec<RankedHit>) -> SearchResponse {
    let results: Vec<SearchHit> = ranked
        .into_iter()
        .filter_map(|hit| {
            let listing = snapshot.listing(&hit.listing_id)?;
            Some(SearchHit {
                listing: ListingSummary::from(listing),
                score: hit.score,
                match_type: hit.match_type,
                matched_fields: hit.matched_fields,
                vector_similarity: hit.vector_similarity,
            })
        })
        .collect();
    SearchResponse {
        query: query.to_string(),
        total_results: results.len(),
        text_results: results.iter().filter(|r| r.is_lexical()).count(),
        semantic_results: results
            .iter()
            .filter(|r| r.vector_similarity.is_some())
            .count(),
        results,
    }
}

fn preview(document: &str) -> String {
    let mut chars = document.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeletionPolicy;
    use crate::embedding::HashEmbedder;
    use crate::index::IndexBuilder;
    use crate::model::fixtures::listing;
    use crate::model::{CriterionValue, Listing};
    use crate::source::InMemorySource;
    use std::collections::HashMap;

    struct Fixture {
        service: SearchService,
        source: Arc<InMemorySource>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(listings: Vec<Listing>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(
            InMemorySource::with_listings(listings)
                .with_labels(HashMap::from([("brand".to_string(), "Marque".to_string())])),
        );
        let handle = Arc::new(IndexHandle::empty());
        let builder = IndexBuilder::new(source.clone(), Arc::new(HashEmbedder::new(64)), 16);
        let supervisor = Arc::new(BuildSupervisor::new(
            builder,
            handle.clone(),
            dir.path(),
            DeletionPolicy::Retain,
        ));
        Fixture {
            service: SearchService::new(SearchConfig::default(), handle, supervisor),
            source,
            _dir: dir,
        }
    }

    async fn ready(listings: Vec<Listing>) -> Fixture {
        let fx = fixture(listings).await;
        fx.service.supervisor().run(BuildKind::Rebuild).await.unwrap();
        fx
    }

    fn bike(id: &str, title: &str, brand: &str) -> Listing {
        let mut l = listing(id, title, "Bon état");
        l.criteria = vec![CriterionValue {
            criterion_id: "brand".into(),
            value: brand.into(),
        }];
        l
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(150);
        let p = preview(&long);
        assert_eq!(p.chars().count(), 103);
        assert!(p.ends_with("..."));
        assert_eq!(preview("court"), "court");
    }

    #[tokio::test]
    async fn test_limit_validation() {
        let fx = fixture(Vec::new()).await;
        let s = &fx.service;
        assert_eq!(s.validate_limit(None).unwrap(), 10);
        assert_eq!(s.validate_limit(Some(50)).unwrap(), 50);
        assert!(matches!(s.validate_limit(Some(0)), Err(Error::InvalidArgument(_))));
        assert!(matches!(s.validate_limit(Some(-1)), Err(Error::InvalidArgument(_))));
        assert!(matches!(s.validate_limit(Some(51)), Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_search_before_build_is_not_ready() {
        let fx = fixture(vec![listing("a", "Villa", "")]).await;
        let err = fx.service.search(&SearchRequest::new("villa")).await.unwrap_err();
        assert!(matches!(err, Error::IndexNotReady));
        assert!(!fx.service.health().await.ready);
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let fx = ready(vec![listing("a", "Villa", "")]).await;
        let err = fx.service.search(&SearchRequest::new("   ")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_villa_example() {
        let villas = (1..=5)
            .map(|i| listing(&format!("v{}", i), &format!("Villa {}", i), "Belle villa"))
            .collect();
        let fx = ready(villas).await;

        let response = fx
            .service
            .search(&SearchRequest::new("villa").with_limit(2))
            .await
            .unwrap();
        assert_eq!(response.total_results, 2);
        assert!(response.results.iter().all(|r| r.is_lexical()));
        assert!(response.results.iter().all(|r| r.listing.title.starts_with("Villa")));
        assert_eq!(response.text_results, 2);
    }

    #[tokio::test]
    async fn test_fast_path_skips_lexical_matcher() {
        let fx = ready(vec![listing("a", "Villa", ""), listing("b", "Vélo", "")]).await;
        fx.service.fast_search(&SearchRequest::new("villa")).await.unwrap();
        let stats = fx.service.stats().await;
        assert_eq!(stats.queries.fast_queries, 1);
        assert_eq!(stats.queries.lexical_evaluations, 0);

        fx.service.search(&SearchRequest::new("villa")).await.unwrap();
        assert_eq!(fx.service.stats().await.queries.lexical_evaluations, 1);
    }

    #[tokio::test]
    async fn test_fast_results_are_vector_hits() {
        let fx = ready(vec![
            listing("a", "Villa avec piscine", ""),
            listing("b", "Maison avec jardin", ""),
        ])
        .await;
        let response = fx
            .service
            .fast_search(&SearchRequest::new("villa piscine"))
            .await
            .unwrap();
        assert!(response
            .results
            .iter()
            .all(|r| r.match_type == MatchType::Semantic && r.matched_fields.is_empty()));
        assert_eq!(response.text_results, 0);
    }

    #[tokio::test]
    async fn test_criteria_label_query_and_filters() {
        let fx = ready(vec![
            bike("t", "Vélo de course", "Trek"),
            bike("g", "VTT", "Giant"),
        ])
        .await;

        let response = fx
            .service
            .search(&SearchRequest::new("Marque: Trek"))
            .await
            .unwrap();
        let lexical: Vec<_> = response
            .results
            .iter()
            .filter(|r| r.is_lexical())
            .map(|r| r.listing.id.as_str())
            .collect();
        assert_eq!(lexical, vec!["t"]);
        assert_eq!(response.results[0].listing.id, "t");
        assert_eq!(response.results[0].matched_fields, vec![MatchedField::Criteria]);

        let mut filtered = SearchRequest::new("vélo");
        filtered.filters = Some(SearchFilters::from([(
            "Marque".to_string(),
            "giant".to_string(),
        )]));
        let response = fx.service.search(&filtered).await.unwrap();
        assert!(response.results.iter().all(|r| r.listing.id == "g"));
    }

    #[tokio::test]
    async fn test_incremental_title_change_flips_lexical_match() {
        let fx = ready(vec![listing("a", "Villa", ""), listing("b", "Vélo", "")]).await;

        let mut renamed = listing("a", "Chalet", "");
        renamed.updated_at = Utc::now() + chrono::Duration::seconds(5);
        fx.source.upsert(renamed).await;
        fx.service.supervisor().run(BuildKind::Update).await.unwrap();

        let old = fx.service.search(&SearchRequest::new("villa")).await.unwrap();
        assert!(old.results.iter().all(|r| !(r.listing.id == "a" && r.is_lexical())));
        let new = fx.service.search(&SearchRequest::new("chalet")).await.unwrap();
        assert!(new
            .results
            .iter()
            .any(|r| r.listing.id == "a" && r.is_lexical()));
    }

    #[tokio::test]
    async fn test_stats_and_index_content() {
        let fx = ready(vec![listing("a", "Villa", "Piscine")]).await;
        let stats = fx.service.stats().await;
        assert!(stats.ready);
        assert_eq!(stats.listing_count, 1);
        assert_eq!(stats.embedding_model.as_deref(), Some("hash-64"));

        let content = fx.service.index_content().await;
        assert_eq!(content.total_documents, 1);
        assert!(content.documents[0].content.starts_with("Title: Villa"));
    }
}
