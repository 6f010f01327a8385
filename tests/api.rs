//! HTTP API tests against an in-memory source and the hashing embedder.

use axum::http::StatusCode;
use axum_test::TestServer;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use listing_search::api::{AcceptedResponse, ErrorBody};
use listing_search::{
    AdapterFailure, ApiConfig, ApiServer, AppState, BuildKind, BuildSupervisor, CriterionValue,
    DeletionPolicy, Embedding, EmbeddingProvider, Error, HashEmbedder, HealthResponse, InMemorySource, IndexBuilder, IndexHandle, Listing, MatchType,
    RateLimitConfig, RateLimitService, SearchConfig, SearchResponse, SearchService, StatsResponse,
};

struct TestApp {
    server: TestServer,
    state: AppState,
    source: Arc<InMemorySource>,
    _dir: TempDir,
}

impl TestApp {
    fn supervisor(&self) -> &Arc<BuildSupervisor> {
        self.state.search.supervisor()
    }

    async fn rebuild(&self) {
        self.supervisor().run(BuildKind::Rebuild).await.unwrap();
    }
}

fn listing(id: &str, title: &str, description: &str) -> Listing {
    Listing {
        id: id.to_string(),
        title: title.to_string(),
        description: description.to_string(),
        price: Some(100.0),
        location: Some("Lyon".to_string()),
        criteria: Vec::new(),
        updated_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
    }
}

fn bike(id: &str, title: &str, brand: &str) -> Listing {
    let mut l = listing(id, title, "Bon état");
    l.criteria = vec![CriterionValue {
        criterion_id: "brand".to_string(),
        value: brand.to_string(),
    }];
    l
}

/// Hash embeddings that can be switched to fail like an unreachable provider.
struct SwitchableEmbedder {
    inner: HashEmbedder,
    failure: Mutex<Option<AdapterFailure>>,
}

impl SwitchableEmbedder {
    fn new() -> Self {
        Self {
            inner: HashEmbedder::new(64),
            failure: Mutex::new(None),
        }
    }

    fn fail_with(&self, failure: AdapterFailure) {
        *self.failure.lock().unwrap() = Some(failure);
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for SwitchableEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed_batch(&self, texts: &[String]) -> listing_search::Result<Vec<Embedding>> {
        let failure = *self.failure.lock().unwrap();
        if let Some(failure) = failure {
            return Err(Error::embedding(
                failure,
                "POST https://embeddings.internal/v1?key=sk-secret failed",
            ));
        }
        self.inner.embed_batch(texts).await
    }
}

fn app_with(source: InMemorySource, admin_token: Option<&str>) -> TestApp {
    app_with_embedder(source, admin_token, Arc::new(HashEmbedder::new(64)))
}

fn app_with_embedder(
    source: InMemorySource,
    admin_token: Option<&str>,
    embedder: Arc<dyn EmbeddingProvider>,
) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(
        source.with_labels(HashMap::from([("brand".to_string(), "Marque".to_string())])),
    );
    let handle = Arc::new(IndexHandle::empty());
    let builder = IndexBuilder::new(source.clone(), embedder, 16);
    let supervisor = Arc::new(BuildSupervisor::new(
        builder,
        handle.clone(),
        dir.path(),
        DeletionPolicy::Retain,
    ));
    let search = Arc::new(SearchService::new(SearchConfig::default(), handle, supervisor));
    let state = AppState::new(search).with_admin_token(admin_token.map(str::to_string));
    let server = ApiServer::with_state(ApiConfig::default(), state.clone());
    TestApp {
        server: TestServer::new(server.router()).unwrap(),
        state,
        source,
        _dir: dir,
    }
}

fn app(listings: Vec<Listing>) -> TestApp {
    app_with(InMemorySource::with_listings(listings), None)
}

async fn ready(listings: Vec<Listing>) -> TestApp {
    let app = app(listings);
    app.rebuild().await;
    app
}

fn villas() -> Vec<Listing> {
    (1..=5)
        .map(|i| listing(&format!("v{}", i), &format!("Villa {}", i), "Belle villa avec piscine"))
        .chain([listing("x", "Vélo de route", "Cadre carbone")])
        .collect()
}

#[tokio::test]
async fn test_root_banner() {
    let app = app(Vec::new());
    let response = app.server.get("/").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["service"], "listing-search");
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_villa_search_returns_lexical_hits_up_to_limit() {
    let app = ready(villas()).await;

    let response = app
        .server
        .post("/search")
        .json(&json!({"query": "villa", "limit": 2}))
        .await;
    response.assert_status_ok();

    let body: SearchResponse = response.json();
    assert_eq!(body.query, "villa");
    assert_eq!(body.total_results, 2);
    assert_eq!(body.results.len(), 2);
    for hit in &body.results {
        assert!(hit.listing.title.starts_with("Villa"));
        assert!(!hit.matched_fields.is_empty());
        assert_ne!(hit.match_type, MatchType::Semantic);
    }
}

#[tokio::test]
async fn test_default_limit_applies() {
    let listings = (0..15)
        .map(|i| listing(&format!("m{:02}", i), &format!("Maison {}", i), "Maison de ville"))
        .collect();
    let app = ready(listings).await;

    let body: SearchResponse = app
        .server
        .post("/search")
        .json(&json!({"query": "maison"}))
        .await
        .json();
    assert_eq!(body.total_results, 10);
}

#[tokio::test]
async fn test_invalid_limits_are_rejected() {
    let app = ready(villas()).await;

    for limit in [0, -1, 51] {
        let response = app
            .server
            .post("/search")
            .json(&json!({"query": "villa", "limit": limit}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: ErrorBody = response.json();
        assert_eq!(body.code, "InvalidArgumentError", "limit {}", limit);
    }
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let app = ready(villas()).await;

    let response = app
        .server
        .post("/search")
        .text("{\"query\": ")
        .content_type("application/json")
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<ErrorBody>().code, "InvalidArgumentError");

    let response = app.server.post("/search").json(&json!({"limit": 3})).await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_search_before_first_build_is_unavailable() {
    let app = app(villas());

    let response = app.server.get("/health").await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let health: HealthResponse = response.json();
    assert!(!health.ready);
    assert_eq!(health.status, "not_ready");

    let response = app.server.post("/search").json(&json!({"query": "villa"})).await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json::<ErrorBody>().code, "IndexNotReadyError");

    app.rebuild().await;

    let response = app.server.get("/health").await;
    response.assert_status_ok();
    let health: HealthResponse = response.json();
    assert!(health.ready);
    assert_eq!(health.listing_count, 6);
}

#[tokio::test]
async fn test_search_by_path() {
    let app = ready(villas()).await;

    let response = app
        .server
        .get("/search/villa")
        .add_query_param("limit", 3)
        .await;
    response.assert_status_ok();
    let body: SearchResponse = response.json();
    assert_eq!(body.query, "villa");
    assert_eq!(body.total_results, 3);

    let response = app.server.get("/search/villa?limit=zero").await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_search_fast_searches_the_word() {
    let mut listings = villas();
    listings.push(listing("f", "Fast food équipé", "Friteuse et plancha"));
    let app = ready(listings).await;

    let response = app.server.get("/search/fast").add_query_param("limit", 5).await;
    response.assert_status_ok();
    let body: SearchResponse = response.json();
    assert_eq!(body.query, "fast");
    assert_eq!(body.results[0].listing.id, "f");
    assert!(!body.results[0].matched_fields.is_empty());

    app.server
        .get("/search/fast?limit=0")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_criteria_label_query_and_filters() {
    let app = ready(vec![
        bike("t", "Vélo de course", "Trek"),
        bike("g", "VTT tout suspendu", "Giant"),
    ])
    .await;

    let body: SearchResponse = app
        .server
        .post("/search")
        .json(&json!({"query": "Marque: Trek"}))
        .await
        .json();
    assert_eq!(body.results[0].listing.id, "t");
    assert!(body.results[0].listing.criteria.contains(&"Marque: Trek".to_string()));
    assert_eq!(body.text_results, 1);

    let body: SearchResponse = app
        .server
        .post("/search")
        .json(&json!({"query": "vélo", "filters": {"marque": "GIANT"}}))
        .await
        .json();
    assert!(body.results.iter().all(|hit| hit.listing.id == "g"));
}

#[tokio::test]
async fn test_fast_search_never_runs_lexical_matching() {
    let app = ready(villas()).await;

    let response = app
        .server
        .post("/search/fast")
        .json(&json!({"query": "villa", "limit": 3}))
        .await;
    response.assert_status_ok();
    let body: SearchResponse = response.json();
    assert_eq!(body.text_results, 0);
    assert!(body
        .results
        .iter()
        .all(|hit| hit.matched_fields.is_empty() && hit.match_type == MatchType::Semantic));

    let stats: StatsResponse = app.server.get("/stats").await.json();
    assert_eq!(stats.queries.fast_queries, 1);
    assert_eq!(stats.queries.lexical_evaluations, 0);
    assert_eq!(stats.listing_count, 6);
    assert_eq!(stats.embedding_model.as_deref(), Some("hash-64"));
}

#[tokio::test]
async fn test_fast_hits_are_a_subset_of_hybrid_vector_hits() {
    let app = ready(villas()).await;

    for query in ["villa", "villa piscine", "vélo carbone"] {
        let request = json!({"query": query, "limit": 50});
        let fast: SearchResponse = app.server.post("/search/fast").json(&request).await.json();
        let hybrid: SearchResponse = app.server.post("/search").json(&request).await.json();

        let hybrid_vector: HashMap<&str, f32> = hybrid
            .results
            .iter()
            .filter_map(|hit| hit.vector_similarity.map(|s| (hit.listing.id.as_str(), s)))
            .collect();
        assert!(!fast.results.is_empty(), "query {}", query);
        for hit in &fast.results {
            let similarity = hit.vector_similarity.unwrap();
            assert_eq!(
                hybrid_vector.get(hit.listing.id.as_str()),
                Some(&similarity),
                "query {} id {}",
                query,
                hit.listing.id
            );
        }
        let fast_ids: HashSet<&str> = fast.results.iter().map(|h| h.listing.id.as_str()).collect();
        assert_eq!(fast_ids.len(), hybrid_vector.len(), "query {}", query);
    }
}

#[tokio::test]
async fn test_embedding_failure_during_query_is_redacted() {
    let embedder = Arc::new(SwitchableEmbedder::new());
    let app = app_with_embedder(
        InMemorySource::with_listings(villas()),
        None,
        embedder.clone(),
    );
    app.rebuild().await;

    embedder.fail_with(AdapterFailure::Unavailable);
    let response = app.server.post("/search").json(&json!({"query": "maison"})).await;
    response.assert_status(StatusCode::BAD_GATEWAY);
    let body: ErrorBody = response.json();
    assert_eq!(body.code, "UpstreamError");
    assert_eq!(body.error, "embedding provider request failed");
    assert!(!response.text().contains("sk-secret"));

    embedder.fail_with(AdapterFailure::Timeout);
    let response = app
        .server
        .post("/search/fast")
        .json(&json!({"query": "chalet"}))
        .await;
    response.assert_status(StatusCode::GATEWAY_TIMEOUT);
    let body: ErrorBody = response.json();
    assert_eq!(body.code, "UpstreamTimeoutError");
    assert!(!body.error.contains("embeddings.internal"));

    // The index itself is unaffected.
    app.server.get("/health").await.assert_status_ok();
}

#[tokio::test]
async fn test_incremental_update_replaces_listing() {
    let app = ready(villas()).await;

    let mut renamed = listing("v1", "Chalet savoyard", "Vue sur les pistes");
    renamed.updated_at = Utc::now() + chrono::Duration::seconds(5);
    app.source.upsert(renamed).await;

    let response = app.server.post("/admin/update-index").await;
    response.assert_status(StatusCode::ACCEPTED);
    let accepted: AcceptedResponse = response.json();
    assert_eq!(accepted.status, "accepted");
    assert_eq!(accepted.kind, BuildKind::Update);
    assert!(!accepted.job_id.is_empty());

    app.supervisor().wait_idle().await;

    let body: SearchResponse = app
        .server
        .post("/search")
        .json(&json!({"query": "chalet"}))
        .await
        .json();
    assert!(body
        .results
        .iter()
        .any(|hit| hit.listing.id == "v1" && !hit.matched_fields.is_empty()));

    let body: SearchResponse = app
        .server
        .post("/search")
        .json(&json!({"query": "villa", "limit": 10}))
        .await
        .json();
    assert!(body
        .results
        .iter()
        .all(|hit| !(hit.listing.id == "v1" && !hit.matched_fields.is_empty())));
}

#[tokio::test]
async fn test_concurrent_rebuild_is_conflict() {
    let source = InMemorySource::with_listings(villas()).with_delay(Duration::from_millis(300));
    let app = app_with(source, None);

    let first = app.server.post("/admin/rebuild-index").await;
    first.assert_status(StatusCode::ACCEPTED);

    let second = app.server.post("/admin/rebuild-index").await;
    second.assert_status(StatusCode::CONFLICT);
    assert_eq!(second.json::<ErrorBody>().code, "BuildInProgressError");

    let status: Value = app.server.get("/admin/build-status").await.json();
    assert_eq!(status["state"], "building");

    app.supervisor().wait_idle().await;
    assert_eq!(app.source.fetch_count(), 1);
    app.server.get("/health").await.assert_status_ok();
}

#[tokio::test]
async fn test_failed_rebuild_keeps_serving_previous_snapshot() {
    let app = ready(villas()).await;
    app.source.set_failing(true).await;

    app.server
        .post("/admin/rebuild-index")
        .await
        .assert_status(StatusCode::ACCEPTED);
    app.supervisor().wait_idle().await;

    let status: Value = app.server.get("/admin/build-status").await.json();
    assert_eq!(status["state"], "failed");
    assert_eq!(status["kind"], "rebuild");
    assert!(status["last_build"].is_object());

    let response = app.server.post("/search").json(&json!({"query": "villa"})).await;
    response.assert_status_ok();
    assert!(response.json::<SearchResponse>().total_results > 0);
}

#[tokio::test]
async fn test_admin_routes_require_token_when_configured() {
    let app = app_with(InMemorySource::with_listings(villas()), Some("s3cret"));
    app.rebuild().await;

    let response = app.server.post("/admin/rebuild-index").await;
    response.assert_status(StatusCode::UNAUTHORIZED);
    assert_eq!(response.json::<ErrorBody>().code, "UnauthorizedError");

    app.server
        .get("/admin/index-content")
        .authorization_bearer("wrong")
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    let response = app
        .server
        .get("/admin/index-content")
        .authorization_bearer("s3cret")
        .await;
    response.assert_status_ok();
    let content: Value = response.json();
    assert_eq!(content["total_documents"], 6);

    // Search stays public.
    app.server
        .post("/search")
        .json(&json!({"query": "villa"}))
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_index_content_previews_documents() {
    let mut long = listing("long", "Appartement", "");
    long.description = "lumineux ".repeat(40);
    let app = ready(vec![long]).await;

    let content: Value = app.server.get("/admin/index-content").await.json();
    let preview = content["documents"][0]["content"].as_str().unwrap();
    assert!(preview.starts_with("Title: Appartement"));
    assert!(preview.ends_with("..."));
    assert_eq!(preview.chars().count(), 103);
}

#[tokio::test]
async fn test_metrics_disabled_is_not_found() {
    let app = app(Vec::new());
    app.server
        .get("/metrics")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_search_routes_are_rate_limited() {
    let app = ready(villas()).await;
    let limited = app
        .state
        .clone()
        .with_rate_limiter(RateLimitService::new(RateLimitConfig {
            requests_per_minute: 2,
        }));
    let server = TestServer::new(ApiServer::with_state(ApiConfig::default(), limited).router())
        .unwrap();

    for _ in 0..2 {
        server
            .post("/search")
            .json(&json!({"query": "villa"}))
            .await
            .assert_status_ok();
    }
    let response = server.get("/search/villa").await;
    response.assert_status(StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.json::<ErrorBody>().code, "RateLimitedError");

    // Health and stats are not limited.
    server.get("/health").await.assert_status_ok();
    server.get("/stats").await.assert_status_ok();
}
