//! Route handlers.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

use super::error::ApiError;
use super::AppState;
use crate::index::{BuildKind, BuildStatus, BuildTicket};
use crate::search::{IndexContentResponse, SearchRequest, SearchResponse, StatsResponse};

/// Service banner for `GET /`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootResponse {
    pub service: String,
    pub version: String,
    pub status: String,
    pub message: String,
}

/// Body of a `202 Accepted` build trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub status: String,
    pub job_id: String,
    pub kind: BuildKind,
}

impl From<BuildTicket> for AcceptedResponse {
    fn from(ticket: BuildTicket) -> Self {
        Self {
            status: "accepted".to_string(),
            job_id: ticket.job_id,
            kind: ticket.kind,
        }
    }
}

/// Query string of `GET /search/{query}`.
#[derive(Debug, Default, Deserialize)]
pub(super) struct LimitParams {
    limit: Option<i64>,
}

pub(super) async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "ok".to_string(),
        message: "POST /search with {\"query\": \"...\"} to search listings".to_string(),
    })
}

/// 200 once a snapshot is serving, 503 before.
pub(super) async fn health(State(state): State<AppState>) -> Response {
    let health = state.search.health().await;
    let status = if health.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

pub(super) async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(state.search.stats().await)
}

pub(super) async fn search(
    State(state): State<AppState>,
    body: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    let Json(request) = body?;
    let started = Instant::now();
    let response = state.search.search(&request).await?;
    debug!(
        results = response.total_results,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Hybrid search served"
    );
    Ok(Json(response))
}

pub(super) async fn fast_search(
    State(state): State<AppState>,
    body: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    let Json(request) = body?;
    Ok(Json(state.search.fast_search(&request).await?))
}

/// `GET /search/{query}?limit=N`, same semantics as `POST /search`.
pub(super) async fn search_by_path(
    State(state): State<AppState>,
    query: Result<Path<String>, PathRejection>,
    params: Result<Query<LimitParams>, QueryRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    let Path(query) = query?;
    let Query(params) = params?;
    path_search(&state, query, params.limit).await
}

/// `GET /search/fast`: the static fast route shadows `/search/{query}` for
/// this one segment, so the word is searched here.
pub(super) async fn search_fast_by_path(
    State(state): State<AppState>,
    params: Result<Query<LimitParams>, QueryRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    let Query(params) = params?;
    path_search(&state, "fast".to_string(), params.limit).await
}

async fn path_search(
    state: &AppState,
    query: String,
    limit: Option<i64>,
) -> Result<Json<SearchResponse>, ApiError> {
    let request = SearchRequest {
        query,
        limit,
        filters: None,
    };
    Ok(Json(state.search.search(&request).await?))
}

pub(super) async fn trigger_update(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let ticket = state.search.trigger_update()?;
    info!(job_id = %ticket.job_id, "Index update accepted");
    Ok((StatusCode::ACCEPTED, Json(ticket.into())))
}

pub(super) async fn trigger_rebuild(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let ticket = state.search.trigger_rebuild()?;
    info!(job_id = %ticket.job_id, "Index rebuild accepted");
    Ok((StatusCode::ACCEPTED, Json(ticket.into())))
}

pub(super) async fn index_content(State(state): State<AppState>) -> Json<IndexContentResponse> {
    Json(state.search.index_content().await)
}

pub(super) async fn build_status(State(state): State<AppState>) -> Json<BuildStatus> {
    Json(state.search.build_status())
}

/// Prometheus text format, 404 when metrics are disabled.
pub(super) async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
