//! OpenAI-compatible embeddings client.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{Embedding, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::{AdapterFailure, Error, Result};
use crate::transport::{self, RETRY_BACKOFF};

/// OpenAI accepts up to 2048 inputs per request; stay well below it.
const MAX_BATCH: usize = 256;

/// Output size of the known OpenAI embedding models.
pub fn known_dimension(model: &str) -> Option<usize> {
    match model {
        "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        _ => None,
    }
}

/// Async embeddings client for `POST {base_url}/embeddings`.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    /// Sent as `dimensions` only when configured explicitly.
    requested_dimensions: Option<usize>,
    dimension: usize,
}

impl std::fmt::Debug for OpenAiEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbedder")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        dimensions: Option<usize>,
        timeout: Duration,
    ) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(Error::Config("missing OpenAI API key".into()));
        }
        if model.trim().is_empty() {
            return Err(Error::Config("missing embedding model name".into()));
        }
        let dimension = dimensions.or_else(|| known_dimension(model)).ok_or_else(|| {
            Error::Config(format!(
                "unknown dimension for model '{}'; set embedding.dimensions",
                model
            ))
        })?;

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|_| Error::Config("OpenAI API key is not a valid header value".into()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            client: transport::build_client(timeout, headers)?,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            requested_dimensions: dimensions,
            dimension,
        })
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config.api_key.as_deref().ok_or_else(|| {
            Error::Config("embedding.api_key (or OPENAI_API_KEY) is required".into())
        })?;
        Self::new(
            api_key,
            &config.base_url,
            &config.model,
            config.dimensions,
            Duration::from_secs(config.timeout_secs),
        )
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.requested_dimensions,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport::adapter_error(e, |f, m| Error::embedding(f, m), "embeddings request"))?;

        let status = response.status();
        if !status.is_success() {
            // The body may echo the request; report the status only.
            return Err(Error::embedding(
                transport::classify_status(status),
                format!("embeddings request failed with status {}", status.as_u16()),
            ));
        }

        let mut parsed: EmbeddingResponse = response.json().await.map_err(|_| {
            Error::embedding(AdapterFailure::Rejected, "malformed embeddings response")
        })?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != texts.len() {
            return Err(Error::embedding(
                AdapterFailure::Rejected,
                format!(
                    "{} embeddings returned for {} inputs",
                    parsed.data.len(),
                    texts.len()
                ),
            ));
        }
        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_batch_size(&self) -> usize {
        MAX_BATCH
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(inputs = texts.len(), model = %self.model, "Requesting embeddings");
        transport::with_retry("embeddings request", RETRY_BACKOFF, || self.request(texts)).await
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}
