//! Embedding providers.
//!
//! Every provider turns text into fixed-dimension vectors:
//! - [`OpenAiEmbedder`]: OpenAI-compatible `/embeddings` endpoint
//! - [`LocalEmbedder`]: ONNX model run in-process by FastEmbed
//! - [`HashEmbedder`]: deterministic feature hashing, no model download

mod hash;
mod local;
mod openai;

pub use hash::HashEmbedder;
pub use local::LocalEmbedder;
pub use openai::OpenAiEmbedder;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::error::{AdapterFailure, Error, Result};

/// A dense embedding vector.
pub type Embedding = Vec<f32>;

/// Converts text to vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Identifier stored in snapshot manifests; snapshots built with another
    /// model are not loaded.
    fn model_id(&self) -> &str;

    /// Length of every vector this provider returns.
    fn dimension(&self) -> usize;

    /// Largest batch accepted by [`EmbeddingProvider::embed_batch`].
    fn max_batch_size(&self) -> usize {
        32
    }

    /// Embed up to `max_batch_size` texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Embedding> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::embedding(AdapterFailure::Rejected, "no embedding returned"))
    }
}

/// Embed `texts` in batches of at most `batch_size`, checking count and
/// dimension of every returned vector.
pub async fn embed_all(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Embedding>> {
    let batch_size = batch_size.clamp(1, provider.max_batch_size().max(1));
    let mut out = Vec::with_capacity(texts.len());
    for (n, chunk) in texts.chunks(batch_size).enumerate() {
        let vectors = provider.embed_batch(chunk).await?;
        if vectors.len() != chunk.len() {
            return Err(Error::embedding(
                AdapterFailure::Rejected,
                format!("{} embeddings for {} inputs", vectors.len(), chunk.len()),
            ));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != provider.dimension()) {
            return Err(Error::embedding(
                AdapterFailure::Rejected,
                format!(
                    "embedding has dimension {}, expected {}",
                    bad.len(),
                    provider.dimension()
                ),
            ));
        }
        debug!(batch = n, size = chunk.len(), "Embedded batch");
        out.extend(vectors);
    }
    Ok(out)
}

/// Build the provider selected in the configuration.
pub fn from_config(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider {
        EmbeddingProviderKind::OpenAi => Arc::new(OpenAiEmbedder::from_config(config)?),
        EmbeddingProviderKind::Local => Arc::new(LocalEmbedder::from_config(config)?),
        EmbeddingProviderKind::Hash => Arc::new(HashEmbedder::new(config.hash_dimension)),
    };
    Ok(provider)
}
