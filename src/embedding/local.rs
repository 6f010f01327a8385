//! In-process embeddings via FastEmbed (ONNX runtime).

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use super::{Embedding, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::{AdapterFailure, Error, Result};

/// Models this adapter can load, by configured name.
const SUPPORTED: &[(&str, usize)] = &[
    ("all-MiniLM-L6-v2", 384),
    ("bge-small-en-v1.5", 384),
    ("multilingual-e5-small", 384),
];

fn resolve(name: &str) -> Option<(EmbeddingModel, usize)> {
    let model = match name {
        "all-MiniLM-L6-v2" => EmbeddingModel::AllMiniLML6V2,
        "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
        "multilingual-e5-small" => EmbeddingModel::MultilingualE5Small,
        _ => return None,
    };
    let dimension = SUPPORTED.iter().find(|(n, _)| *n == name)?.1;
    Some((model, dimension))
}

/// FastEmbed-backed provider. Inference runs on the blocking pool.
pub struct LocalEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
    name: String,
    dimension: usize,
    timeout: Duration,
}

impl LocalEmbedder {
    /// Load (downloading on first use) the named model.
    pub fn load(name: &str, timeout: Duration) -> Result<Self> {
        let (model, dimension) = resolve(name).ok_or_else(|| {
            let names: Vec<&str> = SUPPORTED.iter().map(|(n, _)| *n).collect();
            Error::Config(format!(
                "unsupported local model '{}'; expected one of {}",
                name,
                names.join(", ")
            ))
        })?;
        info!("Loading local embedding model {}", name);
        let engine = TextEmbedding::try_new(
            InitOptions::new(model).with_show_download_progress(false),
        )
        .map_err(|e| Error::Config(format!("failed to load model '{}': {}", name, e)))?;

        Ok(Self {
            model: Arc::new(Mutex::new(engine)),
            name: name.to_string(),
            dimension,
            timeout,
        })
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        Self::load(&config.model, Duration::from_secs(config.timeout_secs))
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedder {
    fn model_id(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = Arc::clone(&self.model);
        let inputs = texts.to_vec();
        let task = tokio::task::spawn_blocking(move || {
            let engine = model
                .lock()
                .map_err(|_| Error::Internal("embedding model lock poisoned".into()))?;
            engine
                .embed(inputs, None)
                .map_err(|e| Error::embedding(AdapterFailure::Rejected, e.to_string()))
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::Internal(format!("embedding task failed: {}", join))),
            Err(_) => Err(Error::embedding(
                AdapterFailure::Timeout,
                format!("local inference exceeded {:?}", self.timeout),
            )),
        }
    }
}
