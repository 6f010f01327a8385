//! Service configuration.
//!
//! Loaded from a TOML file, then overridden by the environment variables the
//! hosting platform provisions (credentials, port, limits).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default Appwrite cloud endpoint.
pub const DEFAULT_STORE_ENDPOINT: &str = "https://cloud.appwrite.io/v1";

/// Collection holding criterion definitions (id -> label).
pub const DEFAULT_CRITERIA_COLLECTION: &str = "68850b060013a170d573";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub search: SearchConfig,
    pub index: IndexConfig,
    pub source: SourceConfig,
    pub embedding: EmbeddingConfig,
    pub metrics: MetricsConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind (host:port)
    pub listen_address: String,
    /// Enable CORS
    pub cors_enabled: bool,
    /// Allowed origins; empty means any
    pub cors_origins: Vec<String>,
    /// Bearer token required by admin routes; `None` leaves them open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
    /// Search requests per minute across all clients (0 disables)
    pub requests_per_minute: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8000".to_string(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            admin_token: None,
            requests_per_minute: 0,
        }
    }
}

/// Ranking and request limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    /// Limit used when the request omits one
    pub default_limit: usize,
    /// Hard cap; larger limits are rejected
    pub max_limit: usize,
    /// Weight of the lexical signal in the combined score
    pub lexical_weight: f32,
    /// Weight of the vector signal in the combined score
    pub vector_weight: f32,
    /// Score a lexical hit contributes before weighting
    pub lexical_base_score: f32,
    /// Vector hits below this similarity are dropped
    pub min_similarity: f32,
    /// Minimum vector candidates fetched before ranking
    pub vector_candidates: usize,
    /// Seconds a query embedding stays cached (0 disables)
    pub query_cache_ttl_secs: u64,
    /// Max cached query embeddings
    pub query_cache_capacity: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 50,
            lexical_weight: 1.0,
            vector_weight: 1.0,
            lexical_base_score: 1.0,
            min_similarity: 0.5,
            vector_candidates: 20,
            query_cache_ttl_secs: 60,
            query_cache_capacity: 1024,
        }
    }
}

/// What an incremental update does with listings that vanished upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicy {
    /// Keep them indexed until the next full rebuild.
    #[default]
    Retain,
    /// List all source ids and drop indexed listings that are gone.
    Prune,
}

/// Index build and persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    /// Directory holding the persisted snapshot
    pub directory: PathBuf,
    pub deletion_policy: DeletionPolicy,
    /// Run an update (or a rebuild when nothing is persisted) at boot
    pub refresh_on_startup: bool,
    /// Documents fetched per store page
    pub page_size: usize,
    /// Texts per embedding request
    pub embed_batch_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("index"),
            deletion_policy: DeletionPolicy::Retain,
            refresh_on_startup: true,
            page_size: 25,
            embed_batch_size: 32,
        }
    }
}

/// Which document store adapter to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Appwrite,
    /// Local JSON file, for development and demos.
    File,
}

/// Document store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub endpoint: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub database_id: String,
    pub collection_id: String,
    pub criteria_collection_id: String,
    /// Used when `kind = "file"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Appwrite,
            endpoint: DEFAULT_STORE_ENDPOINT.to_string(),
            project_id: String::new(),
            api_key: None,
            database_id: String::new(),
            collection_id: String::new(),
            criteria_collection_id: DEFAULT_CRITERIA_COLLECTION.to_string(),
            file_path: None,
            timeout_secs: 30,
        }
    }
}

/// Which embedding provider adapter to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    /// OpenAI-compatible HTTP endpoint
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    /// Local ONNX model via fastembed
    Local,
    /// Deterministic feature hashing, no model
    Hash,
}

/// Embedding provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    /// Optional dimension override for models that support it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
    pub timeout_secs: u64,
    /// Vector size for the hash provider
    pub hash_dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::OpenAi,
            api_key: None,
            model: "text-embedding-3-small".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            dimensions: None,
            timeout_secs: 30,
            hash_dimension: 384,
        }
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder and serve `/metrics`
    pub enabled: bool,
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: ServiceConfig = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Save configuration to a TOML file. Secrets are never written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = toml::to_string_pretty(&self.without_secrets())?;
        std::fs::write(path.as_ref(), raw)?;
        Ok(())
    }

    /// Copy of this config with every credential removed.
    pub fn without_secrets(&self) -> Self {
        let mut copy = self.clone();
        copy.server.admin_token = None;
        copy.source.api_key = None;
        copy.embedding.api_key = None;
        copy
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("OPENAI_API_KEY") {
            self.embedding.api_key = Some(key);
        }
        if let Some(model) = non_empty("EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
        if let Some(endpoint) = non_empty("APPWRITE_ENDPOINT") {
            self.source.endpoint = endpoint;
        }
        if let Some(project) = non_empty("APPWRITE_PROJECT_ID") {
            self.source.project_id = project;
        }
        if let Some(key) = non_empty("APPWRITE_API_KEY") {
            self.source.api_key = Some(key);
        }
        if let Some(database) = non_empty("APPWRITE_DATABASE_ID") {
            self.source.database_id = database;
        }
        if let Some(collection) = non_empty("APPWRITE_COLLECTION_ID") {
            self.source.collection_id = collection;
        }
        if let Some(collection) = non_empty("APPWRITE_CRITERIA_COLLECTION_ID") {
            self.source.criteria_collection_id = collection;
        }
        if let Some(token) = non_empty("ADMIN_TOKEN") {
            self.server.admin_token = Some(token);
        }
        if let Some(dir) = non_empty("INDEX_DIR") {
            self.index.directory = PathBuf::from(dir);
        }
        if let Some(port) = non_empty("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("PORT must be a port number, got '{}'", port)))?;
            let host = self
                .server
                .listen_address
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.server.listen_address = format!("{}:{}", host, port);
        }
        if let Some(cap) = non_empty("SEARCH_MAX_LIMIT") {
            self.search.max_limit = cap.trim().parse().map_err(|_| {
                Error::Config(format!("SEARCH_MAX_LIMIT must be an integer, got '{}'", cap))
            })?;
        }
        Ok(())
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        let search = &self.search;
        if search.max_limit == 0 {
            return Err(Error::Config("search.max_limit must be at least 1".into()));
        }
        if search.default_limit == 0 || search.default_limit > search.max_limit {
            return Err(Error::Config(format!(
                "search.default_limit must be in 1..={}",
                search.max_limit
            )));
        }
        for (name, weight) in [
            ("lexical_weight", search.lexical_weight),
            ("vector_weight", search.vector_weight),
            ("lexical_base_score", search.lexical_base_score),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(Error::Config(format!(
                    "search.{} must be a non-negative number",
                    name
                )));
            }
        }
        if self.index.page_size == 0 {
            return Err(Error::Config("index.page_size must be at least 1".into()));
        }
        if self.index.embed_batch_size == 0 {
            return Err(Error::Config(
                "index.embed_batch_size must be at least 1".into(),
            ));
        }
        if self.source.kind == SourceKind::File && self.source.file_path.is_none() {
            return Err(Error::Config(
                "source.file_path is required when source.kind = \"file\"".into(),
            ));
        }
        Ok(())
    }
}
