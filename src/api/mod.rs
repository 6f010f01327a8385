//! HTTP API.
//!
//! | Method | Path                    | Guard        |
//! |--------|-------------------------|--------------|
//! | GET    | `/`                     |              |
//! | GET    | `/health`               |              |
//! | GET    | `/stats`                |              |
//! | GET    | `/search/{query}`       | rate limit   |
//! | POST   | `/search`               | rate limit   |
//! | POST   | `/search/fast`          | rate limit   |
//! | POST   | `/admin/update-index`   | admin token  |
//! | POST   | `/admin/rebuild-index`  | admin token  |
//! | GET    | `/admin/index-content`  | admin token  |
//! | GET    | `/admin/build-status`   | admin token  |
//! | GET    | `/metrics`              |              |

mod auth;
mod error;
mod handlers;
mod rate_limit;

pub use auth::{bearer_token, token_matches};
pub use error::{ApiError, ErrorBody};
pub use handlers::{AcceptedResponse, RootResponse};
pub use rate_limit::{RateLimitConfig, RateLimitService};

use axum::http::{HeaderValue, Method};
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsService;
use crate::search::SearchService;

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub listen_address: String,
    pub cors_enabled: bool,
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for ApiConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            listen_address: server.listen_address.clone(),
            cors_enabled: server.cors_enabled,
            cors_origins: server.cors_origins.clone(),
        }
    }
}

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub search: Arc<SearchService>,
    pub rate_limiter: Arc<RateLimitService>,
    pub metrics: Arc<MetricsService>,
    pub admin_token: Option<Arc<str>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(search: Arc<SearchService>) -> Self {
        Self {
            search,
            rate_limiter: Arc::new(RateLimitService::disabled()),
            metrics: Arc::new(MetricsService::disabled()),
            admin_token: None,
            start_time: Instant::now(),
        }
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.map(Arc::from);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimitService) -> Self {
        self.rate_limiter = Arc::new(limiter);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsService) -> Self {
        self.metrics = Arc::new(metrics);
        self
    }
}

/// The listing search HTTP server.
pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

impl ApiServer {
    pub fn with_state(config: ApiConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Build the router with all routes and layers.
    pub fn router(&self) -> Router {
        let search_routes = Router::new()
            .route("/search", post(handlers::search))
            .route(
                "/search/fast",
                get(handlers::search_fast_by_path).post(handlers::fast_search),
            )
            .route("/search/{query}", get(handlers::search_by_path))
            .route_layer(middleware::from_fn_with_state(
                self.state.clone(),
                rate_limit::enforce,
            ));

        let admin_routes = Router::new()
            .route("/admin/update-index", post(handlers::trigger_update))
            .route("/admin/rebuild-index", post(handlers::trigger_rebuild))
            .route("/admin/index-content", get(handlers::index_content))
            .route("/admin/build-status", get(handlers::build_status))
            .route_layer(middleware::from_fn_with_state(
                self.state.clone(),
                auth::require_admin,
            ));

        let router = Router::new()
            .route("/", get(handlers::root))
            .route("/health", get(handlers::health))
            .route("/stats", get(handlers::stats))
            .route("/metrics", get(handlers::metrics))
            .merge(search_routes)
            .merge(admin_routes)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http());

        match self.cors_layer() {
            Some(cors) => router.layer(cors),
            None => router,
        }
    }

    fn cors_layer(&self) -> Option<CorsLayer> {
        if !self.config.cors_enabled {
            return None;
        }
        let layer = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any);
        if self.config.cors_origins.is_empty() {
            return Some(layer.allow_origin(Any));
        }
        let origins: Vec<HeaderValue> = self
            .config
            .cors_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin: {}", origin);
                    None
                }
            })
            .collect();
        Some(layer.allow_origin(AllowOrigin::list(origins)))
    }

    /// Serve until the process is stopped.
    pub async fn run(&self, addr: &str) -> Result<()> {
        self.run_until(addr, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    pub async fn run_until<F>(&self, addr: &str, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Api(format!("failed to bind {}: {}", addr, e)))?;
        info!("API server listening on http://{}", addr);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Api(format!("server error: {}", e)))
    }
}
