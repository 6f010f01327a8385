//! Prometheus metrics.
//!
//! Counters and histograms are recorded through the `metrics` facade from
//! wherever they happen; this service only owns the exporter handle that
//! renders them for `GET /metrics`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};

use crate::config::MetricsConfig;

/// Owner of the Prometheus recorder, when enabled.
pub struct MetricsService {
    handle: Option<PrometheusHandle>,
}

impl MetricsService {
    /// Install the global recorder if metrics are enabled.
    ///
    /// Only one recorder can be installed per process; later services reuse a
    /// detached recorder whose output is empty.
    pub fn new(config: &MetricsConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        let handle = match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                describe();
                info!("Prometheus metrics enabled at /metrics");
                handle
            }
            Err(e) => {
                warn!("Metrics recorder already installed ({}), using a detached one", e);
                PrometheusBuilder::new().build_recorder().handle()
            }
        };
        Self {
            handle: Some(handle),
        }
    }

    pub fn disabled() -> Self {
        Self { handle: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.handle.is_some()
    }

    /// Periodically drain histogram buckets. Needs a running tokio runtime.
    pub fn spawn_upkeep(&self, every: std::time::Duration) {
        let Some(handle) = self.handle.clone() else {
            return;
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                handle.run_upkeep();
            }
        });
    }

    /// Prometheus text exposition, or `None` when disabled.
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn describe() {
    metrics::describe_counter!("search_requests_total", "Search requests by mode");
    metrics::describe_histogram!(
        "search_duration_seconds",
        metrics::Unit::Seconds,
        "Search latency by mode"
    );
    metrics::describe_counter!(
        "query_embedding_cache_hits_total",
        "Queries answered from the embedding cache"
    );
    metrics::describe_counter!("index_builds_total", "Index builds by kind and outcome");
    metrics::describe_counter!(
        "index_build_rejected_total",
        "Build triggers rejected because a build was running"
    );
    metrics::describe_histogram!(
        "index_build_duration_seconds",
        metrics::Unit::Seconds,
        "Duration of successful index builds"
    );
    metrics::describe_gauge!("index_listings", "Listings in the serving snapshot");
    metrics::describe_counter!("rate_limited_requests_total", "Requests rejected by the rate limiter");
}
