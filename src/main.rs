//! Listing Search CLI
//!
//! Command-line interface for running the listing search service and
//! maintaining its index.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use listing_search::{
    embedding, source, ApiConfig, ApiServer, AppState, BuildKind, BuildSupervisor, DocumentSource,
    EmbeddingProvider, Error, HealthResponse, IndexBuilder, IndexHandle, IndexSnapshot,
    MetricsService, RateLimitConfig, RateLimitService, Result, SearchService, ServiceConfig,
};

#[derive(Parser)]
#[command(name = "listing-search")]
#[command(author, version, about = "Hybrid search service for marketplace listings", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },

    /// Start the HTTP service
    Start {
        /// HTTP listen address, overrides the configuration
        #[arg(long)]
        api_addr: Option<String>,
    },

    /// Rebuild the whole index from the document store and exit
    Rebuild,

    /// Apply listings modified since the last build and exit
    Update,

    /// Check service health
    Health {
        /// API endpoint to check
        #[arg(long, default_value = "http://localhost:8000")]
        endpoint: String,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

/// Load the file (or defaults), apply environment overrides and validate.
fn load_config(path: &str) -> Result<ServiceConfig> {
    let mut config = if Path::new(path).exists() {
        info!("Loading configuration from: {}", path);
        ServiceConfig::load(path)?
    } else {
        info!("Using default configuration");
        ServiceConfig::default()
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// Collaborators shared by every command that touches the index.
struct Components {
    handle: Arc<IndexHandle>,
    supervisor: Arc<BuildSupervisor>,
}

async fn assemble(config: &ServiceConfig) -> Result<Components> {
    let source = source::from_config(&config.source, config.index.page_size)?;
    info!("Document source: {}", source.name());

    let embedder = embedding::from_config(&config.embedding)?;
    info!(
        "Embedding provider: {} ({} dimensions)",
        embedder.model_id(),
        embedder.dimension()
    );

    let handle = Arc::new(match load_snapshot(&config.index.directory, embedder.as_ref()).await {
        Some(snapshot) => IndexHandle::with_snapshot(snapshot),
        None => IndexHandle::empty(),
    });

    let builder = IndexBuilder::new(source, embedder, config.index.embed_batch_size);
    let supervisor = Arc::new(BuildSupervisor::new(
        builder,
        Arc::clone(&handle),
        config.index.directory.clone(),
        config.index.deletion_policy,
    ));
    Ok(Components { handle, supervisor })
}

/// The persisted snapshot, if there is one built with the active embedding model.
async fn load_snapshot(dir: &Path, embedder: &dyn EmbeddingProvider) -> Option<IndexSnapshot> {
    if !IndexSnapshot::exists(dir) {
        info!("No persisted index at {}", dir.display());
        return None;
    }
    let path: PathBuf = dir.to_path_buf();
    let loaded = tokio::task::spawn_blocking(move || IndexSnapshot::load(&path)).await;
    let snapshot = match loaded {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(e)) => {
            warn!("Ignoring unreadable index at {}: {}", dir.display(), e);
            return None;
        }
        Err(e) => {
            warn!("Index loader panicked: {}", e);
            return None;
        }
    };
    let manifest = snapshot.manifest();
    if manifest.embedding_model != embedder.model_id()
        || manifest.dimension != embedder.dimension()
    {
        warn!(
            "Persisted index was built with {} ({} dimensions), ignoring it",
            manifest.embedding_model, manifest.dimension
        );
        return None;
    }
    info!(
        "Loaded index with {} listings built at {}",
        manifest.listing_count, manifest.built_at
    );
    Some(snapshot)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Init { output } => {
            info!("Initializing new service configuration at: {}", output);
            let config = ServiceConfig::default();
            config.save(&output)?;
            info!("Configuration saved successfully");
        }

        Commands::Start { api_addr } => {
            info!("Starting listing search service...");

            // 1. Configuration
            let mut config = load_config(&cli.config)?;
            if let Some(addr) = api_addr {
                config.server.listen_address = addr;
            }

            // 2. Metrics recorder, installed before any build records
            let metrics = MetricsService::new(&config.metrics);
            metrics.spawn_upkeep(Duration::from_secs(10));

            // 3. Index, builder and supervisor
            let Components { handle, supervisor } = assemble(&config).await?;

            // 4. Startup build policy
            if !handle.is_ready().await {
                info!("Building index in the background");
                supervisor.trigger(BuildKind::Rebuild)?;
            } else if config.index.refresh_on_startup {
                info!("Refreshing index in the background");
                supervisor.trigger(BuildKind::Update)?;
            }

            // 5. Query service and HTTP state
            let search = Arc::new(SearchService::new(
                config.search.clone(),
                Arc::clone(&handle),
                Arc::clone(&supervisor),
            ));
            let rate_limiter = RateLimitService::new(RateLimitConfig {
                requests_per_minute: config.server.requests_per_minute,
            });
            if config.server.admin_token.is_none() {
                warn!("No admin token configured, admin routes are open");
            }
            let app_state = AppState::new(search)
                .with_admin_token(config.server.admin_token.clone())
                .with_rate_limiter(rate_limiter)
                .with_metrics(metrics);

            // 6. Serve until Ctrl+C
            let api_config = ApiConfig::from(&config.server);
            let addr = api_config.listen_address.clone();
            let api_server = ApiServer::with_state(api_config, app_state);

            info!("Press Ctrl+C to stop");
            api_server
                .run_until(&addr, async {
                    if let Err(e) = signal::ctrl_c().await {
                        error!("Failed to listen for shutdown signal: {}", e);
                        return;
                    }
                    info!("Received shutdown signal");
                })
                .await?;
            info!("Service stopped");
        }

        Commands::Rebuild => {
            let config = load_config(&cli.config)?;
            let Components { supervisor, .. } = assemble(&config).await?;
            let report = supervisor.run(BuildKind::Rebuild).await?;
            info!(
                "Rebuilt index: {} listings in {} ms",
                report.listing_count, report.elapsed_ms
            );
        }

        Commands::Update => {
            let config = load_config(&cli.config)?;
            let Components { supervisor, .. } = assemble(&config).await?;
            let report = supervisor.run(BuildKind::Update).await?;
            info!(
                "Updated index: {} fetched, {} removed, {} listings ({})",
                report.fetched,
                report.removed,
                report.listing_count,
                if report.full_rebuild { "full rebuild" } else { "incremental" }
            );
        }

        Commands::Health { endpoint } => {
            info!("Checking service health at: {}", endpoint);

            let health_url = format!("{}/health", endpoint.trim_end_matches('/'));

            match tokio::time::timeout(Duration::from_secs(5), check_health(&health_url)).await {
                Ok(Ok(response)) => {
                    info!("Service status: {}", response.status);
                    info!("Indexed listings: {}", response.listing_count);
                    info!("Build running: {}", response.building);
                    if !response.ready {
                        std::process::exit(1);
                    }
                }
                Ok(Err(e)) => {
                    error!("Health check failed: {}", e);
                    std::process::exit(1);
                }
                Err(_) => {
                    error!("Health check timed out");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

/// Perform a health check against the API endpoint.
async fn check_health(url: &str) -> Result<HealthResponse> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let url = url.trim_start_matches("http://");
    let (host_port, path) = url
        .split_once('/')
        .map(|(h, p)| (h, format!("/{}", p)))
        .unwrap_or((url, "/health".to_string()));

    let mut stream = TcpStream::connect(host_port)
        .await
        .map_err(|e| Error::Api(format!("Connection failed: {}", e)))?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host_port
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| Error::Api(format!("Write failed: {}", e)))?;

    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .map_err(|e| Error::Api(format!("Read failed: {}", e)))?;

    let response_str = String::from_utf8_lossy(&response);

    // Body follows the blank line; a 503 still carries a health body
    let body = response_str
        .split("\r\n\r\n")
        .nth(1)
        .ok_or_else(|| Error::Api("Invalid HTTP response".to_string()))?;

    serde_json::from_str(body).map_err(|e| Error::Api(format!("JSON parse error: {}", e)))
}
