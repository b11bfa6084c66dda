mod address;
mod cache;
mod circuit_breaker;
mod config;
mod cost;
mod db;
mod errors;
mod handlers;
mod job_store;
mod models;
mod providers;
mod quality;
mod queue;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::EnrichmentCache;
use crate::config::Config;
use crate::db::Database;
use crate::job_store::JobStore;
use crate::providers::ProviderFactory;
use crate::queue::EnrichmentQueueManager;

/// How often the abandoned-job reaper runs.
const REAPER_INTERVAL_SECS: u64 = 60;

/// A `processing` job with no heartbeat for this long is considered abandoned.
const REAPER_MAX_AGE_MINUTES: i64 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "property_enrichment_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    // Initialize database connection pool and schema
    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");

    let cache = EnrichmentCache::new(db.pool.clone());
    let store = JobStore::new(db.pool.clone());
    let providers = ProviderFactory::from_config(&config)?;
    let manager = EnrichmentQueueManager::new(
        store,
        cache.clone(),
        providers,
        config.cache_ttl_days,
    );

    // Reap jobs whose worker died mid-flight so they do not sit in
    // `processing` forever.
    let reaper = manager.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(REAPER_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if let Err(e) = reaper
                .reap_abandoned(chrono::Duration::minutes(REAPER_MAX_AGE_MINUTES))
                .await
            {
                tracing::error!("Abandoned-job reaper failed: {}", e);
            }
        }
    });

    let app_state = Arc::new(handlers::AppState {
        manager,
        cache,
        config: config.clone(),
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    let protected_routes = Router::new()
        .route(
            "/api/v1/enrichment/jobs",
            post(handlers::create_enrichment_job),
        )
        .route(
            "/api/v1/enrichment/jobs/:id",
            get(handlers::get_enrichment_job),
        )
        .route(
            "/api/v1/enrichment/estimate",
            post(handlers::estimate_enrichment),
        )
        .layer(
            ServiceBuilder::new()
                // 5MB max payload
                .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
