// src/main.rs - Shop insights API entry point
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cache;
mod calculations;
mod config;
mod database;
mod handlers;
mod models;
mod monitoring;
mod refresh;
mod service;
mod shopify;

use crate::{
    cache::{start_cache_cleanup_task, AnalyticsCache, CacheStore, InMemoryCacheStore},
    config::{AppConfig, CacheBackend, LoggingConfig},
    database::{
        Database, InMemoryProfileStore, PostgresCacheStore, PostgresProfileStore, ProfileStore,
    },
    handlers::*,
    monitoring::{performance_middleware, start_monitoring_task},
    refresh::{spawn_outcome_logger, spawn_refresh_worker, RefreshScheduler},
    service::AnalyticsService,
    shopify::ShopifyClient,
};

pub struct AppState {
    pub service: AnalyticsService,
    /// Present only for the Postgres backend.
    pub db: Option<Database>,
    pub config: AppConfig,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "shop_insights={},sqlx=warn,tower_http=info",
            logging.level
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.log_format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = if state.config.server.enable_cors {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/revenue-overview", get(revenue_overview))
        .route("/clv", get(customer_lifetime_value))
        .route("/dashboard", get(dashboard))
        .route("/cache/prefetch", post(prefetch_caches))
        .route("/cache/cleanup", post(cleanup_cache))
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/stats", get(get_cache_stats))
        .layer(middleware::from_fn(performance_middleware))
        .layer(TimeoutLayer::new(Duration::from_secs(
            state.config.server.timeout_seconds,
        )))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);

    info!(
        backend = ?config.cache.backend,
        shopify_api = %config.shopify.api_version,
        "Starting shop insights API"
    );

    let (store, profiles, db): (Arc<dyn CacheStore>, Arc<dyn ProfileStore>, Option<Database>) =
        match config.cache.backend {
            CacheBackend::Postgres => {
                let db = Database::new(&config).await?;
                db.ensure_schema().await?;
                let store: Arc<dyn CacheStore> = Arc::new(PostgresCacheStore::new(&db));
                let profiles: Arc<dyn ProfileStore> = Arc::new(PostgresProfileStore::new(&db));
                (store, profiles, Some(db))
            }
            CacheBackend::Memory => {
                warn!("In-memory backend: cached metrics and customer profiles are lost on restart");
                let store: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::new());
                let profiles: Arc<dyn ProfileStore> = Arc::new(InMemoryProfileStore::new());
                (store, profiles, None)
            }
        };

    let (scheduler, jobs) = RefreshScheduler::channel(config.cache.refresh_queue_capacity);
    let cache = AnalyticsCache::new(store, scheduler);
    let orders = Arc::new(ShopifyClient::new(&config.shopify)?);
    let service = AnalyticsService::new(cache.clone(), orders, profiles, config.analytics.clone());

    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    spawn_outcome_logger(outcome_rx);
    spawn_refresh_worker(jobs, Arc::new(service.clone()), outcome_tx);
    start_cache_cleanup_task(
        cache,
        Duration::from_secs(config.cache.cleanup_interval_seconds),
    );
    start_monitoring_task();

    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState {
        service,
        db,
        config,
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(address = %bind_address, "Listening");
    info!("   - GET  /revenue-overview?days=30&maxStaleness=600&ignoreErrors=true");
    info!("   - GET  /clv?customerId=X&maxStaleness=600");
    info!("   - GET  /dashboard?days=30");
    info!("   - POST /cache/prefetch, POST /cache/cleanup");
    info!("   - GET  /health, /metrics, /stats");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down gracefully");
        },
    }
}
