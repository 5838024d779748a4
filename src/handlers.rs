// src/handlers.rs - HTTP handlers for the analytics endpoints
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    Extension,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::{
    cache::ReadOptions,
    models::*,
    monitoring::{get_performance_monitor, CacheOutcome, PerformanceReport},
    AppState,
};

pub const SHOP_HEADER: &str = "x-shop-domain";
pub const ACCESS_TOKEN_HEADER: &str = "x-shopify-access-token";

type ErrorReply = (StatusCode, Json<ErrorResponse>);
type CachedReply<T> = Result<(Extension<CacheOutcome>, Json<T>), ErrorReply>;

fn reject(err: ApiError) -> ErrorReply {
    let status = err.to_status_code();
    if status.is_server_error() {
        error!(code = err.code(), error = %err, "Request failed");
    } else {
        warn!(code = err.code(), error = %err, "Request rejected");
    }
    (status, Json(err.to_error_response()))
}

/// Shop and access token come from the embedding app; they are not verified here.
pub fn tenant_from_headers(headers: &HeaderMap) -> Result<Tenant, ApiError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let shop = header(SHOP_HEADER)
        .ok_or_else(|| ApiError::Validation("Missing X-Shop-Domain header".to_string()))?
        .to_ascii_lowercase();
    ValidationRules::validate_shop_domain(&shop).map_err(ApiError::Validation)?;

    let access_token = header(ACCESS_TOKEN_HEADER).ok_or_else(|| {
        ApiError::Validation("Missing X-Shopify-Access-Token header".to_string())
    })?;

    Ok(Tenant::new(shop, access_token))
}

fn read_options(
    state: &AppState,
    max_staleness: Option<u64>,
    ignore_errors: Option<bool>,
) -> ReadOptions {
    let default_staleness = match state.config.cache.default_max_staleness_seconds {
        0 => None,
        secs => Some(secs),
    };
    ReadOptions::new(
        max_staleness.or(default_staleness),
        ignore_errors.unwrap_or(false),
    )
}

/// GET /revenue-overview
pub async fn revenue_overview(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RevenueOverviewQuery>,
) -> CachedReply<AnalyticsResponse<RevenueOverview>> {
    let tenant = tenant_from_headers(&headers).map_err(reject)?;
    let days = query.days.unwrap_or(constants::DEFAULT_WINDOW_DAYS);
    let options = read_options(&state, query.max_staleness, query.ignore_errors);

    debug!(shop = %tenant.shop, days, ?options, "Revenue overview request");

    let response = state
        .service
        .get_revenue_overview(&tenant, days, options)
        .await
        .map_err(reject)?;

    Ok((
        Extension(CacheOutcome::from_metadata(&response.metadata)),
        Json(response),
    ))
}

/// GET /clv
pub async fn customer_lifetime_value(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ClvQuery>,
) -> CachedReply<AnalyticsResponse<ClvReport>> {
    let tenant = tenant_from_headers(&headers).map_err(reject)?;
    let customer_id = query
        .customer_id
        .as_deref()
        .map(ValidationRules::parse_customer_id)
        .transpose()
        .map_err(|e| reject(ApiError::Validation(e)))?;
    let options = read_options(&state, query.max_staleness, query.ignore_errors);

    debug!(shop = %tenant.shop, ?customer_id, ?options, "CLV request");

    let response = state
        .service
        .calculate_clv(&tenant, customer_id, options)
        .await
        .map_err(reject)?;

    Ok((
        Extension(CacheOutcome::from_metadata(&response.metadata)),
        Json(response),
    ))
}

/// GET /dashboard - revenue and CLV resolved concurrently
pub async fn dashboard(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<DashboardQuery>,
) -> CachedReply<DashboardResponse> {
    let tenant = tenant_from_headers(&headers).map_err(reject)?;
    let days = query.days.unwrap_or(constants::DEFAULT_WINDOW_DAYS);
    let options = read_options(&state, query.max_staleness, None);

    let response = state
        .service
        .dashboard(&tenant, days, options)
        .await
        .map_err(reject)?;

    let outcome = CacheOutcome::from_metadata(&response.revenue.metadata)
        .combine(CacheOutcome::from_metadata(&response.clv.metadata));
    Ok((Extension(outcome), Json(response)))
}

/// POST /cache/prefetch
pub async fn prefetch_caches(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<PrefetchResponse>), ErrorReply> {
    let tenant = tenant_from_headers(&headers).map_err(reject)?;
    let scheduled = state.service.prefetch_common(&tenant);

    Ok((
        StatusCode::ACCEPTED,
        Json(PrefetchResponse {
            shop: tenant.shop,
            scheduled,
        }),
    ))
}

/// POST /cache/cleanup
pub async fn cleanup_cache(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<CleanupResponse> {
    let tenant = tenant_from_headers(&headers).map_err(reject)?;
    let deleted = state.service.cleanup_expired(&tenant).await;

    Ok(Json(CleanupResponse {
        shop: tenant.shop,
        deleted,
    }))
}

/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    let store = state.service.cache().store();
    let start = Instant::now();

    match store.ping().await {
        Ok(()) => Ok(Json(HealthResponse {
            status: "healthy".to_string(),
            cache_backend: store.backend_name().to_string(),
            store_status: "connected".to_string(),
            store_response_ms: start.elapsed().as_secs_f64() * 1000.0,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })),
        Err(e) => {
            error!(backend = store.backend_name(), error = %e, "Health check failed");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse::new(
                    "Cache store unavailable",
                    "STORE_UNAVAILABLE",
                )),
            ))
        }
    }
}

/// GET /metrics
pub async fn get_metrics() -> Json<PerformanceReport> {
    Json(get_performance_monitor().generate_report())
}

/// GET /stats
pub async fn get_cache_stats(State(state): State<Arc<AppState>>) -> ApiResult<StatsResponse> {
    let cache = state.service.cache();
    let entries = cache
        .store()
        .count()
        .await
        .map_err(|e| reject(e.into()))?;

    let database = match &state.db {
        Some(db) => match db.health_check().await {
            Ok(health) => Some(DatabasePoolStats {
                pool_size: health.pool_size,
                idle_connections: health.idle_connections,
                active_connections: health.active_connections,
                response_time_ms: health.response_time_ms,
            }),
            Err(e) => {
                warn!(error = %e, "Database stats unavailable");
                None
            }
        },
        None => None,
    };

    Ok(Json(StatsResponse {
        backend: cache.store().backend_name().to_string(),
        entries,
        cache: cache.stats(),
        database,
    }))
}
