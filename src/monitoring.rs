// src/monitoring.rs - Request metrics and the middleware that records them
use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use tracing::{info, warn};

use crate::models::{CacheMetadata, DataSource};

const SLOW_REQUEST_MS: u128 = 1_000;
/// Shared bucket for requests that hit no route, so unknown paths cannot grow the map.
pub const UNMATCHED_ENDPOINT: &str = "unmatched";

/// How a handler satisfied a request, attached to the response extensions so
/// the middleware can count hits per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    StaleHit,
    Miss,
}

impl CacheOutcome {
    pub fn from_metadata(metadata: &CacheMetadata) -> Self {
        match (metadata.source, metadata.is_stale) {
            (DataSource::Computed, _) => CacheOutcome::Miss,
            (DataSource::Cache, false) => CacheOutcome::Hit,
            (DataSource::Cache, true) => CacheOutcome::StaleHit,
        }
    }

    /// Worst outcome of several lookups served by one response.
    pub fn combine(self, other: Self) -> Self {
        use CacheOutcome::*;
        match (self, other) {
            (Miss, _) | (_, Miss) => Miss,
            (StaleHit, _) | (_, StaleHit) => StaleHit,
            _ => Hit,
        }
    }
}

fn update_min(slot: &AtomicU64, value: u64) {
    let mut current = slot.load(Ordering::Relaxed);
    while value < current {
        match slot.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

fn update_max(slot: &AtomicU64, value: u64) {
    let mut current = slot.load(Ordering::Relaxed);
    while value > current {
        match slot.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

#[derive(Debug)]
pub struct EndpointStats {
    pub request_count: AtomicU64,
    pub total_response_time_us: AtomicU64,
    pub min_response_time_us: AtomicU64,
    pub max_response_time_us: AtomicU64,
    pub error_count: AtomicU64,
    pub cache_hits: AtomicU64,
    pub stale_hits: AtomicU64,
    pub cache_misses: AtomicU64,
}

impl EndpointStats {
    fn new() -> Self {
        Self {
            request_count: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
            min_response_time_us: AtomicU64::new(u64::MAX),
            max_response_time_us: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    fn record(&self, response_time_us: u64, is_success: bool, cache: Option<CacheOutcome>) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add(response_time_us, Ordering::Relaxed);
        update_min(&self.min_response_time_us, response_time_us);
        update_max(&self.max_response_time_us, response_time_us);

        if !is_success {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }

        match cache {
            Some(CacheOutcome::Hit) => self.cache_hits.fetch_add(1, Ordering::Relaxed),
            Some(CacheOutcome::StaleHit) => self.stale_hits.fetch_add(1, Ordering::Relaxed),
            Some(CacheOutcome::Miss) => self.cache_misses.fetch_add(1, Ordering::Relaxed),
            None => 0,
        };
    }

    fn summarize(&self) -> EndpointMetricsSummary {
        let request_count = self.request_count.load(Ordering::Relaxed);
        let total_time_us = self.total_response_time_us.load(Ordering::Relaxed);
        let min_time_us = self.min_response_time_us.load(Ordering::Relaxed);
        let error_count = self.error_count.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let stale_hits = self.stale_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = cache_hits + stale_hits + cache_misses;

        EndpointMetricsSummary {
            request_count,
            avg_response_time_ms: if request_count > 0 {
                (total_time_us as f64 / request_count as f64) / 1000.0
            } else {
                0.0
            },
            min_response_time_ms: if min_time_us == u64::MAX {
                0.0
            } else {
                min_time_us as f64 / 1000.0
            },
            max_response_time_ms: self.max_response_time_us.load(Ordering::Relaxed) as f64 / 1000.0,
            error_count,
            error_rate: if request_count > 0 {
                error_count as f64 / request_count as f64
            } else {
                0.0
            },
            cache_hit_ratio: if lookups > 0 {
                (cache_hits + stale_hits) as f64 / lookups as f64
            } else {
                0.0
            },
            cache_hits,
            stale_hits,
            cache_misses,
        }
    }
}

/// Process-wide request metrics
pub struct PerformanceMonitor {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_response_time_us: AtomicU64,
    endpoint_metrics: dashmap::DashMap<String, EndpointStats>,
    error_counts: dashmap::DashMap<u16, AtomicU64>,
    start_time: Instant,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
            endpoint_metrics: dashmap::DashMap::new(),
            error_counts: dashmap::DashMap::new(),
            start_time: Instant::now(),
        }
    }

    pub fn record_request(
        &self,
        endpoint: &str,
        response_time: Duration,
        status_code: u16,
        cache: Option<CacheOutcome>,
    ) {
        let is_success = (200..400).contains(&status_code);
        let response_time_us = response_time.as_micros() as u64;

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add(response_time_us, Ordering::Relaxed);
        if is_success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
            self.error_counts
                .entry(status_code)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::Relaxed);
        }

        self.endpoint_metrics
            .entry(endpoint.to_string())
            .or_insert_with(EndpointStats::new)
            .record(response_time_us, is_success, cache);
    }

    pub fn get_performance_summary(&self) -> PerformanceSummary {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let successful_requests = self.successful_requests.load(Ordering::Relaxed);
        let total_response_time_us = self.total_response_time_us.load(Ordering::Relaxed);
        let uptime = self.start_time.elapsed();

        PerformanceSummary {
            total_requests,
            successful_requests,
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            success_rate: if total_requests > 0 {
                successful_requests as f64 / total_requests as f64
            } else {
                0.0
            },
            requests_per_second: if uptime.as_secs() > 0 {
                total_requests as f64 / uptime.as_secs_f64()
            } else {
                0.0
            },
            avg_response_time_ms: if total_requests > 0 {
                (total_response_time_us as f64 / total_requests as f64) / 1000.0
            } else {
                0.0
            },
            uptime_seconds: uptime.as_secs_f64(),
        }
    }

    pub fn get_endpoint_metrics(&self) -> HashMap<String, EndpointMetricsSummary> {
        self.endpoint_metrics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().summarize()))
            .collect()
    }

    pub fn get_error_summary(&self) -> HashMap<String, u64> {
        self.error_counts
            .iter()
            .map(|entry| {
                (
                    format!("status_{}", entry.key()),
                    entry.value().load(Ordering::Relaxed),
                )
            })
            .collect()
    }

    pub fn generate_report(&self) -> PerformanceReport {
        PerformanceReport {
            summary: self.get_performance_summary(),
            endpoint_metrics: self.get_endpoint_metrics(),
            error_summary: self.get_error_summary(),
            generated_at: chrono::Utc::now(),
        }
    }
}

static PERFORMANCE_MONITOR: std::sync::OnceLock<PerformanceMonitor> = std::sync::OnceLock::new();

pub fn get_performance_monitor() -> &'static PerformanceMonitor {
    PERFORMANCE_MONITOR.get_or_init(PerformanceMonitor::new)
}

/// Route template (`/clv`, not the raw URI) the request matched.
fn endpoint_label(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| UNMATCHED_ENDPOINT.to_string(), |path| path.as_str().to_string())
}

pub async fn performance_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let endpoint = endpoint_label(&request);

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status_code = response.status().as_u16();
    let cache = response.extensions().get::<CacheOutcome>().copied();

    get_performance_monitor().record_request(&endpoint, duration, status_code, cache);

    if duration.as_millis() > SLOW_REQUEST_MS {
        warn!(
            endpoint = %endpoint,
            status = status_code,
            elapsed_ms = duration.as_millis() as u64,
            "Slow request"
        );
    }

    response
}

pub fn start_monitoring_task() {
    tokio::spawn(async {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        let monitor = get_performance_monitor();

        loop {
            interval.tick().await;

            let summary = monitor.get_performance_summary();
            if summary.total_requests == 0 {
                continue;
            }

            info!(
                requests_per_second = summary.requests_per_second,
                avg_ms = summary.avg_response_time_ms,
                success_rate = summary.success_rate,
                "Request metrics"
            );

            if summary.success_rate < 0.95 {
                warn!(
                    success_rate = summary.success_rate,
                    "Success rate below 95%"
                );
            }
        }
    });
}

#[derive(Debug, Serialize)]
pub struct PerformanceSummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub requests_per_second: f64,
    pub avg_response_time_ms: f64,
    pub uptime_seconds: f64,
}

#[derive(Debug, Serialize)]
pub struct EndpointMetricsSummary {
    pub request_count: u64,
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: f64,
    pub max_response_time_ms: f64,
    pub error_count: u64,
    pub error_rate: f64,
    pub cache_hit_ratio: f64,
    pub cache_hits: u64,
    pub stale_hits: u64,
    pub cache_misses: u64,
}

#[derive(Debug, Serialize)]
pub struct PerformanceReport {
    pub summary: PerformanceSummary,
    pub endpoint_metrics: HashMap<String, EndpointMetricsSummary>,
    pub error_summary: HashMap<String, u64>,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}
