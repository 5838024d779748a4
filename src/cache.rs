// src/cache.rs - Per-shop metric cache with stale-while-revalidate reads
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, error, info, warn};

use crate::models::{
    ApiError, AnalyticsResponse, CacheMetadata, DataSource, MetricData, MetricKey, MetricPayload,
    Tenant,
};
use crate::refresh::RefreshScheduler;

// -------------------------------
// Stored entry
// -------------------------------
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub shop: String,
    pub metric_key: String,
    pub payload: serde_json::Value,
    pub computed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

impl From<CacheStoreError> for ApiError {
    fn from(err: CacheStoreError) -> Self {
        ApiError::Cache(err.to_string())
    }
}

/// Durable storage for cache rows, unique on `(shop, metric_key)`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn find(
        &self,
        shop: &str,
        metric_key: &str,
    ) -> Result<Option<CacheEntry>, CacheStoreError>;

    /// Insert or replace the row for `(entry.shop, entry.metric_key)`.
    async fn upsert(&self, entry: CacheEntry) -> Result<(), CacheStoreError>;

    async fn delete_expired(&self, shop: &str, now: DateTime<Utc>) -> Result<u64, CacheStoreError>;

    async fn delete_all_expired(&self, now: DateTime<Utc>) -> Result<u64, CacheStoreError>;

    async fn count(&self) -> Result<u64, CacheStoreError>;

    /// Cheap round trip used by `/health`.
    async fn ping(&self) -> Result<(), CacheStoreError>;

    fn backend_name(&self) -> &'static str;
}

// -------------------------------
// In-memory store
// -------------------------------
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<(String, String), CacheEntry>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn find(
        &self,
        shop: &str,
        metric_key: &str,
    ) -> Result<Option<CacheEntry>, CacheStoreError> {
        Ok(self
            .entries
            .get(&(shop.to_string(), metric_key.to_string()))
            .map(|entry| entry.clone()))
    }

    async fn upsert(&self, entry: CacheEntry) -> Result<(), CacheStoreError> {
        self.entries
            .insert((entry.shop.clone(), entry.metric_key.clone()), entry);
        Ok(())
    }

    async fn delete_expired(&self, shop: &str, now: DateTime<Utc>) -> Result<u64, CacheStoreError> {
        let before = self.entries.len();
        self.entries
            .retain(|(entry_shop, _), entry| entry_shop != shop || entry.expires_at >= now);
        Ok((before - self.entries.len()) as u64)
    }

    async fn delete_all_expired(&self, now: DateTime<Utc>) -> Result<u64, CacheStoreError> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at >= now);
        Ok((before - self.entries.len()) as u64)
    }

    async fn count(&self) -> Result<u64, CacheStoreError> {
        Ok(self.entries.len() as u64)
    }

    async fn ping(&self) -> Result<(), CacheStoreError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

// -------------------------------
// Stats
// -------------------------------
#[derive(Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub stale_hits: AtomicU64,
    pub misses: AtomicU64,
    pub errors: AtomicU64,
    pub writes: AtomicU64,
    pub refreshes_scheduled: AtomicU64,
    pub expired_deleted: AtomicU64,
}

impl CacheStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatistics {
        let hits = self.hits.load(Ordering::Relaxed);
        let stale_hits = self.stale_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_reads = hits + stale_hits + misses;

        CacheStatistics {
            hits,
            stale_hits,
            misses,
            errors: self.errors.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            refreshes_scheduled: self.refreshes_scheduled.load(Ordering::Relaxed),
            expired_deleted: self.expired_deleted.load(Ordering::Relaxed),
            hit_ratio: if total_reads > 0 {
                (hits + stale_hits) as f64 / total_reads as f64
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub writes: u64,
    pub refreshes_scheduled: u64,
    pub expired_deleted: u64,
    pub hit_ratio: f64,
}

// -------------------------------
// Read options
// -------------------------------
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Accept an entry up to this many seconds old, expired or not. Older
    /// entries are still served but flagged stale and refreshed in the background.
    pub max_staleness: Option<u64>,
    /// Treat store failures as a miss instead of an error.
    pub ignore_errors: bool,
}

impl ReadOptions {
    pub fn new(max_staleness: Option<u64>, ignore_errors: bool) -> Self {
        Self {
            max_staleness,
            ignore_errors,
        }
    }
}

fn exceeds(age: ChronoDuration, max_staleness_secs: u64) -> bool {
    let limit_ms = i64::try_from(max_staleness_secs)
        .unwrap_or(i64::MAX)
        .saturating_mul(1_000);
    age.num_milliseconds() > limit_ms
}

// -------------------------------
// AnalyticsCache
// -------------------------------
#[derive(Clone)]
pub struct AnalyticsCache {
    store: Arc<dyn CacheStore>,
    refresher: RefreshScheduler,
    stats: Arc<CacheStats>,
}

impl AnalyticsCache {
    pub fn new(store: Arc<dyn CacheStore>, refresher: RefreshScheduler) -> Self {
        Self {
            store,
            refresher,
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn stats(&self) -> CacheStatistics {
        self.stats.snapshot()
    }

    /// Queue a recomputation without waiting for it.
    pub fn schedule_refresh(&self, tenant: &Tenant, key: &MetricKey) -> bool {
        let scheduled = self.refresher.schedule(tenant, key);
        if scheduled {
            CacheStats::bump(&self.stats.refreshes_scheduled);
        }
        scheduled
    }

    /// Look up a cached metric.
    ///
    /// Without `max_staleness` an entry past `expires_at` is a miss. With it,
    /// the entry is always returned and `is_stale` reports whether it is older
    /// than the tolerance; stale entries trigger a background refresh.
    pub async fn get<T: MetricData>(
        &self,
        tenant: &Tenant,
        key: &MetricKey,
        options: ReadOptions,
    ) -> Result<Option<AnalyticsResponse<T>>, ApiError> {
        let metric_key = key.cache_key();

        let entry = match self.store.find(&tenant.shop, &metric_key).await {
            Ok(entry) => entry,
            Err(err) => {
                CacheStats::bump(&self.stats.errors);
                error!(shop = %tenant.shop, metric = %metric_key, error = %err, "Cache read failed");
                if options.ignore_errors {
                    return Ok(None);
                }
                return Err(err.into());
            }
        };

        let Some(entry) = entry else {
            CacheStats::bump(&self.stats.misses);
            return Ok(None);
        };

        let now = Utc::now();
        let is_stale = match options.max_staleness {
            Some(max) => exceeds(now - entry.computed_at, max),
            None => {
                if now >= entry.expires_at {
                    CacheStats::bump(&self.stats.misses);
                    return Ok(None);
                }
                false
            }
        };

        let data = serde_json::from_value::<MetricPayload>(entry.payload)
            .ok()
            .and_then(T::from_payload);
        let Some(data) = data else {
            CacheStats::bump(&self.stats.misses);
            warn!(shop = %tenant.shop, metric = %metric_key, "Cached payload has unexpected shape, ignoring");
            return Ok(None);
        };

        if is_stale {
            CacheStats::bump(&self.stats.stale_hits);
            self.schedule_refresh(tenant, key);
        } else {
            CacheStats::bump(&self.stats.hits);
        }

        debug!(shop = %tenant.shop, metric = %metric_key, is_stale, "Cache hit");

        Ok(Some(AnalyticsResponse {
            data,
            metadata: CacheMetadata {
                computed_at: entry.computed_at,
                expires_at: entry.expires_at,
                is_stale,
                source: DataSource::Cache,
            },
        }))
    }

    /// Store a freshly computed metric for `ttl`.
    pub async fn set<T: MetricData + Clone>(
        &self,
        tenant: &Tenant,
        key: &MetricKey,
        data: &T,
        ttl: Duration,
    ) -> Result<CacheMetadata, ApiError> {
        let payload = serde_json::to_value(data.clone().into_payload())?;
        let computed_at = Utc::now();
        let ttl = ChronoDuration::from_std(ttl)
            .map_err(|e| ApiError::Internal(format!("invalid cache ttl: {}", e)))?;
        let expires_at = computed_at + ttl;

        let entry = CacheEntry {
            shop: tenant.shop.clone(),
            metric_key: key.cache_key(),
            payload,
            computed_at,
            expires_at,
        };

        if let Err(err) = self.store.upsert(entry).await {
            CacheStats::bump(&self.stats.errors);
            error!(shop = %tenant.shop, metric = %key, error = %err, "Cache write failed");
            return Err(err.into());
        }
        CacheStats::bump(&self.stats.writes);

        Ok(CacheMetadata {
            computed_at,
            expires_at,
            is_stale: false,
            source: DataSource::Computed,
        })
    }

    /// Delete the shop's expired entries. Failures are logged and count as zero.
    pub async fn cleanup_expired(&self, tenant: &Tenant) -> u64 {
        match self.store.delete_expired(&tenant.shop, Utc::now()).await {
            Ok(deleted) => {
                self.stats.expired_deleted.fetch_add(deleted, Ordering::Relaxed);
                info!(shop = %tenant.shop, deleted, "Expired cache entries removed");
                deleted
            }
            Err(err) => {
                CacheStats::bump(&self.stats.errors);
                error!(shop = %tenant.shop, error = %err, "Cache cleanup failed");
                0
            }
        }
    }

    pub async fn cleanup_all_expired(&self) -> u64 {
        match self.store.delete_all_expired(Utc::now()).await {
            Ok(deleted) => {
                self.stats.expired_deleted.fetch_add(deleted, Ordering::Relaxed);
                deleted
            }
            Err(err) => {
                CacheStats::bump(&self.stats.errors);
                error!(error = %err, "Global cache sweep failed");
                0
            }
        }
    }
}

// -------------------------------
// Background expiry sweep
// -------------------------------
pub fn start_cache_cleanup_task(cache: AnalyticsCache, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; skip it so startup is not a sweep.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let deleted = cache.cleanup_all_expired().await;
            let stats = cache.stats();
            info!(
                deleted,
                hit_ratio = stats.hit_ratio,
                refreshes = stats.refreshes_scheduled,
                "Cache sweep completed"
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClvReport, ClvSummary, DailyRevenue, PeriodComparison, RevenueOverview};
    use chrono::NaiveDate;
    use tokio::sync::mpsc;

    struct FailingStore;

    #[async_trait]
    impl CacheStore for FailingStore {
        async fn find(&self, _: &str, _: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
            Err(CacheStoreError::Unavailable("connection refused".to_string()))
        }
        async fn upsert(&self, _: CacheEntry) -> Result<(), CacheStoreError> {
            Err(CacheStoreError::Unavailable("connection refused".to_string()))
        }
        async fn delete_expired(&self, _: &str, _: DateTime<Utc>) -> Result<u64, CacheStoreError> {
            Err(CacheStoreError::Unavailable("connection refused".to_string()))
        }
        async fn delete_all_expired(&self, _: DateTime<Utc>) -> Result<u64, CacheStoreError> {
            Err(CacheStoreError::Unavailable("connection refused".to_string()))
        }
        async fn count(&self) -> Result<u64, CacheStoreError> {
            Ok(0)
        }
        async fn ping(&self) -> Result<(), CacheStoreError> {
            Err(CacheStoreError::Unavailable("connection refused".to_string()))
        }
        fn backend_name(&self) -> &'static str {
            "failing"
        }
    }

    fn tenant() -> Tenant {
        Tenant::new("acme.myshopify.com", "token")
    }

    fn overview() -> RevenueOverview {
        RevenueOverview {
            days: 30,
            total_revenue: 1250.5,
            average_order_value: 62.525,
            order_count: 20,
            conversion_rate: None,
            top_products: Vec::new(),
            revenue_by_day: vec![DailyRevenue {
                date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                revenue: 1250.5,
            }],
            previous_period_revenue_by_day: Vec::new(),
            period_comparison: PeriodComparison {
                revenue_trend: 12,
                order_trend: -3,
                aov_trend: 15,
            },
            truncated: false,
        }
    }

    fn cache_with(
        store: Arc<dyn CacheStore>,
    ) -> (AnalyticsCache, mpsc::Receiver<crate::refresh::RefreshJob>) {
        let (scheduler, rx) = RefreshScheduler::channel(16);
        (AnalyticsCache::new(store, scheduler), rx)
    }

    async fn seed(store: &InMemoryCacheStore, key: &MetricKey, age_secs: i64, ttl_secs: i64) {
        let computed_at = Utc::now() - ChronoDuration::seconds(age_secs);
        store
            .upsert(CacheEntry {
                shop: tenant().shop,
                metric_key: key.cache_key(),
                payload: serde_json::to_value(overview().into_payload()).unwrap(),
                computed_at,
                expires_at: computed_at + ChronoDuration::seconds(ttl_secs),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_set_then_get_returns_payload_unchanged() {
        let (cache, _rx) = cache_with(Arc::new(InMemoryCacheStore::new()));
        let key = MetricKey::RevenueOverview { days: 30 };

        let written = cache
            .set(&tenant(), &key, &overview(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(written.source, DataSource::Computed);

        let read = cache
            .get::<RevenueOverview>(&tenant(), &key, ReadOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.data, overview());
        assert!(!read.metadata.is_stale);
        assert_eq!(read.metadata.source, DataSource::Cache);
        assert_eq!(
            read.metadata.expires_at - read.metadata.computed_at,
            ChronoDuration::seconds(3600)
        );
    }

    #[tokio::test]
    async fn test_within_staleness_is_fresh_and_not_refreshed() {
        let store = Arc::new(InMemoryCacheStore::new());
        let key = MetricKey::RevenueOverview { days: 30 };
        seed(&store, &key, 500, 3600).await;
        let (cache, mut rx) = cache_with(store);

        let read = cache
            .get::<RevenueOverview>(&tenant(), &key, ReadOptions::new(Some(600), false))
            .await
            .unwrap()
            .unwrap();

        assert!(!read.metadata.is_stale);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_past_staleness_is_served_and_refreshed() {
        let store = Arc::new(InMemoryCacheStore::new());
        let key = MetricKey::RevenueOverview { days: 30 };
        seed(&store, &key, 700, 3600).await;
        let (cache, mut rx) = cache_with(store);

        let read = cache
            .get::<RevenueOverview>(&tenant(), &key, ReadOptions::new(Some(600), false))
            .await
            .unwrap()
            .unwrap();

        assert!(read.metadata.is_stale);
        assert_eq!(read.data, overview());

        let job = rx.try_recv().unwrap();
        assert_eq!(job.key, key);
        assert_eq!(job.tenant.shop, "acme.myshopify.com");
        assert_eq!(cache.stats().refreshes_scheduled, 1);
        assert_eq!(cache.stats().stale_hits, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_miss_without_staleness() {
        let store = Arc::new(InMemoryCacheStore::new());
        let key = MetricKey::RevenueOverview { days: 30 };
        seed(&store, &key, 4000, 3600).await;
        let (cache, _rx) = cache_with(store);

        let read = cache
            .get::<RevenueOverview>(&tenant(), &key, ReadOptions::default())
            .await
            .unwrap();
        assert!(read.is_none());

        // The same row is still usable by a caller that tolerates staleness.
        let tolerant = cache
            .get::<RevenueOverview>(&tenant(), &key, ReadOptions::new(Some(86_400), false))
            .await
            .unwrap();
        assert!(tolerant.is_some());
    }

    #[tokio::test]
    async fn test_payload_of_other_metric_is_a_miss() {
        let store = Arc::new(InMemoryCacheStore::new());
        let key = MetricKey::ClvAllCustomers;
        seed(&store, &key, 10, 3600).await;
        let (cache, _rx) = cache_with(store);

        let read = cache
            .get::<ClvReport>(&tenant(), &key, ReadOptions::default())
            .await
            .unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn test_store_failure_respects_ignore_errors() {
        let (cache, _rx) = cache_with(Arc::new(FailingStore));
        let key = MetricKey::ClvAllCustomers;

        let ignored = cache
            .get::<ClvReport>(&tenant(), &key, ReadOptions::new(None, true))
            .await;
        assert!(matches!(ignored, Ok(None)));

        let raised = cache
            .get::<ClvReport>(&tenant(), &key, ReadOptions::new(None, false))
            .await;
        assert!(matches!(raised, Err(ApiError::Cache(_))));

        let report = ClvReport {
            customers: Vec::new(),
            summary: ClvSummary {
                average_clv: 0.0,
                top_segments: Vec::new(),
            },
            truncated: false,
        };
        assert!(cache
            .set(&tenant(), &key, &report, Duration::from_secs(60))
            .await
            .is_err());
        assert_eq!(cache.cleanup_expired(&tenant()).await, 0);
        assert_eq!(cache.stats().errors, 4);
    }

    #[tokio::test]
    async fn test_cleanup_is_scoped_to_tenant() {
        let store = Arc::new(InMemoryCacheStore::new());
        let key = MetricKey::RevenueOverview { days: 7 };
        seed(&store, &key, 4000, 3600).await;
        seed(&store, &MetricKey::RevenueOverview { days: 30 }, 10, 3600).await;

        let other = CacheEntry {
            shop: "other.myshopify.com".to_string(),
            metric_key: key.cache_key(),
            payload: serde_json::Value::Null,
            computed_at: Utc::now() - ChronoDuration::hours(5),
            expires_at: Utc::now() - ChronoDuration::hours(1),
        };
        store.upsert(other).await.unwrap();

        let (cache, _rx) = cache_with(store.clone());
        assert_eq!(cache.cleanup_expired(&tenant()).await, 1);
        assert_eq!(store.count().await.unwrap(), 2);

        assert_eq!(cache.cleanup_all_expired().await, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[test]
    fn test_staleness_limit_handles_huge_values() {
        assert!(!exceeds(ChronoDuration::days(10_000), u64::MAX));
        assert!(exceeds(ChronoDuration::seconds(2), 1));
        assert!(!exceeds(ChronoDuration::seconds(1), 1));
    }
}
