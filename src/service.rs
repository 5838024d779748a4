// src/service.rs - Cached revenue and CLV analytics per shop
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::cache::{AnalyticsCache, ReadOptions};
use crate::calculations::{ClvCalculator, RevenueCalculator};
use crate::config::AnalyticsConfig;
use crate::database::ProfileStore;
use crate::models::{
    constants, AnalyticsResponse, ApiError, CacheMetadata, ClvReport, CustomerClv,
    CustomerProfile, DashboardResponse, DataSource, MetricData, MetricKey, Order,
    RevenueOverview, Tenant, ValidationRules,
};
use crate::refresh::MetricRecomputer;
use crate::shopify::{OrderBatch, OrderSource};

#[derive(Clone)]
pub struct AnalyticsService {
    cache: AnalyticsCache,
    orders: Arc<dyn OrderSource>,
    profiles: Arc<dyn ProfileStore>,
    config: AnalyticsConfig,
}

impl AnalyticsService {
    pub fn new(
        cache: AnalyticsCache,
        orders: Arc<dyn OrderSource>,
        profiles: Arc<dyn ProfileStore>,
        config: AnalyticsConfig,
    ) -> Self {
        Self {
            cache,
            orders,
            profiles,
            config,
        }
    }

    pub fn cache(&self) -> &AnalyticsCache {
        &self.cache
    }

    // ---------------------------
    // Revenue
    // ---------------------------
    pub async fn get_revenue_overview(
        &self,
        tenant: &Tenant,
        days: u32,
        options: ReadOptions,
    ) -> Result<AnalyticsResponse<RevenueOverview>, ApiError> {
        ValidationRules::validate_days(days).map_err(ApiError::Validation)?;

        let key = MetricKey::RevenueOverview { days };
        if let Some(cached) = self.cache.get(tenant, &key, options).await? {
            return Ok(cached);
        }
        self.compute_revenue_overview(tenant, days).await
    }

    /// Fetch two windows of orders, aggregate and cache. Never reads the cache.
    pub async fn compute_revenue_overview(
        &self,
        tenant: &Tenant,
        days: u32,
    ) -> Result<AnalyticsResponse<RevenueOverview>, ApiError> {
        let key = MetricKey::RevenueOverview { days };
        let now = Utc::now();
        let since = now - ChronoDuration::days(2 * i64::from(days));

        let batch = match self.orders.fetch_orders(tenant, since).await {
            Ok(batch) => batch,
            Err(err) => {
                error!(
                    shop = %tenant.shop,
                    metric = %key,
                    days,
                    error = %err,
                    "Order fetch failed, aggregating without orders"
                );
                OrderBatch::default()
            }
        };

        let overview =
            RevenueCalculator::revenue_overview(&batch.orders, days, now, batch.truncated);
        debug!(
            shop = %tenant.shop,
            days,
            fetched = batch.orders.len(),
            orders = overview.order_count,
            "Revenue overview computed"
        );

        let metadata = self.store(tenant, &key, &overview).await;
        Ok(AnalyticsResponse {
            data: overview,
            metadata,
        })
    }

    // ---------------------------
    // CLV
    // ---------------------------
    pub async fn calculate_clv(
        &self,
        tenant: &Tenant,
        customer_id: Option<i64>,
        options: ReadOptions,
    ) -> Result<AnalyticsResponse<ClvReport>, ApiError> {
        let key = clv_key(customer_id);
        if let Some(cached) = self.cache.get(tenant, &key, options).await? {
            return Ok(cached);
        }
        self.compute_clv(tenant, customer_id).await
    }

    /// Score customers, cache the report and persist one profile per customer.
    pub async fn compute_clv(
        &self,
        tenant: &Tenant,
        customer_id: Option<i64>,
    ) -> Result<AnalyticsResponse<ClvReport>, ApiError> {
        let key = clv_key(customer_id);
        let now = Utc::now();

        let fetched = match customer_id {
            Some(id) => self.orders.fetch_customer_orders(tenant, id).await,
            None => {
                let since = now - ChronoDuration::days(self.config.clv_lookback_days);
                self.orders.fetch_orders(tenant, since).await
            }
        };
        let batch = fetched.unwrap_or_else(|err| {
            error!(
                shop = %tenant.shop,
                metric = %key,
                error = %err,
                "Order fetch failed, scoring without orders"
            );
            OrderBatch::default()
        });

        let scored = self.score(batch.orders, now).await?;
        let report = ClvCalculator::clv_report(&scored, customer_id, batch.truncated);
        let metadata = self.store(tenant, &key, &report).await;

        let profiles: Vec<CustomerProfile> = scored
            .iter()
            .map(|clv| CustomerProfile::from_clv(&tenant.shop, clv))
            .collect();
        match self.profiles.upsert_profiles(&profiles).await {
            Ok(written) => debug!(shop = %tenant.shop, written, "Customer profiles updated"),
            Err(err) => error!(
                shop = %tenant.shop,
                customers = profiles.len(),
                error = %err,
                "Customer profile update failed"
            ),
        }

        Ok(AnalyticsResponse {
            data: report,
            metadata,
        })
    }

    async fn score(
        &self,
        orders: Vec<Order>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CustomerClv>, ApiError> {
        let threshold = self.config.parallel_threshold;
        if !ClvCalculator::scores_in_parallel(&orders, threshold) {
            return Ok(ClvCalculator::score_customers(&orders, now, threshold));
        }

        // Large shops go through rayon; keep that off the async workers.
        tokio::task::spawn_blocking(move || ClvCalculator::score_customers(&orders, now, threshold))
            .await
            .map_err(|e| ApiError::Internal(format!("CLV scoring task failed: {}", e)))
    }

    // ---------------------------
    // Dashboard / maintenance
    // ---------------------------
    pub async fn dashboard(
        &self,
        tenant: &Tenant,
        days: u32,
        options: ReadOptions,
    ) -> Result<DashboardResponse, ApiError> {
        let (revenue, clv) = future::try_join(
            self.get_revenue_overview(tenant, days, options),
            self.calculate_clv(tenant, None, options),
        )
        .await?;
        Ok(DashboardResponse { revenue, clv })
    }

    /// Queue the two metrics every dashboard opens with.
    pub fn prefetch_common(&self, tenant: &Tenant) -> usize {
        let keys = [
            MetricKey::RevenueOverview {
                days: constants::DEFAULT_WINDOW_DAYS,
            },
            MetricKey::ClvAllCustomers,
        ];
        let scheduled = keys
            .iter()
            .filter(|key| self.cache.schedule_refresh(tenant, key))
            .count();
        info!(shop = %tenant.shop, scheduled, "Prefetch requested");
        scheduled
    }

    pub async fn cleanup_expired(&self, tenant: &Tenant) -> u64 {
        self.cache.cleanup_expired(tenant).await
    }

    /// Write-through that never fails the request: a failed write is logged
    /// by the cache and the caller still gets the computed value.
    async fn store<T: MetricData + Clone>(
        &self,
        tenant: &Tenant,
        key: &MetricKey,
        data: &T,
    ) -> CacheMetadata {
        let ttl = Duration::from_secs(key.ttl_seconds());
        match self.cache.set(tenant, key, data, ttl).await {
            Ok(metadata) => metadata,
            Err(_) => {
                let computed_at = Utc::now();
                CacheMetadata {
                    computed_at,
                    expires_at: computed_at + ChronoDuration::seconds(key.ttl_seconds() as i64),
                    is_stale: false,
                    source: DataSource::Computed,
                }
            }
        }
    }
}

fn clv_key(customer_id: Option<i64>) -> MetricKey {
    match customer_id {
        Some(customer_id) => MetricKey::ClvCustomer { customer_id },
        None => MetricKey::ClvAllCustomers,
    }
}

#[async_trait]
impl MetricRecomputer for AnalyticsService {
    async fn recompute(&self, tenant: &Tenant, key: &MetricKey) -> Result<(), ApiError> {
        match key {
            MetricKey::RevenueOverview { days } => {
                self.compute_revenue_overview(tenant, *days).await?;
            }
            MetricKey::ClvAllCustomers => {
                self.compute_clv(tenant, None).await?;
            }
            MetricKey::ClvCustomer { customer_id } => {
                self.compute_clv(tenant, Some(*customer_id)).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, InMemoryCacheStore};
    use crate::database::InMemoryProfileStore;
    use crate::models::{Customer, Segment};
    use crate::refresh::{RefreshJob, RefreshScheduler};
    use crate::shopify::OrderSourceError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct StaticOrderSource {
        orders: Vec<Order>,
        fail: bool,
        calls: AtomicUsize,
        customer_calls: AtomicUsize,
    }

    #[async_trait]
    impl OrderSource for StaticOrderSource {
        async fn fetch_orders(
            &self,
            _tenant: &Tenant,
            since: DateTime<Utc>,
        ) -> Result<OrderBatch, OrderSourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(OrderSourceError::Status {
                    status: 401,
                    body: "Invalid API key".to_string(),
                });
            }
            Ok(OrderBatch {
                orders: self
                    .orders
                    .iter()
                    .filter(|o| o.created_at_utc().map_or(true, |ts| ts >= since))
                    .cloned()
                    .collect(),
                truncated: false,
            })
        }

        async fn fetch_customer_orders(
            &self,
            _tenant: &Tenant,
            customer_id: i64,
        ) -> Result<OrderBatch, OrderSourceError> {
            self.customer_calls.fetch_add(1, Ordering::SeqCst);
            Ok(OrderBatch {
                orders: self
                    .orders
                    .iter()
                    .filter(|o| o.customer.as_ref().map(|c| c.id) == Some(customer_id))
                    .cloned()
                    .collect(),
                truncated: false,
            })
        }
    }

    struct FailingProfileStore;

    #[async_trait]
    impl ProfileStore for FailingProfileStore {
        async fn upsert_profiles(&self, _: &[CustomerProfile]) -> Result<u64, ApiError> {
            Err(ApiError::Internal("deadlock detected".to_string()))
        }
    }

    fn tenant() -> Tenant {
        Tenant::new("acme.myshopify.com", "shpat_test")
    }

    fn order(id: i64, price: f64, days_ago: i64, customer: Option<i64>) -> Order {
        Order {
            id,
            created_at: Some((Utc::now() - ChronoDuration::days(days_ago)).fixed_offset()),
            total_price: price,
            customer: customer.map(|id| Customer {
                id,
                first_name: Some("Grace".to_string()),
                last_name: Some("Hopper".to_string()),
                email: None,
            }),
            line_items: Vec::new(),
        }
    }

    struct Harness {
        service: AnalyticsService,
        source: Arc<StaticOrderSource>,
        store: Arc<InMemoryCacheStore>,
        profiles: Arc<InMemoryProfileStore>,
        jobs: mpsc::Receiver<RefreshJob>,
    }

    fn harness(source: StaticOrderSource) -> Harness {
        let source = Arc::new(source);
        let store = Arc::new(InMemoryCacheStore::new());
        let profiles = Arc::new(InMemoryProfileStore::new());
        let (scheduler, jobs) = RefreshScheduler::channel(8);
        let cache = AnalyticsCache::new(store.clone(), scheduler);
        let service = AnalyticsService::new(
            cache,
            source.clone(),
            profiles.clone(),
            AnalyticsConfig {
                clv_lookback_days: 365,
                parallel_threshold: 1_000,
            },
        );
        Harness {
            service,
            source,
            store,
            profiles,
            jobs,
        }
    }

    #[tokio::test]
    async fn test_revenue_overview_is_cached_after_first_call() {
        let h = harness(StaticOrderSource {
            orders: vec![order(1, 120.0, 2, None), order(2, 80.0, 45, None)],
            ..Default::default()
        });

        let first = h
            .service
            .get_revenue_overview(&tenant(), 30, ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(first.metadata.source, DataSource::Computed);
        assert_eq!(first.data.total_revenue, 120.0);
        assert_eq!(first.data.period_comparison.revenue_trend, 50);

        let second = h
            .service
            .get_revenue_overview(&tenant(), 30, ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(second.metadata.source, DataSource::Cache);
        assert_eq!(second.data, first.data);
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 1);
        assert!(h
            .store
            .find("acme.myshopify.com", "revenue_overview_30")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_upstream_failure_yields_empty_overview() {
        let h = harness(StaticOrderSource {
            fail: true,
            ..Default::default()
        });

        let result = h
            .service
            .get_revenue_overview(&tenant(), 7, ReadOptions::default())
            .await
            .unwrap();

        assert_eq!(result.data.order_count, 0);
        assert_eq!(result.data.total_revenue, 0.0);
        assert_eq!(result.data.revenue_by_day.len(), 30);
        assert_eq!(
            result.data.revenue_by_day.last().unwrap().date,
            Utc::now().date_naive()
        );
    }

    #[tokio::test]
    async fn test_invalid_window_is_rejected() {
        let h = harness(StaticOrderSource::default());
        let result = h
            .service
            .get_revenue_overview(&tenant(), 0, ReadOptions::default())
            .await;
        assert!(matches!(result, Err(ApiError::Validation(_))));
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_clv_persists_profiles() {
        let h = harness(StaticOrderSource {
            orders: vec![
                order(1, 100.0, 100, Some(7)),
                order(2, 200.0, 50, Some(7)),
                order(3, 300.0, 5, Some(7)),
                order(4, 40.0, 3, Some(8)),
                order(5, 15.0, 1, None),
            ],
            ..Default::default()
        });

        let result = h
            .service
            .calculate_clv(&tenant(), None, ReadOptions::default())
            .await
            .unwrap();

        assert_eq!(result.data.customers.len(), 2);
        assert_eq!(result.data.customers[0].customer_id, 7);
        assert_eq!(result.data.customers[0].segment, Segment::Promising);
        assert_eq!(
            result.data.customers[0].customer_name.as_deref(),
            Some("Grace Hopper")
        );

        assert_eq!(h.profiles.len(), 2);
        let profile = h.profiles.get("acme.myshopify.com", 7).unwrap();
        assert_eq!(profile.total_orders, 3);
        assert_eq!(profile.total_spent, 600.0);
        assert!(profile.last_order_date.is_some());
        assert_eq!(profile.segment, Segment::Promising);
    }

    #[tokio::test]
    async fn test_single_customer_clv_uses_customer_endpoint() {
        let h = harness(StaticOrderSource {
            orders: vec![order(1, 50.0, 10, Some(3)), order(2, 70.0, 4, Some(4))],
            ..Default::default()
        });

        let result = h
            .service
            .calculate_clv(&tenant(), Some(4), ReadOptions::default())
            .await
            .unwrap();

        assert_eq!(result.data.customers.len(), 1);
        assert_eq!(result.data.customers[0].customer_id, 4);
        assert_eq!(h.source.customer_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 0);
        assert!(h
            .store
            .find("acme.myshopify.com", "clv_customer_4")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_profile_failure_still_returns_report() {
        let source = Arc::new(StaticOrderSource {
            orders: vec![order(1, 50.0, 10, Some(3))],
            ..Default::default()
        });
        let (scheduler, _jobs) = RefreshScheduler::channel(8);
        let service = AnalyticsService::new(
            AnalyticsCache::new(Arc::new(InMemoryCacheStore::new()), scheduler),
            source,
            Arc::new(FailingProfileStore),
            AnalyticsConfig {
                clv_lookback_days: 365,
                parallel_threshold: 1_000,
            },
        );

        let result = service
            .calculate_clv(&tenant(), None, ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(result.data.customers.len(), 1);
    }

    #[tokio::test]
    async fn test_recompute_overwrites_cache_entry() {
        let h = harness(StaticOrderSource {
            orders: vec![order(1, 10.0, 1, Some(1))],
            ..Default::default()
        });

        h.service
            .recompute(&tenant(), &MetricKey::ClvAllCustomers)
            .await
            .unwrap();
        let first = h
            .store
            .find("acme.myshopify.com", "clv_all_customers")
            .await
            .unwrap()
            .unwrap();

        h.service
            .recompute(&tenant(), &MetricKey::ClvAllCustomers)
            .await
            .unwrap();
        let second = h
            .store
            .find("acme.myshopify.com", "clv_all_customers")
            .await
            .unwrap()
            .unwrap();

        assert!(second.computed_at >= first.computed_at);
        assert_eq!(h.store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_prefetch_queues_common_metrics() {
        let mut h = harness(StaticOrderSource::default());

        assert_eq!(h.service.prefetch_common(&tenant()), 2);
        let first = h.jobs.try_recv().unwrap();
        let second = h.jobs.try_recv().unwrap();
        assert_eq!(first.key, MetricKey::RevenueOverview { days: 30 });
        assert_eq!(second.key, MetricKey::ClvAllCustomers);
    }

    #[tokio::test]
    async fn test_dashboard_fans_out() {
        let h = harness(StaticOrderSource {
            orders: vec![order(1, 25.0, 3, Some(9))],
            ..Default::default()
        });

        let dashboard = h
            .service
            .dashboard(&tenant(), 30, ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(dashboard.revenue.data.order_count, 1);
        assert_eq!(dashboard.clv.data.customers.len(), 1);
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 2);
    }
}
