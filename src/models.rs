// src/models.rs - Domain, cache and API models for the analytics endpoints
use axum::http::StatusCode;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cache::CacheStatistics;

// === TENANT ===

/// One shop plus the Admin API token used to read its orders.
#[derive(Clone, PartialEq, Eq)]
pub struct Tenant {
    pub shop: String,
    pub access_token: String,
}

impl Tenant {
    pub fn new(shop: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            shop: shop.into(),
            access_token: access_token.into(),
        }
    }
}

impl fmt::Debug for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tenant")
            .field("shop", &self.shop)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

// === SHOPIFY ORDER MODELS ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl Customer {
    pub fn display_name(&self) -> Option<String> {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// Order as delivered by the Admin API, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawOrder {
    pub id: Option<i64>,
    pub created_at: Option<String>,
    pub total_price: Option<serde_json::Value>,
    pub customer: Option<Customer>,
    #[serde(default)]
    pub line_items: Vec<RawLineItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLineItem {
    pub product_id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub quantity: Option<i64>,
    pub price: Option<serde_json::Value>,
}

/// A paid order that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: i64,
    /// Kept in the shop's own offset so calendar days match the merchant's view.
    pub created_at: Option<DateTime<FixedOffset>>,
    pub total_price: f64,
    pub customer: Option<Customer>,
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineItem {
    pub product_id: Option<i64>,
    pub title: String,
    pub quantity: i64,
    /// `None` when the upstream price did not parse.
    pub price: Option<f64>,
}

/// Parse a decimal that Shopify sends either as a string or a bare number.
pub fn parse_decimal(value: &serde_json::Value) -> Option<f64> {
    let parsed = match value {
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

impl Order {
    /// Validate a raw order. Orders without an id or with a total price that
    /// is not a non-negative finite number are rejected.
    pub fn from_raw(raw: RawOrder) -> Option<Self> {
        let id = raw.id?;
        let total_price = raw.total_price.as_ref().and_then(parse_decimal)?;
        if total_price < 0.0 {
            return None;
        }

        let created_at = raw
            .created_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok());

        let line_items = raw
            .line_items
            .into_iter()
            .map(|item| LineItem {
                product_id: item.product_id,
                title: item.title.unwrap_or_default(),
                quantity: item.quantity.unwrap_or(0),
                price: item.price.as_ref().and_then(parse_decimal),
            })
            .collect();

        Some(Self {
            id,
            created_at,
            total_price,
            customer: raw.customer,
            line_items,
        })
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        self.created_at.map(|ts| ts.with_timezone(&Utc))
    }
}

// === REVENUE MODELS ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyRevenue {
    pub date: NaiveDate,
    pub revenue: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopProduct {
    pub id: i64,
    pub title: String,
    pub units: i64,
    pub revenue: f64,
}

/// Percentage change against the previous window, rounded to whole percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodComparison {
    pub revenue_trend: i64,
    pub order_trend: i64,
    pub aov_trend: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenueOverview {
    pub days: u32,
    pub total_revenue: f64,
    pub average_order_value: f64,
    pub order_count: usize,
    /// Always `None`: no storefront session data is wired in, so there is
    /// nothing to divide orders by.
    pub conversion_rate: Option<f64>,
    pub top_products: Vec<TopProduct>,
    pub revenue_by_day: Vec<DailyRevenue>,
    pub previous_period_revenue_by_day: Vec<DailyRevenue>,
    pub period_comparison: PeriodComparison,
    /// Set when the order fetch stopped at the page cap.
    pub truncated: bool,
}

// === CLV MODELS ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Segment {
    #[serde(rename = "VIP")]
    Vip,
    #[serde(rename = "Loyal")]
    Loyal,
    #[serde(rename = "Promising")]
    Promising,
    #[serde(rename = "New Customer")]
    NewCustomer,
    #[serde(rename = "Needs Attention")]
    NeedsAttention,
    #[serde(rename = "At Risk")]
    AtRisk,
}

impl Segment {
    pub const ALL: [Segment; 6] = [
        Segment::Vip,
        Segment::Loyal,
        Segment::Promising,
        Segment::NewCustomer,
        Segment::NeedsAttention,
        Segment::AtRisk,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Segment::Vip => "VIP",
            Segment::Loyal => "Loyal",
            Segment::Promising => "Promising",
            Segment::NewCustomer => "New Customer",
            Segment::NeedsAttention => "Needs Attention",
            Segment::AtRisk => "At Risk",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Recency / frequency / monetary inputs for one customer.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerMetrics {
    pub total_spent: f64,
    pub order_count: usize,
    pub avg_order_value: f64,
    pub days_since_first_order: i64,
    pub days_since_last_order: i64,
    pub first_order_date: Option<DateTime<FixedOffset>>,
    pub last_order_date: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerClv {
    pub customer_id: i64,
    pub customer_name: Option<String>,
    pub email: Option<String>,
    pub total_spent: f64,
    pub order_count: usize,
    pub avg_order_value: f64,
    pub days_since_first_order: i64,
    pub days_since_last_order: i64,
    pub last_order_date: Option<DateTime<Utc>>,
    #[serde(rename = "predictedCLV")]
    pub predicted_clv: i64,
    pub segment: Segment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentCount {
    pub name: Segment,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClvSummary {
    #[serde(rename = "averageCLV")]
    pub average_clv: f64,
    pub top_segments: Vec<SegmentCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClvReport {
    pub customers: Vec<CustomerClv>,
    pub summary: ClvSummary,
    pub truncated: bool,
}

/// Row persisted per shop and customer after every CLV computation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerProfile {
    pub shop: String,
    pub customer_id: i64,
    pub clv_score: i64,
    pub total_orders: i64,
    pub total_spent: f64,
    pub last_order_date: Option<DateTime<Utc>>,
    pub segment: Segment,
}

impl CustomerProfile {
    pub fn from_clv(shop: &str, clv: &CustomerClv) -> Self {
        Self {
            shop: shop.to_string(),
            customer_id: clv.customer_id,
            clv_score: clv.predicted_clv,
            total_orders: clv.order_count as i64,
            total_spent: clv.total_spent,
            last_order_date: clv.last_order_date,
            segment: clv.segment,
        }
    }
}

// === CACHE KEY MODELS ===

/// Every cacheable metric. The string form is the `metric_key` column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetricKey {
    RevenueOverview { days: u32 },
    ClvAllCustomers,
    ClvCustomer { customer_id: i64 },
}

impl MetricKey {
    pub fn cache_key(&self) -> String {
        match self {
            MetricKey::RevenueOverview { days } => format!("revenue_overview_{}", days),
            MetricKey::ClvAllCustomers => "clv_all_customers".to_string(),
            MetricKey::ClvCustomer { customer_id } => format!("clv_customer_{}", customer_id),
        }
    }

    pub fn class(&self) -> MetricClass {
        MetricClass::from_cache_key(&self.cache_key())
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.class().ttl_seconds()
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricClass {
    RevenueDashboard,
    CustomerSegments,
    Clv,
    Forecast,
    Historical,
    Default,
}

impl MetricClass {
    pub fn ttl_seconds(self) -> u64 {
        match self {
            MetricClass::RevenueDashboard => constants::REVENUE_DASHBOARD_TTL_SECONDS,
            MetricClass::CustomerSegments => constants::CUSTOMER_SEGMENTS_TTL_SECONDS,
            MetricClass::Clv => constants::CLV_TTL_SECONDS,
            MetricClass::Forecast => constants::FORECAST_TTL_SECONDS,
            MetricClass::Historical => constants::HISTORICAL_TTL_SECONDS,
            MetricClass::Default => constants::DEFAULT_TTL_SECONDS,
        }
    }

    /// Classify a stored key by name, including ones this build never writes.
    pub fn from_cache_key(key: &str) -> Self {
        if key.contains("segment") {
            MetricClass::CustomerSegments
        } else if key.contains("clv") {
            MetricClass::Clv
        } else if key.contains("revenue") {
            MetricClass::RevenueDashboard
        } else if key.contains("forecast") {
            MetricClass::Forecast
        } else if key.contains("historical") {
            MetricClass::Historical
        } else {
            MetricClass::Default
        }
    }
}

/// Cached payloads, tagged by metric so each shape has one schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "metric", content = "data", rename_all = "snake_case")]
pub enum MetricPayload {
    RevenueOverview(RevenueOverview),
    Clv(ClvReport),
}

pub trait MetricData: Sized {
    fn into_payload(self) -> MetricPayload;
    fn from_payload(payload: MetricPayload) -> Option<Self>;
}

impl MetricData for RevenueOverview {
    fn into_payload(self) -> MetricPayload {
        MetricPayload::RevenueOverview(self)
    }

    fn from_payload(payload: MetricPayload) -> Option<Self> {
        match payload {
            MetricPayload::RevenueOverview(overview) => Some(overview),
            _ => None,
        }
    }
}

impl MetricData for ClvReport {
    fn into_payload(self) -> MetricPayload {
        MetricPayload::Clv(self)
    }

    fn from_payload(payload: MetricPayload) -> Option<Self> {
        match payload {
            MetricPayload::Clv(report) => Some(report),
            _ => None,
        }
    }
}

// === REQUEST MODELS ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenueOverviewQuery {
    pub days: Option<u32>,
    pub max_staleness: Option<u64>,
    pub ignore_errors: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClvQuery {
    pub customer_id: Option<String>,
    pub max_staleness: Option<u64>,
    pub ignore_errors: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardQuery {
    pub days: Option<u32>,
    pub max_staleness: Option<u64>,
}

// === RESPONSE MODELS ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Cache,
    Computed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    pub computed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_stale: bool,
    pub source: DataSource,
}

/// Metric payload plus where it came from and how old it is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsResponse<T> {
    pub data: T,
    pub metadata: CacheMetadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardResponse {
    pub revenue: AnalyticsResponse<RevenueOverview>,
    pub clv: AnalyticsResponse<ClvReport>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub shop: String,
    pub deleted: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchResponse {
    pub shop: String,
    pub scheduled: usize,
}

#[derive(Debug, Serialize)]
pub struct DatabasePoolStats {
    pub pool_size: u32,
    pub idle_connections: u32,
    pub active_connections: u32,
    pub response_time_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub backend: String,
    pub entries: u64,
    pub cache: CacheStatistics,
    /// Absent for the in-memory backend.
    pub database: Option<DatabasePoolStats>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub cache_backend: String,
    pub store_status: String,
    pub store_response_ms: f64,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: code.to_string(),
        }
    }
}

// === VALIDATION ===

pub struct ValidationRules;

impl ValidationRules {
    pub fn validate_shop_domain(shop: &str) -> Result<(), String> {
        if shop.is_empty() {
            return Err("Shop domain cannot be empty".to_string());
        }
        if shop.len() > constants::MAX_SHOP_DOMAIN_LENGTH {
            return Err("Shop domain too long".to_string());
        }
        let Some(handle) = shop.strip_suffix(".myshopify.com") else {
            return Err("Shop domain must end with .myshopify.com".to_string());
        };
        if handle.is_empty()
            || handle.starts_with('-')
            || !handle
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(
                "Shop handle can only contain alphanumeric characters and hyphens".to_string(),
            );
        }
        Ok(())
    }

    pub fn validate_days(days: u32) -> Result<(), String> {
        if days == 0 || days > constants::MAX_WINDOW_DAYS {
            return Err(format!(
                "days must be between 1 and {}",
                constants::MAX_WINDOW_DAYS
            ));
        }
        Ok(())
    }

    pub fn parse_customer_id(raw: &str) -> Result<i64, String> {
        raw.trim()
            .parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| format!("Invalid customer id: {}", raw))
    }
}

// === ERROR TYPES ===

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Cache(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Database(_) => "DATABASE_ERROR",
            ApiError::Cache(_) => "CACHE_ERROR",
            ApiError::Serialization(_) => "SERIALIZATION_ERROR",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.to_string(), self.code())
    }
}

pub type ApiResult<T> = Result<axum::Json<T>, (StatusCode, axum::Json<ErrorResponse>)>;

// === CONSTANTS ===

pub mod constants {
    pub const REVENUE_DASHBOARD_TTL_SECONDS: u64 = 3_600;
    pub const CUSTOMER_SEGMENTS_TTL_SECONDS: u64 = 7_200;
    pub const CLV_TTL_SECONDS: u64 = 14_400;
    pub const FORECAST_TTL_SECONDS: u64 = 86_400;
    pub const HISTORICAL_TTL_SECONDS: u64 = 604_800;
    pub const DEFAULT_TTL_SECONDS: u64 = 1_800;

    pub const DEFAULT_WINDOW_DAYS: u32 = 30;
    pub const MAX_WINDOW_DAYS: u32 = 365;

    /// Length of the zero series handed to charts when a window has no sales.
    pub const EMPTY_SERIES_DAYS: i64 = 30;
    pub const TOP_PRODUCTS_LIMIT: usize = 5;

    pub const EXPECTED_LIFESPAN_MONTHS: f64 = 24.0;
    pub const DAYS_PER_MONTH: f64 = 30.0;

    pub const MAX_SHOP_DOMAIN_LENGTH: usize = 255;
}
