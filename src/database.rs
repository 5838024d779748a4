// src/database.rs - Postgres pool, schema and the cache / profile tables
use crate::cache::{CacheEntry, CacheStore, CacheStoreError};
use crate::config::AppConfig;
use crate::models::{ApiError, CustomerProfile};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

/// Executed one statement at a time on startup; every statement is idempotent.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS analytics_cache (
        id BIGSERIAL PRIMARY KEY,
        shop TEXT NOT NULL,
        metric_key TEXT NOT NULL,
        payload JSONB NOT NULL,
        computed_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        CONSTRAINT analytics_cache_shop_metric_key UNIQUE (shop, metric_key)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_analytics_cache_expires_at
    ON analytics_cache (expires_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS customer_profiles (
        shop TEXT NOT NULL,
        customer_id BIGINT NOT NULL,
        clv_score BIGINT NOT NULL,
        total_orders BIGINT NOT NULL,
        total_spent DOUBLE PRECISION NOT NULL,
        last_order_date TIMESTAMPTZ,
        segment TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (shop, customer_id)
    )
    "#,
];

pub mod queries {
    pub const FIND_CACHE_ENTRY: &str = r#"
        SELECT shop, metric_key, payload, computed_at, expires_at
        FROM analytics_cache
        WHERE shop = $1 AND metric_key = $2
    "#;

    pub const UPSERT_CACHE_ENTRY: &str = r#"
        INSERT INTO analytics_cache (shop, metric_key, payload, computed_at, expires_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (shop, metric_key) DO UPDATE
        SET payload = EXCLUDED.payload,
            computed_at = EXCLUDED.computed_at,
            expires_at = EXCLUDED.expires_at
    "#;

    pub const DELETE_EXPIRED_FOR_SHOP: &str =
        "DELETE FROM analytics_cache WHERE shop = $1 AND expires_at < $2";

    pub const DELETE_ALL_EXPIRED: &str = "DELETE FROM analytics_cache WHERE expires_at < $1";

    pub const COUNT_CACHE_ENTRIES: &str = "SELECT COUNT(*) FROM analytics_cache";

    pub const UPSERT_CUSTOMER_PROFILE: &str = r#"
        INSERT INTO customer_profiles
            (shop, customer_id, clv_score, total_orders, total_spent, last_order_date, segment, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, now())
        ON CONFLICT (shop, customer_id) DO UPDATE
        SET clv_score = EXCLUDED.clv_score,
            total_orders = EXCLUDED.total_orders,
            total_spent = EXCLUDED.total_spent,
            last_order_date = EXCLUDED.last_order_date,
            segment = EXCLUDED.segment,
            updated_at = now()
    "#;
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        info!(
            host = %config.database.host,
            database = %config.database.database,
            "Connecting to Postgres"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .acquire_timeout(Duration::from_millis(config.database.connection_timeout_ms))
            .idle_timeout(Duration::from_secs(300))
            .max_lifetime(Duration::from_secs(1800))
            .connect_with(config.database.connection_options())
            .await
            .context("Failed to create database connection pool")?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("Failed to test database connection")?;

        info!("Database connection established");
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to apply schema")?;
        }
        debug!(statements = SCHEMA_STATEMENTS.len(), "Schema verified");
        Ok(())
    }

    /// Health check with pool metrics
    pub async fn health_check(&self) -> Result<HealthStats> {
        let start = std::time::Instant::now();

        let _: i32 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;

        let pool_size = self.pool.size();
        let idle_connections = self.pool.num_idle() as u32;

        Ok(HealthStats {
            response_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            pool_size,
            idle_connections,
            active_connections: pool_size.saturating_sub(idle_connections),
        })
    }
}

#[derive(Debug)]
pub struct HealthStats {
    pub response_time_ms: f64,
    pub pool_size: u32,
    pub idle_connections: u32,
    pub active_connections: u32,
}

// -------------------------------
// Cache table
// -------------------------------
#[derive(Debug, sqlx::FromRow)]
struct CacheRow {
    shop: String,
    metric_key: String,
    payload: serde_json::Value,
    computed_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<CacheRow> for CacheEntry {
    fn from(row: CacheRow) -> Self {
        Self {
            shop: row.shop,
            metric_key: row.metric_key,
            payload: row.payload,
            computed_at: row.computed_at,
            expires_at: row.expires_at,
        }
    }
}

#[derive(Clone)]
pub struct PostgresCacheStore {
    pool: PgPool,
}

impl PostgresCacheStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool.clone(),
        }
    }
}

#[async_trait]
impl CacheStore for PostgresCacheStore {
    async fn find(
        &self,
        shop: &str,
        metric_key: &str,
    ) -> Result<Option<CacheEntry>, CacheStoreError> {
        let row: Option<CacheRow> = sqlx::query_as(queries::FIND_CACHE_ENTRY)
            .bind(shop)
            .bind(metric_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(CacheEntry::from))
    }

    async fn upsert(&self, entry: CacheEntry) -> Result<(), CacheStoreError> {
        sqlx::query(queries::UPSERT_CACHE_ENTRY)
            .bind(&entry.shop)
            .bind(&entry.metric_key)
            .bind(&entry.payload)
            .bind(entry.computed_at)
            .bind(entry.expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_expired(&self, shop: &str, now: DateTime<Utc>) -> Result<u64, CacheStoreError> {
        let result = sqlx::query(queries::DELETE_EXPIRED_FOR_SHOP)
            .bind(shop)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_all_expired(&self, now: DateTime<Utc>) -> Result<u64, CacheStoreError> {
        let result = sqlx::query(queries::DELETE_ALL_EXPIRED)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count(&self) -> Result<u64, CacheStoreError> {
        let count: i64 = sqlx::query_scalar(queries::COUNT_CACHE_ENTRIES)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn ping(&self) -> Result<(), CacheStoreError> {
        let _: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

// -------------------------------
// Customer profiles
// -------------------------------

/// Sink for the per-customer projection written after every CLV run.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Upsert every profile or none of them.
    async fn upsert_profiles(&self, profiles: &[CustomerProfile]) -> Result<u64, ApiError>;
}

#[derive(Clone)]
pub struct PostgresProfileStore {
    pool: PgPool,
}

impl PostgresProfileStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool.clone(),
        }
    }
}

#[async_trait]
impl ProfileStore for PostgresProfileStore {
    async fn upsert_profiles(&self, profiles: &[CustomerProfile]) -> Result<u64, ApiError> {
        if profiles.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for profile in profiles {
            sqlx::query(queries::UPSERT_CUSTOMER_PROFILE)
                .bind(&profile.shop)
                .bind(profile.customer_id)
                .bind(profile.clv_score)
                .bind(profile.total_orders)
                .bind(profile.total_spent)
                .bind(profile.last_order_date)
                .bind(profile.segment.label())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(profiles.len() as u64)
    }
}

/// Profile store for database-less development runs and tests.
#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: DashMap<(String, i64), CustomerProfile>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl InMemoryProfileStore {
    pub fn get(&self, shop: &str, customer_id: i64) -> Option<CustomerProfile> {
        self.profiles
            .get(&(shop.to_string(), customer_id))
            .map(|p| p.clone())
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn upsert_profiles(&self, profiles: &[CustomerProfile]) -> Result<u64, ApiError> {
        for profile in profiles {
            self.profiles
                .insert((profile.shop.clone(), profile.customer_id), profile.clone());
        }
        Ok(profiles.len() as u64)
    }
}
