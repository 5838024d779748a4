// src/config.rs - Environment driven configuration for the analytics service
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub shopify: ShopifyConfig,
    pub analytics: AnalyticsConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_ms: u64,
    pub enable_ssl: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Postgres,
    Memory,
}

impl FromStr for CacheBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow::anyhow!("Unknown cache backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    /// Interval of the all-tenant expiry sweep.
    pub cleanup_interval_seconds: u64,
    /// Staleness tolerance applied by the HTTP layer when a request does not
    /// carry one. Zero means "honour expires_at only".
    pub default_max_staleness_seconds: u64,
    /// Pending background refreshes; further requests are dropped while full.
    pub refresh_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShopifyConfig {
    pub api_version: String,
    pub page_size: u32,
    /// Upper bound on pages followed per fetch; reaching it marks the result truncated.
    pub max_pages: u32,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    pub clv_lookback_days: i64,
    /// Customer count above which per-customer metrics run on the rayon pool.
    pub parallel_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub timeout_seconds: u64,
    pub enable_cors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub log_format: String, // json, text
}

fn env_or<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    parse_var(name, &raw)
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("Invalid {}", name))
}

impl DatabaseConfig {
    /// Replace preset connection settings with any `DATABASE_*` variable
    /// `lookup` returns.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("DATABASE_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("DATABASE_PORT") {
            self.port = parse_var("DATABASE_PORT", &port)?;
        }
        if let Some(database) = lookup("DATABASE_NAME") {
            self.database = database;
        }
        if let Some(username) = lookup("DATABASE_USERNAME") {
            self.username = username;
        }
        if let Some(password) = lookup("DATABASE_PASSWORD") {
            self.password = password;
        }
        if let Some(max) = lookup("DATABASE_MAX_CONNECTIONS") {
            self.max_connections = parse_var("DATABASE_MAX_CONNECTIONS", &max)?;
        }
        if let Some(min) = lookup("DATABASE_MIN_CONNECTIONS") {
            self.min_connections = parse_var("DATABASE_MIN_CONNECTIONS", &min)?;
        }
        if let Some(timeout) = lookup("DATABASE_TIMEOUT_MS") {
            self.connection_timeout_ms = parse_var("DATABASE_TIMEOUT_MS", &timeout)?;
        }
        if let Some(ssl) = lookup("DATABASE_ENABLE_SSL") {
            self.enable_ssl = parse_var("DATABASE_ENABLE_SSL", &ssl)?;
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from environment variables with development-friendly defaults
    pub fn load() -> Result<Self> {
        let database = DatabaseConfig {
            host: env::var("DATABASE_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env_or("DATABASE_PORT", "5432")?,
            database: env::var("DATABASE_NAME").unwrap_or_else(|_| "shop_insights".to_string()),
            username: env::var("DATABASE_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
            password: env::var("DATABASE_PASSWORD").unwrap_or_default(),
            max_connections: env_or("DATABASE_MAX_CONNECTIONS", "10")?,
            min_connections: env_or("DATABASE_MIN_CONNECTIONS", "2")?,
            connection_timeout_ms: env_or("DATABASE_TIMEOUT_MS", "30000")?,
            enable_ssl: env_or("DATABASE_ENABLE_SSL", "false")?,
        };

        let cache = CacheConfig {
            backend: env_or("CACHE_BACKEND", "postgres")?,
            cleanup_interval_seconds: env_or("CACHE_CLEANUP_INTERVAL", "900")?,
            default_max_staleness_seconds: env_or("CACHE_DEFAULT_MAX_STALENESS", "0")?,
            refresh_queue_capacity: env_or("CACHE_REFRESH_QUEUE_CAPACITY", "256")?,
        };

        let shopify = ShopifyConfig {
            api_version: env::var("SHOPIFY_API_VERSION").unwrap_or_else(|_| "2024-01".to_string()),
            page_size: env_or("SHOPIFY_PAGE_SIZE", "250")?,
            max_pages: env_or("SHOPIFY_MAX_PAGES", "20")?,
            request_timeout_seconds: env_or("SHOPIFY_TIMEOUT_SECONDS", "30")?,
        };

        let analytics = AnalyticsConfig {
            clv_lookback_days: env_or("ANALYTICS_CLV_LOOKBACK_DAYS", "365")?,
            parallel_threshold: env_or("ANALYTICS_PARALLEL_THRESHOLD", "2000")?,
        };

        let server = ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("SERVER_PORT", "8000")?,
            timeout_seconds: env_or("SERVER_TIMEOUT_SECONDS", "30")?,
            enable_cors: env_or("SERVER_ENABLE_CORS", "true")?,
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string()),
        };

        let config = Self {
            database,
            cache,
            shopify,
            analytics,
            server,
            logging,
        };
        config.validate()?;
        Ok(config)
    }

    /// `APP_PROFILE=production|development` selects a preset, with `DATABASE_*`
    /// variables layered over its connection settings; otherwise every
    /// setting is read from the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = match env::var("APP_PROFILE").as_deref() {
            Ok("production") => Self::production(),
            Ok("development") => Self::development(),
            _ => return Self::load(),
        };
        config
            .database
            .apply_overrides(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn production() -> Self {
        Self {
            database: DatabaseConfig {
                host: "localhost".to_string(),
                port: 5432,
                database: "shop_insights".to_string(),
                username: "postgres".to_string(),
                password: String::new(),
                max_connections: 15,
                min_connections: 3,
                connection_timeout_ms: 30_000,
                enable_ssl: true,
            },
            cache: CacheConfig {
                backend: CacheBackend::Postgres,
                cleanup_interval_seconds: 900,
                default_max_staleness_seconds: 3600,
                refresh_queue_capacity: 1_024,
            },
            shopify: ShopifyConfig {
                api_version: "2024-01".to_string(),
                page_size: 250,
                max_pages: 40,
                request_timeout_seconds: 30,
            },
            analytics: AnalyticsConfig {
                clv_lookback_days: 365,
                parallel_threshold: 2_000,
            },
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                timeout_seconds: 30,
                enable_cors: true,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_format: "json".to_string(),
            },
        }
    }

    /// Local configuration: in-memory cache, no database needed
    pub fn development() -> Self {
        Self {
            database: DatabaseConfig {
                host: "localhost".to_string(),
                port: 5432,
                database: "shop_insights_dev".to_string(),
                username: "postgres".to_string(),
                password: String::new(),
                max_connections: 5,
                min_connections: 1,
                connection_timeout_ms: 30_000,
                enable_ssl: false,
            },
            cache: CacheConfig {
                backend: CacheBackend::Memory,
                cleanup_interval_seconds: 60,
                default_max_staleness_seconds: 0,
                refresh_queue_capacity: 64,
            },
            shopify: ShopifyConfig {
                api_version: "2024-01".to_string(),
                page_size: 250,
                max_pages: 4,
                request_timeout_seconds: 15,
            },
            analytics: AnalyticsConfig {
                clv_lookback_days: 365,
                parallel_threshold: 500,
            },
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
                timeout_seconds: 30,
                enable_cors: true,
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                log_format: "text".to_string(),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.host.is_empty() {
            return Err(anyhow::anyhow!("Database host cannot be empty"));
        }
        if self.database.max_connections < self.database.min_connections {
            return Err(anyhow::anyhow!(
                "Max connections must be >= min connections"
            ));
        }
        if self.shopify.page_size == 0 || self.shopify.page_size > 250 {
            return Err(anyhow::anyhow!("Shopify page size must be within 1..=250"));
        }
        if self.shopify.max_pages == 0 {
            return Err(anyhow::anyhow!("Shopify max pages must be > 0"));
        }
        if self.cache.refresh_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Refresh queue capacity must be > 0"));
        }
        if self.analytics.clv_lookback_days <= 0 {
            return Err(anyhow::anyhow!("CLV lookback must be a positive number of days"));
        }
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port must be valid"));
        }
        Ok(())
    }
}

impl DatabaseConfig {
    pub fn connection_options(&self) -> sqlx::postgres::PgConnectOptions {
        let mut options = sqlx::postgres::PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .database(&self.database)
            .application_name("shop_insights");

        options = if self.enable_ssl {
            options.ssl_mode(sqlx::postgres::PgSslMode::Require)
        } else {
            options.ssl_mode(sqlx::postgres::PgSslMode::Prefer)
        };

        options
    }
}
