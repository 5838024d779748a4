// src/shopify.rs - Shopify Admin API order source
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::LINK;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ShopifyConfig;
use crate::models::{Order, RawOrder, Tenant};

const ACCESS_TOKEN_HEADER: &str = "X-Shopify-Access-Token";
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum OrderSourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Shopify returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed orders payload: {0}")]
    Decode(String),
}

/// Validated orders from one fetch. `truncated` is set when the page cap
/// stopped pagination before the last page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBatch {
    pub orders: Vec<Order>,
    pub truncated: bool,
}

/// Where paid orders come from.
#[async_trait]
pub trait OrderSource: Send + Sync {
    /// Paid orders created at or after `since`.
    async fn fetch_orders(
        &self,
        tenant: &Tenant,
        since: DateTime<Utc>,
    ) -> Result<OrderBatch, OrderSourceError>;

    /// Paid orders for a single customer.
    async fn fetch_customer_orders(
        &self,
        tenant: &Tenant,
        customer_id: i64,
    ) -> Result<OrderBatch, OrderSourceError>;
}

#[derive(Deserialize)]
struct OrdersEnvelope {
    #[serde(default)]
    orders: Vec<serde_json::Value>,
}

/// Decode one `orders.json` page, dropping orders that fail validation.
/// Returns the kept orders and the number dropped.
pub fn parse_orders_page(body: &str) -> Result<(Vec<Order>, usize), OrderSourceError> {
    let envelope: OrdersEnvelope =
        serde_json::from_str(body).map_err(|e| OrderSourceError::Decode(e.to_string()))?;

    let total = envelope.orders.len();
    let orders: Vec<Order> = envelope
        .orders
        .into_iter()
        .filter_map(|value| serde_json::from_value::<RawOrder>(value).ok())
        .filter_map(Order::from_raw)
        .collect();

    let dropped = total - orders.len();
    Ok((orders, dropped))
}

/// Extract the `rel="next"` target from a `Link` header.
pub fn next_page_url(link_header: &str) -> Option<String> {
    link_header.split(',').find_map(|link| {
        let mut parts = link.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|param| {
            let param = param.trim();
            param.eq_ignore_ascii_case("rel=\"next\"") || param.eq_ignore_ascii_case("rel=next")
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

#[derive(Clone)]
pub struct ShopifyClient {
    client: reqwest::Client,
    api_version: String,
    page_size: u32,
    max_pages: u32,
    base_url: Option<String>,
}

impl ShopifyClient {
    pub fn new(config: &ShopifyConfig) -> Result<Self, OrderSourceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            api_version: config.api_version.clone(),
            page_size: config.page_size,
            max_pages: config.max_pages,
            base_url: None,
        })
    }

    /// Send every request to `base_url` instead of `https://{shop}`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn admin_url(&self, shop: &str, path: &str) -> String {
        match &self.base_url {
            Some(base) => format!("{}/admin/api/{}/{}", base, self.api_version, path),
            None => format!("https://{}/admin/api/{}/{}", shop, self.api_version, path),
        }
    }

    pub fn orders_url(&self, shop: &str, since: DateTime<Utc>) -> String {
        format!(
            "{}?status=paid&created_at_min={}&limit={}",
            self.admin_url(shop, "orders.json"),
            since.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.page_size
        )
    }

    pub fn customer_orders_url(&self, shop: &str, customer_id: i64) -> String {
        format!(
            "{}?status=paid&limit={}",
            self.admin_url(shop, &format!("customers/{}/orders.json", customer_id)),
            self.page_size
        )
    }

    /// Follow `Link: rel="next"` until the last page or the page cap.
    async fn fetch_paginated(
        &self,
        tenant: &Tenant,
        first_url: String,
    ) -> Result<OrderBatch, OrderSourceError> {
        let mut url = first_url;
        let mut orders = Vec::new();
        let mut dropped = 0;
        let mut pages = 0u32;

        loop {
            let response = self
                .client
                .get(&url)
                .header(ACCESS_TOKEN_HEADER, &tenant.access_token)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body: String = response
                    .text()
                    .await
                    .unwrap_or_default()
                    .chars()
                    .take(MAX_ERROR_BODY_CHARS)
                    .collect();
                return Err(OrderSourceError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let next = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(next_page_url);

            let body = response.text().await?;
            let (page, page_dropped) = parse_orders_page(&body)?;
            orders.extend(page);
            dropped += page_dropped;
            pages += 1;

            match next {
                None => break,
                Some(_) if pages >= self.max_pages => {
                    warn!(
                        shop = %tenant.shop,
                        pages,
                        orders = orders.len(),
                        "Order pagination stopped at page cap, results truncated"
                    );
                    return Ok(OrderBatch {
                        orders,
                        truncated: true,
                    });
                }
                Some(next_url) => url = next_url,
            }
        }

        if dropped > 0 {
            debug!(shop = %tenant.shop, dropped, "Discarded malformed orders");
        }

        Ok(OrderBatch {
            orders,
            truncated: false,
        })
    }
}

#[async_trait]
impl OrderSource for ShopifyClient {
    async fn fetch_orders(
        &self,
        tenant: &Tenant,
        since: DateTime<Utc>,
    ) -> Result<OrderBatch, OrderSourceError> {
        let url = self.orders_url(&tenant.shop, since);
        self.fetch_paginated(tenant, url).await
    }

    async fn fetch_customer_orders(
        &self,
        tenant: &Tenant,
        customer_id: i64,
    ) -> Result<OrderBatch, OrderSourceError> {
        let url = self.customer_orders_url(&tenant.shop, customer_id);
        self.fetch_paginated(tenant, url).await
    }
}
