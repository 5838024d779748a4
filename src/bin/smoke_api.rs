// Exercise a running shop insights API end to end.
//
//   SMOKE_API_URL=http://localhost:8000 SMOKE_SHOP=acme.myshopify.com \
//   SMOKE_ACCESS_TOKEN=shpat_... cargo run --bin smoke_api
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::env;

struct Smoke {
    client: Client,
    base_url: String,
    shop: String,
    access_token: String,
    failures: usize,
}

impl Smoke {
    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("X-Shop-Domain", &self.shop)
            .header("X-Shopify-Access-Token", &self.access_token)
    }

    async fn check(
        &mut self,
        label: &str,
        builder: RequestBuilder,
        expected: StatusCode,
    ) -> anyhow::Result<Option<Value>> {
        println!("\n{}", label);
        let response = self.request(builder).send().await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if status == expected {
            println!("  ✅ {}", status);
            Ok(Some(body))
        } else {
            println!("  ❌ expected {}, got {}: {}", expected, status, body);
            self.failures += 1;
            Ok(None)
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

fn source(body: &Value) -> &str {
    body["metadata"]["source"].as_str().unwrap_or("?")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut smoke = Smoke {
        client: Client::new(),
        base_url: env::var("SMOKE_API_URL").unwrap_or_else(|_| "http://localhost:8000".to_string()),
        shop: env::var("SMOKE_SHOP").unwrap_or_else(|_| "demo-store.myshopify.com".to_string()),
        access_token: env::var("SMOKE_ACCESS_TOKEN").unwrap_or_default(),
        failures: 0,
    };
    println!("🧪 Smoke testing {} as {}", smoke.base_url, smoke.shop);

    let health = smoke.client.get(smoke.url("/health"));
    if let Some(body) = smoke.check("1️⃣ Health", health, StatusCode::OK).await? {
        println!("  backend: {}", body["cache_backend"]);
    }

    let revenue = smoke.client.get(smoke.url("/revenue-overview?days=30"));
    if let Some(body) = smoke.check("2️⃣ Revenue overview", revenue, StatusCode::OK).await? {
        println!(
            "  total {} over {} orders, trend {}% (source: {})",
            body["data"]["totalRevenue"],
            body["data"]["orderCount"],
            body["data"]["periodComparison"]["revenueTrend"],
            source(&body)
        );
    }

    let cached = smoke
        .client
        .get(smoke.url("/revenue-overview?days=30&maxStaleness=3600"));
    if let Some(body) = smoke
        .check("3️⃣ Revenue overview again", cached, StatusCode::OK)
        .await?
    {
        println!("  source: {}, stale: {}", source(&body), body["metadata"]["isStale"]);
    }

    let invalid = smoke.client.get(smoke.url("/revenue-overview?days=0"));
    smoke.check("4️⃣ Invalid window", invalid, StatusCode::BAD_REQUEST).await?;

    let clv = smoke.client.get(smoke.url("/clv"));
    if let Some(body) = smoke.check("5️⃣ Customer lifetime value", clv, StatusCode::OK).await? {
        println!(
            "  {} customers, average CLV {}",
            body["data"]["customers"].as_array().map_or(0, Vec::len),
            body["data"]["summary"]["averageCLV"]
        );
    }

    let dashboard = smoke.client.get(smoke.url("/dashboard?days=7"));
    smoke.check("6️⃣ Dashboard", dashboard, StatusCode::OK).await?;

    let prefetch = smoke.client.post(smoke.url("/cache/prefetch"));
    if let Some(body) = smoke.check("7️⃣ Prefetch", prefetch, StatusCode::ACCEPTED).await? {
        println!("  scheduled: {}", body["scheduled"]);
    }

    let cleanup = smoke.client.post(smoke.url("/cache/cleanup"));
    if let Some(body) = smoke.check("8️⃣ Cleanup", cleanup, StatusCode::OK).await? {
        println!("  deleted: {}", body["deleted"]);
    }

    let stats = smoke.client.get(smoke.url("/stats"));
    if let Some(body) = smoke.check("9️⃣ Stats", stats, StatusCode::OK).await? {
        println!("  {}", serde_json::to_string_pretty(&body["cache"])?);
    }

    if smoke.failures > 0 {
        anyhow::bail!("{} check(s) failed", smoke.failures);
    }
    println!("\n✅ All checks passed");
    Ok(())
}
