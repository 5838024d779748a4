// Inspect the analytics tables in the configured Postgres database.
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::Connection;
use std::env;

const EXPECTED_TABLES: [&str; 2] = ["analytics_cache", "customer_profiles"];

fn connect_options() -> anyhow::Result<PgConnectOptions> {
    let var = |name: &str, default: &str| env::var(name).unwrap_or_else(|_| default.to_string());

    let ssl_mode = if var("DATABASE_ENABLE_SSL", "false").parse::<bool>()? {
        PgSslMode::Require
    } else {
        PgSslMode::Prefer
    };

    Ok(PgConnectOptions::new()
        .host(&var("DATABASE_HOST", "localhost"))
        .port(var("DATABASE_PORT", "5432").parse()?)
        .username(&var("DATABASE_USERNAME", "postgres"))
        .password(&var("DATABASE_PASSWORD", ""))
        .database(&var("DATABASE_NAME", "shop_insights"))
        .ssl_mode(ssl_mode))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("Connecting to database...");
    let mut conn = PgConnection::connect_with(&connect_options()?).await?;
    println!("✅ Connected");

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public'",
    )
    .fetch_all(&mut conn)
    .await?;

    let mut missing = 0;
    for table in EXPECTED_TABLES {
        if !tables.iter().any(|(name,)| name == table) {
            println!("\n❌ {} not found (the server creates it on startup)", table);
            missing += 1;
            continue;
        }

        println!("\n📊 TABLE: {}", table);
        let columns: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT column_name, data_type, is_nullable FROM information_schema.columns \
             WHERE table_name = $1 ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&mut conn)
        .await?;
        for (name, data_type, nullable) in columns {
            println!("  - {}: {} (nullable: {})", name, data_type, nullable);
        }

        let (rows,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&mut conn)
            .await?;
        println!("  📈 Rows: {}", rows);
    }

    if tables.iter().any(|(name,)| name == "analytics_cache") {
        println!("\n🔑 Cached metrics per shop:");
        let per_shop: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT shop, COUNT(*), COUNT(*) FILTER (WHERE expires_at < now()) \
             FROM analytics_cache GROUP BY shop ORDER BY shop LIMIT 20",
        )
        .fetch_all(&mut conn)
        .await?;
        if per_shop.is_empty() {
            println!("  (empty)");
        }
        for (shop, total, expired) in per_shop {
            println!("  - {}: {} entries, {} expired", shop, total, expired);
        }
    }

    if tables.iter().any(|(name,)| name == "customer_profiles") {
        println!("\n👥 Customer segments:");
        let segments: Vec<(String, i64)> = sqlx::query_as(
            "SELECT segment, COUNT(*) FROM customer_profiles GROUP BY segment ORDER BY 2 DESC",
        )
        .fetch_all(&mut conn)
        .await?;
        for (segment, count) in segments {
            println!("  - {}: {}", segment, count);
        }
    }

    if missing > 0 {
        anyhow::bail!("{} expected table(s) missing", missing);
    }
    println!("\n✅ Schema check complete");
    Ok(())
}
