//! Redemption Burst Example
//!
//! Fires a burst of concurrent redemptions at a limited code, then shows the
//! store catching up after reconciliation.
//!
//! Runs against in-process backends by default. Set `GIFT_DEMO_LIVE=1` to use
//! Redis and Postgres from `REDIS_URL` / `DATABASE_URL` instead.
//!
//! Run with: cargo run --example `redemption_burst`

use gift_redemption::{CreateGiftRequest, GiftConfig, GiftError, GiftSystem};
use std::sync::Arc;
use tokio::task::JoinSet;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== Gift Redemption: Burst ===\n");

    let system = if std::env::var("GIFT_DEMO_LIVE").is_ok() {
        GiftSystem::connect(GiftConfig::from_env()).await?
    } else {
        GiftSystem::in_memory().await?
    };
    let system = Arc::new(system);
    println!("Health check: {}\n", system.health_check().await);

    // Scenario 1: generated code
    println!("=== Scenario 1: Create a gift with a generated code ===\n");
    let gift = system
        .service()
        .create(&CreateGiftRequest {
            code_prefix: Some("BURST".to_string()),
            gift_amount: 2500,
            usage_limit: 25,
            expiration_date: "2030-12-31".to_string(),
            start_date_time: "2030-01-01".to_string(),
            ..CreateGiftRequest::default()
        })
        .await?;
    println!("   Created {} (limit {})\n", gift.code, gift.usage_limit);

    // Scenario 2: 200 callers, 25 redemptions allowed
    println!("=== Scenario 2: 200 concurrent redemptions ===\n");
    let mut tasks = JoinSet::new();
    for _ in 0..200 {
        let system = Arc::clone(&system);
        let code = gift.code.clone();
        tasks.spawn(async move { system.service().use_gift(&code).await });
    }

    let (mut accepted, mut refused) = (0, 0);
    while let Some(result) = tasks.join_next().await {
        match result? {
            Ok(_) => accepted += 1,
            Err(GiftError::UsageLimitReached(_)) => refused += 1,
            Err(e) => return Err(e.into()),
        }
    }
    println!("   Accepted: {accepted}");
    println!("   Refused:  {refused}\n");

    let cached = system.service().get_by_code(&gift.code).await?;
    let stored = system
        .service()
        .repository()
        .store()
        .select_by_code(&gift.code)
        .await?
        .map(|g| g.used_count);
    println!("   Cache says used_count = {}", cached.used_count);
    println!("   Store says used_count = {stored:?} (not flushed yet)\n");

    // Scenario 3: reconciliation
    println!("=== Scenario 3: Reconcile ===\n");
    let report = system.reconciler().run_once().await?;
    println!("   {report:?}");
    let stored = system
        .service()
        .repository()
        .store()
        .select_by_code(&gift.code)
        .await?
        .map(|g| g.used_count);
    println!("   Store says used_count = {stored:?}\n");

    println!("Worker stats: {:?}", system.service().serializer_stats());
    println!("Repository stats: {:?}", system.service().repository().stats());

    system.shutdown().await;
    Ok(())
}
