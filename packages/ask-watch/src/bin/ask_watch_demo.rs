// Walks one order through a successful and a failed joint watch

use std::sync::Arc;

use anyhow::{Context, Result};
use ask_watch::{
    async_trait, AskCallback, AskParameter, AskStatus, CallbackArgs, CallbackDescriptor,
    EventRegistry, InMemoryMemberStore, InMemoryWatchStore, WatchConfig, WatchEngine,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StockReserved {
    sku: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CardCharged {
    amount_cents: i64,
}

#[derive(Default)]
struct PlaceOrder;

#[async_trait]
impl AskCallback for PlaceOrder {
    async fn on_success(&mut self, args: CallbackArgs) -> Result<()> {
        let sku = args.event::<StockReserved>(0).map(|e| e.sku.as_str());
        let amount = args.event::<CardCharged>(1).map(|e| e.amount_cents);
        tracing::info!(order_id = args.text(3), ?sku, ?amount, "order placed");
        Ok(())
    }

    async fn on_failure(&mut self, args: CallbackArgs) -> Result<()> {
        let failure = args.failure(2).context("failure info missing")?;
        tracing::warn!(
            order_id = args.text(3),
            kind = %failure.kind,
            at = %failure.timestamp,
            "order abandoned"
        );
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ask_watch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = WatchConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(?config, "Configuration loaded");

    let mut registry = EventRegistry::new();
    registry.register_revocable_event::<StockReserved>("inventory:reserve");
    registry.register_event::<CardCharged>("payment:charge");
    registry.register_callback(
        CallbackDescriptor::builder("order:place")
            .event::<StockReserved>()
            .event::<CardCharged>()
            .failure_info()
            .named("order_id")
            .with_failure_operation()
            .build::<PlaceOrder>(),
    );

    let watches = Arc::new(InMemoryWatchStore::new());
    let members = Arc::new(InMemoryMemberStore::new());
    let engine = WatchEngine::builder(watches, members.clone(), Arc::new(registry))
        .with_config(config)
        .build();

    let mut revocations = engine
        .subscribe_revocations()
        .context("engine has no revoke bus")?;
    let releaser = tokio::spawn(async move {
        while let Ok(request) = revocations.recv().await {
            tracing::info!(
                member_id = %request.member_id,
                kind = %request.failure.kind,
                "releasing reservation"
            );
        }
    });

    // Both members succeed
    let reserve = members.create("inventory:reserve", serde_json::json!({ "sku": "BOOK-7" }));
    let charge = members.create("payment:charge", serde_json::json!({ "amount_cents": 2450 }));
    let watch = engine
        .watch_ask_events(
            AskParameter::joint([reserve, charge])
                .with_callback("order:place")
                .with_param("order_id", "1001"),
        )
        .await?;

    members.resolve(&reserve, AskStatus::Success, Utc::now());
    let outcome = engine
        .process_trigger(watch.id, AskStatus::Success, None)
        .await?;
    tracing::info!(?outcome, "first member resolved");

    members.resolve(&charge, AskStatus::Success, Utc::now());
    let outcome = engine
        .process_trigger(watch.id, AskStatus::Success, None)
        .await?;
    tracing::info!(?outcome, "second member resolved");

    // The card is declined after stock was reserved
    let reserve = members.create("inventory:reserve", serde_json::json!({ "sku": "BOOK-8" }));
    let charge = members.create("payment:charge", serde_json::json!({ "amount_cents": 990 }));
    let watch = engine
        .watch_ask_events(
            AskParameter::joint([reserve, charge])
                .with_callback("order:place")
                .with_param("order_id", "1002"),
        )
        .await?;

    members.resolve(&reserve, AskStatus::Success, Utc::now());
    members.resolve(&charge, AskStatus::Failed, Utc::now());
    let outcome = engine
        .process_trigger(watch.id, AskStatus::Failed, None)
        .await?;
    tracing::info!(?outcome, reserve = ?members.status(&reserve), "declined order settled");

    // Redelivered trigger
    let outcome = engine
        .process_trigger(watch.id, AskStatus::Failed, None)
        .await?;
    tracing::info!(?outcome, "redelivered trigger ignored");

    drop(engine);
    releaser.await.context("revocation listener failed")?;

    Ok(())
}
