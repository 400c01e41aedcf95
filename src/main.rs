//! Tollgate - entitlement metering admin CLI

use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tollgate::{
    config::{Args, Command, KeyArgs},
    db::MongoClient,
    types::RecordStatus,
    ConfigRegistry, EntitlementEngine, EntitlementStore, MemoryEntitlementStore,
    MongoEntitlementStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    init_tracing(&args);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let registry = Arc::new(ConfigRegistry::new(args.budget_table()?));
    let store = open_store(&args).await?;
    let engine = EntitlementEngine::new(store, registry);

    match &args.command {
        Command::Check(key) => print_json(
            &engine
                .check_eligibility(&key.identifier, key.kind, &key.feature)
                .await?,
        ),
        Command::Consume(key) => print_json(
            &engine
                .consume(&key.identifier, key.kind, &key.feature)
                .await?,
        ),
        Command::Reset(key) => print_json(
            &engine
                .reset(&key.identifier, key.kind, &key.feature)
                .await?,
        ),
        Command::Suspend(key) => set_status(&engine, key, RecordStatus::Suspended).await,
        Command::Activate(key) => set_status(&engine, key, RecordStatus::Active).await,
        Command::Show(key) => print_json(
            &engine
                .get_record(&key.identifier, key.kind, &key.feature)
                .await?,
        ),
        Command::Stats { feature } => print_json(&engine.get_stats(feature.as_deref()).await?),
        Command::Sweep { retention_days } => {
            let deleted = engine
                .sweep_stale_zero_usage_records(*retention_days)
                .await?;
            print_json(&serde_json::json!({ "deleted": deleted }))
        }
    }
}

fn init_tracing(args: &Args) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("tollgate={},info", args.log_level).into());

    // Logs go to stderr so stdout stays machine-readable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn open_store(args: &Args) -> anyhow::Result<Arc<dyn EntitlementStore>> {
    if args.dev_mode {
        info!("Mode: DEVELOPMENT (in-memory store, state is not persisted)");
        return Ok(Arc::new(MemoryEntitlementStore::new()));
    }

    let mongo = MongoClient::new(&args.mongodb_uri, &args.mongodb_db, args.store_timeout()).await?;
    let store = MongoEntitlementStore::new(&mongo, &args.entitlement_collection).await?;
    info!(
        "Using MongoDB collection {}.{}",
        mongo.db_name(),
        args.entitlement_collection
    );
    Ok(Arc::new(store))
}

async fn set_status(
    engine: &EntitlementEngine,
    key: &KeyArgs,
    status: RecordStatus,
) -> anyhow::Result<()> {
    let record = engine
        .set_status(&key.identifier, key.kind, &key.feature, status)
        .await?;
    print_json(&record)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
