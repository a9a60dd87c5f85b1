//! Assessment Sync Hub - data integration and synchronization server.

mod api;
mod config;
mod conflict;
mod connectors;
mod error;
mod inbox;
mod mapping;
mod models;
mod notify;
mod pipeline;
mod pool;
mod query;
mod registry;
mod sanitizer;
mod scheduler;
mod store;
mod target_schema;
mod tiers;

use anyhow::Context;
use api::AppState;
use config::HubConfig;
use inbox::Inbox;
use mapping::MappingStore;
use notify::NotificationRouter;
use pipeline::EtlPipeline;
use query::QueryExecutor;
use registry::SourceRegistry;
use sanitizer::Sanitizer;
use scheduler::SyncScheduler;
use std::sync::Arc;
use store::HubStore;
use tiers::{Tier, TierStore};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "assessment_sync_hub=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = HubConfig::from_env()?;

    // Durable state and destination tiers
    let store = HubStore::open(&config.state_db).context("Failed to open hub state database")?;
    let production = TierStore::open(&config.production_db, Tier::Production)
        .context("Failed to open production tier")?;
    let training = TierStore::open(&config.training_db, Tier::Training)
        .context("Failed to open training tier")?;

    // Services
    let registry = Arc::new(SourceRegistry::load(store.clone(), config.pool).await?);
    let executor = Arc::new(QueryExecutor::new(registry.clone(), config.query));
    let mappings = Arc::new(MappingStore::load(store.clone()).await?);
    let mut sanitizer = Sanitizer::compile(&config.sanitization_rules);
    if let Some(key) = &config.hash_key {
        sanitizer = sanitizer.with_hash_key(key.as_bytes());
    }
    let sanitizer = Arc::new(sanitizer);
    let inbox = Inbox::new();
    let notifier = Arc::new(NotificationRouter::from_rules(
        &config.notification_rules,
        inbox.clone(),
        store.clone(),
        config.notify_backoff,
    ));
    let pipeline = Arc::new(EtlPipeline::new(
        executor.clone(),
        registry.clone(),
        mappings.clone(),
        production,
        training,
        sanitizer,
        store.clone(),
    ));
    let scheduler = Arc::new(
        SyncScheduler::load(
            store.clone(),
            pipeline,
            notifier,
            registry.clone(),
            config.scheduler,
        )
        .await?,
    );

    // Scheduler loop
    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown.clone()));

    // Build application state
    let state = AppState {
        registry,
        executor,
        mappings,
        scheduler,
        store,
        inbox,
    };
    let app = api::router(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Server listening on http://{}", config.bind_addr);
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    scheduler_task.await.ok();
    Ok(())
}
