use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use outbox_relay::config::{self, DispatcherConfig};
use outbox_relay::db;
use outbox_relay::dispatch::{LogDispatcher, OutboxDispatcher, WebhookDispatcher};
use outbox_relay::WorkerGroup;

#[derive(Debug, Parser)]
#[command(author, version, about = "Relay outbox messages to their downstream endpoint")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = Arc::new(db::SqliteOutboxStore::new(pool));

    let dispatcher: Arc<dyn OutboxDispatcher> = match &cfg.dispatcher {
        DispatcherConfig::Webhook(hook) => Arc::new(WebhookDispatcher::from_config(hook)?),
        DispatcherConfig::Log => Arc::new(LogDispatcher),
    };

    let group = WorkerGroup::spawn(store, dispatcher, cfg.worker.clone());
    info!(
        workers = group.len(),
        poll_interval_ms = cfg.worker.poll_interval_ms,
        max_batch_size = cfg.worker.max_batch_size,
        lease_duration_ms = cfg.worker.lease_duration_ms,
        "outbox relay running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested; finishing in-flight messages");
    group.shutdown_and_join().await;
    info!("outbox relay stopped");
    Ok(())
}
