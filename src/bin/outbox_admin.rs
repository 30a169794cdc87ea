use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

use outbox_relay::config;
use outbox_relay::db::{self, SqliteOutboxStore};
use outbox_relay::{OutboxMessage, OutboxStore};

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and feed the outbox database")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Enqueue a new pending message
    Enqueue {
        /// Message type tag, e.g. `order.created`
        #[arg(long = "type")]
        message_type: String,
        /// Serialized payload
        #[arg(long)]
        payload: String,
        #[arg(long, default_value = "")]
        correlation_id: String,
        #[arg(long, default_value = "")]
        causation_id: String,
    },
    /// Print message counts per status
    Stats,
    /// Print one message as JSON
    Show { id: Uuid },
    /// Return messages with lapsed leases to pending
    ReleaseExpired,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = SqliteOutboxStore::new(pool);

    match args.command {
        Command::Enqueue {
            message_type,
            payload,
            correlation_id,
            causation_id,
        } => {
            let message = OutboxMessage::new(message_type, payload)
                .with_correlation_id(correlation_id)
                .with_causation_id(causation_id);
            store.enqueue(&message).await?;
            info!(message_id = %message.id, "enqueued outbox message");
            println!("{}", message.id);
        }
        Command::Stats => {
            let counts = store.status_counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Command::Show { id } => {
            let message = store
                .get(id)
                .await?
                .with_context(|| format!("outbox message {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&message)?);
        }
        Command::ReleaseExpired => {
            let released = store.release_expired_leases().await?;
            info!(released, "released expired leases");
            println!("{released}");
        }
    }
    Ok(())
}
