// ABOUTME: Entry point for the fieldsync binary.
// ABOUTME: Parses CLI arguments, initializes tracing, and runs store, queue, and sync commands.

use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use fieldsync_core::{Connectivity, Entity, Schema, SyncStatus, SystemClock};
use fieldsync_store::{EntityFilter, StorageManager, StoreHandle};
use fieldsync_sync::{HttpRemote, OfflineService, SyncConfig, SyncOutcome};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "fieldsync", version, about = "Offline-first local store and sync for field health records")]
struct Cli {
    /// Treat the remote as unreachable for this invocation.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write an entity. The JSON payload must carry a string "id".
    Put { collection: String, json: String },
    Get { collection: String, id: String },
    List {
        collection: String,
        /// Only entities not yet confirmed by the remote.
        #[arg(long)]
        pending: bool,
        /// Secondary index lookup as NAME=VALUE, e.g. qr_code=QR-001.
        #[arg(long)]
        index: Option<String>,
    },
    Delete { collection: String, id: String },
    /// Show queued changes in replay order.
    Pending,
    /// Show abandoned and rejected changes.
    Parked,
    /// Discard a parked change.
    Dismiss { change_id: Ulid },
    /// Return a parked change to the queue.
    Retry { change_id: Ulid },
    /// Push queued changes to the remote.
    Sync,
    /// Show the sync outcome journal.
    Journal,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fieldsync=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    let manager = StorageManager::new(config.home.clone())?;
    let store = manager.open(
        Schema::migrant_health(),
        Arc::new(SystemClock),
        config.retry_policy(),
    )?;

    let online = config.start_online && !cli.offline;
    let service = match &config.remote_url {
        Some(url) => Some(
            OfflineService::builder(store.clone())
                .remote(Arc::new(HttpRemote::new(url, config.request_timeout)?))
                .start_online(online)
                .policy(config.retry_policy())
                .build()?,
        ),
        None => None,
    };

    run(cli.command, &store, service.as_ref()).await
}

async fn run(
    command: Command,
    store: &StoreHandle,
    service: Option<&OfflineService>,
) -> anyhow::Result<()> {
    match command {
        Command::Put { collection, json } => {
            let payload: serde_json::Value =
                serde_json::from_str(&json).context("payload is not valid JSON")?;
            let entity = Entity::from_payload(payload)
                .context("payload needs a string \"id\" field")?;
            // The CLI has no other channel to the remote, so every write is
            // queued and pushed through the sync engine when online
            let receipt = store.put(&collection, entity, Connectivity::Offline).await?;
            println!("{} {}/{}", receipt.kind, collection, receipt.entity.id);
            push(service).await?;
        }
        Command::Get { collection, id } => match store.get(&collection, &id).await? {
            Some(entity) => print_json(&entity)?,
            None => bail!("{}/{} not found", collection, id),
        },
        Command::List {
            collection,
            pending,
            index,
        } => {
            let mut filter = EntityFilter::all();
            if pending {
                filter = filter.with_status(SyncStatus::Pending);
            }
            if let Some(index) = index {
                let (name, value) = index
                    .split_once('=')
                    .context("--index expects NAME=VALUE")?;
                filter = filter.with_index(name, value);
            }
            print_json(&store.list(&collection, filter).await?)?;
        }
        Command::Delete { collection, id } => {
            let receipt = store.delete(&collection, &id, Connectivity::Offline).await?;
            if !receipt.existed {
                println!("{}/{} did not exist", collection, id);
                return Ok(());
            }
            println!("deleted {}/{}", collection, id);
            push(service).await?;
        }
        Command::Pending => print_json(&store.peek_all().await?)?,
        Command::Parked => print_json(&store.parked().await?)?,
        Command::Dismiss { change_id } => {
            if store.dismiss(change_id).await? {
                println!("dismissed {}", change_id);
            } else {
                bail!("no parked change {}", change_id);
            }
        }
        Command::Retry { change_id } => {
            store.retry_parked(change_id).await?;
            println!("requeued {}", change_id);
        }
        Command::Sync => {
            let Some(service) = service else {
                bail!("FIELDSYNC_REMOTE_URL is not set");
            };
            report(service.sync().await?)?;
        }
        Command::Journal => print_json(&store.journal_entries().await?)?,
    }

    Ok(())
}

/// Sync right away when a reachable remote is configured.
async fn push(service: Option<&OfflineService>) -> anyhow::Result<()> {
    match service {
        Some(service) if service.is_online() => report(service.sync().await?),
        _ => {
            tracing::info!("offline or no remote configured, change left queued");
            Ok(())
        }
    }
}

fn report(outcome: SyncOutcome) -> anyhow::Result<()> {
    match outcome {
        SyncOutcome::Completed(summary) => {
            println!("sync {:?}", summary.result());
            print_json(&summary)
        }
        other => {
            println!("sync skipped: {:?}", other);
            Ok(())
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
