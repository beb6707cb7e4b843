//! AquaPin sync CLI.
//!
//! Operator tool over the device's local store: replays queued field
//! actions, inspects and repairs the queue, and reconciles pond aggregates.

use aquapin_client::{db, AppError, Config, HttpRemote, ProbeConnectivity, SqliteStore};
use aquapin_engine::{keys, ClientIdentity, Engine, JsonStore, QueuedOperation};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "aquapin-sync", version, about = "AquaPin offline sync tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay queued actions against the backend
    Sync,
    /// List queued actions
    Pending,
    /// Drop every queued action
    Discard,
    /// List actions set aside after repeated rejection
    DeadLetters {
        /// Move them back onto the queue with a fresh attempt count
        #[arg(long)]
        requeue: bool,
    },
    /// Recompute and print a pond's stock aggregate
    Reconcile {
        /// Pond id (negative for ponds created offline)
        #[arg(allow_negative_numbers = true)]
        pond_id: i64,
    },
    /// Print this device's client id
    ClientId,
    /// List every key in the local store
    Keys,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aquapin_client=info,aquapin_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;

    let store = SqliteStore::new_shared(pool);
    let json = JsonStore::new(store.clone());

    // Mint the client id once so the transport and the engine agree on it.
    let identity = Arc::new(ClientIdentity::new(json.clone()));
    identity.get_or_create().await?;

    let remote = Arc::new(HttpRemote::new(
        json.clone(),
        identity,
        config.api_url.clone(),
        config.request_timeout,
    )?);
    let connectivity = Arc::new(ProbeConnectivity::new(
        json,
        config.api_url.clone(),
        config.probe_timeout,
    ));

    let engine = Engine::new(store.clone(), connectivity, remote, config.sync_config());

    match cli.command {
        Command::Sync => {
            let report = engine.sync().await?;
            println!("{}", report.message);
            if !report.success {
                std::process::exit(1);
            }
        }
        Command::Pending => {
            print_operations(&engine.queue().list_pending().await?);
            let unreadable = engine.queue().list_unreadable().await?;
            if !unreadable.is_empty() {
                println!(
                    "{} unreadable actions kept under {}",
                    unreadable.len(),
                    keys::UNREADABLE_ACTIONS
                );
            }
        }
        Command::Discard => {
            let count = engine.queue().len().await?;
            engine.queue().clear().await?;
            println!("Discarded {count} queued actions");
        }
        Command::DeadLetters { requeue: true } => {
            let count = engine.queue().requeue_dead_letters().await?;
            println!("Requeued {count} actions");
        }
        Command::DeadLetters { requeue: false } => {
            print_operations(&engine.queue().list_dead_letters().await?)
        }
        Command::Reconcile { pond_id } => {
            match engine.reconciler().reconcile_pond_aggregates(pond_id).await? {
                Some(pond) => println!("{}", serde_json::to_string_pretty(&pond)?),
                None => {
                    eprintln!("Pond {pond_id} is not known locally or on the server");
                    std::process::exit(1);
                }
            }
        }
        Command::ClientId => println!("{}", engine.identity().get_or_create().await?),
        Command::Keys => {
            for key in store.keys().await? {
                println!("{key}");
            }
        }
    }

    Ok(())
}

fn print_operations(ops: &[QueuedOperation]) {
    if ops.is_empty() {
        println!("No actions");
        return;
    }
    for op in ops {
        let temp = op.temp_id.map(|id| format!(" temp={id}")).unwrap_or_default();
        println!(
            "{:>14}  {:<6} {:<22} attempts={}{}  {}",
            op.id, op.method, op.endpoint, op.attempts, temp, op.timestamp
        );
    }
}
