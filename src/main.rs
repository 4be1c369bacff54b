//! # Collection Sync CLI (`csync`)
//!
//! The `csync` binary drives the consistency engine against the two
//! SQLite databases named in the config file: the metadata store and the
//! local vector index.
//!
//! ## Usage
//!
//! ```bash
//! csync --config ./config/csync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `csync init` | Create both databases and run schema migrations |
//! | `csync create <name>` | Create a collection and its vector container |
//! | `csync list` | List all collections |
//! | `csync show <id>` | Show one collection record |
//! | `csync sync <id>` | Re-synchronize a collection with the vector index |
//! | `csync delete <id>` | Delete a collection and its container |
//! | `csync health [id]` | System health, or one collection's health |
//! | `csync stats <id>` | Collection statistics |
//! | `csync reconcile` | Run one repair sweep (or keep running with `--watch`) |
//!
//! Results are printed to stdout as pretty JSON; logs go to stderr
//! (filter with `RUST_LOG`, default `info`).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use collection_sync::config::{self, Config};
use collection_sync::engine::Engine;
use collection_sync::error::SyncError;
use collection_sync::migrate;
use collection_sync::models::NewCollection;
use collection_sync::stats;

/// Collection Sync CLI: keeps collection metadata and its vector index
/// consistent.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "csync",
    about = "Collection Sync: keeps collection metadata and its vector index consistent",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/csync.toml`.
    #[arg(long, global = true, default_value = "./config/csync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize both database schemas.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Create a collection and provision its vector container.
    ///
    /// If the container cannot be created the collection is still stored
    /// (in `error`) and the result status is `pending`.
    Create {
        /// Collection name (letters, digits, spaces, `-`, `_`).
        name: String,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        embedding_model: Option<String>,

        #[arg(long)]
        chunk_size: Option<i64>,

        #[arg(long)]
        chunk_overlap: Option<i64>,

        /// Tag to attach (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// List all collections.
    List,

    /// Show a collection record by id.
    Show { id: String },

    /// Re-synchronize a collection with the vector index.
    Sync {
        id: String,

        /// Drop and recreate the container even if it looks healthy.
        #[arg(long)]
        force: bool,
    },

    /// Delete a collection, its documents and chunks, and its container.
    Delete { id: String },

    /// Report system health, or one collection's health.
    Health { id: Option<String> },

    /// Show collection statistics.
    Stats {
        id: String,

        /// Print JSON instead of the human-readable summary.
        #[arg(long)]
        json: bool,
    },

    /// Detect and repair divergence between the two stores.
    Reconcile {
        /// Keep running, one sweep every `reconcile.interval_secs`.
        #[arg(long)]
        watch: bool,

        /// Override the sweep interval in seconds (with `--watch`).
        #[arg(long)]
        interval: Option<u64>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let engine = Engine::open(&cfg).await?;
    let outcome = run(&engine, &cfg, cli.command).await;
    engine.close().await;
    outcome
}

async fn run(engine: &Engine, cfg: &Config, command: Commands) -> Result<()> {
    let coordinator = &engine.coordinator;

    match command {
        Commands::Init => unreachable!(),
        Commands::Create {
            name,
            description,
            embedding_model,
            chunk_size,
            chunk_overlap,
            tags,
        } => {
            let mut request = NewCollection::named(&name);
            request.description = description;
            if let Some(model) = embedding_model {
                request.embedding_model = model;
            }
            if let Some(size) = chunk_size {
                request.chunk_size = size;
            }
            if let Some(overlap) = chunk_overlap {
                request.chunk_overlap = overlap;
            }
            request.tags = tags;
            print_json(&coordinator.create_collection(request).await?)?;
        }
        Commands::List => {
            let collections = coordinator
                .metadata()
                .list_collections()
                .await
                .map_err(SyncError::metadata)?;
            print_json(&collections)?;
        }
        Commands::Show { id } => {
            let collection = coordinator
                .metadata()
                .get_collection(&id)
                .await
                .map_err(SyncError::metadata)?
                .ok_or_else(|| SyncError::not_found("collection", &id))?;
            print_json(&collection)?;
        }
        Commands::Sync { id, force } => {
            print_json(&coordinator.sync_collection(&id, force).await?)?;
        }
        Commands::Delete { id } => {
            print_json(&coordinator.delete_collection(&id).await?)?;
        }
        Commands::Health { id: Some(id) } => {
            print_json(&engine.health.check_collection_health(&id).await?)?;
        }
        Commands::Health { id: None } => {
            print_json(&engine.health.check_system_health().await)?;
        }
        Commands::Stats { id, json } => {
            let summary = stats::collection_stats(coordinator.metadata().as_ref(), &id).await?;
            if json {
                print_json(&summary)?;
            } else {
                stats::print_stats(&summary);
            }
        }
        Commands::Reconcile { watch: false, .. } => {
            print_json(&engine.scanner.reconcile_once().await)?;
        }
        Commands::Reconcile {
            watch: true,
            interval,
        } => {
            let interval =
                Duration::from_secs(interval.unwrap_or(cfg.reconcile.interval_secs).max(1));
            tracing::info!(interval_secs = interval.as_secs(), "reconcile watch started");
            let sweep = engine.scanner.watch(interval, |report| {
                if let Ok(line) = serde_json::to_string(report) {
                    println!("{}", line);
                }
            });
            tokio::select! {
                _ = sweep => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("reconcile watch stopped");
                }
            }
        }
    }

    Ok(())
}
