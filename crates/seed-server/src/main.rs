//! Seed server binary.
//!
//! # Usage
//!
//! ```bash
//! # In-memory storage (development)
//! seed-server --bind 127.0.0.1:8080
//!
//! # Durable storage
//! seed-server --bind 0.0.0.0:8080 --db /var/lib/seed/messages.redb
//! ```

use std::path::PathBuf;

use clap::Parser;
use seed_server::{
    DEFAULT_CATCH_UP_PAGE, DEFAULT_OUTBOUND_CAPACITY, MemoryStorage, RedbStorage, Server,
    ServerRuntimeConfig,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Seed chat fan-out server
#[derive(Parser, Debug)]
#[command(name = "seed-server")]
#[command(about = "Ordered chat fan-out server over WebSocket")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, env = "SEED_BIND", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Path accepted for WebSocket upgrades
    #[arg(short, long, env = "SEED_WS_PATH", default_value = "/ws")]
    path: String,

    /// Redb database file (messages are kept in memory if omitted)
    #[arg(long, env = "SEED_DB_PATH")]
    db: Option<PathBuf>,

    /// Frames a connection may have queued before it is dropped
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    outbound_capacity: usize,

    /// Messages per catch-up page (also the history cap)
    #[arg(long, default_value_t = DEFAULT_CATCH_UP_PAGE)]
    catch_up_page: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Seed server starting");
    tracing::info!("Binding to {}", args.bind);

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        ws_path: args.path,
        outbound_capacity: args.outbound_capacity,
        catch_up_page: args.catch_up_page,
    };

    match args.db {
        Some(path) => {
            tracing::info!("Using redb storage at {}", path.display());
            let storage = RedbStorage::open(&path)?;
            Server::bind(config, storage).await?.run().await?;
        },
        None => {
            tracing::warn!("No database path provided - messages are kept in memory only");
            Server::bind(config, MemoryStorage::new()).await?.run().await?;
        },
    }

    Ok(())
}
