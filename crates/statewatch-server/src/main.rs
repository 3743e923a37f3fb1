//! statewatchd: tail a state watcher's deltas.
//!
//! Seeds an in-memory backing store from a JSON fixture, starts a watcher
//! over it, and long-polls from `--from`, printing each change set as one
//! JSON line on stdout until Ctrl-C. Logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! statewatchd --fixture model.json
//! statewatchd --fixture model.json --config watcher.ron --from 12
//! RUST_LOG=statewatch_kernel=debug statewatchd --fixture model.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use statewatch_kernel::{Aggregator, MemoryBackend, WatcherConfig};
use statewatch_server::constants::{DEFAULT_FROM_REVNO, DEFAULT_LOG_FILTER};
use statewatch_server::{seed_backend, tail};
use statewatch_types::default_registry;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Tail deltas from a state watcher over a fixture-seeded store.
#[derive(Parser, Debug)]
#[command(name = "statewatchd")]
#[command(about = "Tail entity deltas from a state watcher")]
struct Args {
    /// Watcher config (RON); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON fixture of {collection: [documents]} to seed the store with
    #[arg(long)]
    fixture: Option<PathBuf>,

    /// Revno to start tailing from
    #[arg(long, default_value_t = DEFAULT_FROM_REVNO)]
    from: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => WatcherConfig::load(path)?,
        None => WatcherConfig::default(),
    };

    let registry = default_registry();
    let backend = Arc::new(MemoryBackend::new());
    if let Some(path) = &args.fixture {
        seed_backend(&backend, &registry, path)?;
    }

    let handle = Aggregator::start(registry, backend.clone(), backend, config).await?;
    tracing::info!(from = args.from, "tailing");

    let mut stdout = std::io::stdout().lock();
    tokio::select! {
        result = tail(&handle, args.from, &mut stdout, None) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "tail ended");
            }
        }
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    handle.stop();
    handle.wait().await?;
    Ok(())
}
