//! Run the skein daemon against a repository.
//!
//! 1. Load (or default) `.skein/config.toml`
//! 2. Open the cache and initialize the schema
//! 3. Run the daemon until Ctrl+C
//!
//! ```bash
//! cargo run --package skein-daemon --example daemon_demo [path]
//! ```

use skein_core::{EventBus, SkeinConfig};
use skein_daemon::{Daemon, DaemonConfig};
use skein_storage::{Cache, PoolConfig, Syncer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let root = PathBuf::from(std::env::args().nth(1).unwrap_or_else(|| ".".to_string()));

    let config = SkeinConfig::load_or_default(&root)?;
    info!("skein daemon starting at {}", root.display());

    let cache = Cache::open(config.db_path(&root), PoolConfig::from(&config.pool)).await?;
    cache.init_schema().await?;
    info!("Cache ready at {}", cache.path());

    let bus = EventBus::new();
    let mut observer = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = observer.recv().await {
            info!("event: {:?}", event);
        }
    });

    let syncer = Arc::new(Syncer::new(
        Arc::new(cache),
        &config.tasks_path(&root),
        &config.deps_path(&root),
        bus,
    ));

    let mut daemon = Daemon::with_config(syncer, &root, DaemonConfig::from(&config));
    let handle = daemon.handle();

    let run = tokio::spawn(async move { daemon.run().await });

    info!("Daemon running. Press Ctrl+C to stop.");
    signal::ctrl_c().await?;
    info!("Shutting down...");

    handle.shutdown().await;
    run.await??;

    info!("Daemon stopped cleanly");
    Ok(())
}
