use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use veilbox_server::api::{self, AppState};
use veilbox_server::config::ServerConfig;
use veilbox_server::dispatch::Dispatcher;
use veilbox_server::flush::{self, Flusher};
use veilbox_store::{JsonDirStore, RelayStore, SnapshotStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,veilbox_server=debug,veilbox_store=debug")
        }))
        .init();

    info!("Starting Veilbox relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Hydrate the store from the last snapshot
    // -----------------------------------------------------------------------
    let persistence: Arc<dyn SnapshotStore> = Arc::new(JsonDirStore::new(&config.data_dir));
    let store = Arc::new(RelayStore::load_from(persistence.as_ref()).await?);
    let flusher = Arc::new(Flusher::new(Arc::clone(&store), Arc::clone(&persistence)));

    // Persist right away so a freshly generated salt is never lost.
    flusher.flush().await?;
    info!(stats = ?store.stats().await, "Relay state ready");

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    if config.save_interval_secs > 0 {
        flush::spawn_periodic_flush(
            Arc::clone(&flusher),
            Duration::from_secs(config.save_interval_secs),
        );
    }
    if config.sweep_interval_secs > 0 {
        flush::spawn_lock_sweep(
            Arc::clone(&store),
            Duration::from_secs(config.sweep_interval_secs),
        );
    }

    let app_state = AppState {
        dispatcher: Dispatcher::new(Arc::clone(&store)),
        flusher: Arc::clone(&flusher),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API until it fails or Ctrl+C arrives
    // -----------------------------------------------------------------------
    let outcome = tokio::select! {
        result = api::serve(app_state, config.http_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    // -----------------------------------------------------------------------
    // 6. Final flush
    // -----------------------------------------------------------------------
    match flusher.flush().await {
        Ok(at) => info!(at = %at, "Final snapshot saved"),
        Err(e) => error!(error = %e, "Final snapshot save failed"),
    }

    if let Err(e) = &outcome {
        error!(error = %e, "HTTP server failed");
    }
    outcome
}
