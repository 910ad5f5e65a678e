//! Snapshot flushing and lock-table sweeping.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use veilbox_store::{RelayStore, SnapshotStore};

use crate::error::ServerError;

/// Writes store snapshots to persistence and remembers when it last did.
pub struct Flusher {
    store: Arc<RelayStore>,
    sink: Arc<dyn SnapshotStore>,
    last_saved: RwLock<Option<DateTime<Utc>>>,
}

impl Flusher {
    pub fn new(store: Arc<RelayStore>, sink: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            sink,
            last_saved: RwLock::new(None),
        }
    }

    /// Save a snapshot now. On failure the in-memory store is untouched and
    /// the previous snapshot on disk stays in place.
    pub async fn flush(&self) -> Result<DateTime<Utc>, ServerError> {
        self.store.persist(self.sink.as_ref()).await?;
        let now = Utc::now();
        *self.last_saved.write().await = Some(now);
        debug!(at = %now, "Relay state flushed");
        Ok(now)
    }

    pub async fn last_saved(&self) -> Option<DateTime<Utc>> {
        *self.last_saved.read().await
    }
}

/// Flush every `interval`. Failures are logged and retried on the next tick.
pub fn spawn_periodic_flush(flusher: Arc<Flusher>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = flusher.flush().await {
                error!(error = %e, "Periodic snapshot save failed");
            }
        }
    });
}

/// Drop idle per-user locks every `interval`.
pub fn spawn_lock_sweep(store: Arc<RelayStore>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = store.purge_idle().await;
            if removed > 0 {
                info!(removed, "Swept idle user locks");
            }
        }
    });
}
