use crate::error::BackplaneResult;
use crate::store::BackplaneStore;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Keeps this process's subscriber row live so the cleaner waits for its
/// acknowledgments.
pub struct Heartbeat {
    store: BackplaneStore,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(store: BackplaneStore) -> Self {
        let interval = store.config().heartbeat_interval;
        Self { store, interval }
    }

    /// Insert or refresh this process's subscriber row once.
    pub async fn register(&self) -> BackplaneResult<()> {
        let subscriber_id = self.store.subscriber_id();
        self.store.register_subscriber(subscriber_id).await?;
        info!(subscriber_id = %subscriber_id, "Backplane subscriber registered");
        Ok(())
    }

    /// Register the subscriber, then refresh it every `heartbeat_interval`
    /// until `shutdown` turns true or its sender is dropped.
    pub async fn start(self, shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.register().await {
            warn!(
                subscriber_id = %self.store.subscriber_id(),
                error = %e,
                "Backplane subscriber registration failed, retrying on next heartbeat"
            );
        }
        self.run(shutdown).await;
    }

    /// Refresh the subscriber every `heartbeat_interval` without an initial
    /// registration.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let subscriber_id = self.store.subscriber_id().to_string();

        loop {
            let sender_dropped = tokio::select! {
                _ = tokio::time::sleep(self.interval) => false,
                changed = shutdown.changed() => changed.is_err(),
            };
            if sender_dropped || *shutdown.borrow() {
                break;
            }

            match self.store.heartbeat(&subscriber_id).await {
                Ok(()) => debug!(subscriber_id = %subscriber_id, "Backplane heartbeat"),
                Err(e) => warn!(
                    subscriber_id = %subscriber_id,
                    error = %e,
                    "Backplane heartbeat failed"
                ),
            }
        }

        info!(subscriber_id = %subscriber_id, "Backplane heartbeat stopped");
    }
}
