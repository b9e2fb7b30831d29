//! Replays backplane envelopes onto the connections held by this process.
//!
//! Every process runs one [`Dispatcher`] subscribed to [`HUB_CHANNEL`] under
//! the process subscriber id. For each envelope it resolves the local targets
//! through the [`ConnectionRegistry`], writes the decoded message to each of
//! them, then acknowledges the message so the cleaner can reclaim it once
//! every live process has done the same.

mod hub;
mod registry;

pub use hub::BackplaneHub;
pub use registry::{ChannelConnection, ConnectionRegistry, HubConnection};

use crate::envelope::BackplaneEnvelope;
use crate::error::BackplaneResult;
use crate::store::BackplaneStore;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Internal channel carrying hub envelopes, kept apart from application
/// channels.
pub const HUB_CHANNEL: &str = "backplane:hub";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Starting,
    Polling,
    Delivering,
    Stopped,
}

/// Result of delivering one envelope locally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Local connections addressed after exclusions
    pub resolved: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct Dispatcher {
    store: BackplaneStore,
    registry: ConnectionRegistry,
    state: watch::Sender<DispatcherState>,
}

impl Dispatcher {
    pub fn new(store: BackplaneStore, registry: ConnectionRegistry) -> Self {
        let (state, _) = watch::channel(DispatcherState::Starting);
        Self {
            store,
            registry,
            state,
        }
    }

    /// Observe state transitions
    pub fn state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    /// Consume the hub channel until `shutdown` turns true or its sender is
    /// dropped.
    ///
    /// Nothing that happens to a single envelope stops the loop: a malformed
    /// envelope is left unacknowledged and comes back on a later poll.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        self.state.send_replace(DispatcherState::Starting);
        let subscriber_id = self.store.subscriber_id().to_string();
        info!(
            subscriber_id = %subscriber_id,
            channel = HUB_CHANNEL,
            "Backplane dispatcher starting"
        );

        let mut subscription = self.store.subscribe_until(HUB_CHANNEL, shutdown);
        self.state.send_replace(DispatcherState::Polling);

        while let Some((envelope, message_id)) = subscription.next().await {
            self.state.send_replace(DispatcherState::Delivering);
            self.handle(&envelope, message_id).await;
            self.state.send_replace(DispatcherState::Polling);
        }

        self.state.send_replace(DispatcherState::Stopped);
        info!(subscriber_id = %subscriber_id, "Backplane dispatcher stopped");
    }

    /// Deliver one envelope, then acknowledge it for this process.
    async fn handle(&self, envelope: &BackplaneEnvelope, message_id: i64) {
        let metrics = self.store.metrics();

        match self.dispatch(envelope, message_id).await {
            Ok(outcome) => {
                debug!(
                    message_id,
                    resolved = outcome.resolved,
                    delivered = outcome.delivered,
                    failed = outcome.failed,
                    "Envelope dispatched"
                );

                match self.store.ack_for_current(message_id).await {
                    Ok(()) => {
                        if let Some(metrics) = metrics {
                            metrics.acked.inc();
                        }
                    }
                    Err(e) => warn!(
                        message_id,
                        error = %e,
                        "Failed to acknowledge dispatched message, it will be redelivered"
                    ),
                }
            }
            Err(e) => {
                warn!(
                    message_id,
                    error = %e,
                    "Envelope dispatch failed, leaving it unacknowledged"
                );
                if let Some(metrics) = metrics {
                    metrics.dispatch_failures.inc();
                }
            }
        }
    }

    /// Decode `envelope` and write it to every local connection it addresses.
    ///
    /// A failed write to one connection is logged and counted; the others are
    /// still attempted.
    ///
    /// # Errors
    ///
    /// `MalformedEnvelope` when an invocation has no method.
    pub async fn dispatch(
        &self,
        envelope: &BackplaneEnvelope,
        message_id: i64,
    ) -> BackplaneResult<DispatchOutcome> {
        let message = envelope.decode()?;
        let targets = self.registry.resolve(envelope).await;
        let metrics = self.store.metrics();

        let mut outcome = DispatchOutcome {
            resolved: targets.len(),
            ..DispatchOutcome::default()
        };

        for connection in targets {
            match connection.write(&message).await {
                Ok(()) => {
                    outcome.delivered += 1;
                    if let Some(metrics) = metrics {
                        metrics.delivered.inc();
                    }
                }
                Err(e) => {
                    outcome.failed += 1;
                    warn!(
                        message_id,
                        connection_id = %connection.connection_id(),
                        error = %e,
                        "Delivery to local connection failed"
                    );
                    if let Some(metrics) = metrics {
                        metrics.delivery_failures.inc();
                    }
                }
            }
        }

        Ok(outcome)
    }
}
