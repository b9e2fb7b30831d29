//! Durable publish/subscribe/acknowledge store.
//!
//! [`BackplaneRepository`] is the only seam that touches persistence;
//! [`BackplaneStore`] layers the bootstrap policy, the polling subscription
//! and metrics on top of it.

mod memory;
mod postgres;
mod subscription;

pub use memory::InMemoryBackplaneRepository;
pub use postgres::PgBackplaneRepository;
pub use subscription::Subscription;

use crate::cleaner::{BackplaneCleaner, CleanupReport};
use crate::config::{BackplaneConfig, CleanupMode};
use crate::envelope::BackplaneEnvelope;
use crate::error::{BackplaneError, BackplaneResult};
use crate::metrics::BackplaneMetrics;
use crate::models::{AckCandidate, StoredMessage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Persistence operations of the backplane.
///
/// Every method is one short unit of work: a single statement, or a single
/// transaction for [`delete_messages`](Self::delete_messages).
#[async_trait]
pub trait BackplaneRepository: Send + Sync {
    /// Create the tables and indexes if they do not exist.
    async fn provision_schema(&self) -> BackplaneResult<()>;

    /// Check connectivity and that the tables are present.
    ///
    /// # Errors
    ///
    /// `SchemaUnavailable` when a table is missing, `StoreUnavailable` when
    /// the store cannot be reached.
    async fn verify_schema(&self) -> BackplaneResult<()>;

    /// Append a message and return its id.
    async fn insert_message(&self, channel: &str, payload: &serde_json::Value)
        -> BackplaneResult<i64>;

    /// Non-deleted messages on `channel` with an id greater than `after_id`
    /// and without an ack from `subscriber_id`, ascending by id.
    async fn fetch_pending(
        &self,
        channel: &str,
        subscriber_id: &str,
        after_id: i64,
        limit: i64,
    ) -> BackplaneResult<Vec<StoredMessage>>;

    /// Insert an ack unless one exists.
    ///
    /// Returns `true` when a row was written. Duplicates and acks for
    /// messages that no longer exist return `false`, never an error.
    async fn insert_ack(&self, message_id: i64, subscriber_id: &str) -> BackplaneResult<bool>;

    /// Insert the subscriber, or refresh `last_seen` when it already exists.
    async fn upsert_subscriber(&self, subscriber_id: &str) -> BackplaneResult<()>;

    /// Subscribers whose `last_seen` is within `timeout` of now.
    async fn active_subscribers(&self, timeout: Duration) -> BackplaneResult<Vec<String>>;

    /// Non-deleted messages with at least `min_acks` acks and an id greater
    /// than `after_id`, ascending, with the ids that acked each of them.
    async fn ack_candidates(
        &self,
        min_acks: i64,
        after_id: i64,
        limit: i64,
    ) -> BackplaneResult<Vec<AckCandidate>>;

    /// Ids of non-deleted messages older than `retention`, greater than
    /// `after_id`, ascending.
    async fn expired_messages(
        &self,
        retention: Duration,
        after_id: i64,
        limit: i64,
    ) -> BackplaneResult<Vec<i64>>;

    /// Remove or flag the given messages in one transaction.
    ///
    /// Returns the number of messages actually affected.
    async fn delete_messages(&self, message_ids: &[i64], mode: CleanupMode) -> BackplaneResult<u64>;
}

/// Shared message store used by every backplane component of a process.
#[derive(Clone)]
pub struct BackplaneStore {
    repository: Arc<dyn BackplaneRepository>,
    config: Arc<BackplaneConfig>,
    metrics: Option<BackplaneMetrics>,
}

impl BackplaneStore {
    /// Connect to PostgreSQL and bootstrap the store.
    ///
    /// # Errors
    ///
    /// Returns `SchemaUnavailable` when the database cannot be reached or
    /// the schema cannot be provisioned.
    pub async fn connect(config: BackplaneConfig) -> BackplaneResult<Self> {
        let repository = PgBackplaneRepository::connect(&config)
            .await
            .map_err(|e| {
                error!(error = %e, "Cannot connect to backplane store");
                BackplaneError::SchemaUnavailable(format!(
                    "cannot connect to backplane store: {}",
                    e
                ))
            })?;

        Self::new(Arc::new(repository), config).await
    }

    /// Bootstrap a store over an existing repository.
    ///
    /// Provisions the schema when `auto_create_schema` is set, then verifies
    /// that the store is reachable and the tables exist.
    pub async fn new(
        repository: Arc<dyn BackplaneRepository>,
        config: BackplaneConfig,
    ) -> BackplaneResult<Self> {
        config.log_config();

        if config.auto_create_schema {
            repository.provision_schema().await.map_err(|e| {
                error!(error = %e, "Failed to provision backplane schema");
                BackplaneError::SchemaUnavailable(format!(
                    "failed to provision backplane schema: {}",
                    e
                ))
            })?;
        }

        repository.verify_schema().await.map_err(|e| {
            error!(error = %e, "Backplane schema verification failed");
            match e {
                BackplaneError::SchemaUnavailable(reason) => {
                    BackplaneError::SchemaUnavailable(reason)
                }
                other => BackplaneError::SchemaUnavailable(format!(
                    "cannot reach backplane store: {}",
                    other
                )),
            }
        })?;

        info!(subscriber_id = %config.subscriber_id, "Backplane store ready");

        Ok(Self {
            repository,
            config: Arc::new(config),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: BackplaneMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &BackplaneConfig {
        &self.config
    }

    /// Identity of this process in the subscribers table
    pub fn subscriber_id(&self) -> &str {
        &self.config.subscriber_id
    }

    pub fn repository(&self) -> Arc<dyn BackplaneRepository> {
        Arc::clone(&self.repository)
    }

    pub fn metrics(&self) -> Option<&BackplaneMetrics> {
        self.metrics.as_ref()
    }

    /// Append an envelope to `channel`.
    ///
    /// Never waits on subscriber state; the envelope is validated only when
    /// it is dispatched.
    pub async fn publish(&self, channel: &str, envelope: &BackplaneEnvelope) -> BackplaneResult<i64> {
        let payload = serde_json::to_value(envelope)?;
        let message_id = self.repository.insert_message(channel, &payload).await?;

        debug!(message_id, channel = %channel, kind = ?envelope.kind, "Published envelope");
        if let Some(metrics) = &self.metrics {
            metrics.published.inc();
        }

        Ok(message_id)
    }

    /// Stream of `(envelope, message_id)` for every message on `channel` not
    /// yet acknowledged by this store's subscriber id.
    ///
    /// The stream never ends on its own; drop it to stop polling. Messages
    /// that are not acknowledged are yielded again on a later poll.
    pub fn subscribe(&self, channel: &str) -> Subscription {
        Subscription::new(
            Arc::clone(&self.repository),
            channel,
            &self.config,
            None,
        )
    }

    /// Like [`subscribe`](Self::subscribe), but the stream also ends once
    /// `shutdown` turns true or its sender is dropped.
    pub fn subscribe_until(&self, channel: &str, shutdown: watch::Receiver<bool>) -> Subscription {
        Subscription::new(
            Arc::clone(&self.repository),
            channel,
            &self.config,
            Some(shutdown),
        )
    }

    /// Record that `subscriber_id` processed `message_id`.
    ///
    /// Acknowledging twice, or acknowledging a message the cleaner already
    /// removed, succeeds without writing anything.
    pub async fn ack(&self, message_id: i64, subscriber_id: &str) -> BackplaneResult<()> {
        let inserted = self.repository.insert_ack(message_id, subscriber_id).await?;
        if inserted {
            debug!(message_id, subscriber_id = %subscriber_id, "Message acknowledged");
        }
        Ok(())
    }

    /// Acknowledge with this store's own subscriber id.
    pub async fn ack_for_current(&self, message_id: i64) -> BackplaneResult<()> {
        self.ack(message_id, &self.config.subscriber_id).await
    }

    /// Register a subscriber, refreshing it if it already exists.
    pub async fn register_subscriber(&self, subscriber_id: &str) -> BackplaneResult<()> {
        self.repository.upsert_subscriber(subscriber_id).await
    }

    /// Refresh the liveness of a subscriber.
    pub async fn heartbeat(&self, subscriber_id: &str) -> BackplaneResult<()> {
        self.repository.upsert_subscriber(subscriber_id).await
    }

    /// Subscribers seen within the heartbeat timeout.
    pub async fn active_subscribers(&self) -> BackplaneResult<Vec<String>> {
        self.repository
            .active_subscribers(self.config.heartbeat_timeout)
            .await
    }

    /// Run one cleanup cycle now with this store's configuration.
    pub async fn run_cleaner(&self) -> BackplaneResult<CleanupReport> {
        BackplaneCleaner::new(self.clone()).run_once().await
    }
}
