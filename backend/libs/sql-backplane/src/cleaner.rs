//! Background reclamation of acknowledged and expired messages.
//!
//! A message is reclaimable when every active subscriber acknowledged it
//! (ack strategy) or when it is older than the retention time (TTL strategy).
//! Subscribers that never registered, or whose heartbeat went stale, do not
//! hold messages back.

use crate::config::{CleanupMode, CleanupStrategy};
use crate::error::BackplaneResult;
use crate::store::{BackplaneRepository, BackplaneStore};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Outcome of one cleanup cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub active_subscribers: usize,
    /// Messages acknowledged by every active subscriber
    pub ack_candidates: usize,
    /// Messages past retention that were not already ack candidates
    pub ttl_candidates: usize,
    /// Messages actually removed or flagged
    pub deleted: u64,
}

pub struct BackplaneCleaner {
    store: BackplaneStore,
    repository: Arc<dyn BackplaneRepository>,
    strategy: CleanupStrategy,
    mode: CleanupMode,
    batch_size: i64,
    interval: Duration,
}

impl BackplaneCleaner {
    pub fn new(store: BackplaneStore) -> Self {
        let config = store.config();
        Self {
            repository: store.repository(),
            strategy: config.cleanup_strategy,
            mode: config.cleanup_mode,
            batch_size: config.cleanup_batch_size.max(1),
            interval: config.cleanup_interval,
            store,
        }
    }

    /// Run cleanup cycles every `cleanup_interval` until `shutdown` turns
    /// true or its sender is dropped.
    ///
    /// A failed cycle is logged and retried on the next interval.
    pub async fn start(self, mut shutdown: watch::Receiver<bool>) {
        if self.strategy == CleanupStrategy::None {
            info!("Backplane cleanup strategy is None, cleaner not started");
            return;
        }

        info!(
            strategy = ?self.strategy,
            mode = ?self.mode,
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Backplane cleaner starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.run_once().await {
                error!(error = %e, "Backplane cleanup cycle failed");
            }

            let sender_dropped = tokio::select! {
                _ = tokio::time::sleep(self.interval) => false,
                changed = shutdown.changed() => changed.is_err(),
            };
            if sender_dropped {
                break;
            }
        }

        info!("Backplane cleaner stopped");
    }

    /// Run a single cleanup cycle.
    ///
    /// # Errors
    ///
    /// Fails when the active subscribers or the candidates cannot be read.
    /// A failed deletion batch is logged and does not stop later batches.
    pub async fn run_once(&self) -> BackplaneResult<CleanupReport> {
        let mut report = CleanupReport::default();

        if self.strategy == CleanupStrategy::None {
            debug!("Backplane cleanup skipped, strategy is None");
            return Ok(report);
        }

        let active = self.store.active_subscribers().await?;
        report.active_subscribers = active.len();
        if let Some(metrics) = self.store.metrics() {
            metrics.active_subscribers.set(active.len() as i64);
        }

        if self.strategy.ack_enabled() {
            self.reclaim_acknowledged(&active, &mut report).await?;
        }

        if self.strategy.ttl_enabled() {
            self.reclaim_expired(&mut report).await?;
        }

        if let Some(metrics) = self.store.metrics() {
            metrics.cleaned.inc_by(report.deleted);
        }

        if report.deleted > 0 {
            info!(
                active_subscribers = report.active_subscribers,
                ack_candidates = report.ack_candidates,
                ttl_candidates = report.ttl_candidates,
                deleted = report.deleted,
                mode = ?self.mode,
                "Backplane cleanup cycle completed"
            );
        } else {
            debug!(
                active_subscribers = report.active_subscribers,
                "Backplane cleanup found nothing to reclaim"
            );
        }

        Ok(report)
    }

    async fn reclaim_acknowledged(
        &self,
        active: &[String],
        report: &mut CleanupReport,
    ) -> BackplaneResult<()> {
        let active: HashSet<&str> = active.iter().map(String::as_str).collect();
        let min_acks = active.len() as i64;
        let mut after_id = 0;

        loop {
            let page = self
                .repository
                .ack_candidates(min_acks, after_id, self.batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.message_id;
            let page_len = page.len() as i64;

            // The count filter admits acks from stale subscribers; confirm
            // that every active subscriber is among them.
            let confirmed: Vec<i64> = page
                .into_iter()
                .filter(|candidate| {
                    let acked: HashSet<&str> =
                        candidate.acked_by.iter().map(String::as_str).collect();
                    active.is_subset(&acked)
                })
                .map(|candidate| candidate.message_id)
                .collect();

            report.ack_candidates += confirmed.len();
            report.deleted += self.delete_batch(&confirmed).await;

            if page_len < self.batch_size {
                break;
            }
        }

        Ok(())
    }

    async fn reclaim_expired(&self, report: &mut CleanupReport) -> BackplaneResult<()> {
        let retention = self.store.config().retention_time;
        let mut after_id = 0;

        loop {
            let page = self
                .repository
                .expired_messages(retention, after_id, self.batch_size)
                .await?;
            let Some(&last) = page.last() else {
                break;
            };
            after_id = last;

            report.ttl_candidates += page.len();
            report.deleted += self.delete_batch(&page).await;

            if (page.len() as i64) < self.batch_size {
                break;
            }
        }

        Ok(())
    }

    async fn delete_batch(&self, message_ids: &[i64]) -> u64 {
        if message_ids.is_empty() {
            return 0;
        }

        match self.repository.delete_messages(message_ids, self.mode).await {
            Ok(deleted) => deleted,
            Err(e) => {
                error!(
                    batch_size = message_ids.len(),
                    first_id = message_ids[0],
                    error = %e,
                    "Backplane cleanup batch failed"
                );
                0
            }
        }
    }
}
