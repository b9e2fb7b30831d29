use super::BackplaneRepository;
use crate::config::BackplaneConfig;
use crate::envelope::BackplaneEnvelope;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Lazy, infinite stream of `(envelope, message_id)` pairs read from one
/// channel on behalf of one subscriber.
pub struct Subscription {
    inner: BoxStream<'static, (BackplaneEnvelope, i64)>,
}

impl Subscription {
    pub(super) fn new(
        repository: Arc<dyn BackplaneRepository>,
        channel: &str,
        config: &BackplaneConfig,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Self {
        let state = PollState {
            repository,
            channel: channel.to_string(),
            subscriber_id: config.subscriber_id.clone(),
            poll_interval: config.poll_interval,
            batch_size: config.poll_batch_size.max(1),
            buffer: VecDeque::new(),
            polled_once: false,
            skip_next_wait: false,
            cursor: 0,
            shutdown,
        };

        Self {
            inner: stream::unfold(state, next_message).boxed(),
        }
    }
}

impl Stream for Subscription {
    type Item = (BackplaneEnvelope, i64);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

struct PollState {
    repository: Arc<dyn BackplaneRepository>,
    channel: String,
    subscriber_id: String,
    poll_interval: Duration,
    batch_size: i64,
    buffer: VecDeque<(BackplaneEnvelope, i64)>,
    polled_once: bool,
    skip_next_wait: bool,
    /// Last id seen in the current pass over the pending rows; 0 starts a
    /// new pass from the oldest pending message
    cursor: i64,
    shutdown: Option<watch::Receiver<bool>>,
}

async fn next_message(
    mut state: PollState,
) -> Option<((BackplaneEnvelope, i64), PollState)> {
    loop {
        if let Some(item) = state.buffer.pop_front() {
            return Some((item, state));
        }

        if state.polled_once && !state.skip_next_wait {
            if !state.wait().await {
                debug!(channel = %state.channel, "Subscription stopped");
                return None;
            }
        } else if state.is_shutdown() {
            return None;
        }

        state.polled_once = true;
        state.poll().await;
    }
}

impl PollState {
    fn is_shutdown(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleep one poll interval. Returns false when shutdown was signalled.
    async fn wait(&mut self) -> bool {
        let interval = self.poll_interval;

        match self.shutdown.as_mut() {
            None => {
                tokio::time::sleep(interval).await;
                true
            }
            Some(rx) => {
                if *rx.borrow() {
                    return false;
                }
                let sender_dropped = tokio::select! {
                    _ = tokio::time::sleep(interval) => false,
                    changed = rx.changed() => changed.is_err(),
                };
                !sender_dropped && !*rx.borrow()
            }
        }
    }

    async fn poll(&mut self) {
        let rows = match self
            .repository
            .fetch_pending(
                &self.channel,
                &self.subscriber_id,
                self.cursor,
                self.batch_size,
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(
                    channel = %self.channel,
                    subscriber_id = %self.subscriber_id,
                    error = %e,
                    "Backplane poll failed, retrying next cycle"
                );
                self.skip_next_wait = false;
                return;
            }
        };

        // A full page continues the pass past its last id right away, so rows
        // that are never acked cannot hide newer ones. A partial page ends the
        // pass; the next one restarts from the oldest pending row after a wait.
        match rows.last() {
            Some(last) if rows.len() as i64 >= self.batch_size => {
                self.cursor = last.id;
                self.skip_next_wait = true;
            }
            _ => {
                self.cursor = 0;
                self.skip_next_wait = false;
            }
        }

        debug!(
            channel = %self.channel,
            subscriber_id = %self.subscriber_id,
            count = rows.len(),
            cursor = self.cursor,
            "Polled backplane"
        );

        for row in rows {
            let message_id = row.id;
            match row.decode() {
                Ok(message) => self.buffer.push_back((message.payload, message_id)),
                Err(e) => error!(
                    message_id,
                    channel = %self.channel,
                    error = %e,
                    "Skipping undecodable backplane payload"
                ),
            }
        }
    }
}
