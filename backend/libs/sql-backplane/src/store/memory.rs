//! In-process implementation of [`BackplaneRepository`].
//!
//! Gives single-process development and the test-suite the same semantics
//! as the PostgreSQL tables: monotonic ids, one ack per
//! `(message, subscriber)`, acks removed together with their message.

use super::BackplaneRepository;
use crate::config::CleanupMode;
use crate::error::{BackplaneError, BackplaneResult};
use crate::models::{AckCandidate, BackplaneAck, BackplaneSubscriber, StoredMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Default)]
struct MemoryState {
    schema_ready: bool,
    next_message_id: i64,
    next_ack_id: i64,
    messages: BTreeMap<i64, StoredMessage>,
    acks: BTreeMap<i64, BTreeMap<String, BackplaneAck>>,
    subscribers: HashMap<String, BackplaneSubscriber>,
}

#[derive(Default)]
pub struct InMemoryBackplaneRepository {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl InMemoryBackplaneRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate lost connectivity: every operation fails with
    /// `StoreUnavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Move a message's `created_at` into the past.
    pub fn backdate_message(&self, message_id: i64, age: Duration) {
        let mut state = self.state.lock();
        if let Some(message) = state.messages.get_mut(&message_id) {
            message.created_at = Utc::now() - to_chrono(age);
        }
    }

    /// Move a subscriber's `last_seen` into the past.
    pub fn backdate_subscriber(&self, subscriber_id: &str, age: Duration) {
        let mut state = self.state.lock();
        if let Some(subscriber) = state.subscribers.get_mut(subscriber_id) {
            subscriber.last_seen = Utc::now() - to_chrono(age);
        }
    }

    /// Store a raw payload as-is, bypassing envelope serialization.
    pub fn insert_raw(&self, channel: &str, payload: serde_json::Value) -> i64 {
        let mut state = self.state.lock();
        state.next_message_id += 1;
        let id = state.next_message_id;
        state.messages.insert(
            id,
            StoredMessage {
                id,
                channel: channel.to_string(),
                payload,
                created_at: Utc::now(),
                is_deleted: false,
            },
        );
        id
    }

    /// Number of message rows, deleted or not.
    pub fn message_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// Snapshot of a message row, deleted or not.
    pub fn get_message(&self, message_id: i64) -> Option<StoredMessage> {
        self.state.lock().messages.get(&message_id).cloned()
    }

    /// Number of acks recorded for a message.
    pub fn ack_count(&self, message_id: i64) -> usize {
        self.state.lock().acks.get(&message_id).map_or(0, BTreeMap::len)
    }

    fn check_available(&self) -> BackplaneResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackplaneError::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 1000))
}

fn cutoff(window: Duration) -> Option<DateTime<Utc>> {
    Utc::now().checked_sub_signed(to_chrono(window))
}

#[async_trait]
impl BackplaneRepository for InMemoryBackplaneRepository {
    async fn provision_schema(&self) -> BackplaneResult<()> {
        self.check_available()?;
        self.state.lock().schema_ready = true;
        Ok(())
    }

    async fn verify_schema(&self) -> BackplaneResult<()> {
        self.check_available()?;
        if !self.state.lock().schema_ready {
            return Err(BackplaneError::SchemaUnavailable(
                "table backplane_messages does not exist".to_string(),
            ));
        }
        Ok(())
    }

    async fn insert_message(
        &self,
        channel: &str,
        payload: &serde_json::Value,
    ) -> BackplaneResult<i64> {
        self.check_available()?;
        Ok(self.insert_raw(channel, payload.clone()))
    }

    async fn fetch_pending(
        &self,
        channel: &str,
        subscriber_id: &str,
        after_id: i64,
        limit: i64,
    ) -> BackplaneResult<Vec<StoredMessage>> {
        self.check_available()?;
        let state = self.state.lock();

        let pending = state
            .messages
            .range(after_id.saturating_add(1)..)
            .map(|(_, m)| m)
            .filter(|m| m.channel == channel && !m.is_deleted)
            .filter(|m| {
                state
                    .acks
                    .get(&m.id)
                    .map_or(true, |acks| !acks.contains_key(subscriber_id))
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect();

        Ok(pending)
    }

    async fn insert_ack(&self, message_id: i64, subscriber_id: &str) -> BackplaneResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();

        if !state.messages.contains_key(&message_id) {
            return Ok(false);
        }
        if state
            .acks
            .get(&message_id)
            .is_some_and(|acks| acks.contains_key(subscriber_id))
        {
            return Ok(false);
        }

        state.next_ack_id += 1;
        let ack = BackplaneAck {
            id: state.next_ack_id,
            message_id,
            subscriber_id: subscriber_id.to_string(),
            acknowledged_at: Utc::now(),
        };
        state
            .acks
            .entry(message_id)
            .or_default()
            .insert(subscriber_id.to_string(), ack);

        Ok(true)
    }

    async fn upsert_subscriber(&self, subscriber_id: &str) -> BackplaneResult<()> {
        self.check_available()?;
        self.state
            .lock()
            .subscribers
            .entry(subscriber_id.to_string())
            .and_modify(|subscriber| subscriber.last_seen = Utc::now())
            .or_insert_with(|| BackplaneSubscriber {
                id: subscriber_id.to_string(),
                last_seen: Utc::now(),
            });
        Ok(())
    }

    async fn active_subscribers(&self, timeout: Duration) -> BackplaneResult<Vec<String>> {
        self.check_available()?;
        let state = self.state.lock();

        let mut active: Vec<String> = match cutoff(timeout) {
            Some(since) => state
                .subscribers
                .values()
                .filter(|subscriber| subscriber.last_seen >= since)
                .map(|subscriber| subscriber.id.clone())
                .collect(),
            None => state.subscribers.keys().cloned().collect(),
        };
        active.sort();

        Ok(active)
    }

    async fn ack_candidates(
        &self,
        min_acks: i64,
        after_id: i64,
        limit: i64,
    ) -> BackplaneResult<Vec<AckCandidate>> {
        self.check_available()?;
        let state = self.state.lock();

        let candidates = state
            .messages
            .range(after_id.saturating_add(1)..)
            .filter(|(_, m)| !m.is_deleted)
            .filter_map(|(id, _)| {
                let acked_by: Vec<String> = state
                    .acks
                    .get(id)
                    .map(|acks| acks.keys().cloned().collect())
                    .unwrap_or_default();
                (acked_by.len() as i64 >= min_acks).then(|| AckCandidate {
                    message_id: *id,
                    acked_by,
                })
            })
            .take(limit.max(0) as usize)
            .collect();

        Ok(candidates)
    }

    async fn expired_messages(
        &self,
        retention: Duration,
        after_id: i64,
        limit: i64,
    ) -> BackplaneResult<Vec<i64>> {
        self.check_available()?;
        let Some(before) = cutoff(retention) else {
            return Ok(Vec::new());
        };
        let state = self.state.lock();

        let expired = state
            .messages
            .range(after_id.saturating_add(1)..)
            .filter(|(_, m)| !m.is_deleted && m.created_at < before)
            .map(|(id, _)| *id)
            .take(limit.max(0) as usize)
            .collect();

        Ok(expired)
    }

    async fn delete_messages(&self, message_ids: &[i64], mode: CleanupMode) -> BackplaneResult<u64> {
        self.check_available()?;
        let mut state = self.state.lock();
        let mut affected = 0u64;

        for message_id in message_ids {
            match mode {
                CleanupMode::Logical => {
                    if let Some(message) = state.messages.get_mut(message_id) {
                        if !message.is_deleted {
                            message.is_deleted = true;
                            affected += 1;
                        }
                    }
                }
                CleanupMode::Physical => {
                    state.acks.remove(message_id);
                    if state.messages.remove(message_id).is_some() {
                        affected += 1;
                    }
                }
            }
        }

        Ok(affected)
    }
}
