//! Persisted records of the backplane tables.

use crate::envelope::BackplaneEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A published envelope on a channel (`backplane_messages`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackplaneMessage {
    /// Monotonic id; ascending order is delivery order within a channel
    pub id: i64,
    pub channel: String,
    pub payload: BackplaneEnvelope,
    pub created_at: DateTime<Utc>,
    /// Set by logical cleanup; deleted rows are never delivered again
    pub is_deleted: bool,
}

/// One subscriber's acknowledgment of one message (`backplane_acks`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackplaneAck {
    pub id: i64,
    pub message_id: i64,
    pub subscriber_id: String,
    pub acknowledged_at: DateTime<Utc>,
}

/// Liveness row of one process instance or connection (`backplane_subscribers`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackplaneSubscriber {
    pub id: String,
    pub last_seen: DateTime<Utc>,
}

/// Raw message row as read from storage; the payload is decoded per row so a
/// single corrupt document cannot fail a whole poll.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub channel: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub is_deleted: bool,
}

impl StoredMessage {
    pub fn decode(self) -> Result<BackplaneMessage, serde_json::Error> {
        let payload = serde_json::from_value(self.payload)?;
        Ok(BackplaneMessage {
            id: self.id,
            channel: self.channel,
            payload,
            created_at: self.created_at,
            is_deleted: self.is_deleted,
        })
    }
}

/// Message that passed the cheap ack-count filter, with the ids that acked it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckCandidate {
    pub message_id: i64,
    pub acked_by: Vec<String>,
}
