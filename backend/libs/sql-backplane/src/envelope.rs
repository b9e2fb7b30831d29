//! Addressed envelopes and the decoded messages delivered to connections.

use crate::error::{BackplaneError, BackplaneResult};
use serde::{Deserialize, Serialize};

/// Addressing scope of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    /// Every connection
    #[default]
    All,
    /// Connections whose user identifier is in `targets`
    User,
    /// Members of the group named by `targets[0]`
    Group,
    /// The connection named by `targets[0]`
    Conn,
    /// Every connection listed in `targets`
    Conns,
    /// Members of every group listed in `targets`
    Groups,
}

/// Addressed event persisted as a message payload.
///
/// When `is_invocation_message` is true the receiving connections get
/// `method(args...)`; otherwise they get a simple message carrying
/// `message_text` with `method` as its category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackplaneEnvelope {
    #[serde(rename = "type", default)]
    pub kind: NotificationType,

    /// Connection ids, user ids or group names depending on `kind`
    #[serde(default)]
    pub targets: Vec<String>,

    #[serde(default = "default_is_invocation")]
    pub is_invocation_message: bool,

    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub args: Vec<serde_json::Value>,

    #[serde(default)]
    pub message_text: Option<String>,

    /// Connection ids that must not receive this envelope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded: Option<Vec<String>>,
}

fn default_is_invocation() -> bool {
    true
}

impl Default for BackplaneEnvelope {
    fn default() -> Self {
        Self {
            kind: NotificationType::All,
            targets: Vec::new(),
            is_invocation_message: true,
            method: None,
            args: Vec::new(),
            message_text: None,
            excluded: None,
        }
    }
}

impl BackplaneEnvelope {
    /// Create an invocation envelope
    pub fn invocation(
        kind: NotificationType,
        targets: Vec<String>,
        method: impl Into<String>,
        args: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            kind,
            targets,
            is_invocation_message: true,
            method: Some(method.into()),
            args,
            ..Self::default()
        }
    }

    /// Create a simple text envelope; `category` travels in `method`
    pub fn text(
        kind: NotificationType,
        targets: Vec<String>,
        category: Option<String>,
        message_text: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            targets,
            is_invocation_message: false,
            method: category,
            message_text: Some(message_text.into()),
            ..Self::default()
        }
    }

    /// Exclude connection ids from delivery
    pub fn with_excluded(mut self, excluded: Vec<String>) -> Self {
        self.excluded = if excluded.is_empty() {
            None
        } else {
            Some(excluded)
        };
        self
    }

    pub fn is_excluded(&self, connection_id: &str) -> bool {
        self.excluded
            .as_ref()
            .is_some_and(|ids| ids.iter().any(|id| id == connection_id))
    }

    /// First target, used by the single-target kinds (`group`, `conn`)
    pub fn primary_target(&self) -> Option<&str> {
        self.targets.first().map(String::as_str)
    }

    /// Reject invocations without a method name
    pub fn validate(&self) -> BackplaneResult<()> {
        if self.is_invocation_message
            && self.method.as_deref().map_or(true, |m| m.trim().is_empty())
        {
            return Err(BackplaneError::MalformedEnvelope(
                "method is required when isInvocationMessage is true".to_string(),
            ));
        }
        Ok(())
    }

    /// Decode into the message written to each target connection
    pub fn decode(&self) -> BackplaneResult<HubMessage> {
        self.validate()?;

        if self.is_invocation_message {
            Ok(HubMessage::Invocation {
                target: self.method.clone().unwrap_or_default(),
                arguments: self.args.clone(),
            })
        } else {
            Ok(HubMessage::Simple {
                category: self.method.clone(),
                message_text: self.message_text.clone(),
            })
        }
    }
}

/// Message delivered to a single client connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HubMessage {
    Invocation {
        target: String,
        arguments: Vec<serde_json::Value>,
    },
    Simple {
        #[serde(skip_serializing_if = "Option::is_none")]
        category: Option<String>,
        #[serde(rename = "messageText")]
        message_text: Option<String>,
    },
}

impl HubMessage {
    pub fn to_json(&self) -> BackplaneResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
