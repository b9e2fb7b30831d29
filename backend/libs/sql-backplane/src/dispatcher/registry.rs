use crate::envelope::{BackplaneEnvelope, HubMessage, NotificationType};
use crate::error::{BackplaneError, BackplaneResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};

/// A client connection held by this process.
///
/// The transport that owns the physical connection implements this; the
/// backplane only needs an id, an optional user identity and a way to write
/// one decoded message.
#[async_trait]
pub trait HubConnection: Send + Sync {
    fn connection_id(&self) -> &str;

    fn user_identifier(&self) -> Option<&str>;

    async fn write(&self, message: &HubMessage) -> BackplaneResult<()>;
}

/// Connection that forwards serialized JSON frames to a channel pumped by
/// the transport.
pub struct ChannelConnection {
    connection_id: String,
    user_identifier: Option<String>,
    sender: UnboundedSender<String>,
}

impl ChannelConnection {
    /// Returns the connection and the receiver the transport should drain.
    pub fn new(
        connection_id: impl Into<String>,
        user_identifier: Option<String>,
    ) -> (Self, UnboundedReceiver<String>) {
        let (sender, receiver) = unbounded_channel();
        let connection = Self {
            connection_id: connection_id.into(),
            user_identifier,
            sender,
        };
        (connection, receiver)
    }
}

#[async_trait]
impl HubConnection for ChannelConnection {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn user_identifier(&self) -> Option<&str> {
        self.user_identifier.as_deref()
    }

    async fn write(&self, message: &HubMessage) -> BackplaneResult<()> {
        let frame = message.to_json()?;
        self.sender
            .send(frame)
            .map_err(|_| BackplaneError::Delivery {
                connection_id: self.connection_id.clone(),
                reason: "connection channel closed".to_string(),
            })
    }
}

/// Connections and group memberships local to this process.
///
/// Cloning shares the same state.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    // connection_id -> connection
    connections: Arc<RwLock<HashMap<String, Arc<dyn HubConnection>>>>,
    // group name -> connection ids
    groups: Arc<RwLock<HashMap<String, HashSet<String>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, connection: Arc<dyn HubConnection>) {
        let connection_id = connection.connection_id().to_string();
        let mut guard = self.connections.write().await;
        guard.insert(connection_id.clone(), connection);

        tracing::debug!(
            connection_id = %connection_id,
            total = guard.len(),
            "Connection added to registry"
        );
    }

    /// Remove a connection and all of its group memberships.
    ///
    /// Returns whether the connection was registered.
    pub async fn remove(&self, connection_id: &str) -> bool {
        {
            let mut groups = self.groups.write().await;
            groups.retain(|_, members| {
                members.remove(connection_id);
                !members.is_empty()
            });
        }

        let removed = self.connections.write().await.remove(connection_id).is_some();
        if removed {
            tracing::debug!(connection_id = %connection_id, "Connection removed from registry");
        }
        removed
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<dyn HubConnection>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn add_to_group(&self, connection_id: &str, group: &str) {
        self.groups
            .write()
            .await
            .entry(group.to_string())
            .or_default()
            .insert(connection_id.to_string());

        tracing::debug!(connection_id = %connection_id, group = %group, "Joined group");
    }

    pub async fn remove_from_group(&self, connection_id: &str, group: &str) {
        let mut groups = self.groups.write().await;
        if let Some(members) = groups.get_mut(group) {
            members.remove(connection_id);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    pub async fn group_members(&self, group: &str) -> Vec<String> {
        self.groups
            .read()
            .await
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Local connections addressed by `envelope`, minus its exclusions.
    pub async fn resolve(&self, envelope: &BackplaneEnvelope) -> Vec<Arc<dyn HubConnection>> {
        let resolved: Vec<Arc<dyn HubConnection>> = match envelope.kind {
            NotificationType::All => self.connections.read().await.values().cloned().collect(),
            NotificationType::User => {
                let users: HashSet<&str> = envelope.targets.iter().map(String::as_str).collect();
                self.connections
                    .read()
                    .await
                    .values()
                    .filter(|c| c.user_identifier().is_some_and(|u| users.contains(u)))
                    .cloned()
                    .collect()
            }
            NotificationType::Group => {
                let ids = match envelope.primary_target() {
                    Some(group) => self.group_members(group).await,
                    None => Vec::new(),
                };
                self.lookup(ids).await
            }
            NotificationType::Groups => {
                let ids: HashSet<String> = {
                    let groups = self.groups.read().await;
                    envelope
                        .targets
                        .iter()
                        .filter_map(|group| groups.get(group))
                        .flatten()
                        .cloned()
                        .collect()
                };
                self.lookup(ids).await
            }
            NotificationType::Conn => {
                self.lookup(envelope.primary_target().map(str::to_string))
                    .await
            }
            NotificationType::Conns => {
                let ids: HashSet<String> = envelope.targets.iter().cloned().collect();
                self.lookup(ids).await
            }
        };

        resolved
            .into_iter()
            .filter(|c| !envelope.is_excluded(c.connection_id()))
            .collect()
    }

    async fn lookup(&self, ids: impl IntoIterator<Item = String>) -> Vec<Arc<dyn HubConnection>> {
        let connections = self.connections.read().await;
        ids.into_iter()
            .filter_map(|id| connections.get(&id).cloned())
            .collect()
    }
}
