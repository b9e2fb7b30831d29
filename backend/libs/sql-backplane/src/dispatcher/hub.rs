use super::registry::{ConnectionRegistry, HubConnection};
use super::{Dispatcher, HUB_CHANNEL};
use crate::envelope::{BackplaneEnvelope, NotificationType};
use crate::error::BackplaneResult;
use crate::store::BackplaneStore;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Entry point for a host: outbound sends go through the store to every
/// process, lifecycle hooks maintain this process's registry.
///
/// Sends never write to local connections directly; the local dispatcher
/// delivers them like any other process does.
#[derive(Clone)]
pub struct BackplaneHub {
    store: BackplaneStore,
    registry: ConnectionRegistry,
}

impl BackplaneHub {
    pub fn new(store: BackplaneStore, registry: ConnectionRegistry) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &BackplaneStore {
        &self.store
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Dispatcher consuming the hub channel into this hub's registry
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.store.clone(), self.registry.clone())
    }

    pub async fn send_all(&self, method: &str, args: Vec<Value>) -> BackplaneResult<i64> {
        self.invoke(NotificationType::All, Vec::new(), method, args, Vec::new())
            .await
    }

    pub async fn send_all_except(
        &self,
        method: &str,
        args: Vec<Value>,
        excluded_connection_ids: Vec<String>,
    ) -> BackplaneResult<i64> {
        self.invoke(
            NotificationType::All,
            Vec::new(),
            method,
            args,
            excluded_connection_ids,
        )
        .await
    }

    pub async fn send_user(
        &self,
        user_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> BackplaneResult<i64> {
        self.invoke(
            NotificationType::User,
            vec![user_id.to_string()],
            method,
            args,
            Vec::new(),
        )
        .await
    }

    pub async fn send_users(
        &self,
        user_ids: Vec<String>,
        method: &str,
        args: Vec<Value>,
    ) -> BackplaneResult<i64> {
        self.invoke(NotificationType::User, user_ids, method, args, Vec::new())
            .await
    }

    pub async fn send_group(
        &self,
        group: &str,
        method: &str,
        args: Vec<Value>,
    ) -> BackplaneResult<i64> {
        self.invoke(
            NotificationType::Group,
            vec![group.to_string()],
            method,
            args,
            Vec::new(),
        )
        .await
    }

    pub async fn send_group_except(
        &self,
        group: &str,
        method: &str,
        args: Vec<Value>,
        excluded_connection_ids: Vec<String>,
    ) -> BackplaneResult<i64> {
        self.invoke(
            NotificationType::Group,
            vec![group.to_string()],
            method,
            args,
            excluded_connection_ids,
        )
        .await
    }

    pub async fn send_groups(
        &self,
        groups: Vec<String>,
        method: &str,
        args: Vec<Value>,
    ) -> BackplaneResult<i64> {
        self.invoke(NotificationType::Groups, groups, method, args, Vec::new())
            .await
    }

    pub async fn send_connection(
        &self,
        connection_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> BackplaneResult<i64> {
        self.invoke(
            NotificationType::Conn,
            vec![connection_id.to_string()],
            method,
            args,
            Vec::new(),
        )
        .await
    }

    pub async fn send_connections(
        &self,
        connection_ids: Vec<String>,
        method: &str,
        args: Vec<Value>,
    ) -> BackplaneResult<i64> {
        self.invoke(NotificationType::Conns, connection_ids, method, args, Vec::new())
            .await
    }

    /// Send a simple text message; `category` is delivered alongside it.
    pub async fn send_text(
        &self,
        kind: NotificationType,
        targets: Vec<String>,
        category: Option<String>,
        text: &str,
    ) -> BackplaneResult<i64> {
        let envelope = BackplaneEnvelope::text(kind, targets, category, text);
        self.publish_envelope(&envelope).await
    }

    /// Publish a prebuilt envelope on the hub channel.
    pub async fn publish_envelope(&self, envelope: &BackplaneEnvelope) -> BackplaneResult<i64> {
        self.store.publish(HUB_CHANNEL, envelope).await
    }

    /// Track a new local connection.
    ///
    /// With `register_connections` enabled the connection id is also
    /// upserted as a subscriber. Nothing heartbeats or acks under that id,
    /// so it only delays ack-based cleanup for one `heartbeat_timeout`
    /// after the connection is made.
    pub async fn on_connected(&self, connection: Arc<dyn HubConnection>) -> BackplaneResult<()> {
        let connection_id = connection.connection_id().to_string();
        self.registry.add(connection).await;

        if self.store.config().register_connections {
            self.store.register_subscriber(&connection_id).await?;
        }

        info!(connection_id = %connection_id, "Client connected");
        Ok(())
    }

    /// Forget a local connection and its group memberships.
    pub async fn on_disconnected(&self, connection_id: &str) {
        if self.registry.remove(connection_id).await {
            info!(connection_id = %connection_id, "Client disconnected");
        } else {
            debug!(connection_id = %connection_id, "Disconnect for unknown connection");
        }
    }

    pub async fn add_to_group(&self, connection_id: &str, group: &str) {
        self.registry.add_to_group(connection_id, group).await;
    }

    pub async fn remove_from_group(&self, connection_id: &str, group: &str) {
        self.registry.remove_from_group(connection_id, group).await;
    }

    async fn invoke(
        &self,
        kind: NotificationType,
        targets: Vec<String>,
        method: &str,
        args: Vec<Value>,
        excluded: Vec<String>,
    ) -> BackplaneResult<i64> {
        let envelope =
            BackplaneEnvelope::invocation(kind, targets, method, args).with_excluded(excluded);
        self.publish_envelope(&envelope).await
    }
}
