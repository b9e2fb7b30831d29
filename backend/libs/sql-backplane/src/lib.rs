//! # SQL Backplane
//!
//! Lets several server processes that share nothing but one PostgreSQL
//! database fan out real-time events to their locally held client
//! connections as if they were a single server.
//!
//! ## How it works
//!
//! ```text
//! send_* ─▶ BackplaneStore::publish ─▶ backplane_messages
//!                                            │ (poll)
//!              ┌─────────────────────────────┴──────────────────────┐
//!        Dispatcher (process A)                           Dispatcher (process B)
//!    resolve ─▶ write ─▶ ack(A)                        resolve ─▶ write ─▶ ack(B)
//!                                            │
//!                               BackplaneCleaner reclaims once
//!                        every live subscriber acked, or after retention
//! ```
//!
//! - **At-least-once**: a message stays pending for a subscriber until that
//!   subscriber acknowledges it; unacknowledged messages are polled again.
//! - **Ordering**: within a channel messages are delivered by ascending id.
//! - **Liveness**: each process heartbeats its subscriber row; subscribers
//!   silent for longer than the heartbeat timeout no longer hold messages.
//! - **Bounded growth**: the cleaner removes (or flags) acknowledged and
//!   expired messages in small transactions.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use sql_backplane::{
//!     BackplaneConfig, BackplaneHub, BackplaneRuntime, BackplaneStore, ChannelConnection,
//!     ConnectionRegistry,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = BackplaneStore::connect(BackplaneConfig::from_env()).await?;
//! let hub = BackplaneHub::new(store, ConnectionRegistry::new());
//! let runtime = BackplaneRuntime::spawn(&hub).await?;
//!
//! // transport side: one channel per client connection
//! let (connection, mut frames) = ChannelConnection::new("conn-1", Some("alice".to_string()));
//! hub.on_connected(Arc::new(connection)).await?;
//! hub.add_to_group("conn-1", "admins").await;
//!
//! // reaches conn-1 through whichever process holds it
//! hub.send_group("admins", "Notify", vec![serde_json::json!("deploy started")])
//!     .await?;
//! let _frame = frames.recv().await;
//!
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cleaner;
pub mod config;
pub mod dispatcher;
pub mod envelope;
mod error;
pub mod heartbeat;
pub mod metrics;
pub mod models;
pub mod runtime;
pub mod store;

pub use cleaner::{BackplaneCleaner, CleanupReport};
pub use config::{BackplaneConfig, CleanupMode, CleanupStrategy};
pub use dispatcher::{
    BackplaneHub, ChannelConnection, ConnectionRegistry, DispatchOutcome, Dispatcher,
    DispatcherState, HubConnection, HUB_CHANNEL,
};
pub use envelope::{BackplaneEnvelope, HubMessage, NotificationType};
pub use error::{BackplaneError, BackplaneResult};
pub use heartbeat::Heartbeat;
pub use metrics::BackplaneMetrics;
pub use models::{BackplaneAck, BackplaneMessage, BackplaneSubscriber};
pub use runtime::BackplaneRuntime;
pub use store::{
    BackplaneRepository, BackplaneStore, InMemoryBackplaneRepository, PgBackplaneRepository,
    Subscription,
};
