//! Dispatcher and hub behaviour against the in-process repository.

use async_trait::async_trait;
use serde_json::{json, Value};
use sql_backplane::models::{AckCandidate, StoredMessage};
use sql_backplane::{
    BackplaneConfig, BackplaneEnvelope, BackplaneError, BackplaneHub, BackplaneRepository,
    BackplaneResult, BackplaneRuntime, BackplaneStore, ChannelConnection, CleanupMode,
    CleanupStrategy, ConnectionRegistry, DispatcherState, HubConnection, HubMessage,
    InMemoryBackplaneRepository, NotificationType, HUB_CHANNEL,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn create_hub(
    repository: &Arc<InMemoryBackplaneRepository>,
    subscriber_id: &str,
) -> BackplaneHub {
    let config = BackplaneConfig::default()
        .with_subscriber_id(subscriber_id)
        .with_poll_interval(Duration::from_millis(20));
    let store = BackplaneStore::new(repository.clone(), config)
        .await
        .expect("Failed to bootstrap store");
    BackplaneHub::new(store, ConnectionRegistry::new())
}

async fn connect(
    hub: &BackplaneHub,
    connection_id: &str,
    user: Option<&str>,
) -> UnboundedReceiver<String> {
    let (connection, frames) = ChannelConnection::new(connection_id, user.map(str::to_string));
    hub.on_connected(Arc::new(connection)).await.unwrap();
    frames
}

async fn recv_frame(frames: &mut UnboundedReceiver<String>) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .expect("Timed out waiting for frame")
        .expect("Connection channel closed");
    serde_json::from_str(&frame).expect("Frame is not JSON")
}

fn no_frame(frames: &mut UnboundedReceiver<String>) -> bool {
    frames.try_recv().is_err()
}

fn spawn_dispatcher(hub: &BackplaneHub) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = hub.dispatcher();
    let handle = tokio::spawn(async move { dispatcher.run(shutdown_rx).await });
    (shutdown_tx, handle)
}

async fn wait_for_acks(
    repository: &InMemoryBackplaneRepository,
    message_id: i64,
    expected: usize,
) {
    for _ in 0..100 {
        if repository.ack_count(message_id) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("message {} never reached {} acks", message_id, expected);
}

struct FailingConnection {
    connection_id: String,
}

#[async_trait]
impl HubConnection for FailingConnection {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn user_identifier(&self) -> Option<&str> {
        None
    }

    async fn write(&self, _message: &HubMessage) -> BackplaneResult<()> {
        Err(BackplaneError::Delivery {
            connection_id: self.connection_id.clone(),
            reason: "socket reset".to_string(),
        })
    }
}

/// In-memory repository whose subscriber upserts and polls take as long as a
/// database round trip.
struct DelayedRepository {
    inner: Arc<InMemoryBackplaneRepository>,
    delay: Duration,
}

#[async_trait]
impl BackplaneRepository for DelayedRepository {
    async fn provision_schema(&self) -> BackplaneResult<()> {
        self.inner.provision_schema().await
    }

    async fn verify_schema(&self) -> BackplaneResult<()> {
        self.inner.verify_schema().await
    }

    async fn insert_message(&self, channel: &str, payload: &Value) -> BackplaneResult<i64> {
        self.inner.insert_message(channel, payload).await
    }

    async fn fetch_pending(
        &self,
        channel: &str,
        subscriber_id: &str,
        after_id: i64,
        limit: i64,
    ) -> BackplaneResult<Vec<StoredMessage>> {
        tokio::time::sleep(self.delay).await;
        self.inner
            .fetch_pending(channel, subscriber_id, after_id, limit)
            .await
    }

    async fn insert_ack(&self, message_id: i64, subscriber_id: &str) -> BackplaneResult<bool> {
        self.inner.insert_ack(message_id, subscriber_id).await
    }

    async fn upsert_subscriber(&self, subscriber_id: &str) -> BackplaneResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.upsert_subscriber(subscriber_id).await
    }

    async fn active_subscribers(&self, timeout: Duration) -> BackplaneResult<Vec<String>> {
        self.inner.active_subscribers(timeout).await
    }

    async fn ack_candidates(
        &self,
        min_acks: i64,
        after_id: i64,
        limit: i64,
    ) -> BackplaneResult<Vec<AckCandidate>> {
        self.inner.ack_candidates(min_acks, after_id, limit).await
    }

    async fn expired_messages(
        &self,
        retention: Duration,
        after_id: i64,
        limit: i64,
    ) -> BackplaneResult<Vec<i64>> {
        self.inner.expired_messages(retention, after_id, limit).await
    }

    async fn delete_messages(&self, message_ids: &[i64], mode: CleanupMode) -> BackplaneResult<u64> {
        self.inner.delete_messages(message_ids, mode).await
    }
}

#[tokio::test]
async fn test_dispatch_resolves_each_addressing_type() {
    init_tracing();
    let repository = Arc::new(InMemoryBackplaneRepository::new());
    let hub = create_hub(&repository, "server-a").await;

    let mut c1 = connect(&hub, "c1", Some("alice")).await;
    let mut c2 = connect(&hub, "c2", Some("bob")).await;
    let mut c3 = connect(&hub, "c3", None).await;
    hub.add_to_group("c1", "admins").await;
    hub.add_to_group("c2", "ops").await;
    hub.add_to_group("c3", "ops").await;

    let dispatcher = hub.dispatcher();
    let cases = vec![
        (NotificationType::All, vec![], vec![true, true, true]),
        (NotificationType::User, vec!["bob"], vec![false, true, false]),
        (NotificationType::Group, vec!["ops", "admins"], vec![false, true, true]),
        (NotificationType::Groups, vec!["ops", "admins"], vec![true, true, true]),
        (NotificationType::Conn, vec!["c3", "c1"], vec![false, false, true]),
        (NotificationType::Conns, vec!["c1", "c3", "remote"], vec![true, false, true]),
    ];

    for (kind, targets, expected) in cases {
        let envelope = BackplaneEnvelope::invocation(
            kind,
            targets.iter().map(|t| t.to_string()).collect(),
            "Notify",
            vec![json!("payload")],
        );
        let outcome = dispatcher.dispatch(&envelope, 1).await.unwrap();
        assert_eq!(
            outcome.delivered,
            expected.iter().filter(|e| **e).count(),
            "{:?}",
            kind
        );

        for (frames, should_receive) in [&mut c1, &mut c2, &mut c3].into_iter().zip(expected) {
            if should_receive {
                let frame = recv_frame(frames).await;
                assert_eq!(frame["type"], "invocation");
                assert_eq!(frame["target"], "Notify");
                assert_eq!(frame["arguments"], json!(["payload"]));
            } else {
                assert!(no_frame(frames), "{:?} delivered to an unaddressed connection", kind);
            }
        }
    }
}

#[tokio::test]
async fn test_exclusions_apply_to_every_type() {
    let repository = Arc::new(InMemoryBackplaneRepository::new());
    let hub = create_hub(&repository, "server-a").await;

    let mut c1 = connect(&hub, "c1", Some("alice")).await;
    let mut c2 = connect(&hub, "c2", Some("alice")).await;
    hub.add_to_group("c1", "room").await;
    hub.add_to_group("c2", "room").await;

    let dispatcher = hub.dispatcher();
    for (kind, targets) in [
        (NotificationType::All, vec![]),
        (NotificationType::User, vec!["alice".to_string()]),
        (NotificationType::Group, vec!["room".to_string()]),
        (NotificationType::Conns, vec!["c1".to_string(), "c2".to_string()]),
    ] {
        let envelope = BackplaneEnvelope::invocation(kind, targets, "Notify", Vec::new())
            .with_excluded(vec!["c2".to_string()]);
        let outcome = dispatcher.dispatch(&envelope, 1).await.unwrap();
        assert_eq!(outcome.resolved, 1, "{:?}", kind);

        recv_frame(&mut c1).await;
        assert!(no_frame(&mut c2));
    }
}

#[tokio::test]
async fn test_text_message_is_delivered_as_simple_message() {
    let repository = Arc::new(InMemoryBackplaneRepository::new());
    let hub = create_hub(&repository, "server-a").await;
    let mut c1 = connect(&hub, "c1", None).await;

    let envelope = BackplaneEnvelope::text(
        NotificationType::Conn,
        vec!["c1".to_string()],
        Some("Status".to_string()),
        "Hello",
    );
    hub.dispatcher().dispatch(&envelope, 1).await.unwrap();

    let frame = recv_frame(&mut c1).await;
    assert_eq!(frame["type"], "simple");
    assert_eq!(frame["category"], "Status");
    assert_eq!(frame["messageText"], "Hello");
}

#[tokio::test]
async fn test_send_group_round_trips_through_the_store() {
    let repository = Arc::new(InMemoryBackplaneRepository::new());
    let hub = create_hub(&repository, "server-a").await;

    let mut member = connect(&hub, "c1", None).await;
    let mut outsider = connect(&hub, "c2", None).await;
    hub.add_to_group("c1", "admins").await;

    let (shutdown_tx, handle) = spawn_dispatcher(&hub);

    let message_id = hub
        .send_group("admins", "Notify", vec![json!("deploy")])
        .await
        .unwrap();
    let frame = recv_frame(&mut member).await;
    assert_eq!(frame["arguments"], json!(["deploy"]));

    wait_for_acks(&repository, message_id, 1).await;
    assert!(no_frame(&mut outsider));

    // sends go through the hub channel only
    let stored = repository.get_message(message_id).unwrap();
    assert_eq!(stored.channel, HUB_CHANNEL);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_failing_connection_does_not_block_others_or_ack() {
    let repository = Arc::new(InMemoryBackplaneRepository::new());
    let hub = create_hub(&repository, "server-a").await;

    hub.on_connected(Arc::new(FailingConnection {
        connection_id: "broken".to_string(),
    }))
    .await
    .unwrap();
    let mut healthy = connect(&hub, "healthy", None).await;

    let outcome = hub
        .dispatcher()
        .dispatch(
            &BackplaneEnvelope::invocation(NotificationType::All, Vec::new(), "Ping", Vec::new()),
            1,
        )
        .await
        .unwrap();
    assert_eq!(outcome.resolved, 2);
    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.failed, 1);
    recv_frame(&mut healthy).await;

    let (shutdown_tx, handle) = spawn_dispatcher(&hub);
    let message_id = hub.send_all("Ping", Vec::new()).await.unwrap();
    recv_frame(&mut healthy).await;
    wait_for_acks(&repository, message_id, 1).await;

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_malformed_envelope_is_not_acked_and_loop_continues() {
    init_tracing();
    let repository = Arc::new(InMemoryBackplaneRepository::new());
    let hub = create_hub(&repository, "server-a").await;
    let mut c1 = connect(&hub, "c1", None).await;

    let (shutdown_tx, handle) = spawn_dispatcher(&hub);

    // invocation without a method
    let malformed = hub
        .publish_envelope(&BackplaneEnvelope::default())
        .await
        .unwrap();
    let valid = hub.send_all("Notify", vec![json!(1)]).await.unwrap();

    let frame = recv_frame(&mut c1).await;
    assert_eq!(frame["target"], "Notify");
    wait_for_acks(&repository, valid, 1).await;

    // give the dispatcher a few more polls at the malformed message
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(repository.ack_count(malformed), 0);
    assert!(no_frame(&mut c1));

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_malformed_backlog_larger_than_a_batch_does_not_block_delivery() {
    let repository = Arc::new(InMemoryBackplaneRepository::new());
    let mut config = BackplaneConfig::default()
        .with_subscriber_id("server-a")
        .with_poll_interval(Duration::from_millis(20));
    config.poll_batch_size = 2;
    let store = BackplaneStore::new(repository.clone(), config).await.unwrap();
    let hub = BackplaneHub::new(store, ConnectionRegistry::new());
    let mut c1 = connect(&hub, "c1", None).await;

    let mut malformed = Vec::new();
    for _ in 0..3 {
        malformed.push(
            hub.publish_envelope(&BackplaneEnvelope::default())
                .await
                .unwrap(),
        );
    }
    let valid = hub.send_all("Notify", vec![json!("behind")]).await.unwrap();

    let (shutdown_tx, handle) = spawn_dispatcher(&hub);

    let frame = recv_frame(&mut c1).await;
    assert_eq!(frame["target"], "Notify");
    assert_eq!(frame["arguments"][0], "behind");
    wait_for_acks(&repository, valid, 1).await;
    for id in malformed {
        assert_eq!(repository.ack_count(id), 0);
    }

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_two_processes_sharing_one_store() {
    let repository = Arc::new(InMemoryBackplaneRepository::new());
    let hub_a = create_hub(&repository, "server-a").await;
    let hub_b = create_hub(&repository, "server-b").await;

    let mut on_a = connect(&hub_a, "conn-a", Some("alice")).await;
    let mut on_b = connect(&hub_b, "conn-b", Some("bob")).await;

    let (stop_a, task_a) = spawn_dispatcher(&hub_a);
    let (stop_b, task_b) = spawn_dispatcher(&hub_b);

    let broadcast = hub_a.send_all("Announce", vec![json!("hi")]).await.unwrap();
    assert_eq!(recv_frame(&mut on_a).await["target"], "Announce");
    assert_eq!(recv_frame(&mut on_b).await["target"], "Announce");
    wait_for_acks(&repository, broadcast, 2).await;

    // sent from B, held by A
    let direct = hub_b
        .send_connection("conn-a", "Direct", Vec::new())
        .await
        .unwrap();
    assert_eq!(recv_frame(&mut on_a).await["target"], "Direct");
    wait_for_acks(&repository, direct, 2).await;
    assert!(no_frame(&mut on_b));

    let to_user = hub_a.send_user("bob", "ForBob", Vec::new()).await.unwrap();
    assert_eq!(recv_frame(&mut on_b).await["target"], "ForBob");
    wait_for_acks(&repository, to_user, 2).await;
    assert!(no_frame(&mut on_a));

    stop_a.send(true).unwrap();
    stop_b.send(true).unwrap();
    task_a.await.unwrap();
    task_b.await.unwrap();
}

#[tokio::test]
async fn test_dispatcher_state_reaches_stopped() {
    let repository = Arc::new(InMemoryBackplaneRepository::new());
    let hub = create_hub(&repository, "server-a").await;

    let dispatcher = hub.dispatcher();
    let mut state = dispatcher.state();
    assert_eq!(*state.borrow(), DispatcherState::Starting);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { dispatcher.run(shutdown_rx).await });

    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == DispatcherState::Polling),
    )
    .await
    .expect("dispatcher never started polling")
    .unwrap();

    drop(shutdown_tx);
    handle.await.unwrap();
    assert_eq!(*state.borrow(), DispatcherState::Stopped);
}

#[tokio::test]
async fn test_disconnect_removes_group_memberships() {
    let repository = Arc::new(InMemoryBackplaneRepository::new());
    let hub = create_hub(&repository, "server-a").await;

    let _frames = connect(&hub, "c1", None).await;
    hub.add_to_group("c1", "room").await;
    assert_eq!(hub.registry().group_members("room").await, vec!["c1"]);

    hub.on_disconnected("c1").await;
    assert!(hub.registry().group_members("room").await.is_empty());
    assert!(hub.registry().is_empty().await);

    let outcome = hub
        .dispatcher()
        .dispatch(
            &BackplaneEnvelope::invocation(
                NotificationType::Conn,
                vec!["c1".to_string()],
                "Notify",
                Vec::new(),
            ),
            1,
        )
        .await
        .unwrap();
    assert_eq!(outcome.resolved, 0);
}

#[tokio::test]
async fn test_connections_register_as_subscribers_when_enabled() {
    let repository = Arc::new(InMemoryBackplaneRepository::new());
    let mut config = BackplaneConfig::default().with_subscriber_id("server-a");
    config.register_connections = true;
    let store = BackplaneStore::new(repository.clone(), config).await.unwrap();
    let hub = BackplaneHub::new(store.clone(), ConnectionRegistry::new());

    let _frames = connect(&hub, "c1", None).await;
    assert_eq!(store.active_subscribers().await.unwrap(), vec!["c1"]);

    let plain = create_hub(&repository, "server-b").await;
    let _frames = connect(&plain, "c2", None).await;
    assert_eq!(store.active_subscribers().await.unwrap(), vec!["c1"]);
}

#[tokio::test]
async fn test_runtime_delivers_and_heartbeats() {
    init_tracing();
    let repository = Arc::new(InMemoryBackplaneRepository::new());
    let hub = create_hub(&repository, "server-a").await;
    let mut frames = connect(&hub, "c1", None).await;

    let runtime = BackplaneRuntime::spawn(&hub).await.unwrap();
    assert_eq!(
        hub.store().active_subscribers().await.unwrap(),
        vec!["server-a"]
    );

    let message_id = hub.send_all("Notify", Vec::new()).await.unwrap();
    assert_eq!(recv_frame(&mut frames).await["target"], "Notify");
    wait_for_acks(&repository, message_id, 1).await;
    assert_ne!(*runtime.dispatcher_state().borrow(), DispatcherState::Stopped);

    let mut state = runtime.dispatcher_state();
    tokio::time::timeout(Duration::from_secs(2), runtime.shutdown())
        .await
        .expect("runtime did not shut down");
    assert_eq!(*state.borrow_and_update(), DispatcherState::Stopped);
}

#[tokio::test]
async fn test_runtime_registers_before_first_cleanup_cycle() {
    init_tracing();
    let repository = Arc::new(InMemoryBackplaneRepository::new());
    let delayed = Arc::new(DelayedRepository {
        inner: repository.clone(),
        delay: Duration::from_millis(30),
    });
    let config = BackplaneConfig::default()
        .with_subscriber_id("server-a")
        .with_poll_interval(Duration::from_millis(20))
        .with_cleanup(CleanupStrategy::AckBased, CleanupMode::Logical);
    let store = BackplaneStore::new(delayed, config).await.unwrap();
    let hub = BackplaneHub::new(store, ConnectionRegistry::new());
    let mut frames = connect(&hub, "c1", None).await;

    // published while no process is registered
    let message_id = hub.send_all("Notify", Vec::new()).await.unwrap();

    let runtime = BackplaneRuntime::spawn(&hub).await.unwrap();

    assert_eq!(recv_frame(&mut frames).await["target"], "Notify");
    wait_for_acks(&repository, message_id, 1).await;
    assert!(!repository.get_message(message_id).unwrap().is_deleted);

    tokio::time::timeout(Duration::from_secs(2), runtime.shutdown())
        .await
        .expect("runtime did not shut down");
}

#[tokio::test]
async fn test_runtime_does_not_start_when_registration_fails() {
    let repository = Arc::new(InMemoryBackplaneRepository::new());
    let hub = create_hub(&repository, "server-a").await;

    repository.set_unavailable(true);
    let err = BackplaneRuntime::spawn(&hub).await.err().unwrap();
    assert!(err.is_transient());

    repository.set_unavailable(false);
    assert!(hub.store().active_subscribers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_connection_subscribers_hold_cleanup_until_stale() {
    let repository = Arc::new(InMemoryBackplaneRepository::new());
    let mut config = BackplaneConfig::default()
        .with_subscriber_id("server-a")
        .with_cleanup(CleanupStrategy::AckBased, CleanupMode::Physical);
    config.register_connections = true;
    let store = BackplaneStore::new(repository.clone(), config).await.unwrap();
    store.register_subscriber("server-a").await.unwrap();
    let hub = BackplaneHub::new(store.clone(), ConnectionRegistry::new());
    let _frames = connect(&hub, "c1", None).await;

    let message_id = hub.send_all("Notify", Vec::new()).await.unwrap();
    store.ack_for_current(message_id).await.unwrap();

    // "c1" is live but never acks on its own
    let report = store.run_cleaner().await.unwrap();
    assert_eq!(report.deleted, 0);
    assert!(repository.get_message(message_id).is_some());

    repository.backdate_subscriber("c1", Duration::from_secs(120));
    let report = store.run_cleaner().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(repository.get_message(message_id).is_none());
}
