use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use backoff::{Error as BackoffError, ExponentialBackoff};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::channel::{ChannelRegistry, LogicalChannel};
use crate::config::RecoveryConfig;
use crate::events::{ConnectionEvent, EventBus, EventKind, HandlerError};
use crate::lapin_transport::LapinConnector;
use crate::recovery::{RecoveryCommand, RecoverySupervisor, COMMAND_QUEUE_CAPACITY};
use crate::topology::TopologyLedger;
use crate::transport::{
    Connector, EndpointResolver, RoundRobinResolver, ShutdownEvent, ShutdownInitiator, Transport,
    TransportEvent,
};

/// AMQP reply-success, used when closing cleanly.
const REPLY_SUCCESS: u16 = 200;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("connection error: {0}")]
    Connection(#[from] lapin::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no endpoints configured")]
    NoEndpoints,
    #[error("connection is closed")]
    Closed,
    #[error("backoff error: {0}")]
    Backoff(String),
    #[error("failed to recover {kind} '{name}': {reason}")]
    Topology {
        kind: &'static str,
        name: String,
        reason: String,
    },
}

/// State shared between the connection handle, the supervisor task and the
/// event dispatcher.
pub(crate) struct Shared {
    pub(crate) config: RecoveryConfig,
    pub(crate) ledger: Arc<TopologyLedger>,
    pub(crate) registry: Arc<ChannelRegistry>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) resolver: Arc<dyn EndpointResolver>,
    pub(crate) connector: Arc<dyn Connector>,
    /// Single writer (the supervisor during recovery), many readers.
    pub(crate) transport: StdRwLock<Arc<dyn Transport>>,
    pub(crate) event_sink: mpsc::UnboundedSender<TransportEvent>,
    pub(crate) closed: AtomicBool,
    pub(crate) recovering: AtomicBool,
}

impl Shared {
    pub(crate) fn current_transport(&self) -> Arc<dyn Transport> {
        self.transport.read().unwrap().clone()
    }
}

/// A long-lived logical connection whose underlying transport may be torn
/// down and re-established any number of times. Identity, the client-provided
/// name and registered event handlers survive transport restarts; endpoint
/// and negotiated limits reflect whatever transport is currently installed.
pub struct RecoveringConnection {
    shared: Arc<Shared>,
    cancel: watch::Sender<bool>,
    supervisor_done: StdMutex<Option<oneshot::Receiver<()>>>,
}

impl RecoveringConnection {
    /// Connects against RabbitMQ through the lapin-backed transport,
    /// retrying the initial attempt with exponential backoff for up to a
    /// minute.
    pub async fn open(uri: &str, config: RecoveryConfig) -> Result<Self, RecoveryError> {
        let resolver: Arc<dyn EndpointResolver> = Arc::new(RoundRobinResolver::new([uri]));
        let connector: Arc<dyn Connector> = Arc::new(LapinConnector::new());

        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        backoff::future::retry(backoff, || async {
            info!("attempting to connect to RabbitMQ");
            Self::connect(config.clone(), resolver.clone(), connector.clone())
                .await
                .map_err(BackoffError::transient)
        })
        .await
        .map_err(|e| RecoveryError::Backoff(e.to_string()))
    }

    /// Connects through caller-supplied endpoint resolution and transport
    /// construction.
    pub async fn connect(
        config: RecoveryConfig,
        resolver: Arc<dyn EndpointResolver>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, RecoveryError> {
        let endpoint = resolver.select_one().await?;
        let transport = connector
            .connect(&endpoint, config.client_provided_name.as_deref())
            .await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        transport.register_event_listener(event_tx.clone());

        let shared = Arc::new(Shared {
            config,
            ledger: Arc::new(TopologyLedger::new()),
            registry: Arc::new(ChannelRegistry::new()),
            events: Arc::new(EventBus::new()),
            resolver,
            connector,
            transport: StdRwLock::new(transport),
            event_sink: event_tx,
            closed: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
        });

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(
            RecoverySupervisor::new(
                shared.clone(),
                command_rx,
                command_tx.clone(),
                cancel_rx.clone(),
                done_tx,
            )
            .run(),
        );
        tokio::spawn(dispatch_transport_events(
            shared.clone(),
            event_rx,
            command_tx,
            cancel_rx,
        ));

        info!(endpoint = %shared.current_transport().endpoint(), "connection established");
        Ok(Self {
            shared,
            cancel: cancel_tx,
            supervisor_done: StdMutex::new(Some(done_rx)),
        })
    }

    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst) && self.shared.current_transport().is_open()
    }

    pub fn is_recovering(&self) -> bool {
        self.shared.recovering.load(Ordering::SeqCst)
    }

    pub fn endpoint(&self) -> String {
        self.shared.current_transport().endpoint()
    }

    pub fn channel_max(&self) -> u16 {
        self.shared.current_transport().channel_max()
    }

    pub fn frame_max(&self) -> u32 {
        self.shared.current_transport().frame_max()
    }

    pub fn client_provided_name(&self) -> Option<&str> {
        self.shared.config.client_provided_name.as_deref()
    }

    /// Subscribes a handler to one event stream. Handlers run synchronously
    /// in subscription order; a handler error is re-emitted as a
    /// `CallbackException` rather than propagated.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&ConnectionEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.shared.events.subscribe(kind, handler);
    }

    /// Opens a logical channel bound to the current transport. The channel
    /// is re-attached automatically after each recovery.
    pub async fn create_channel(&self) -> Result<Arc<LogicalChannel>, RecoveryError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(RecoveryError::Closed);
        }
        let transport = self.shared.current_transport();
        let transport_channel = transport.open_channel().await?;
        Ok(ChannelRegistry::create(
            &self.shared.registry,
            self.shared.ledger.clone(),
            transport_channel,
        )
        .await)
    }

    pub async fn close(&self) -> Result<(), RecoveryError> {
        self.shutdown(false).await
    }

    pub async fn abort(&self) {
        let _ = self.shutdown(true).await;
    }

    async fn shutdown(&self, abort: bool) -> Result<(), RecoveryError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // stop the supervisor before touching the transport so a racing
        // recovery cannot resurrect a connection the user is tearing down
        let _ = self.cancel.send(true);
        let done = self.supervisor_done.lock().unwrap().take();
        if let Some(done) = done {
            let wait = self.shared.config.requested_connection_timeout;
            if timeout(wait, done).await.is_err() {
                warn!("recovery supervisor did not stop within {:?}", wait);
            }
        }

        let transport = self.shared.current_transport();
        let reply_text = if abort { "Connection aborted" } else { "Goodbye" };
        let result = if abort {
            transport
                .abort(
                    REPLY_SUCCESS,
                    reply_text,
                    self.shared.config.handshake_continuation_timeout,
                )
                .await;
            Ok(())
        } else {
            transport.close(REPLY_SUCCESS, reply_text).await
        };

        self.shared.ledger.clear();
        self.shared.registry.clear().await;
        self.shared.events.emit(ConnectionEvent::Shutdown(ShutdownEvent::new(
            ShutdownInitiator::Application,
            REPLY_SUCCESS,
            reply_text,
        )));
        result
    }
}

/// Serves the per-connection event stream: fans transport events out to
/// subscribers and turns recoverable shutdowns into `BeginRecovery` commands.
async fn dispatch_transport_events(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::Sender<RecoveryCommand>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.changed() => break,
            event = events.recv() => match event {
                None => break,
                Some(event) => event,
            },
        };
        match event {
            TransportEvent::Shutdown(event) => {
                debug!(
                    initiator = event.initiator.as_ref(),
                    code = event.reply_code,
                    "transport shutdown: {}",
                    event.reply_text
                );
                shared.events.emit(ConnectionEvent::Shutdown(event.clone()));
                if !shared.closed.load(Ordering::SeqCst) && shared.config.should_recover(&event) {
                    match commands.try_send(RecoveryCommand::BeginRecovery) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            debug!("recovery trigger already queued, coalescing")
                        }
                        Err(TrySendError::Closed(_)) => {}
                    }
                }
            }
            TransportEvent::Blocked(reason) => {
                shared.events.emit(ConnectionEvent::Blocked { reason });
            }
            TransportEvent::Unblocked => {
                shared.events.emit(ConnectionEvent::Unblocked);
            }
            TransportEvent::CallbackException { context, error } => {
                shared
                    .events
                    .emit(ConnectionEvent::CallbackException { context, error });
            }
        }
    }
    debug!("transport event dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    use lapin::types::FieldTable;
    use tokio::time::sleep;

    use super::*;
    use crate::channel::{ConsumeOptions, ExchangeDeclareOptions, QueueDeclareOptions};
    use crate::test::harness::{
        connect_mock, record_events, test_config, RecoveryProbe,
    };

    #[tokio::test]
    async fn clean_recovery_replays_recorded_topology() {
        let (connection, broker) = connect_mock(test_config(Duration::from_millis(20))).await;
        let channel = connection.create_channel().await.unwrap();

        channel
            .exchange_declare("logs", "direct", ExchangeDeclareOptions::default())
            .await
            .unwrap();
        channel
            .queue_declare("inbox", QueueDeclareOptions::default())
            .await
            .unwrap();
        channel
            .queue_bind("inbox", "logs", "k", FieldTable::default())
            .await
            .unwrap();
        let tag = channel
            .basic_consume(
                "inbox",
                ConsumeOptions {
                    consumer_tag: "worker-1".to_string(),
                    auto_ack: true,
                    ..Default::default()
                },
                |_| {},
            )
            .await
            .unwrap();
        assert_eq!(tag, "worker-1");

        let probe = RecoveryProbe::install(&connection);
        let renames = record_events(&connection, EventKind::QueueNameChanged);
        let retags = record_events(&connection, EventKind::ConsumerTagChanged);

        broker.drop_current_transport();
        probe.await_successes(1).await;

        assert_eq!(probe.successes(), 1);
        assert_eq!(probe.errors(), 0);
        assert!(renames.lock().unwrap().is_empty());
        assert!(retags.lock().unwrap().is_empty());
        assert!(connection.is_open());
        assert!(!connection.is_recovering());

        // ledger survived untouched
        let shared = &connection.shared;
        assert!(shared.ledger.exchange("logs").is_some());
        assert!(shared.ledger.queue("inbox").is_some());
        assert_eq!(shared.ledger.consumer("worker-1").unwrap().queue, "inbox");

        // everything was re-declared once, in dependency order
        let ops = broker.wire_ops();
        let count = |needle: &str| ops.iter().filter(|o| o.as_str() == needle).count();
        assert_eq!(count("exchange.declare logs direct"), 2);
        assert_eq!(count("queue.declare inbox"), 2);
        assert_eq!(count("queue.bind inbox logs"), 2);
        assert_eq!(count("basic.consume inbox worker-1"), 2);
        let last = |needle: &str| ops.iter().rposition(|o| o.as_str() == needle).unwrap();
        assert!(last("exchange.declare logs direct") < last("queue.declare inbox"));
        assert!(last("queue.declare inbox") < last("queue.bind inbox logs"));
        assert!(last("queue.bind inbox logs") < last("basic.consume inbox worker-1"));

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn server_named_queue_is_renamed_on_recovery() {
        let (connection, broker) = connect_mock(test_config(Duration::from_millis(20))).await;
        let channel = connection.create_channel().await.unwrap();

        channel
            .exchange_declare("x", "direct", ExchangeDeclareOptions::default())
            .await
            .unwrap();
        let declared = channel
            .queue_declare("", QueueDeclareOptions::default())
            .await
            .unwrap();
        assert_eq!(declared.name, "amq.gen-1");
        channel
            .queue_bind(&declared.name, "x", "", FieldTable::default())
            .await
            .unwrap();
        channel
            .basic_consume(
                &declared.name,
                ConsumeOptions {
                    consumer_tag: "t".to_string(),
                    ..Default::default()
                },
                |_| {},
            )
            .await
            .unwrap();

        let probe = RecoveryProbe::install(&connection);
        let renames = record_events(&connection, EventKind::QueueNameChanged);

        broker.drop_current_transport();
        probe.await_successes(1).await;

        let renames = renames.lock().unwrap();
        assert_eq!(renames.len(), 1);
        match &renames[0] {
            ConnectionEvent::QueueNameChanged { old, new } => {
                assert_eq!(old, "amq.gen-1");
                assert_eq!(new, "amq.gen-2");
            }
            other => panic!("unexpected event {other:?}"),
        }

        let shared = &connection.shared;
        assert!(shared.ledger.queue("amq.gen-1").is_none());
        assert!(shared.ledger.queue("amq.gen-2").is_some());
        let bindings = shared.ledger.bindings_snapshot();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].destination, "amq.gen-2");
        assert_eq!(shared.ledger.consumer("t").unwrap().queue, "amq.gen-2");

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn server_assigned_consumer_tag_is_retagged_on_recovery() {
        let (connection, broker) = connect_mock(test_config(Duration::from_millis(20))).await;
        let channel = connection.create_channel().await.unwrap();

        channel
            .queue_declare("inbox", QueueDeclareOptions::default())
            .await
            .unwrap();
        let tag = channel
            .basic_consume("inbox", ConsumeOptions::default(), |_| {})
            .await
            .unwrap();
        assert_eq!(tag, "ctag-1");

        broker.reassign_consumer_tags.store(true, Ordering::SeqCst);
        let probe = RecoveryProbe::install(&connection);
        let retags = record_events(&connection, EventKind::ConsumerTagChanged);

        broker.drop_current_transport();
        probe.await_successes(1).await;

        let retags = retags.lock().unwrap();
        assert_eq!(retags.len(), 1);
        match &retags[0] {
            ConnectionEvent::ConsumerTagChanged { old, new } => {
                assert_eq!(old, "ctag-1");
                assert_eq!(new, "ctag-2");
            }
            other => panic!("unexpected event {other:?}"),
        }

        let shared = &connection.shared;
        assert!(shared.ledger.consumer("ctag-1").is_none());
        assert_eq!(shared.ledger.consumer("ctag-2").unwrap().queue, "inbox");

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn recovery_retries_until_connect_succeeds() {
        let (connection, broker) = connect_mock(test_config(Duration::from_millis(50))).await;
        assert_eq!(broker.connect_attempts(), 1);

        broker.refuse_next_connects(2);
        let probe = RecoveryProbe::install(&connection);

        let started = Instant::now();
        broker.drop_current_transport();
        probe.await_successes(1).await;
        let elapsed = started.elapsed();

        assert_eq!(broker.connect_attempts(), 4);
        assert_eq!(probe.errors(), 2);
        assert_eq!(probe.successes(), 1);
        // three attempts, each preceded by a full recovery interval
        assert!(elapsed >= Duration::from_millis(150), "elapsed {elapsed:?}");
        assert!(connection.is_open());
        assert!(!connection.is_recovering());

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_recovery_triggers_coalesce() {
        let (connection, broker) = connect_mock(test_config(Duration::from_millis(50))).await;
        broker.refuse_next_connects(2);
        let probe = RecoveryProbe::install(&connection);

        broker.drop_current_transport();
        // the peer flaps again while the first recovery is still in flight
        broker.drop_current_transport();
        probe.await_successes(1).await;
        sleep(Duration::from_millis(150)).await;

        assert_eq!(probe.successes(), 1);
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn back_to_back_recoveries_replay_the_same_ledger() {
        let (connection, broker) = connect_mock(test_config(Duration::from_millis(20))).await;
        let channel = connection.create_channel().await.unwrap();
        channel
            .exchange_declare("logs", "direct", ExchangeDeclareOptions::default())
            .await
            .unwrap();
        channel
            .queue_declare("inbox", QueueDeclareOptions::default())
            .await
            .unwrap();

        let probe = RecoveryProbe::install(&connection);
        broker.drop_current_transport();
        probe.await_successes(1).await;
        broker.drop_current_transport();
        probe.await_successes(2).await;

        // each replay re-issues the same declarations against a fresh server
        let ops = broker.wire_ops();
        assert_eq!(ops.iter().filter(|o| o.as_str() == "queue.declare inbox").count(), 3);
        assert!(connection.shared.ledger.exchange("logs").is_some());
        assert!(connection.shared.ledger.queue("inbox").is_some());

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn application_close_does_not_trigger_recovery() {
        let (connection, broker) = connect_mock(test_config(Duration::from_millis(20))).await;
        let probe = RecoveryProbe::install(&connection);
        let shutdowns = record_events(&connection, EventKind::Shutdown);

        connection.close().await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert!(!connection.is_open());
        assert_eq!(probe.successes(), 0);
        assert_eq!(probe.errors(), 0);
        assert_eq!(broker.connect_attempts(), 1);

        let shutdowns = shutdowns.lock().unwrap();
        assert_eq!(shutdowns.len(), 1);
        match &shutdowns[0] {
            ConnectionEvent::Shutdown(event) => {
                assert_eq!(event.initiator, ShutdownInitiator::Application);
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(matches!(
            connection.create_channel().await,
            Err(RecoveryError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_completes_while_a_retry_is_in_flight() {
        let config = RecoveryConfig {
            network_recovery_interval: Duration::from_millis(50),
            requested_connection_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let (connection, broker) = connect_mock(config).await;
        broker.refuse_next_connects(1000);
        let probe = RecoveryProbe::install(&connection);

        broker.drop_current_transport();
        probe.await_errors(1).await;

        let started = Instant::now();
        connection.close().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        let attempts = broker.connect_attempts();
        sleep(Duration::from_millis(150)).await;
        assert_eq!(broker.connect_attempts(), attempts, "retries survived close");
    }

    #[tokio::test]
    async fn channel_modes_are_reissued_on_reattach() {
        let (connection, broker) = connect_mock(test_config(Duration::from_millis(20))).await;
        let channel = connection.create_channel().await.unwrap();
        channel.confirm_select().await.unwrap();
        channel.basic_qos(10, false).await.unwrap();

        let probe = RecoveryProbe::install(&connection);
        broker.drop_current_transport();
        probe.await_successes(1).await;

        let ops = broker.wire_ops();
        assert_eq!(ops.iter().filter(|o| o.as_str() == "confirm.select").count(), 2);
        assert_eq!(ops.iter().filter(|o| o.as_str() == "basic.qos 10").count(), 2);

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn reattach_wakes_channel_waiters() {
        let (connection, broker) = connect_mock(test_config(Duration::from_millis(20))).await;
        let channel = connection.create_channel().await.unwrap();

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.wait_for_reattach().await })
        };
        sleep(Duration::from_millis(10)).await;

        let probe = RecoveryProbe::install(&connection);
        broker.drop_current_transport();
        probe.await_successes(1).await;

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter was never woken")
            .unwrap();

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn identity_survives_recovery() {
        let config = RecoveryConfig {
            network_recovery_interval: Duration::from_millis(20),
            client_provided_name: Some("reporting-worker".to_string()),
            ..Default::default()
        };
        let (connection, broker) = connect_mock(config).await;
        assert_eq!(connection.client_provided_name(), Some("reporting-worker"));

        let probe = RecoveryProbe::install(&connection);
        broker.drop_current_transport();
        probe.await_successes(1).await;

        assert_eq!(connection.client_provided_name(), Some("reporting-worker"));
        assert_eq!(connection.endpoint(), "mock://broker");
        assert!(connection.is_open());

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn topology_replay_can_be_disabled() {
        let config = RecoveryConfig {
            network_recovery_interval: Duration::from_millis(20),
            topology_recovery_enabled: false,
            ..Default::default()
        };
        let (connection, broker) = connect_mock(config).await;
        let channel = connection.create_channel().await.unwrap();
        channel
            .queue_declare("inbox", QueueDeclareOptions::default())
            .await
            .unwrap();

        let probe = RecoveryProbe::install(&connection);
        broker.drop_current_transport();
        probe.await_successes(1).await;

        let ops = broker.wire_ops();
        assert_eq!(ops.iter().filter(|o| o.as_str() == "queue.declare inbox").count(), 1);
        // the ledger still remembers the queue for the next enabled replay
        assert!(connection.shared.ledger.queue("inbox").is_some());

        connection.close().await.unwrap();
    }
}
