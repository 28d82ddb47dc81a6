use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};

use lapin::types::FieldTable;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::connection::RecoveryError;
use crate::topology::{
    BindingDestinationKind, RecordedBinding, RecordedConsumer, RecordedExchange, RecordedQueue,
    TopologyLedger,
};
use crate::transport::{
    Delivery, DeliveryCallback, QueueDeclareOk, Transport, TransportChannel,
};

#[derive(Debug, Clone, Default)]
pub struct ExchangeDeclareOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

#[derive(Debug, Clone, Default)]
pub struct QueueDeclareOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Empty requests a server-generated tag.
    pub consumer_tag: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub arguments: FieldTable,
}

#[derive(Debug, Clone, Copy)]
struct QosSettings {
    prefetch_count: u16,
    global: bool,
}

/// The client-visible, long-lived channel. Wraps a transport channel that is
/// re-created across recoveries; every successful declare, bind and consume
/// issued through it lands in the topology ledger.
pub struct LogicalChannel {
    id: u64,
    ledger: Arc<TopologyLedger>,
    registry: Weak<ChannelRegistry>,
    transport_channel: StdRwLock<Arc<dyn TransportChannel>>,
    confirm_mode: AtomicBool,
    qos: StdMutex<Option<QosSettings>>,
    reattached: Notify,
}

impl LogicalChannel {
    fn new(
        id: u64,
        ledger: Arc<TopologyLedger>,
        registry: Weak<ChannelRegistry>,
        transport_channel: Arc<dyn TransportChannel>,
    ) -> Self {
        Self {
            id,
            ledger,
            registry,
            transport_channel: StdRwLock::new(transport_channel),
            confirm_mode: AtomicBool::new(false),
            qos: StdMutex::new(None),
            reattached: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.current().is_open()
    }

    /// Resolves once the channel has been re-attached to a fresh transport.
    pub async fn wait_for_reattach(&self) {
        self.reattached.notified().await;
    }

    fn current(&self) -> Arc<dyn TransportChannel> {
        self.transport_channel.read().unwrap().clone()
    }

    pub async fn exchange_declare(
        &self,
        name: &str,
        kind: &str,
        options: ExchangeDeclareOptions,
    ) -> Result<(), RecoveryError> {
        self.current()
            .exchange_declare(name, kind, options.durable, options.auto_delete, &options.arguments)
            .await?;
        self.ledger.record_exchange(RecordedExchange {
            name: name.to_string(),
            kind: kind.to_string(),
            durable: options.durable,
            auto_delete: options.auto_delete,
            arguments: options.arguments,
        });
        Ok(())
    }

    pub async fn exchange_delete(&self, name: &str) -> Result<(), RecoveryError> {
        self.current().exchange_delete(name).await?;
        self.ledger.delete_exchange(name);
        Ok(())
    }

    /// Declaring with an empty `name` requests a server-generated one; the
    /// ledger is keyed by the name the server hands back.
    pub async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
    ) -> Result<QueueDeclareOk, RecoveryError> {
        let ok = self
            .current()
            .queue_declare(
                name,
                options.durable,
                options.exclusive,
                options.auto_delete,
                &options.arguments,
            )
            .await?;
        self.ledger.record_queue(RecordedQueue {
            name: ok.name.clone(),
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            server_named: name.is_empty(),
            arguments: options.arguments,
        });
        Ok(ok)
    }

    pub async fn queue_delete(&self, name: &str) -> Result<(), RecoveryError> {
        self.current().queue_delete(name).await?;
        self.ledger.delete_queue(name);
        Ok(())
    }

    pub async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), RecoveryError> {
        self.current()
            .queue_bind(queue, exchange, routing_key, &arguments)
            .await?;
        self.ledger.record_binding(RecordedBinding {
            source: exchange.to_string(),
            destination: queue.to_string(),
            destination_kind: BindingDestinationKind::Queue,
            routing_key: routing_key.to_string(),
            arguments,
        });
        Ok(())
    }

    pub async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), RecoveryError> {
        self.current()
            .queue_unbind(queue, exchange, routing_key, &arguments)
            .await?;
        self.ledger.delete_binding(&RecordedBinding {
            source: exchange.to_string(),
            destination: queue.to_string(),
            destination_kind: BindingDestinationKind::Queue,
            routing_key: routing_key.to_string(),
            arguments,
        });
        Ok(())
    }

    pub async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), RecoveryError> {
        self.current()
            .exchange_bind(destination, source, routing_key, &arguments)
            .await?;
        self.ledger.record_binding(RecordedBinding {
            source: source.to_string(),
            destination: destination.to_string(),
            destination_kind: BindingDestinationKind::Exchange,
            routing_key: routing_key.to_string(),
            arguments,
        });
        Ok(())
    }

    pub async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), RecoveryError> {
        self.current()
            .exchange_unbind(destination, source, routing_key, &arguments)
            .await?;
        self.ledger.delete_binding(&RecordedBinding {
            source: source.to_string(),
            destination: destination.to_string(),
            destination_kind: BindingDestinationKind::Exchange,
            routing_key: routing_key.to_string(),
            arguments,
        });
        Ok(())
    }

    /// Returns the effective consumer tag (server-assigned when the
    /// requested tag is empty).
    pub async fn basic_consume<F>(
        &self,
        queue: &str,
        options: ConsumeOptions,
        callback: F,
    ) -> Result<String, RecoveryError>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        let callback: DeliveryCallback = Arc::new(callback);
        let tag = self
            .current()
            .basic_consume(
                queue,
                &options.consumer_tag,
                options.auto_ack,
                options.exclusive,
                &options.arguments,
                callback.clone(),
            )
            .await?;
        self.ledger.record_consumer(RecordedConsumer {
            tag: tag.clone(),
            queue: queue.to_string(),
            auto_ack: options.auto_ack,
            exclusive: options.exclusive,
            arguments: options.arguments,
            channel_id: self.id,
            callback,
        });
        Ok(tag)
    }

    pub async fn basic_cancel(&self, tag: &str) -> Result<(), RecoveryError> {
        self.current().basic_cancel(tag).await?;
        self.ledger.delete_consumer(tag);
        Ok(())
    }

    pub async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), RecoveryError> {
        self.current().basic_qos(prefetch_count, global).await?;
        *self.qos.lock().unwrap() = Some(QosSettings {
            prefetch_count,
            global,
        });
        Ok(())
    }

    pub async fn confirm_select(&self) -> Result<(), RecoveryError> {
        self.current().confirm_select().await?;
        self.confirm_mode.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn close(&self) -> Result<(), RecoveryError> {
        let result = self.current().close().await;
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id).await;
        }
        result
    }

    /// Re-attachment hook: opens a fresh transport channel, reissues the
    /// recorded channel modes, publishes the new channel and wakes waiters.
    pub(crate) async fn reattach(&self, transport: &Arc<dyn Transport>) -> Result<(), RecoveryError> {
        let fresh = transport.open_channel().await?;
        if self.confirm_mode.load(Ordering::SeqCst) {
            fresh.confirm_select().await?;
        }
        let qos = *self.qos.lock().unwrap();
        if let Some(qos) = qos {
            fresh.basic_qos(qos.prefetch_count, qos.global).await?;
        }
        *self.transport_channel.write().unwrap() = fresh;
        self.reattached.notify_waiters();
        debug!(channel = self.id, "re-attached to fresh transport");
        Ok(())
    }

    /// Reissues a recorded subscription on the current transport channel.
    /// Phase four of topology replay.
    pub(crate) async fn resubscribe(&self, consumer: &RecordedConsumer) -> Result<String, RecoveryError> {
        self.current()
            .basic_consume(
                &consumer.queue,
                &consumer.tag,
                consumer.auto_ack,
                consumer.exclusive,
                &consumer.arguments,
                consumer.callback.clone(),
            )
            .await
    }
}

/// The set of logical channels owned by a connection. One lock guards the
/// list; it is held briefly for add/remove and for the whole of
/// `recover_all`.
pub(crate) struct ChannelRegistry {
    channels: Mutex<Vec<Arc<LogicalChannel>>>,
    next_id: AtomicU64,
}

impl ChannelRegistry {
    pub(crate) fn new() -> Self {
        Self {
            channels: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) async fn create(
        registry: &Arc<Self>,
        ledger: Arc<TopologyLedger>,
        transport_channel: Arc<dyn TransportChannel>,
    ) -> Arc<LogicalChannel> {
        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::new(LogicalChannel::new(
            id,
            ledger,
            Arc::downgrade(registry),
            transport_channel,
        ));
        registry.channels.lock().await.push(channel.clone());
        channel
    }

    pub(crate) async fn unregister(&self, id: u64) {
        self.channels.lock().await.retain(|ch| ch.id != id);
    }

    pub(crate) async fn lookup(&self, id: u64) -> Option<Arc<LogicalChannel>> {
        self.channels
            .lock()
            .await
            .iter()
            .find(|ch| ch.id == id)
            .cloned()
    }

    /// Re-attaches every registered channel to the fresh transport.
    /// Per-channel failures are logged and do not abort the loop.
    pub(crate) async fn recover_all(&self, transport: &Arc<dyn Transport>) {
        let channels = self.channels.lock().await;
        for channel in channels.iter() {
            if let Err(error) = channel.reattach(transport).await {
                warn!(channel = channel.id, "failed to re-attach channel: {error}");
            }
        }
    }

    pub(crate) async fn clear(&self) {
        self.channels.lock().await.clear();
    }
}
