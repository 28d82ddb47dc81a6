use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicQosOptions, ConfirmSelectOptions,
    ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::connection::RecoveryError;
use crate::transport::{
    Connector, Delivery, DeliveryCallback, QueueDeclareOk, ShutdownEvent, ShutdownInitiator,
    Transport, TransportChannel, TransportEvent,
};

/// Opens plain lapin connections. The inner connection never attempts any
/// recovery of its own; the supervisor owns the retry loop.
#[derive(Default)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        endpoint: &str,
        client_provided_name: Option<&str>,
    ) -> Result<Arc<dyn Transport>, RecoveryError> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = client_provided_name {
            properties = properties.with_connection_name(name.into());
        }
        let connection = Connection::connect(endpoint, properties).await?;
        Ok(Arc::new(LapinTransport {
            connection,
            endpoint: endpoint.to_string(),
        }))
    }
}

pub struct LapinTransport {
    connection: Connection,
    endpoint: String,
}

#[async_trait]
impl Transport for LapinTransport {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn channel_max(&self) -> u16 {
        self.connection.configuration().channel_max()
    }

    fn frame_max(&self) -> u32 {
        self.connection.configuration().frame_max()
    }

    fn register_event_listener(&self, sink: mpsc::UnboundedSender<TransportEvent>) {
        self.connection.on_error(move |error| {
            let event = TransportEvent::Shutdown(ShutdownEvent::new(
                shutdown_initiator(&error),
                0,
                error.to_string(),
            ));
            if sink.send(event).is_err() {
                debug!("event sink dropped, transport shutdown not delivered");
            }
        });
    }

    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, RecoveryError> {
        let channel = self.connection.create_channel().await?;
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), RecoveryError> {
        self.connection.close(reply_code, reply_text).await?;
        Ok(())
    }

    async fn abort(&self, reply_code: u16, reply_text: &str, deadline: Duration) {
        match timeout(deadline, self.connection.close(reply_code, reply_text)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => debug!("error while aborting transport: {error}"),
            Err(_) => warn!("transport abort timed out after {:?}", deadline),
        }
    }
}

pub struct LapinChannel {
    channel: lapin::Channel,
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

/// A connection.close from the server surfaces as a protocol error;
/// everything else means the library noticed the peer gone.
fn shutdown_initiator(error: &lapin::Error) -> ShutdownInitiator {
    match error {
        lapin::Error::ProtocolError(_) => ShutdownInitiator::Peer,
        _ => ShutdownInitiator::Library,
    }
}

#[async_trait]
impl TransportChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: &str,
        durable: bool,
        auto_delete: bool,
        arguments: &FieldTable,
    ) -> Result<(), RecoveryError> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    auto_delete,
                    ..Default::default()
                },
                arguments.clone(),
            )
            .await?;
        Ok(())
    }

    async fn exchange_delete(&self, name: &str) -> Result<(), RecoveryError> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn queue_declare(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        arguments: &FieldTable,
    ) -> Result<QueueDeclareOk, RecoveryError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    exclusive,
                    auto_delete,
                    ..Default::default()
                },
                arguments.clone(),
            )
            .await?;
        Ok(QueueDeclareOk {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_delete(&self, name: &str) -> Result<(), RecoveryError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), RecoveryError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                arguments.clone(),
            )
            .await?;
        Ok(())
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), RecoveryError> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, arguments.clone())
            .await?;
        Ok(())
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), RecoveryError> {
        self.channel
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions::default(),
                arguments.clone(),
            )
            .await?;
        Ok(())
    }

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), RecoveryError> {
        self.channel
            .exchange_unbind(
                destination,
                source,
                routing_key,
                ExchangeUnbindOptions::default(),
                arguments.clone(),
            )
            .await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        tag: &str,
        auto_ack: bool,
        exclusive: bool,
        arguments: &FieldTable,
        callback: DeliveryCallback,
    ) -> Result<String, RecoveryError> {
        let options = BasicConsumeOptions {
            no_ack: auto_ack,
            exclusive,
            ..Default::default()
        };
        let mut consumer = self
            .channel
            .basic_consume(queue, tag, options, arguments.clone())
            .await?;
        let consumer_tag = consumer.tag().as_str().to_string();

        // pump deliveries from lapin's stream into the callback site; the
        // task ends with the consumer when the channel goes away
        let pump_tag = consumer_tag.clone();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => callback(Delivery {
                        consumer_tag: pump_tag.clone(),
                        delivery_tag: delivery.delivery_tag,
                        exchange: delivery.exchange.as_str().to_string(),
                        routing_key: delivery.routing_key.as_str().to_string(),
                        redelivered: delivery.redelivered,
                        data: delivery.data,
                    }),
                    Err(error) => {
                        error!(tag = %pump_tag, "consumer stream failed: {error}");
                        break;
                    }
                }
            }
            debug!(tag = %pump_tag, "consumer stream ended");
        });

        Ok(consumer_tag)
    }

    async fn basic_cancel(&self, tag: &str) -> Result<(), RecoveryError> {
        self.channel
            .basic_cancel(tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), RecoveryError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await?;
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), RecoveryError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), RecoveryError> {
        self.channel.close(200, "Goodbye").await?;
        Ok(())
    }
}
