use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::types::FieldTable;
use strum_macros::AsRefStr;
use tokio::sync::mpsc;

use crate::connection::RecoveryError;

/// Who closed the connection. Peer- and library-initiated shutdowns are
/// recoverable under the default trigger policy; application-initiated ones
/// are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum ShutdownInitiator {
    /// The user asked for the connection to be closed.
    Application,
    /// The client library detected the peer gone (EOF, missed heartbeats,
    /// framing error).
    Library,
    /// The server sent a connection.close.
    Peer,
}

#[derive(Debug, Clone)]
pub struct ShutdownEvent {
    pub initiator: ShutdownInitiator,
    pub reply_code: u16,
    pub reply_text: String,
}

impl ShutdownEvent {
    pub fn new(initiator: ShutdownInitiator, reply_code: u16, reply_text: impl Into<String>) -> Self {
        Self {
            initiator,
            reply_code,
            reply_text: reply_text.into(),
        }
    }
}

/// Raised by a transport on its own I/O worker and delivered to the sink the
/// connection registered through [`Transport::register_event_listener`].
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Shutdown(ShutdownEvent),
    Blocked(String),
    Unblocked,
    CallbackException { context: String, error: String },
}

/// One message handed to a consumer callback. Acknowledgement flows are not
/// part of the recovery core.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
}

pub type DeliveryCallback = Arc<dyn Fn(Delivery) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct QueueDeclareOk {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Picks the endpoint for the next connection attempt. Implementations may
/// rotate endpoints, back off, or fail; a failure is treated as a retryable
/// recovery failure.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn select_one(&self) -> Result<String, RecoveryError>;
}

/// Opens a fresh transport against an endpoint. The returned transport must
/// not attempt any recovery of its own; the supervisor owns the retry loop.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        client_provided_name: Option<&str>,
    ) -> Result<Arc<dyn Transport>, RecoveryError>;
}

/// One TCP-plus-AMQP session. Replaced wholesale by the recovery core while
/// the logical connection persists.
#[async_trait]
pub trait Transport: Send + Sync {
    fn is_open(&self) -> bool;
    fn endpoint(&self) -> String;
    fn channel_max(&self) -> u16;
    fn frame_max(&self) -> u32;

    /// Subscribe the connection-level event sink. Called once per transport,
    /// right after the transport is created; re-registration after a
    /// recovery is passing the same sink to the fresh transport.
    fn register_event_listener(&self, sink: mpsc::UnboundedSender<TransportEvent>);

    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, RecoveryError>;
    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), RecoveryError>;

    /// Best-effort close bounded by `timeout`; errors are swallowed.
    async fn abort(&self, reply_code: u16, reply_text: &str, timeout: Duration);
}

/// The AMQP channel operations the recovery core declares and subscribes
/// through, both on the user path and during topology replay.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: &str,
        durable: bool,
        auto_delete: bool,
        arguments: &FieldTable,
    ) -> Result<(), RecoveryError>;

    async fn exchange_delete(&self, name: &str) -> Result<(), RecoveryError>;

    /// Declaring with an empty `name` requests a server-generated name; the
    /// effective name comes back in the result.
    async fn queue_declare(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        arguments: &FieldTable,
    ) -> Result<QueueDeclareOk, RecoveryError>;

    async fn queue_delete(&self, name: &str) -> Result<(), RecoveryError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), RecoveryError>;

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), RecoveryError>;

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), RecoveryError>;

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), RecoveryError>;

    /// Returns the effective consumer tag, which is server-assigned when
    /// `tag` is empty.
    async fn basic_consume(
        &self,
        queue: &str,
        tag: &str,
        auto_ack: bool,
        exclusive: bool,
        arguments: &FieldTable,
        callback: DeliveryCallback,
    ) -> Result<String, RecoveryError>;

    async fn basic_cancel(&self, tag: &str) -> Result<(), RecoveryError>;
    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), RecoveryError>;
    async fn confirm_select(&self) -> Result<(), RecoveryError>;
    async fn close(&self) -> Result<(), RecoveryError>;
}

/// Rotates through a fixed endpoint list, one endpoint per attempt.
pub struct RoundRobinResolver {
    endpoints: Vec<String>,
    next: AtomicUsize,
}

impl RoundRobinResolver {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EndpointResolver for RoundRobinResolver {
    async fn select_one(&self) -> Result<String, RecoveryError> {
        if self.endpoints.is_empty() {
            return Err(RecoveryError::NoEndpoints);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        Ok(self.endpoints[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_robin_rotates_endpoints() {
        let resolver = RoundRobinResolver::new(["amqp://a:5672", "amqp://b:5672"]);
        assert_eq!(resolver.select_one().await.unwrap(), "amqp://a:5672");
        assert_eq!(resolver.select_one().await.unwrap(), "amqp://b:5672");
        assert_eq!(resolver.select_one().await.unwrap(), "amqp://a:5672");
    }

    #[tokio::test]
    async fn empty_resolver_fails() {
        let resolver = RoundRobinResolver::new(Vec::<String>::new());
        assert!(resolver.select_one().await.is_err());
    }
}
