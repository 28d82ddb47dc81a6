//! Auto-recovering RabbitMQ connections.
//!
//! [`RecoveringConnection`] presents one stable logical connection while the
//! transport underneath may be torn down and re-established any number of
//! times. Each re-establishment replays the recorded topology (exchanges,
//! queues, bindings, consumers) and re-attaches every logical channel, so
//! transient network faults stay invisible to application code.

pub mod channel;
pub mod config;
pub mod connection;
pub mod events;
pub mod lapin_transport;
mod recovery;
mod replay;
pub mod topology;
pub mod transport;


pub use channel::{ConsumeOptions, ExchangeDeclareOptions, LogicalChannel, QueueDeclareOptions};
pub use config::{RecoveryConfig, RecoveryTrigger};
pub use connection::{RecoveringConnection, RecoveryError};
pub use events::{ConnectionEvent, EventKind, HandlerError};
pub use topology::{
    BindingDestinationKind, RecordedBinding, RecordedConsumer, RecordedExchange, RecordedQueue,
};
pub use transport::{
    Connector, Delivery, DeliveryCallback, EndpointResolver, QueueDeclareOk, RoundRobinResolver,
    ShutdownEvent, ShutdownInitiator, Transport, TransportChannel, TransportEvent,
};
