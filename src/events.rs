use std::collections::HashMap;
use std::sync::RwLock;

use strum_macros::{AsRefStr, EnumDiscriminants};
use tracing::error;

use crate::transport::ShutdownEvent;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Box<dyn Fn(&ConnectionEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Everything observable on a recovering connection. [`EventKind`] is the
/// discriminant-only mirror used to key subscriptions.
#[derive(Debug, Clone, EnumDiscriminants)]
#[strum_discriminants(name(EventKind), derive(Hash, AsRefStr))]
pub enum ConnectionEvent {
    RecoverySucceeded,
    RecoveryError { reason: String },
    CallbackException { context: String, error: String },
    Blocked { reason: String },
    Unblocked,
    Shutdown(ShutdownEvent),
    ConsumerTagChanged { old: String, new: String },
    QueueNameChanged { old: String, new: String },
}

/// Synchronous multicast of connection events.
///
/// Handlers run in subscription order on the emitting task; a failing
/// handler never masks later ones. Every handler error is re-emitted as a
/// `CallbackException` carrying the fan-out site in its context tag.
/// Handlers must not subscribe from within a handler.
#[derive(Default)]
pub(crate) struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<Handler>>>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&ConnectionEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let kind = EventKind::from(&event);
        let context = format!("On{}", kind.as_ref());
        let mut failures = Vec::new();
        {
            let listeners = self.listeners.read().unwrap();
            if let Some(handlers) = listeners.get(&kind) {
                for handler in handlers {
                    if let Err(error) = handler(&event) {
                        failures.push(error);
                    }
                }
            }
        }
        for failure in failures {
            if kind == EventKind::CallbackException {
                // a misbehaving exception handler must not re-enter the bus
                error!(context = %context, "callback-exception handler failed: {failure}");
            } else {
                self.emit(ConnectionEvent::CallbackException {
                    context: context.clone(),
                    error: failure.to_string(),
                });
            }
        }
    }
}
