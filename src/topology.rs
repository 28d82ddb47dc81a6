use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use lapin::types::FieldTable;
use strum_macros::AsRefStr;
use tracing::{debug, warn};

use crate::transport::DeliveryCallback;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedExchange {
    pub name: String,
    pub kind: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedQueue {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Set iff the declare-time name was empty. The ledger key is always the
    /// current name and may change across recoveries.
    pub server_named: bool,
    pub arguments: FieldTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum BindingDestinationKind {
    Queue,
    Exchange,
}

/// Bindings have no independent identity; equality is structural over all
/// five fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedBinding {
    pub source: String,
    pub destination: String,
    pub destination_kind: BindingDestinationKind,
    pub routing_key: String,
    pub arguments: FieldTable,
}

#[derive(Clone)]
pub struct RecordedConsumer {
    pub tag: String,
    /// Non-owning name reference into the queue table; actively rewritten
    /// when a server-named queue changes name during recovery.
    pub queue: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub arguments: FieldTable,
    /// Non-owning back-reference to the owning logical channel, resolved
    /// through the registry at recovery time.
    pub channel_id: u64,
    pub callback: DeliveryCallback,
}

impl fmt::Debug for RecordedConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordedConsumer")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .field("auto_ack", &self.auto_ack)
            .field("exclusive", &self.exclusive)
            .field("channel_id", &self.channel_id)
            .finish()
    }
}

/// The record of every server-visible declaration made through this
/// connection, kept so recovery can replay it in dependency order.
///
/// Each table is synchronised on its own; callers never take an external
/// lock. Replay iterates snapshots because it renames queues and retags
/// consumers mid-walk.
#[derive(Default)]
pub struct TopologyLedger {
    exchanges: RwLock<HashMap<String, RecordedExchange>>,
    queues: RwLock<HashMap<String, RecordedQueue>>,
    bindings: RwLock<Vec<RecordedBinding>>,
    consumers: RwLock<HashMap<String, RecordedConsumer>>,
}

impl TopologyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exchange(&self, exchange: RecordedExchange) {
        self.exchanges
            .write()
            .unwrap()
            .insert(exchange.name.clone(), exchange);
    }

    pub fn record_queue(&self, queue: RecordedQueue) {
        self.queues.write().unwrap().insert(queue.name.clone(), queue);
    }

    pub fn record_binding(&self, binding: RecordedBinding) {
        let mut bindings = self.bindings.write().unwrap();
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
    }

    pub fn record_consumer(&self, consumer: RecordedConsumer) {
        self.consumers
            .write()
            .unwrap()
            .insert(consumer.tag.clone(), consumer);
    }

    pub fn delete_exchange(&self, name: &str) {
        if self.exchanges.write().unwrap().remove(name).is_none() {
            warn!(exchange = name, "deleting an exchange that was never recorded");
        }
        let dropped: Vec<RecordedBinding> = {
            let mut bindings = self.bindings.write().unwrap();
            let (dropped, kept) = std::mem::take(&mut *bindings).into_iter().partition(|b| {
                b.source == name
                    || (b.destination_kind == BindingDestinationKind::Exchange
                        && b.destination == name)
            });
            *bindings = kept;
            dropped
        };
        for binding in dropped {
            if binding.source != name {
                self.maybe_delete_auto_delete_exchange(&binding.source);
            }
        }
    }

    pub fn delete_queue(&self, name: &str) {
        if self.queues.write().unwrap().remove(name).is_none() {
            warn!(queue = name, "deleting a queue that was never recorded");
        }
        let dropped: Vec<RecordedBinding> = {
            let mut bindings = self.bindings.write().unwrap();
            let (dropped, kept) = std::mem::take(&mut *bindings).into_iter().partition(|b| {
                b.destination_kind == BindingDestinationKind::Queue && b.destination == name
            });
            *bindings = kept;
            dropped
        };
        for binding in dropped {
            self.maybe_delete_auto_delete_exchange(&binding.source);
        }
    }

    pub fn delete_binding(&self, binding: &RecordedBinding) {
        let removed = {
            let mut bindings = self.bindings.write().unwrap();
            match bindings.iter().position(|b| b == binding) {
                Some(index) => {
                    bindings.remove(index);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.maybe_delete_auto_delete_exchange(&binding.source);
        } else {
            debug!(
                source = binding.source,
                destination = binding.destination,
                "deleting a binding that was never recorded"
            );
        }
    }

    pub fn delete_consumer(&self, tag: &str) {
        let removed = self.consumers.write().unwrap().remove(tag);
        match removed {
            Some(consumer) => self.maybe_delete_auto_delete_queue(&consumer.queue),
            None => warn!(tag, "deleting a consumer that was never recorded"),
        }
    }

    /// Drops the exchange iff it is auto-delete and no remaining binding
    /// references it as source.
    pub fn maybe_delete_auto_delete_exchange(&self, name: &str) {
        let still_source = self
            .bindings
            .read()
            .unwrap()
            .iter()
            .any(|b| b.source == name);
        if still_source {
            return;
        }
        let mut exchanges = self.exchanges.write().unwrap();
        if exchanges.get(name).is_some_and(|x| x.auto_delete) {
            exchanges.remove(name);
            debug!(exchange = name, "dropped auto-delete exchange with no bindings left");
        }
    }

    /// Drops the queue iff it is auto-delete and no remaining consumer
    /// references it.
    pub fn maybe_delete_auto_delete_queue(&self, name: &str) {
        let still_consumed = self
            .consumers
            .read()
            .unwrap()
            .values()
            .any(|c| c.queue == name);
        if still_consumed {
            return;
        }
        let mut queues = self.queues.write().unwrap();
        if queues.get(name).is_some_and(|q| q.auto_delete) {
            queues.remove(name);
            debug!(queue = name, "dropped auto-delete queue with no consumers left");
        }
    }

    /// Re-keys a server-named queue after the server handed out a fresh name,
    /// rewriting every binding destination and consumer queue field that
    /// pointed at the old one. Only invoked during recovery.
    pub fn rename_queue(&self, old: &str, new: &str) {
        {
            let mut queues = self.queues.write().unwrap();
            if let Some(mut queue) = queues.remove(old) {
                queue.name = new.to_string();
                queues.insert(new.to_string(), queue);
            }
        }
        for binding in self.bindings.write().unwrap().iter_mut() {
            if binding.destination_kind == BindingDestinationKind::Queue
                && binding.destination == old
            {
                binding.destination = new.to_string();
            }
        }
        for consumer in self.consumers.write().unwrap().values_mut() {
            if consumer.queue == old {
                consumer.queue = new.to_string();
            }
        }
    }

    /// Re-keys a consumer after the server returned a fresh tag on replay.
    pub fn retag_consumer(&self, old: &str, new: &str) {
        let mut consumers = self.consumers.write().unwrap();
        if let Some(mut consumer) = consumers.remove(old) {
            consumer.tag = new.to_string();
            consumers.insert(new.to_string(), consumer);
        }
    }

    /// Final close/abort only; the ledger survives transport disconnects.
    pub fn clear(&self) {
        self.exchanges.write().unwrap().clear();
        self.queues.write().unwrap().clear();
        self.bindings.write().unwrap().clear();
        self.consumers.write().unwrap().clear();
    }

    pub fn exchange(&self, name: &str) -> Option<RecordedExchange> {
        self.exchanges.read().unwrap().get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<RecordedQueue> {
        self.queues.read().unwrap().get(name).cloned()
    }

    pub fn consumer(&self, tag: &str) -> Option<RecordedConsumer> {
        self.consumers.read().unwrap().get(tag).cloned()
    }

    pub fn exchanges_snapshot(&self) -> Vec<RecordedExchange> {
        self.exchanges.read().unwrap().values().cloned().collect()
    }

    pub fn queues_snapshot(&self) -> Vec<RecordedQueue> {
        self.queues.read().unwrap().values().cloned().collect()
    }

    pub fn bindings_snapshot(&self) -> Vec<RecordedBinding> {
        self.bindings.read().unwrap().clone()
    }

    pub fn consumers_snapshot(&self) -> Vec<RecordedConsumer> {
        self.consumers.read().unwrap().values().cloned().collect()
    }
}
