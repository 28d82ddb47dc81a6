use std::sync::Arc;

use tracing::{info, warn};

use crate::connection::{RecoveryError, Shared};
use crate::events::ConnectionEvent;
use crate::transport::{Transport, TransportChannel};

/// Re-declares the recorded topology against a fresh transport in dependency
/// order: exchanges, queues, bindings, consumers. Each phase walks a snapshot
/// because queue renames and consumer retags mutate the ledger mid-replay.
/// Per-entity failures are logged and never abort the walk.
pub(crate) async fn replay_topology(shared: &Arc<Shared>, transport: &Arc<dyn Transport>) {
    let scratch = match transport.open_channel().await {
        Ok(channel) => channel,
        Err(error) => {
            warn!("cannot open a channel for topology recovery: {error}");
            return;
        }
    };

    recover_exchanges(shared, &scratch).await;
    recover_queues(shared, &scratch).await;
    recover_bindings(shared, &scratch).await;
    recover_consumers(shared).await;

    if let Err(error) = scratch.close().await {
        warn!("failed to close the topology recovery channel: {error}");
    }
}

async fn recover_exchanges(shared: &Arc<Shared>, channel: &Arc<dyn TransportChannel>) {
    for exchange in shared.ledger.exchanges_snapshot() {
        if let Err(error) = channel
            .exchange_declare(
                &exchange.name,
                &exchange.kind,
                exchange.durable,
                exchange.auto_delete,
                &exchange.arguments,
            )
            .await
        {
            warn!(
                "{}",
                RecoveryError::Topology {
                    kind: "exchange",
                    name: exchange.name,
                    reason: error.to_string(),
                }
            );
        }
    }
}

async fn recover_queues(shared: &Arc<Shared>, channel: &Arc<dyn TransportChannel>) {
    for queue in shared.ledger.queues_snapshot() {
        // a server-named queue is re-declared the way it was requested:
        // with an empty name, letting the server pick a fresh one
        let declare_name = if queue.server_named { "" } else { queue.name.as_str() };
        match channel
            .queue_declare(
                declare_name,
                queue.durable,
                queue.exclusive,
                queue.auto_delete,
                &queue.arguments,
            )
            .await
        {
            Ok(ok) => {
                if queue.server_named && ok.name != queue.name {
                    info!(old = %queue.name, new = %ok.name, "server renamed queue during recovery");
                    shared.ledger.rename_queue(&queue.name, &ok.name);
                    shared.events.emit(ConnectionEvent::QueueNameChanged {
                        old: queue.name.clone(),
                        new: ok.name,
                    });
                }
            }
            Err(error) => {
                warn!(
                    "{}",
                    RecoveryError::Topology {
                        kind: "queue",
                        name: queue.name,
                        reason: error.to_string(),
                    }
                );
            }
        }
    }
}

async fn recover_bindings(shared: &Arc<Shared>, channel: &Arc<dyn TransportChannel>) {
    use crate::topology::BindingDestinationKind::{Exchange, Queue};

    for binding in shared.ledger.bindings_snapshot() {
        let result = match binding.destination_kind {
            Queue => {
                channel
                    .queue_bind(
                        &binding.destination,
                        &binding.source,
                        &binding.routing_key,
                        &binding.arguments,
                    )
                    .await
            }
            Exchange => {
                channel
                    .exchange_bind(
                        &binding.destination,
                        &binding.source,
                        &binding.routing_key,
                        &binding.arguments,
                    )
                    .await
            }
        };
        if let Err(error) = result {
            warn!(
                "{}",
                RecoveryError::Topology {
                    kind: "binding",
                    name: format!("{} -> {}", binding.source, binding.destination),
                    reason: error.to_string(),
                }
            );
        }
    }
}

async fn recover_consumers(shared: &Arc<Shared>) {
    for consumer in shared.ledger.consumers_snapshot() {
        let Some(channel) = shared.registry.lookup(consumer.channel_id).await else {
            warn!(tag = %consumer.tag, "skipping consumer whose channel is gone");
            continue;
        };
        match channel.resubscribe(&consumer).await {
            Ok(new_tag) => {
                if new_tag != consumer.tag {
                    info!(old = %consumer.tag, new = %new_tag, "server retagged consumer during recovery");
                    shared.ledger.retag_consumer(&consumer.tag, &new_tag);
                    shared.events.emit(ConnectionEvent::ConsumerTagChanged {
                        old: consumer.tag.clone(),
                        new: new_tag,
                    });
                }
            }
            Err(error) => {
                warn!(
                    "{}",
                    RecoveryError::Topology {
                        kind: "consumer",
                        name: consumer.tag,
                        reason: error.to_string(),
                    }
                );
            }
        }
    }
}
