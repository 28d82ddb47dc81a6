use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::connection::{RecoveryError, Shared};
use crate::events::ConnectionEvent;
use crate::replay;

/// Bounding the command queue keeps a flapping peer from growing it without
/// limit; `BeginRecovery` producers coalesce on a full queue, which is safe
/// because the command is a no-op while already recovering.
pub(crate) const COMMAND_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecoveryCommand {
    BeginRecovery,
    PerformRecovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SupervisorState {
    Connected,
    Recovering,
}

/// Drives the retry loop from a dedicated task: observes recovery triggers,
/// schedules delayed attempts, and hands the connection back once an attempt
/// sticks. Only cancellation ends it.
pub(crate) struct RecoverySupervisor {
    shared: Arc<Shared>,
    commands: mpsc::Receiver<RecoveryCommand>,
    retry_tx: mpsc::Sender<RecoveryCommand>,
    cancel: watch::Receiver<bool>,
    done: oneshot::Sender<()>,
    state: SupervisorState,
}

impl RecoverySupervisor {
    pub(crate) fn new(
        shared: Arc<Shared>,
        commands: mpsc::Receiver<RecoveryCommand>,
        retry_tx: mpsc::Sender<RecoveryCommand>,
        cancel: watch::Receiver<bool>,
        done: oneshot::Sender<()>,
    ) -> Self {
        Self {
            shared,
            commands,
            retry_tx,
            cancel,
            done,
            state: SupervisorState::Connected,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.changed() => break,
                command = self.commands.recv() => match command {
                    None => break,
                    Some(command) => self.handle(command).await,
                },
            }
        }
        debug!("recovery supervisor stopped");
        let _ = self.done.send(());
    }

    async fn handle(&mut self, command: RecoveryCommand) {
        match (self.state, command) {
            (SupervisorState::Connected, RecoveryCommand::BeginRecovery) => {
                info!(
                    "connection lost, retrying in {:?}",
                    self.shared.config.network_recovery_interval
                );
                self.state = SupervisorState::Recovering;
                self.shared.recovering.store(true, Ordering::SeqCst);
                self.schedule_retry();
            }
            (SupervisorState::Connected, RecoveryCommand::PerformRecovery) => {
                warn!("asked to perform recovery while connected, ignoring");
            }
            (SupervisorState::Recovering, RecoveryCommand::BeginRecovery) => {
                info!("already recovering, ignoring duplicate trigger");
            }
            (SupervisorState::Recovering, RecoveryCommand::PerformRecovery) => {
                if self.try_recover().await {
                    self.state = SupervisorState::Connected;
                    self.shared.recovering.store(false, Ordering::SeqCst);
                } else {
                    self.schedule_retry();
                }
            }
        }
    }

    /// Arms a timer that feeds the next attempt back into the command queue.
    /// The supervisor itself never sleeps, so cancellation stays responsive.
    fn schedule_retry(&self) {
        let retry_tx = self.retry_tx.clone();
        let mut cancel = self.cancel.clone();
        let delay = self.shared.config.network_recovery_interval;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = retry_tx.send(RecoveryCommand::PerformRecovery).await;
                }
                _ = cancel.changed() => {}
            }
        });
    }

    /// One full recovery attempt. Never propagates: failures surface as
    /// `RecoveryError` events and a `false` return.
    async fn try_recover(&self) -> bool {
        match self.attempt().await {
            Ok(()) => {
                info!("connection recovery succeeded");
                self.shared.events.emit(ConnectionEvent::RecoverySucceeded);
                true
            }
            Err(error) => {
                error!("connection recovery attempt failed: {error}");
                self.shared.events.emit(ConnectionEvent::RecoveryError {
                    reason: error.to_string(),
                });
                false
            }
        }
    }

    async fn attempt(&self) -> Result<(), RecoveryError> {
        let shared = &self.shared;

        // transport rebinding: fresh endpoint, fresh transport, listeners
        // re-registered, then one atomic swap of the shared reference
        let endpoint = shared.resolver.select_one().await?;
        debug!(endpoint = %endpoint, "reopening transport");
        let transport = shared
            .connector
            .connect(&endpoint, shared.config.client_provided_name.as_deref())
            .await?;
        transport.register_event_listener(shared.event_sink.clone());
        *shared.transport.write().unwrap() = transport.clone();

        // channels must hold fresh transport channels before any declare is
        // issued against them
        shared.registry.recover_all(&transport).await;

        if shared.config.topology_recovery_enabled {
            replay::replay_topology(shared, &transport).await;
        }
        Ok(())
    }
}
