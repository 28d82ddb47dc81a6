use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::transport::{ShutdownEvent, ShutdownInitiator};

/// Replacement for the default trigger policy. Runs on the event-dispatch
/// task and must not block.
pub type RecoveryTrigger = Arc<dyn Fn(&ShutdownEvent) -> bool + Send + Sync>;

/// Knobs recognized by the recovery core.
#[derive(Clone)]
pub struct RecoveryConfig {
    /// Delay between recovery attempts.
    pub network_recovery_interval: Duration,
    /// Upper bound on waiting for the supervisor to stop during close.
    pub requested_connection_timeout: Duration,
    /// Bound on the disposal-path abort of the current transport.
    pub handshake_continuation_timeout: Duration,
    /// When false, recovery re-establishes the transport but does not replay
    /// the recorded topology.
    pub topology_recovery_enabled: bool,
    /// Client-supplied connection label, preserved across recoveries.
    pub client_provided_name: Option<String>,
    /// Overrides the default policy of recovering on peer- and
    /// library-initiated shutdowns.
    pub recovery_trigger: Option<RecoveryTrigger>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            network_recovery_interval: Duration::from_secs(5),
            requested_connection_timeout: Duration::from_secs(10),
            handshake_continuation_timeout: Duration::from_secs(10),
            topology_recovery_enabled: true,
            client_provided_name: None,
            recovery_trigger: None,
        }
    }
}

impl fmt::Debug for RecoveryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryConfig")
            .field("network_recovery_interval", &self.network_recovery_interval)
            .field("requested_connection_timeout", &self.requested_connection_timeout)
            .field(
                "handshake_continuation_timeout",
                &self.handshake_continuation_timeout,
            )
            .field("topology_recovery_enabled", &self.topology_recovery_enabled)
            .field("client_provided_name", &self.client_provided_name)
            .field("recovery_trigger", &self.recovery_trigger.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl RecoveryConfig {
    pub(crate) fn should_recover(&self, event: &ShutdownEvent) -> bool {
        match &self.recovery_trigger {
            Some(trigger) => trigger(event),
            None => matches!(
                event.initiator,
                ShutdownInitiator::Peer | ShutdownInitiator::Library
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_trigger_ignores_application_shutdowns() {
        let config = RecoveryConfig::default();
        let peer = ShutdownEvent::new(ShutdownInitiator::Peer, 320, "CONNECTION_FORCED");
        let library = ShutdownEvent::new(ShutdownInitiator::Library, 0, "heartbeat missed");
        let application = ShutdownEvent::new(ShutdownInitiator::Application, 200, "Goodbye");

        assert!(config.should_recover(&peer));
        assert!(config.should_recover(&library));
        assert!(!config.should_recover(&application));
    }

    #[test]
    fn custom_trigger_replaces_the_default() {
        let config = RecoveryConfig {
            recovery_trigger: Some(Arc::new(|event| event.reply_code == 541)),
            ..Default::default()
        };
        let internal = ShutdownEvent::new(ShutdownInitiator::Peer, 541, "INTERNAL_ERROR");
        let forced = ShutdownEvent::new(ShutdownInitiator::Peer, 320, "CONNECTION_FORCED");

        assert!(config.should_recover(&internal));
        assert!(!config.should_recover(&forced));
    }
}
