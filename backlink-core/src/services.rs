use std::sync::Arc;

use crate::{AgentRegistry, ConnectionEvents, ForwardBindings, RelayConfig};

/// Shared state threaded through the server: configuration, the agent
/// registry, the connection-state hub and the forward routing table.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<RelayConfig>,
    pub registry: AgentRegistry,
    pub connection_events: ConnectionEvents,
    pub forwards: ForwardBindings,
}

impl Services {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: AgentRegistry::new(),
            connection_events: ConnectionEvents::new(),
            forwards: ForwardBindings::new(),
        }
    }
}
