//! The hub: registry, broadcaster, keepalive responder and shutdown
//! coordinator wired together once at startup and shared by every session.

use std::sync::Arc;

use crate::{
    broadcast::Broadcaster,
    config::HubConfig,
    connection::{Connection, OutboundLanes},
    keepalive::KeepaliveResponder,
    registry::Registry,
    session::Session,
    shutdown::ShutdownCoordinator,
};

pub struct Hub {
    config: HubConfig,
    registry: Arc<Registry>,
    broadcaster: Broadcaster,
    responder: KeepaliveResponder,
    coordinator: Arc<ShutdownCoordinator>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let responder = KeepaliveResponder::new(config.pong_reply.clone());
        let coordinator = Arc::new(ShutdownCoordinator::new(
            Arc::clone(&registry),
            config.grace_period,
        ));

        Arc::new(Self {
            config,
            registry,
            broadcaster,
            responder,
            coordinator,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn responder(&self) -> &KeepaliveResponder {
        &self.responder
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    /// Issues a fresh connection id and the handle/lanes pair for it.
    pub fn open_connection(&self) -> (Arc<Connection>, OutboundLanes) {
        Connection::new(self.registry.next_id(), self.config.outbound_capacity)
    }

    pub fn session(self: &Arc<Self>, topic: impl Into<String>, conn: Arc<Connection>) -> Session {
        Session::new(Arc::clone(self), topic, conn)
    }
}
