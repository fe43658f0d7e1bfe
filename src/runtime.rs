//! Messaging composition root
//!
//! Constructs and wires the messaging components in dependency order:
//! local bus, connection manager, publisher, consumer, bridge. References
//! are passed explicitly; there is no global registry to reach into.
//!
//! Startup order matters: the bridge registers its re-emission handlers
//! before the consumer starts, and the connect attempt (or its degraded
//! fallback) completes before `start` returns, so callers can rely on the
//! health surface immediately.

use crate::broker::{BrokerConfig, ConnectionManager, HealthStatus};
use crate::bus::LocalEventBus;
use crate::events::{EventBridge, EventConsumer, EventPublisher};
use std::sync::Arc;

pub struct MessagingRuntime {
    bus: Arc<LocalEventBus>,
    connection: Arc<ConnectionManager>,
    publisher: Arc<EventPublisher>,
    consumer: Arc<EventConsumer>,
    bridge: Arc<EventBridge>,
}

impl MessagingRuntime {
    /// Build and start the messaging subsystem
    ///
    /// Connects to the broker when configured (waiting for
    /// connect-or-degrade), then activates the bridge. Domain modules
    /// register their queue handlers on [`consumer`](Self::consumer) after
    /// this returns and then call
    /// [`start_consuming`](Self::start_consuming).
    pub async fn start(config: BrokerConfig) -> Arc<Self> {
        let bus = Arc::new(LocalEventBus::new());
        let connection = Arc::new(ConnectionManager::new(config));
        connection.connect().await;

        let publisher = Arc::new(EventPublisher::new(
            Arc::clone(&bus),
            Arc::clone(&connection),
        ));
        let consumer = Arc::new(EventConsumer::new(Arc::clone(&connection)));
        let bridge = Arc::new(EventBridge::new(
            Arc::clone(&bus),
            Arc::clone(&publisher),
            Arc::clone(&consumer),
            Arc::clone(&connection),
        ));
        bridge.start();

        Arc::new(Self {
            bus,
            connection,
            publisher,
            consumer,
            bridge,
        })
    }

    pub fn bus(&self) -> &Arc<LocalEventBus> {
        &self.bus
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    pub fn consumer(&self) -> &Arc<EventConsumer> {
        &self.consumer
    }

    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.bridge
    }

    /// Begin consuming registered queues (no-op when degraded)
    pub async fn start_consuming(&self) {
        self.consumer.start_consuming().await;
    }

    /// Health-check surface for the host application
    pub fn health(&self) -> HealthStatus {
        self.connection.health()
    }

    /// Graceful shutdown: closes the broker connection and suppresses
    /// reconnects. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.connection.close().await;
    }
}
