//! Bidirectional bus/broker bridge
//!
//! Forwards locally published events to the broker and re-emits broker
//! deliveries onto the local bus, without ever looping an event:
//!
//! - local → broker: a subscriber on the local bus forwards every event
//!   through the publisher's broker-only leg, skipping events whose origin
//!   tag says they came from the broker in the first place
//! - broker → local: a dedicated handler on each `.bridge` queue variant
//!   rebuilds a [`LocalEvent`] from the envelope and publishes it marked
//!   [`EventOrigin::Broker`], so the forwarding leg will never send it back
//!
//! With no broker URL configured the bridge is entirely inactive and the
//! process behaves exactly as in broker-absent mode.

use crate::broker::transport::Delivery;
use crate::broker::{ConnectionManager, Envelope};
use crate::bus::{EventOrigin, LocalEvent, LocalEventBus};
use crate::events::consumer::{EventConsumer, EventHandler};
use crate::events::error::HandlerError;
use crate::events::publisher::EventPublisher;
use crate::events::DEFAULT_RETRY_LIMIT;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const FORWARDER_SUBSCRIBER_ID: &str = "event-bridge";

pub struct EventBridge {
    bus: Arc<LocalEventBus>,
    publisher: Arc<EventPublisher>,
    consumer: Arc<EventConsumer>,
    connection: Arc<ConnectionManager>,
    started: AtomicBool,
}

impl EventBridge {
    pub fn new(
        bus: Arc<LocalEventBus>,
        publisher: Arc<EventPublisher>,
        consumer: Arc<EventConsumer>,
        connection: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            bus,
            publisher,
            consumer,
            connection,
            started: AtomicBool::new(false),
        }
    }

    /// Wire up both directions
    ///
    /// Must run before the consumer starts so the re-emission handlers are
    /// part of its registry. Does nothing when no broker is configured;
    /// idempotent otherwise.
    pub fn start(&self) {
        if !self.connection.is_configured() {
            log::debug!("No broker configured, event bridge inactive");
            return;
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        self.start_forwarding_leg();
        self.register_reemission_handlers();
        log::info!("Event bridge active");
    }

    /// local bus → broker
    fn start_forwarding_leg(&self) {
        let mut receiver = self.bus.subscribe_all(FORWARDER_SUBSCRIBER_ID);
        let publisher = Arc::clone(&self.publisher);

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if event.origin == EventOrigin::Broker {
                    // Came off the broker already; forwarding it back would
                    // loop
                    continue;
                }
                publisher.forward_to_broker(&event).await;
            }
        });
    }

    /// broker → local bus, one handler per `.bridge` queue variant
    fn register_reemission_handlers(&self) {
        let handler: Arc<dyn EventHandler> = Arc::new(ReemissionHandler {
            bus: Arc::clone(&self.bus),
        });

        for binding in self.connection.topology().bridge_bindings() {
            self.consumer.register_handler_with_retry(
                binding.queue,
                Arc::clone(&handler),
                DEFAULT_RETRY_LIMIT,
            );
        }
    }
}

/// Rebuilds a local event from a broker envelope, marked broker-originated
struct ReemissionHandler {
    bus: Arc<LocalEventBus>,
}

#[async_trait]
impl EventHandler for ReemissionHandler {
    async fn handle(&self, envelope: &Envelope, _delivery: &Delivery) -> Result<(), HandlerError> {
        let event = LocalEvent::new(envelope.event_type.clone(), envelope.payload.clone())
            .with_origin(EventOrigin::Broker);

        if let Err(e) = self.bus.publish(event) {
            log::warn!("Bridge re-emission of '{}' incomplete: {}", envelope.event_type, e);
        }
        Ok(())
    }
}
