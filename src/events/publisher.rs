//! Event publisher
//!
//! Publishing is local-bus-first: in-process listeners always see the event
//! synchronously, whatever the broker is doing. The broker leg runs on the
//! publisher's own local-bus subscription, which the bridge wires up (one
//! broker send per event no matter how it entered the bus), and it is
//! best-effort: not connected means skip with a debug line, and a failed
//! send is logged and swallowed because the event already reached the
//! local bus.

use crate::broker::transport::PublishOptions;
use crate::broker::{ConnectionManager, Envelope, EnvelopeMetadata};
use crate::bus::{LocalEvent, LocalEventBus};
use serde_json::{Map, Value};
use std::sync::Arc;

pub struct EventPublisher {
    bus: Arc<LocalEventBus>,
    connection: Arc<ConnectionManager>,
}

impl EventPublisher {
    pub fn new(bus: Arc<LocalEventBus>, connection: Arc<ConnectionManager>) -> Self {
        Self { bus, connection }
    }

    /// Publish a domain event
    ///
    /// The event is delivered to the local bus synchronously; the broker
    /// copy follows through the bridge-wired forwarding leg. Never blocks
    /// on or fails because of the broker; the only guarantee is that the
    /// local bus saw the event exactly once.
    pub fn publish_event(&self, event: LocalEvent) {
        let name = event.name.clone();

        if let Err(e) = self.bus.publish(event) {
            log::warn!("Local delivery of '{}' incomplete: {}", name, e);
        }

        if !self.connection.is_connected() {
            log::debug!("Broker not connected, '{}' delivered locally only", name);
        }
    }

    /// The broker-only leg: wrap in an envelope and send
    ///
    /// Invoked by the bridge's local-bus subscription for every
    /// locally-originated event. Skips silently when not connected; a
    /// rejected or failed send is logged and swallowed.
    pub(crate) async fn forward_to_broker(&self, event: &LocalEvent) {
        if !self.connection.is_connected() {
            return;
        }

        let config = self.connection.config();
        let envelope = Envelope::new(
            event.name.clone(),
            event.payload.clone(),
            EnvelopeMetadata::new(&config.service_name),
        );

        let body = match envelope.encode() {
            Ok(body) => body,
            Err(e) => {
                log::warn!("Failed to encode envelope for '{}': {}", event.name, e);
                return;
            }
        };

        let options = PublishOptions {
            correlation_id: Some(envelope.metadata.correlation_id.clone()),
            ..Default::default()
        };
        let exchange = config.events_exchange.clone();
        if !self
            .connection
            .publish(&exchange, &event.name, &body, options)
            .await
        {
            log::warn!(
                "Broker publish of '{}' not accepted; event remains local-only",
                event.name
            );
        }
    }

    /// Publish a raw command/message payload to an arbitrary exchange
    ///
    /// Unlike [`publish_event`](Self::publish_event) this has no local-bus
    /// leg: it returns `false` without side effects when not connected,
    /// otherwise the broker's accept signal.
    pub async fn publish_message(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Map<String, Value>,
        correlation_id: Option<String>,
    ) -> bool {
        if !self.connection.is_connected() {
            log::debug!(
                "Broker not connected, dropping message for '{}/{}'",
                exchange,
                routing_key
            );
            return false;
        }

        let config = self.connection.config();
        let envelope = Envelope::new(
            routing_key,
            payload,
            EnvelopeMetadata::with_correlation_id(&config.service_name, correlation_id),
        );
        let body = match envelope.encode() {
            Ok(body) => body,
            Err(e) => {
                log::warn!("Failed to encode message for '{}': {}", routing_key, e);
                return false;
            }
        };

        let options = PublishOptions {
            correlation_id: Some(envelope.metadata.correlation_id.clone()),
            ..Default::default()
        };
        self.connection
            .publish(exchange, routing_key, &body, options)
            .await
    }
}
