//! Event consumer
//!
//! A handler registry keyed by queue name. Starting consumption subscribes
//! every registration through the connection manager; each inbound raw
//! message runs the same pipeline: decode and validate the envelope,
//! invoke the handler, then ack or nack.
//!
//! The retry policy is driven by broker-tracked redelivery metadata rather
//! than in-memory counters, so it survives process restarts: the delivery
//! count is the first `x-death` record's count when the broker supplies
//! one, else 2 when the redelivered flag is set, else 1. A count at or
//! above the registration's retry limit dead-letters the message;
//! malformed envelopes are dead-lettered on first sight and never retried.

use crate::broker::transport::{Delivery, DeliveryCallback};
use crate::broker::{ConnectionManager, Envelope};
use crate::events::error::HandlerError;
use crate::events::DEFAULT_RETRY_LIMIT;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Business logic invoked for each decoded envelope
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope, delivery: &Delivery) -> Result<(), HandlerError>;
}

/// Wrap an async closure as an [`EventHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    struct FnHandler<F>(F);

    #[async_trait]
    impl<F, Fut> EventHandler for FnHandler<F>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        async fn handle(
            &self,
            envelope: &Envelope,
            _delivery: &Delivery,
        ) -> Result<(), HandlerError> {
            (self.0)(envelope.clone()).await
        }
    }

    Arc::new(FnHandler(f))
}

/// One queue subscription with its handler and retry budget
#[derive(Clone)]
pub struct HandlerRegistration {
    pub queue: String,
    pub handler: Arc<dyn EventHandler>,
    pub retry_limit: u64,
}

pub struct EventConsumer {
    connection: Arc<ConnectionManager>,
    registrations: Mutex<Vec<HandlerRegistration>>,
    consuming: AtomicBool,
}

impl EventConsumer {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            registrations: Mutex::new(Vec::new()),
            consuming: AtomicBool::new(false),
        }
    }

    /// Register a handler for a queue with the default retry budget
    pub fn register_handler(&self, queue: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.register_handler_with_retry(queue, handler, DEFAULT_RETRY_LIMIT);
    }

    /// Register a handler for a queue
    ///
    /// Registering the same queue twice keeps both registrations: each
    /// becomes its own consumer subscription at start, so two handlers on
    /// one queue compete for its deliveries. Registrations made after
    /// consumption has started are ignored until a future start (the
    /// registry is frozen once consuming).
    pub fn register_handler_with_retry(
        &self,
        queue: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        retry_limit: u64,
    ) {
        let queue = queue.into();
        if self.consuming.load(Ordering::Acquire) {
            log::warn!(
                "Consumption already started; handler for '{}' will not receive messages",
                queue
            );
        }
        self.registrations.lock().unwrap().push(HandlerRegistration {
            queue,
            handler,
            retry_limit,
        });
    }

    pub fn handler_count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    /// Subscribe every registration and begin consuming
    ///
    /// Idempotent: a second call is a no-op. When the broker is not
    /// connected this does nothing (delivery falls back entirely to the
    /// local bus) and a later call after a connect will subscribe.
    pub async fn start_consuming(self: &Arc<Self>) {
        if self.consuming.load(Ordering::Acquire) {
            log::debug!("Consumer already started");
            return;
        }
        if !self.connection.is_connected() {
            log::info!("Broker not connected; consuming locally only");
            return;
        }
        if self.consuming.swap(true, Ordering::AcqRel) {
            return;
        }

        let registrations = self.registrations.lock().unwrap().clone();
        for registration in registrations {
            let queue = registration.queue.clone();
            let consumer = Arc::clone(self);
            let callback: DeliveryCallback = Arc::new(move |delivery| {
                let consumer = Arc::clone(&consumer);
                let registration = registration.clone();
                Box::pin(async move {
                    consumer.process_message(&registration, delivery).await;
                })
            });

            if let Err(e) = self.connection.subscribe(&queue, callback).await {
                log::error!("Failed to subscribe to '{}': {}", queue, e);
            }
        }
    }

    /// Decode, dispatch, and acknowledge one delivery
    async fn process_message(&self, registration: &HandlerRegistration, delivery: Delivery) {
        let envelope = match Envelope::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Malformed: straight to the dead-letter exchange, no retry
                log::warn!(
                    "Malformed message on '{}' dead-lettered: {}",
                    registration.queue,
                    e
                );
                self.connection.nack(&delivery, false).await;
                return;
            }
        };

        match registration.handler.handle(&envelope, &delivery).await {
            Ok(()) => {
                self.connection.ack(&delivery).await;
            }
            Err(e) => {
                let delivery_count = delivery_count(&delivery);
                if delivery_count >= registration.retry_limit {
                    log::warn!(
                        "Handler for '{}' failed on delivery {} of '{}', retry budget ({}) \
                         exhausted, dead-lettering: {}",
                        registration.queue,
                        delivery_count,
                        envelope.event_type,
                        registration.retry_limit,
                        e
                    );
                    self.connection.nack(&delivery, false).await;
                } else {
                    log::debug!(
                        "Handler for '{}' failed on delivery {} of '{}', requeueing: {}",
                        registration.queue,
                        delivery_count,
                        envelope.event_type,
                        e
                    );
                    self.connection.nack(&delivery, true).await;
                }
            }
        }
    }
}

/// Delivery count from broker metadata: first `x-death` record's count when
/// present, else 2 if redelivered, else 1
fn delivery_count(delivery: &Delivery) -> u64 {
    delivery
        .death_count
        .unwrap_or(if delivery.redelivered { 2 } else { 1 })
}
