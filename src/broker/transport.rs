//! Broker transport capability
//!
//! The connection manager talks to the broker through these traits rather
//! than a concrete client, so the client library is a swappable capability:
//! when the crate is built with the `amqp` feature, [`detect`] returns the
//! lapin-backed transport; without it there is no transport and the
//! subsystem degrades to local-bus-only mode exactly as if no broker URL
//! had been configured.

use crate::broker::error::BrokerError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Exchange routing behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

/// Declaration arguments for a durable queue
#[derive(Debug, Clone, Default)]
pub struct QueueArgs {
    /// Exchange rejected/expired messages are dead-lettered to
    pub dead_letter_exchange: Option<String>,
}

/// Caller-supplied publish options
///
/// The channel implementation merges these with the fixed defaults:
/// persistent delivery and `application/json` content type.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub correlation_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// One delivery handed to a consumer callback
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    /// Broker redelivered flag
    pub redelivered: bool,
    /// Count from the first `x-death` record, when the broker supplies one
    pub death_count: Option<u64>,
}

/// Callback invoked for each delivery on a consumed queue
pub type DeliveryCallback = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Observer invoked when the connection closes unexpectedly
pub type CloseObserver = Box<dyn Fn() + Send + Sync>;

/// Entry point: opens connections to a broker
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

/// An open broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Register an observer for unexpected closure. Not invoked for a
    /// graceful [`close`](Self::close).
    fn on_close(&self, observer: CloseObserver);

    async fn close(&self) -> Result<(), BrokerError>;
}

/// An open channel on a broker connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str, args: QueueArgs) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Publish a message; the returned bool is the broker's accept signal
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<bool, BrokerError>;

    /// Begin consuming `queue`, invoking `callback` for each delivery
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        callback: DeliveryCallback,
    ) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Probe for an available broker client transport
///
/// Returns the AMQP transport when compiled in, `None` otherwise. Callers
/// treat `None` as "run degraded", never as a fatal error.
pub fn detect() -> Option<Box<dyn BrokerTransport>> {
    #[cfg(feature = "amqp")]
    {
        Some(Box::new(crate::broker::amqp::AmqpTransport::new()))
    }
    #[cfg(not(feature = "amqp"))]
    {
        None
    }
}
