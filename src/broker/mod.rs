//! Broker connectivity layer
//!
//! Everything that touches the external AMQP broker lives here: the
//! environment-driven [`BrokerConfig`], the wire [`Envelope`] codec, the
//! static [`Topology`] descriptor (exchanges, queues, bindings, dead-letter
//! routing), the [`transport`] capability traits with their lapin-backed
//! implementation, and the [`ConnectionManager`] that owns the live
//! connection/channel pair.
//!
//! The connection manager is the only component holding broker handles;
//! the publisher and consumer go through its narrow methods and never keep
//! a channel reference across calls, so a reconnect can swap the handles
//! out from under them safely.

mod config;
mod connection;
mod envelope;
mod error;
mod topology;
pub mod transport;

#[cfg(feature = "amqp")]
mod amqp;

#[cfg(test)]
pub(crate) mod testing;

pub use config::BrokerConfig;
pub use connection::{ConnectionManager, ConnectionState, HealthStatus};
pub use envelope::{Envelope, EnvelopeError, EnvelopeMetadata};
pub use error::BrokerError;
pub use topology::{QueueBinding, Topology};

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Prefetch window: unacknowledged deliveries allowed in flight per queue
pub const PREFETCH_COUNT: u16 = 10;
