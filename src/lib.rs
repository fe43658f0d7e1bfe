//! Event distribution bridge for the tilo backend.
//!
//! This crate ships domain events between the in-process event bus (cheap,
//! synchronous, single-node) and an external AMQP broker (durable,
//! cross-process), while tolerating the broker being absent, unreachable,
//! or flapping. The application behaves identically whether or not a broker
//! is configured: local-bus delivery always happens first and broker
//! delivery is best-effort.
//!
//! # Components
//!
//! - [`bus`]: the synchronous in-process multicast event bus
//! - [`broker`]: broker configuration, envelope codec, topology, transport
//!   and the connection manager
//! - [`events`]: publisher, consumer (retry/dead-letter policy) and the
//!   bidirectional bridge
//! - [`runtime`]: the composition root wiring the above together

pub mod broker;
pub mod bus;
pub mod core;
pub mod events;
pub mod runtime;

pub use broker::{BrokerConfig, ConnectionManager, ConnectionState, Envelope, HealthStatus};
pub use bus::{EventOrigin, LocalEvent, LocalEventBus};
pub use events::{EventBridge, EventConsumer, EventPublisher};
pub use runtime::MessagingRuntime;
