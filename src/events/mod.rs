//! Event distribution layer
//!
//! Sits between the in-process bus and the broker connection:
//!
//! - [`EventPublisher`] delivers every event to the local bus first and to
//!   the broker best-effort, so callers never block or fail on broker
//!   trouble
//! - [`EventConsumer`] drives queue consumption, envelope decoding, handler
//!   dispatch, and the bounded-retry/dead-letter policy
//! - [`EventBridge`] wires both directions together without feedback loops

mod bridge;
mod consumer;
mod error;
mod publisher;

pub use bridge::EventBridge;
pub use consumer::{handler_fn, EventConsumer, EventHandler, HandlerRegistration};
pub use error::HandlerError;
pub use publisher::EventPublisher;

/// Default retry budget for a handler registration
pub const DEFAULT_RETRY_LIMIT: u64 = 3;
