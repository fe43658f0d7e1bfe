//! In-process event bus
//!
//! A synchronous multicast publish/subscribe registry keyed by event name.
//! Domain modules publish [`LocalEvent`]s and subscribe with an
//! [`EventFilter`]; every matching subscriber receives its own clone of the
//! event through an unbounded channel. Subscribers whose receiving half has
//! been dropped are pruned on the next publish.
//!
//! Events carry an [`EventOrigin`] tag so the bridge can tell locally
//! produced events apart from events it re-emitted after a broker round
//! trip. That tag is the loop-prevention marker: the bridge never forwards
//! a broker-originated event back to the broker.

mod error;
mod event;
mod manager;

pub use error::BusError;
pub use event::{EventFilter, EventOrigin, LocalEvent};
pub use manager::LocalEventBus;

pub type BusResult<T> = Result<T, BusError>;
