//! Static broker topology descriptor
//!
//! Declares the exchanges, durable queues, and routing-key bindings the
//! connection manager provisions on every successful connect. The table is
//! fixed at build time; only the queue-name prefix comes from
//! configuration.

use crate::broker::config::BrokerConfig;
use crate::broker::transport::ExchangeKind;

/// Suffix for the queue variants the bridge consumes from, so bridge
/// re-emission never competes with domain-specific consumers
pub const BRIDGE_QUEUE_SUFFIX: &str = "bridge";

/// Static binding table: which routing keys land in which event queue
const EVENT_BINDINGS: &[(&str, &[&str])] = &[
    (
        "pos.transactions",
        &["transaction.created", "transaction.voided", "payment.received"],
    ),
    (
        "inventory.stock",
        &["stock.level_changed", "stock.transfer_completed"],
    ),
    ("kds.orders", &["order.created", "order.status_changed"]),
    (
        "customers.loyalty",
        &["transaction.created", "transaction.voided"],
    ),
    (
        "notifications.send",
        &["notification.send", "stock.level_changed"],
    ),
];

/// One durable queue and the routing keys bound to it
#[derive(Debug, Clone, PartialEq)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_keys: Vec<String>,
}

/// The full exchange/queue/binding layout for one deployment
#[derive(Debug, Clone)]
pub struct Topology {
    events_exchange: String,
    commands_exchange: String,
    dead_letter_exchange: String,
    queue_prefix: String,
}

impl Topology {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            events_exchange: config.events_exchange.clone(),
            commands_exchange: config.commands_exchange.clone(),
            dead_letter_exchange: config.dead_letter_exchange.clone(),
            queue_prefix: config.queue_prefix.clone(),
        }
    }

    pub fn events_exchange(&self) -> &str {
        &self.events_exchange
    }

    pub fn commands_exchange(&self) -> &str {
        &self.commands_exchange
    }

    pub fn dead_letter_exchange(&self) -> &str {
        &self.dead_letter_exchange
    }

    /// Exchanges to declare, all durable
    pub fn exchanges(&self) -> Vec<(String, ExchangeKind)> {
        vec![
            (self.events_exchange.clone(), ExchangeKind::Topic),
            (self.commands_exchange.clone(), ExchangeKind::Direct),
            (self.dead_letter_exchange.clone(), ExchangeKind::Fanout),
        ]
    }

    /// The single dead-letter parking queue
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dead-letter", self.queue_prefix)
    }

    /// Namespace a queue name with the deployment prefix
    pub fn queue_name(&self, base: &str) -> String {
        format!("{}.{}", self.queue_prefix, base)
    }

    /// Domain queue bindings on the events exchange
    pub fn bindings(&self) -> Vec<QueueBinding> {
        EVENT_BINDINGS
            .iter()
            .map(|(queue, keys)| QueueBinding {
                queue: self.queue_name(queue),
                exchange: self.events_exchange.clone(),
                routing_keys: keys.iter().map(|k| k.to_string()).collect(),
            })
            .collect()
    }

    /// Bridge-consumed variants of the domain queues
    ///
    /// Same routing keys as the base queue, `.bridge`-suffixed name. These
    /// are provisioned alongside the base queues so the bridge receives its
    /// own copy of every event instead of competing for domain deliveries.
    pub fn bridge_bindings(&self) -> Vec<QueueBinding> {
        EVENT_BINDINGS
            .iter()
            .map(|(queue, keys)| QueueBinding {
                queue: self.queue_name(&format!("{}.{}", queue, BRIDGE_QUEUE_SUFFIX)),
                exchange: self.events_exchange.clone(),
                routing_keys: keys.iter().map(|k| k.to_string()).collect(),
            })
            .collect()
    }
}
