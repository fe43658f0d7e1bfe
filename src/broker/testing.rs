//! In-memory broker transport for tests
//!
//! Implements the transport capability traits against a recording fake:
//! declarations, bindings, publishes, acks and nacks are captured for
//! assertion; connect failures can be scripted; deliveries are injected
//! directly into registered consumers; close observers can be triggered to
//! simulate a broker drop.

use crate::broker::error::BrokerError;
use crate::broker::transport::{
    BrokerChannel, BrokerConnection, BrokerTransport, CloseObserver, Delivery, DeliveryCallback,
    ExchangeKind, PublishOptions, QueueArgs,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub options: PublishOptions,
}

#[derive(Default)]
struct BrokerState {
    exchanges: Vec<(String, ExchangeKind)>,
    queues: HashMap<String, QueueArgs>,
    bindings: Vec<(String, String, String)>,
    consumers: HashMap<String, DeliveryCallback>,
    consume_calls: Vec<String>,
    close_observers: Vec<CloseObserver>,
    published: Vec<PublishedMessage>,
    acks: Vec<u64>,
    nacks: Vec<(u64, bool)>,
    prefetch: Option<u16>,
    reject_publishes: bool,
}

/// Shared fake broker behind [`MemoryTransport`]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    connect_attempts: AtomicU32,
    fail_connects: AtomicU32,
    next_delivery_tag: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            connect_attempts: AtomicU32::new(0),
            fail_connects: AtomicU32::new(0),
            next_delivery_tag: AtomicU64::new(1),
        })
    }

    /// Script the next `n` connect attempts to fail
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn reject_publishes(&self, reject: bool) {
        self.state.lock().unwrap().reject_publishes = reject;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn declared_exchanges(&self) -> Vec<(String, ExchangeKind)> {
        self.state.lock().unwrap().exchanges.clone()
    }

    pub fn declared_queues(&self) -> Vec<String> {
        self.state.lock().unwrap().queues.keys().cloned().collect()
    }

    pub fn queue_dead_letter_exchange(&self, queue: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .and_then(|args| args.dead_letter_exchange.clone())
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().bindings.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.state.lock().unwrap().acks.clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.state.lock().unwrap().nacks.clone()
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.state.lock().unwrap().prefetch
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.state.lock().unwrap().consumers.contains_key(queue)
    }

    /// How many times `consume` was called for `queue` over the broker's
    /// lifetime (re-subscriptions replace the callback but are counted)
    pub fn consume_calls(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .consume_calls
            .iter()
            .filter(|q| q.as_str() == queue)
            .count()
    }

    /// Invoke every registered close observer, as the client would on an
    /// unexpected connection drop
    pub fn trigger_unexpected_close(&self) {
        let observers = std::mem::take(&mut self.state.lock().unwrap().close_observers);
        for observer in &observers {
            observer();
        }
    }

    /// Inject a delivery into the consumer registered for `queue`
    pub async fn deliver(&self, queue: &str, body: &[u8], redelivered: bool, death_count: Option<u64>) {
        let delivery = Delivery {
            queue: queue.to_string(),
            routing_key: String::new(),
            body: body.to_vec(),
            delivery_tag: self.next_delivery_tag.fetch_add(1, Ordering::SeqCst),
            redelivered,
            death_count,
        };
        self.deliver_raw(queue, delivery).await;
    }

    pub async fn deliver_raw(&self, queue: &str, delivery: Delivery) {
        let callback = self.state.lock().unwrap().consumers.get(queue).cloned();
        match callback {
            Some(callback) => callback(delivery).await,
            None => panic!("no consumer registered for queue '{}'", queue),
        }
    }
}

/// Transport handing out connections to a shared [`MemoryBroker`]
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
}

impl MemoryTransport {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, _url: &str) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        self.broker.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.broker.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.broker.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::ConnectionFailed {
                reason: "scripted connect failure".to_string(),
            });
        }

        Ok(Box::new(MemoryConnection {
            broker: Arc::clone(&self.broker),
        }))
    }
}

struct MemoryConnection {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        Ok(Arc::new(MemoryChannel {
            broker: Arc::clone(&self.broker),
        }))
    }

    fn on_close(&self, observer: CloseObserver) {
        self.broker
            .state
            .lock()
            .unwrap()
            .close_observers
            .push(observer);
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

struct MemoryChannel {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock().unwrap();
        if !state.exchanges.iter().any(|(n, _)| n == name) {
            state.exchanges.push((name.to_string(), kind));
        }
        Ok(())
    }

    async fn declare_queue(&self, name: &str, args: QueueArgs) -> Result<(), BrokerError> {
        self.broker
            .state
            .lock()
            .unwrap()
            .queues
            .insert(name.to_string(), args);
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let binding = (
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        );
        let mut state = self.broker.state.lock().unwrap();
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.broker.state.lock().unwrap().prefetch = Some(count);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<bool, BrokerError> {
        let mut state = self.broker.state.lock().unwrap();
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            options,
        });
        Ok(!state.reject_publishes)
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        callback: DeliveryCallback,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock().unwrap();
        state.consume_calls.push(queue.to_string());
        state.consumers.insert(queue.to_string(), callback);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.broker.state.lock().unwrap().acks.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.broker
            .state
            .lock()
            .unwrap()
            .nacks
            .push((delivery_tag, requeue));
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
