//! Broker connection lifecycle
//!
//! The [`ConnectionManager`] owns the live connection/channel pair and is
//! the only component that touches them. It connects with linear-backoff
//! retries, provisions the topology on every successful connect, exposes
//! narrow publish/subscribe/ack/nack pass-throughs that never panic or
//! propagate broker trouble to callers, and schedules a single reconnect
//! when the connection drops unexpectedly.

use crate::broker::config::BrokerConfig;
use crate::broker::topology::Topology;
use crate::broker::transport::{
    self, BrokerChannel, BrokerConnection, BrokerTransport, Delivery, DeliveryCallback,
    PublishOptions, QueueArgs,
};
use crate::broker::{BrokerResult, PREFETCH_COUNT};
use crate::core::retry::{retry_with_backoff, RetryPolicy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connect retries exhausted; the application continues degraded
    Error,
}

/// Health-check surface derived from configuration and connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// No broker URL configured: degraded mode by design, healthy
    NotConfigured,
    Connected,
    Connecting,
    Disconnected,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::NotConfigured => "not_configured",
            HealthStatus::Connected => "connected",
            HealthStatus::Connecting => "connecting",
            HealthStatus::Disconnected => "disconnected",
            HealthStatus::Error => "error",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::NotConfigured | HealthStatus::Connected)
    }
}

/// Owns the broker connection and channel
///
/// Shared as `Arc<ConnectionManager>`. The channel handle is behind a
/// read-write lock; methods clone the `Arc` out and drop the guard before
/// awaiting, so no caller ever holds a handle across a reconnect.
pub struct ConnectionManager {
    config: BrokerConfig,
    topology: Topology,
    transport: Option<Box<dyn BrokerTransport>>,
    state: RwLock<ConnectionState>,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    connection: tokio::sync::Mutex<Option<Box<dyn BrokerConnection>>>,
    shutting_down: AtomicBool,
    /// Capacity-1 signal channel: at most one reconnect pending at a time
    reconnect_tx: mpsc::Sender<()>,
    reconnect_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    watcher_started: AtomicBool,
}

impl ConnectionManager {
    /// Build a manager using the detected transport (lapin when the `amqp`
    /// feature is compiled in)
    pub fn new(config: BrokerConfig) -> Self {
        let transport = if config.is_configured() {
            let detected = transport::detect();
            if detected.is_none() {
                log::warn!(
                    "Broker URL configured but no client transport is available; \
                     running in local-bus-only mode"
                );
            }
            detected
        } else {
            None
        };
        Self::with_transport(config, transport)
    }

    pub(crate) fn with_transport(
        config: BrokerConfig,
        transport: Option<Box<dyn BrokerTransport>>,
    ) -> Self {
        let topology = Topology::from_config(&config);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        Self {
            config,
            topology,
            transport,
            state: RwLock::new(ConnectionState::Disconnected),
            channel: RwLock::new(None),
            connection: tokio::sync::Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            reconnect_tx,
            reconnect_rx: tokio::sync::Mutex::new(Some(reconnect_rx)),
            watcher_started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// True iff a broker URL is present in configuration
    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    pub fn status(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionState::Connected && self.channel.read().unwrap().is_some()
    }

    pub fn health(&self) -> HealthStatus {
        if !self.is_configured() {
            return HealthStatus::NotConfigured;
        }
        match self.status() {
            ConnectionState::Connected => HealthStatus::Connected,
            ConnectionState::Connecting => HealthStatus::Connecting,
            ConnectionState::Disconnected => HealthStatus::Disconnected,
            ConnectionState::Error => HealthStatus::Error,
        }
    }

    /// Connect to the broker, retrying with linear backoff
    ///
    /// No-op when unconfigured or when no transport is available; both
    /// leave the application in supported degraded mode. After exhausting
    /// `retry_attempts`, state becomes [`ConnectionState::Error`] and the
    /// call returns; it never propagates a connect failure.
    pub async fn connect(self: &Arc<Self>) {
        let Some(url) = self.config.url.clone() else {
            log::debug!("No broker URL configured, skipping broker connect");
            return;
        };
        let Some(transport) = &self.transport else {
            return;
        };
        if self.is_connected() {
            return;
        }

        // An explicit connect after close() re-arms auto-reconnect
        self.shutting_down.store(false, Ordering::Release);
        self.start_reconnect_watcher();
        self.set_state(ConnectionState::Connecting);

        let policy = RetryPolicy {
            max_attempts: self.config.retry_attempts.max(1),
            base_delay: self.config.retry_delay,
        };
        let result = retry_with_backoff("broker connect", policy, || {
            self.establish(transport.as_ref(), &url)
        })
        .await;

        match result {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                log::info!(
                    "Connected to broker via {} transport, topology provisioned",
                    transport.name()
                );
            }
            Err(e) => {
                self.set_state(ConnectionState::Error);
                log::error!(
                    "Broker unreachable after {} attempts, continuing without it: {}",
                    self.config.retry_attempts,
                    e
                );
            }
        }
    }

    /// One connect attempt: open connection and channel, provision
    /// topology, store the handles, watch for unexpected closure
    async fn establish(
        self: &Arc<Self>,
        transport: &dyn BrokerTransport,
        url: &str,
    ) -> BrokerResult<()> {
        let connection = transport.connect(url).await?;
        let channel = connection.open_channel().await?;
        self.provision_topology(channel.as_ref()).await?;

        let weak = Arc::downgrade(self);
        connection.on_close(Box::new(move || {
            Self::handle_unexpected_close(&weak);
        }));

        *self.channel.write().unwrap() = Some(channel);
        *self.connection.lock().await = Some(connection);
        Ok(())
    }

    /// Declare exchanges, the dead-letter queue, and every queue/binding in
    /// the topology table. All declarations are idempotent on the broker
    /// side, so this runs on every (re)connect.
    async fn provision_topology(&self, channel: &dyn BrokerChannel) -> BrokerResult<()> {
        for (name, kind) in self.topology.exchanges() {
            channel.declare_exchange(&name, kind).await?;
        }

        let dlq = self.topology.dead_letter_queue();
        channel.declare_queue(&dlq, QueueArgs::default()).await?;
        channel
            .bind_queue(&dlq, self.topology.dead_letter_exchange(), "")
            .await?;

        let dlx_args = QueueArgs {
            dead_letter_exchange: Some(self.topology.dead_letter_exchange().to_string()),
        };
        for binding in self
            .topology
            .bindings()
            .into_iter()
            .chain(self.topology.bridge_bindings())
        {
            channel
                .declare_queue(&binding.queue, dlx_args.clone())
                .await?;
            for routing_key in &binding.routing_keys {
                channel
                    .bind_queue(&binding.queue, &binding.exchange, routing_key)
                    .await?;
            }
        }
        Ok(())
    }

    /// Publish raw bytes; returns the broker's accept signal
    ///
    /// Returns `false` immediately when no channel is open and on any send
    /// error. Never panics or propagates an error to the caller.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> bool {
        let Some(channel) = self.current_channel() else {
            return false;
        };
        match channel.publish(exchange, routing_key, body, options).await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Broker publish to '{}/{}' failed: {}", exchange, routing_key, e);
                false
            }
        }
    }

    /// Declare `queue` and begin consuming it with a bounded prefetch
    ///
    /// No-op with a warning when not connected. Callback errors are the
    /// callback's own concern; the consume loop never crashes because of
    /// them.
    pub async fn subscribe(&self, queue: &str, callback: DeliveryCallback) -> BrokerResult<()> {
        let Some(channel) = self.current_channel() else {
            log::warn!("Not connected to broker, cannot subscribe to '{}'", queue);
            return Ok(());
        };

        channel
            .declare_queue(
                queue,
                QueueArgs {
                    dead_letter_exchange: Some(
                        self.topology.dead_letter_exchange().to_string(),
                    ),
                },
            )
            .await?;
        channel.set_prefetch(PREFETCH_COUNT).await?;
        channel
            .consume(queue, &format!("{}-{}", self.config.service_name, queue), callback)
            .await?;

        log::debug!("Consuming queue '{}'", queue);
        Ok(())
    }

    /// Acknowledge a delivery; no-op if the channel has been torn down
    pub async fn ack(&self, delivery: &Delivery) {
        let Some(channel) = self.current_channel() else {
            return;
        };
        if let Err(e) = channel.ack(delivery.delivery_tag).await {
            log::warn!("Failed to ack delivery {}: {}", delivery.delivery_tag, e);
        }
    }

    /// Negatively acknowledge a delivery; no-op if the channel has been
    /// torn down (the broker will redeliver on its own)
    pub async fn nack(&self, delivery: &Delivery, requeue: bool) {
        let Some(channel) = self.current_channel() else {
            return;
        };
        if let Err(e) = channel.nack(delivery.delivery_tag, requeue).await {
            log::warn!("Failed to nack delivery {}: {}", delivery.delivery_tag, e);
        }
    }

    /// Graceful shutdown: suppress reconnects, close channel then
    /// connection. Idempotent.
    pub async fn close(&self) {
        self.shutting_down.store(true, Ordering::Release);

        let channel = self.channel.write().unwrap().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                log::debug!("Channel close reported: {}", e);
            }
        }

        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                log::debug!("Connection close reported: {}", e);
            }
        }

        self.set_state(ConnectionState::Disconnected);
        log::info!("Broker connection closed");
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap() = state;
    }

    fn current_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel.read().unwrap().clone()
    }

    /// Invoked from the transport's close observer, possibly off the tokio
    /// runtime: only atomics and a non-blocking channel send happen here.
    fn handle_unexpected_close(weak: &Weak<Self>) {
        let Some(manager) = weak.upgrade() else {
            return;
        };
        if manager.shutting_down.load(Ordering::Acquire) {
            return;
        }

        log::warn!("Broker connection closed unexpectedly, scheduling reconnect");
        manager.set_state(ConnectionState::Disconnected);
        *manager.channel.write().unwrap() = None;

        // Full channel means a reconnect is already pending
        let _ = manager.reconnect_tx.try_send(());
    }

    /// Spawn the single long-lived reconnect watcher (first connect only)
    fn start_reconnect_watcher(self: &Arc<Self>) {
        if self.watcher_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(mut rx) = self.reconnect_rx.try_lock().ok().and_then(|mut g| g.take()) else {
            return;
        };

        let weak = Arc::downgrade(self);
        let delay = self.config.retry_delay;
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                sleep(delay).await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if manager.shutting_down.load(Ordering::Acquire) {
                    continue;
                }
                log::info!("Attempting broker reconnect");
                manager.connect().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::{MemoryBroker, MemoryTransport};
    use crate::broker::transport::ExchangeKind;
    use std::time::Duration;

    fn test_config() -> BrokerConfig {
        BrokerConfig {
            url: Some("amqp://localhost".to_string()),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(1),
            ..BrokerConfig::default()
        }
    }

    fn manager_with(broker: &Arc<MemoryBroker>, config: BrokerConfig) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::with_transport(
            config,
            Some(Box::new(MemoryTransport::new(Arc::clone(broker)))),
        ))
    }

    #[tokio::test]
    async fn test_unconfigured_connect_is_a_noop() {
        let broker = MemoryBroker::new();
        let manager = manager_with(
            &broker,
            BrokerConfig {
                url: None,
                ..test_config()
            },
        );

        manager.connect().await;

        assert_eq!(manager.status(), ConnectionState::Disconnected);
        assert_eq!(manager.health(), HealthStatus::NotConfigured);
        assert!(manager.health().is_healthy());
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_missing_transport_degrades_without_error() {
        let manager = Arc::new(ConnectionManager::with_transport(test_config(), None));

        manager.connect().await;

        assert_eq!(manager.status(), ConnectionState::Disconnected);
        assert!(!manager.is_connected());
        assert_eq!(manager.health(), HealthStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_provisions_topology() {
        let broker = MemoryBroker::new();
        let manager = manager_with(&broker, test_config());

        manager.connect().await;

        assert!(manager.is_connected());
        assert_eq!(manager.health(), HealthStatus::Connected);

        let exchanges = broker.declared_exchanges();
        assert!(exchanges.contains(&("events".to_string(), ExchangeKind::Topic)));
        assert!(exchanges.contains(&("commands".to_string(), ExchangeKind::Direct)));
        assert!(exchanges.contains(&("dlx".to_string(), ExchangeKind::Fanout)));

        // Dead-letter queue bound to the fanout with an empty key
        assert!(broker.declared_queues().contains(&"tilo.dead-letter".to_string()));
        assert!(broker
            .bindings()
            .contains(&("tilo.dead-letter".to_string(), "dlx".to_string(), String::new())));

        // Domain queues carry the DLX argument and their routing keys
        assert_eq!(
            broker.queue_dead_letter_exchange("tilo.pos.transactions"),
            Some("dlx".to_string())
        );
        assert!(broker.bindings().contains(&(
            "tilo.pos.transactions".to_string(),
            "events".to_string(),
            "transaction.created".to_string()
        )));

        // Bridge variants are provisioned with the same routing keys
        assert!(broker.bindings().contains(&(
            "tilo.kds.orders.bridge".to_string(),
            "events".to_string(),
            "order.created".to_string()
        )));
    }

    #[tokio::test]
    async fn test_connect_retries_then_errors_out() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(10);
        let manager = manager_with(&broker, test_config());

        manager.connect().await;

        assert_eq!(manager.status(), ConnectionState::Error);
        assert_eq!(manager.health(), HealthStatus::Error);
        assert!(!manager.health().is_healthy());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_connect_succeeds_after_transient_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        let manager = manager_with(&broker, test_config());

        manager.connect().await;

        assert!(manager.is_connected());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_publish_returns_false_when_disconnected() {
        let broker = MemoryBroker::new();
        let manager = manager_with(&broker, test_config());

        let accepted = manager
            .publish("events", "order.created", b"{}", PublishOptions::default())
            .await;

        assert!(!accepted);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_passes_through_when_connected() {
        let broker = MemoryBroker::new();
        let manager = manager_with(&broker, test_config());
        manager.connect().await;

        let accepted = manager
            .publish("events", "order.created", b"{}", PublishOptions::default())
            .await;

        assert!(accepted);
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "events");
        assert_eq!(published[0].routing_key, "order.created");
    }

    #[tokio::test]
    async fn test_publish_reports_broker_rejection() {
        let broker = MemoryBroker::new();
        broker.reject_publishes(true);
        let manager = manager_with(&broker, test_config());
        manager.connect().await;

        let accepted = manager
            .publish("events", "order.created", b"{}", PublishOptions::default())
            .await;
        assert!(!accepted);
    }

    #[tokio::test]
    async fn test_subscribe_sets_prefetch_and_dlx() {
        let broker = MemoryBroker::new();
        let manager = manager_with(&broker, test_config());
        manager.connect().await;

        let callback: DeliveryCallback = Arc::new(|_| Box::pin(async {}));
        manager.subscribe("tilo.kds.orders", callback).await.unwrap();

        assert_eq!(broker.prefetch(), Some(PREFETCH_COUNT));
        assert_eq!(
            broker.queue_dead_letter_exchange("tilo.kds.orders"),
            Some("dlx".to_string())
        );
        assert!(broker.has_consumer("tilo.kds.orders"));
    }

    #[tokio::test]
    async fn test_subscribe_when_disconnected_is_a_warning_noop() {
        let broker = MemoryBroker::new();
        let manager = manager_with(&broker, test_config());

        let callback: DeliveryCallback = Arc::new(|_| Box::pin(async {}));
        manager.subscribe("tilo.kds.orders", callback).await.unwrap();

        assert!(!broker.has_consumer("tilo.kds.orders"));
    }

    #[tokio::test]
    async fn test_unexpected_close_schedules_single_reconnect() {
        let broker = MemoryBroker::new();
        let manager = manager_with(&broker, test_config());
        manager.connect().await;
        assert_eq!(broker.connect_attempts(), 1);

        broker.trigger_unexpected_close();
        assert_eq!(manager.status(), ConnectionState::Disconnected);
        assert!(!manager.is_connected());

        // Reconnect fires after retry_delay and re-provisions topology
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.is_connected());
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_close_suppresses_reconnect() {
        let broker = MemoryBroker::new();
        let manager = manager_with(&broker, test_config());
        manager.connect().await;

        manager.close().await;
        assert_eq!(manager.status(), ConnectionState::Disconnected);

        broker.trigger_unexpected_close();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Still down: the shutting-down flag stopped the reconnect
        assert_eq!(manager.status(), ConnectionState::Disconnected);
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MemoryBroker::new();
        let manager = manager_with(&broker, test_config());
        manager.connect().await;

        manager.close().await;
        manager.close().await;
        assert_eq!(manager.status(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_ack_nack_noop_when_channel_gone() {
        let broker = MemoryBroker::new();
        let manager = manager_with(&broker, test_config());

        let delivery = Delivery {
            queue: "q".to_string(),
            routing_key: "k".to_string(),
            body: Vec::new(),
            delivery_tag: 7,
            redelivered: false,
            death_count: None,
        };
        manager.ack(&delivery).await;
        manager.nack(&delivery, true).await;

        assert!(broker.acks().is_empty());
        assert!(broker.nacks().is_empty());
    }
}
