//! lapin-backed AMQP transport
//!
//! Maps the transport capability traits onto the lapin client. All
//! declarations are durable; queues carry their dead-letter exchange as a
//! declaration argument; publishes are persistent `application/json`
//! messages.

use crate::broker::error::BrokerError;
use crate::broker::transport::{
    BrokerChannel, BrokerConnection, BrokerTransport, CloseObserver, Delivery, DeliveryCallback,
    ExchangeKind, PublishOptions, QueueArgs,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const CONTENT_TYPE_JSON: &str = "application/json";

pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AmqpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    fn name(&self) -> &'static str {
        "amqp"
    }

    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                reason: e.to_string(),
            })?;

        Ok(Box::new(AmqpConnection {
            connection,
            closing: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    /// Set before a graceful close so the error observer stays quiet
    closing: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                reason: e.to_string(),
            })?;

        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn on_close(&self, observer: CloseObserver) {
        let closing = Arc::clone(&self.closing);
        self.connection.on_error(move |error| {
            if closing.load(Ordering::Acquire) {
                return;
            }
            log::warn!("Broker connection error: {}", error);
            observer();
        });
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closing.store(true, Ordering::Release);
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                reason: e.to_string(),
            })
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                name,
                map_exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::TopologyFailed {
                reason: format!("exchange '{}': {}", name, e),
            })
    }

    async fn declare_queue(&self, name: &str, args: QueueArgs) -> Result<(), BrokerError> {
        let mut arguments = FieldTable::default();
        if let Some(dlx) = &args.dead_letter_exchange {
            arguments.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(dlx.clone().into()),
            );
        }

        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::TopologyFailed {
                reason: format!("queue '{}': {}", name, e),
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::TopologyFailed {
                reason: format!("binding '{}' -> '{}': {}", routing_key, queue, e),
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::OperationFailed {
                message: format!("basic_qos: {}", e),
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<bool, BrokerError> {
        let mut properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_content_type(ShortString::from(CONTENT_TYPE_JSON));

        if let Some(correlation_id) = options.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id));
        }
        if !options.headers.is_empty() {
            let mut headers = FieldTable::default();
            for (key, value) in options.headers {
                headers.insert(ShortString::from(key), AMQPValue::LongString(value.into()));
            }
            properties = properties.with_headers(headers);
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::PublishFailed {
                exchange: exchange.to_string(),
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| BrokerError::PublishFailed {
                exchange: exchange.to_string(),
                reason: e.to_string(),
            })?;

        Ok(!matches!(confirm, Confirmation::Nack(_)))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        callback: DeliveryCallback,
    ) -> Result<(), BrokerError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ConsumeFailed {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let queue_name = queue.to_string();
        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        callback(map_delivery(&queue_name, delivery)).await;
                    }
                    Err(e) => {
                        log::warn!("Consumer stream on '{}' ended: {}", queue_name, e);
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::OperationFailed {
                message: format!("basic_ack: {}", e),
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::OperationFailed {
                message: format!("basic_nack: {}", e),
            })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.channel
            .close(200, "shutdown")
            .await
            .map_err(|e| BrokerError::OperationFailed {
                message: format!("channel close: {}", e),
            })
    }
}

fn map_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

fn map_delivery(queue: &str, delivery: AmqpDelivery) -> Delivery {
    Delivery {
        queue: queue.to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        death_count: death_count(&delivery),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        body: delivery.data,
    }
}

/// Extract the count of the first `x-death` record, if the broker attached
/// the header
fn death_count(delivery: &AmqpDelivery) -> Option<u64> {
    let headers = delivery.properties.headers().as_ref()?;
    let deaths = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == "x-death")?
        .1;

    let AMQPValue::FieldArray(records) = deaths else {
        return None;
    };
    let AMQPValue::FieldTable(first) = records.as_slice().first()? else {
        return None;
    };

    first
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == "count")
        .and_then(|(_, value)| match value {
            AMQPValue::LongLongInt(count) => Some(*count as u64),
            AMQPValue::LongInt(count) => Some(*count as u64),
            AMQPValue::ShortInt(count) => Some(*count as u64),
            _ => None,
        })
}
