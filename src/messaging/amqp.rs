//! RabbitMQ broker over `lapin`.
//!
//! Implements the broker traits with AMQP 0-9-1 primitives: durable
//! exchanges and queues, persistent publishes and manually acknowledged
//! consumers.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::mpsc;
use tracing::{error, info, instrument};

use super::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerSession, Delivery, DeliveryAcker,
    DeliveryStream, EventEnvelope, ExchangeKind, LinkFailure,
};
use super::error::{MessagingError, Result};

/// Reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// RabbitMQ connection settings.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    uri: String,
    connection_name: String,
}

impl AmqpBroker {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            connection_name: "staff-service".to_string(),
        }
    }

    /// Name reported to the broker's management UI.
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_string();
        self
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<BrokerSession> {
        let mut properties = ConnectionProperties::default();
        properties.client_properties.insert(
            "connection_name".into(),
            AMQPValue::LongString(self.connection_name.as_str().into()),
        );

        let connection = Connection::connect(&self.uri, properties)
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        let (notifier, failures) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            error!(error = %err, "AMQP connection error");
            let failure = match err {
                lapin::Error::InvalidConnectionState(_) => LinkFailure::Closed,
                other => LinkFailure::Error(other.to_string()),
            };
            let _ = notifier.send(failure);
        });

        info!(connection = %self.connection_name, "AMQP connection established");

        Ok(BrokerSession {
            connection: Arc::new(AmqpConnection { connection }),
            failures,
        })
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }
}

struct AmqpChannel {
    channel: Channel,
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

fn properties_for(envelope: &EventEnvelope) -> BasicProperties {
    let delivery_mode = if envelope.persistent { 2 } else { 1 };
    BasicProperties::default()
        .with_delivery_mode(delivery_mode)
        .with_message_id(envelope.message_id.as_str().into())
        .with_timestamp(envelope.timestamp.max(0) as u64)
        .with_content_type(envelope.content_type.as_str().into())
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Topology(e.to_string()))
    }

    async fn declare_queue(&self, name: &str, dead_letter_exchange: Option<&str>) -> Result<()> {
        let mut arguments = FieldTable::default();
        if let Some(dlx) = dead_letter_exchange {
            arguments.insert("x-dead-letter-exchange".into(), AMQPValue::LongString(dlx.into()));
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
            .map_err(|e| MessagingError::Topology(e.to_string()))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Topology(e.to_string()))
    }

    #[instrument(skip(self, envelope), fields(routing_key = %envelope.routing_key))]
    async fn publish(&self, exchange: &str, envelope: &EventEnvelope) -> Result<()> {
        let publish_error = |e: lapin::Error| MessagingError::Publish {
            routing_key: envelope.routing_key.clone(),
            reason: e.to_string(),
        };

        self.channel
            .basic_publish(
                exchange,
                &envelope.routing_key,
                BasicPublishOptions::default(),
                &envelope.payload,
                properties_for(envelope),
            )
            .await
            .map_err(publish_error)?;

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Consume {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let queue = queue.to_string();
        let stream = consumer.map(move |delivery| match delivery {
            Ok(delivery) => Ok(Delivery {
                delivery_tag: delivery.delivery_tag,
                routing_key: delivery.routing_key.as_str().to_string(),
                message_id: delivery
                    .properties
                    .message_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string()),
                redelivered: delivery.redelivered,
                data: delivery.data,
                acker: Arc::new(AmqpAcker {
                    acker: delivery.acker,
                    delivery_tag: delivery.delivery_tag,
                }),
            }),
            Err(e) => Err(MessagingError::Consume {
                queue: queue.clone(),
                reason: e.to_string(),
            }),
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }
}

struct AmqpAcker {
    acker: Acker,
    delivery_tag: u64,
}

impl AmqpAcker {
    fn error(&self, e: lapin::Error) -> MessagingError {
        MessagingError::Acknowledge {
            delivery_tag: self.delivery_tag,
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| self.error(e))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| self.error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistent_properties() {
        let envelope = EventEnvelope::json("staff.created", b"{}".to_vec());
        let properties = properties_for(&envelope);
        assert_eq!(*properties.delivery_mode(), Some(2));
        assert_eq!(
            properties.content_type().as_ref().map(|c| c.as_str()),
            Some("application/json")
        );
        assert_eq!(
            properties.message_id().as_ref().map(|m| m.as_str()),
            Some(envelope.message_id.as_str())
        );
        assert_eq!(*properties.timestamp(), Some(envelope.timestamp as u64));
    }

    #[test]
    fn test_connection_name_override() {
        let broker = AmqpBroker::new("amqp://localhost:5672").with_connection_name("staff-test");
        assert_eq!(broker.connection_name, "staff-test");
    }
}
