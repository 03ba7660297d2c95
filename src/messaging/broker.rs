//! Broker abstraction.
//!
//! The connection manager, publisher and consumer only talk to the broker
//! through these traits. [`AmqpBroker`](super::amqp::AmqpBroker) implements
//! them over `lapin`, [`InMemoryBroker`](super::memory::InMemoryBroker)
//! models the same primitives in process.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::Result;

/// Content type stamped on every published envelope.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Route on exact routing key equality.
    Direct,
    /// Route on dotted patterns with `*` and `#` wildcards.
    Topic,
    /// Route to every bound queue.
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => write!(f, "direct"),
            ExchangeKind::Topic => write!(f, "topic"),
            ExchangeKind::Fanout => write!(f, "fanout"),
        }
    }
}

/// Why a live connection stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFailure {
    /// The client reported an error on the connection.
    Error(String),
    /// The connection was closed by the broker or the network.
    Closed,
}

impl fmt::Display for LinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkFailure::Error(reason) => write!(f, "connection error: {}", reason),
            LinkFailure::Closed => write!(f, "connection closed"),
        }
    }
}

/// A message ready to be published.
///
/// Built once by the publisher and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub persistent: bool,
    pub message_id: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub content_type: String,
}

impl EventEnvelope {
    /// Wrap a JSON payload with persistent delivery and fresh metadata.
    pub fn json(routing_key: &str, payload: Vec<u8>) -> Self {
        let timestamp = Utc::now().timestamp_millis();
        Self {
            routing_key: routing_key.to_string(),
            payload,
            persistent: true,
            message_id: next_message_id(timestamp),
            timestamp,
            content_type: JSON_CONTENT_TYPE.to_string(),
        }
    }
}

static MESSAGE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Time based id, unique within the process even for same-millisecond publishes.
fn next_message_id(timestamp: i64) -> String {
    let seq = MESSAGE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", timestamp, seq)
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Acknowledge the delivery, removing it from the queue.
    async fn ack(&self) -> Result<()>;

    /// Reject the delivery, optionally putting it back on the queue.
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer.
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub acker: Arc<dyn DeliveryAcker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Stream of deliveries for one consumer registration.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Channel-level AMQP operations.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable exchange. Repeating an identical declaration is a no-op.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Declare a durable queue, optionally dead-lettering into `dead_letter_exchange`.
    async fn declare_queue(&self, name: &str, dead_letter_exchange: Option<&str>) -> Result<()>;

    /// Bind `queue` to `exchange` under `pattern`.
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Publish an envelope to `exchange`.
    async fn publish(&self, exchange: &str, envelope: &EventEnvelope) -> Result<()>;

    /// Start consuming `queue` with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Close the channel.
    async fn close(&self) -> Result<()>;
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

/// A freshly opened connection together with its failure notifications.
pub struct BrokerSession {
    pub connection: Arc<dyn BrokerConnection>,
    /// Receives one item per error/close event reported by the client.
    pub failures: mpsc::UnboundedReceiver<LinkFailure>,
}

/// Factory for broker connections.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<BrokerSession>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_envelope_defaults() {
        let envelope = EventEnvelope::json("staff.created", b"{}".to_vec());
        assert!(envelope.persistent);
        assert_eq!(envelope.content_type, "application/json");
        assert_eq!(envelope.routing_key, "staff.created");
        assert!(envelope.message_id.starts_with(&envelope.timestamp.to_string()));
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = EventEnvelope::json("staff.updated", Vec::new());
        let b = EventEnvelope::json("staff.updated", Vec::new());
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_exchange_kind_serde() {
        let kind: ExchangeKind = serde_json::from_str("\"topic\"").unwrap();
        assert_eq!(kind, ExchangeKind::Topic);
        assert_eq!(ExchangeKind::Direct.to_string(), "direct");
    }
}
