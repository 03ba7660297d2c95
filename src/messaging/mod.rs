//! # Messaging Module
//!
//! Domain event plumbing between the staff service and the message broker.
//!
//! ## Features
//! - Single shared broker connection with single-flight connect and an
//!   unbounded fixed-delay reconnect loop
//! - Idempotent exchange / dead-letter exchange / queue topology
//! - Persistent JSON event publishing
//! - Queue consumers with ack, requeue and dead-letter dispositions
//! - `lapin` (RabbitMQ) and in-memory broker backends

pub mod amqp;
pub mod broker;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod retry;
pub mod topology;

use std::sync::Arc;

pub use amqp::AmqpBroker;
pub use broker::{Broker, BrokerChannel, Delivery, EventEnvelope, ExchangeKind, LinkFailure};
pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::{ConsumerConfig, Disposition, EventConsumer, EventHandler};
pub use error::MessagingError;
pub use memory::InMemoryBroker;
pub use publisher::EventPublisher;
pub use retry::RetryPolicy;
pub use topology::{QueueSpec, Topology};

/// URL scheme selecting the in-process broker.
pub const MEMORY_SCHEME: &str = "memory://";

/// Pick a broker backend for `url`.
pub fn broker_for_url(url: &str) -> Arc<dyn Broker> {
    if url.starts_with(MEMORY_SCHEME) {
        Arc::new(InMemoryBroker::new())
    } else {
        Arc::new(AmqpBroker::new(url))
    }
}
