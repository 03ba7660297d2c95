//! Queue consumer with ack / requeue / dead-letter policy.
//!
//! Each delivery ends in exactly one of three ways:
//! - handler succeeded: ack
//! - body is not valid JSON: nack without requeue, so the broker
//!   dead-letters it (it can never succeed)
//! - handler failed: nack with requeue for another attempt

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::Delivery;
use super::connection::ConnectionManager;
use super::error::{MessagingError, Result};

/// Processes one decoded message.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, message: Value) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Value) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// Outcome applied to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove from the queue.
    Ack,
    /// Rejected for good; the queue dead-letters it.
    Reject,
    /// Rejected for now; the broker redelivers it.
    Requeue,
}

/// Consumer settings.
#[derive(Debug, Clone, Default)]
pub struct ConsumerConfig {
    /// Handler failures tolerated per message before it is dead-lettered
    /// instead of requeued. `None` keeps requeueing forever.
    pub max_redeliveries: Option<u32>,
}

/// Subscribes handlers to queues on the shared connection.
#[derive(Debug, Clone)]
pub struct EventConsumer {
    manager: Arc<ConnectionManager>,
    config: ConsumerConfig,
}

impl EventConsumer {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            config: ConsumerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register `handler` on `queue` and process deliveries in a background task.
    ///
    /// Returns once the consumer is registered. The task ends when the
    /// channel closes; deliveries that were not settled go back to the queue.
    pub async fn start_consuming<H>(&self, queue: &str, handler: H) -> Result<JoinHandle<()>>
    where
        H: EventHandler,
    {
        self.manager.ensure_connection().await?;
        let channel = self.manager.channel().ok_or(MessagingError::ChannelUnavailable)?;

        let consumer_tag = format!("staff-service.{}", queue);
        let mut deliveries = channel.consume(queue, &consumer_tag).await?;
        info!(queue = %queue, consumer_tag = %consumer_tag, "Started consuming");

        let processor = DeliveryProcessor::new(queue, handler, self.config.clone());
        let handle = tokio::spawn(async move {
            while let Some(delivery) = deliveries.next().await {
                match delivery {
                    Ok(delivery) => processor.process(delivery).await,
                    Err(e) => error!(queue = %processor.queue, error = %e, "Consumer error"),
                }
            }
            warn!(queue = %processor.queue, "Consumer stream ended");
        });

        Ok(handle)
    }
}

struct DeliveryProcessor<H> {
    queue: String,
    handler: H,
    config: ConsumerConfig,
    /// Handler failures per message id, only tracked when a cap is set.
    failures: Mutex<HashMap<String, u32>>,
}

impl<H: EventHandler> DeliveryProcessor<H> {
    fn new(queue: &str, handler: H, config: ConsumerConfig) -> Self {
        Self {
            queue: queue.to_string(),
            handler,
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    async fn process(&self, delivery: Delivery) {
        let disposition = self.decide(&delivery).await;

        let settled = match disposition {
            Disposition::Ack => delivery.acker.ack().await,
            Disposition::Reject => delivery.acker.nack(false).await,
            Disposition::Requeue => delivery.acker.nack(true).await,
        };

        match settled {
            Ok(()) => debug!(
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                disposition = ?disposition,
                "Delivery settled"
            ),
            Err(e) => error!(
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                error = %e,
                "Failed to settle delivery"
            ),
        }
    }

    async fn decide(&self, delivery: &Delivery) -> Disposition {
        let message: Value = match serde_json::from_slice(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    queue = %self.queue,
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Malformed message, dead-lettering"
                );
                return Disposition::Reject;
            }
        };

        match self.handler.handle(message).await {
            Ok(()) => {
                self.forget(delivery);
                Disposition::Ack
            }
            Err(e) => {
                error!(
                    queue = %self.queue,
                    routing_key = %delivery.routing_key,
                    redelivered = delivery.redelivered,
                    error = %e,
                    "Error processing message"
                );
                self.on_handler_failure(delivery)
            }
        }
    }

    fn on_handler_failure(&self, delivery: &Delivery) -> Disposition {
        let (Some(limit), Some(message_id)) = (self.config.max_redeliveries, &delivery.message_id)
        else {
            return Disposition::Requeue;
        };

        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(message_id.clone()).or_insert(0);
        *count += 1;
        if *count > limit {
            failures.remove(message_id);
            warn!(
                queue = %self.queue,
                message_id = %message_id,
                limit,
                "Redelivery limit reached, dead-lettering"
            );
            Disposition::Reject
        } else {
            Disposition::Requeue
        }
    }

    fn forget(&self, delivery: &Delivery) {
        if self.config.max_redeliveries.is_none() {
            return;
        }
        if let Some(message_id) = &delivery.message_id {
            self.failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(message_id);
        }
    }
}
