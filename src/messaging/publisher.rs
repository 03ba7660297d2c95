//! Domain event publisher.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, instrument};

use super::broker::EventEnvelope;
use super::connection::ConnectionManager;
use super::error::{MessagingError, Result};
use crate::types::StaffEvent;

/// Publishes JSON events to the main exchange.
///
/// There is no retry here: if the broker rejects a publish the error goes
/// straight back to the caller.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    manager: Arc<ConnectionManager>,
}

impl EventPublisher {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Serialize `data` and publish it under `routing_key`.
    #[instrument(skip(self, data))]
    pub async fn publish_event<T>(&self, routing_key: &str, data: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let result = self.try_publish(routing_key, data).await;
        if let Err(e) = &result {
            error!(routing_key = %routing_key, error = %e, "Failed to publish event");
        }
        result
    }

    /// Publish a staff event under its own routing key.
    pub async fn publish_staff_event(&self, event: &StaffEvent) -> Result<()> {
        self.publish_event(event.routing_key(), event).await
    }

    async fn try_publish<T>(&self, routing_key: &str, data: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.manager.ensure_connection().await?;
        let channel = self.manager.channel().ok_or(MessagingError::ChannelUnavailable)?;

        let payload = serde_json::to_vec(data)?;
        let envelope = EventEnvelope::json(routing_key, payload);

        channel
            .publish(&self.manager.topology().exchange, &envelope)
            .await?;

        info!(
            routing_key = %routing_key,
            message_id = %envelope.message_id,
            bytes = envelope.payload.len(),
            "Event published"
        );
        Ok(())
    }
}
