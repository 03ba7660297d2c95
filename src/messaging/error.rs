//! Error type for the messaging layer.

use thiserror::Error;

/// Errors raised by the broker connection, publisher and consumer.
///
/// The type is `Clone` because a single connection attempt is shared by
/// every caller that joined it, and each of them receives the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessagingError {
    /// The broker could not be reached or refused the connection.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// Declaring an exchange, queue or binding failed.
    #[error("topology declaration failed: {0}")]
    Topology(String),

    /// No channel exists even after ensuring the connection.
    #[error("broker channel not initialized")]
    ChannelUnavailable,

    /// The event payload could not be encoded as JSON.
    #[error("failed to serialize event: {0}")]
    Serialization(String),

    /// The broker rejected or failed a publish.
    #[error("failed to publish to {routing_key}: {reason}")]
    Publish { routing_key: String, reason: String },

    /// Registering a consumer or reading deliveries failed.
    #[error("failed to consume from {queue}: {reason}")]
    Consume { queue: String, reason: String },

    /// Acknowledging or rejecting a delivery failed.
    #[error("failed to acknowledge delivery {delivery_tag}: {reason}")]
    Acknowledge { delivery_tag: u64, reason: String },

    /// The channel or connection has been closed.
    #[error("broker channel closed")]
    Closed,
}

impl From<serde_json::Error> for MessagingError {
    fn from(e: serde_json::Error) -> Self {
        MessagingError::Serialization(e.to_string())
    }
}

/// Result alias used across the messaging module.
pub type Result<T> = std::result::Result<T, MessagingError>;
