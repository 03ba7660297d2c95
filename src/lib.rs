//! Staff Service Library
//!
//! Staff management for the transit booking platform. Every change to a
//! staff record is published as a domain event on an AMQP exchange.

pub mod api;
pub mod messaging;
pub mod staff;
pub mod types;

pub use messaging::{ConnectionManager, EventConsumer, EventPublisher, MessagingError};
pub use staff::{StaffError, StaffService};
pub use types::{ServiceConfig, Staff, StaffEvent};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::messaging::{
        broker_for_url, ConnectionManager, EventConsumer, EventPublisher, RetryPolicy, Topology,
    };
    pub use crate::staff::*;
    pub use crate::types::*;
}

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 3000;

/// Default broker URL
pub const DEFAULT_AMQP_URL: &str = "amqp://localhost:5672";

/// Default delay between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;
