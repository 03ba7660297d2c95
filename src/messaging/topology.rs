//! Exchange and queue topology declared on every (re)connect.

use tracing::debug;

use super::broker::{BrokerChannel, ExchangeKind};
use super::error::Result;

/// Default main exchange.
pub const DEFAULT_EXCHANGE: &str = "bus_booking_events";

/// Queue receiving staff events.
pub const STAFF_QUEUE: &str = "staff_events";

/// Queue reserved for bus events.
pub const BUS_QUEUE: &str = "bus_events";

/// Queue reserved for route events.
pub const ROUTE_QUEUE: &str = "route_events";

/// A durable queue and its optional binding pattern on the main exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub binding: Option<String>,
}

impl QueueSpec {
    pub fn bound(name: &str, pattern: &str) -> Self {
        Self {
            name: name.to_string(),
            binding: Some(pattern.to_string()),
        }
    }

    pub fn unbound(name: &str) -> Self {
        Self {
            name: name.to_string(),
            binding: None,
        }
    }
}

/// The full declaration set.
///
/// Every declaration is idempotent, so applying the topology again after a
/// reconnect leaves the broker unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub queues: Vec<QueueSpec>,
}

impl Topology {
    /// Transit topology: three queues, only `staff_events` bound (`staff.*`).
    ///
    /// With `bind_all` the bus and route queues get `bus.*` and `route.*`
    /// bindings too.
    pub fn transit(exchange: &str, exchange_kind: ExchangeKind, bind_all: bool) -> Self {
        let (bus, route) = if bind_all {
            (
                QueueSpec::bound(BUS_QUEUE, "bus.*"),
                QueueSpec::bound(ROUTE_QUEUE, "route.*"),
            )
        } else {
            (QueueSpec::unbound(BUS_QUEUE), QueueSpec::unbound(ROUTE_QUEUE))
        };

        Self {
            exchange: exchange.to_string(),
            exchange_kind,
            queues: vec![QueueSpec::bound(STAFF_QUEUE, "staff.*"), bus, route],
        }
    }

    /// Name of the dead-letter exchange, `<exchange>.dlx`.
    pub fn dead_letter_exchange(&self) -> String {
        format!("{}.dlx", self.exchange)
    }

    /// Declare exchanges, queues and bindings on `channel`.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<()> {
        let dlx = self.dead_letter_exchange();

        channel.declare_exchange(&self.exchange, self.exchange_kind).await?;
        channel.declare_exchange(&dlx, ExchangeKind::Direct).await?;

        for queue in &self.queues {
            channel.declare_queue(&queue.name, Some(&dlx)).await?;
        }

        for queue in &self.queues {
            if let Some(pattern) = &queue.binding {
                channel.bind_queue(&queue.name, &self.exchange, pattern).await?;
                debug!(queue = %queue.name, pattern = %pattern, "Queue bound");
            }
        }

        debug!(
            exchange = %self.exchange,
            kind = %self.exchange_kind,
            queues = self.queues.len(),
            "Topology declared"
        );

        Ok(())
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::transit(DEFAULT_EXCHANGE, ExchangeKind::Topic, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::InMemoryBroker;
    use crate::messaging::broker::Broker;

    #[test]
    fn test_default_topology_is_asymmetric() {
        let topology = Topology::default();
        assert_eq!(topology.dead_letter_exchange(), "bus_booking_events.dlx");
        let bound: Vec<_> = topology
            .queues
            .iter()
            .filter(|q| q.binding.is_some())
            .map(|q| q.name.as_str())
            .collect();
        assert_eq!(bound, vec![STAFF_QUEUE]);
    }

    #[test]
    fn test_bind_all_binds_every_queue() {
        let topology = Topology::transit(DEFAULT_EXCHANGE, ExchangeKind::Topic, true);
        assert!(topology.queues.iter().all(|q| q.binding.is_some()));
    }

    #[tokio::test]
    async fn test_declare_twice_is_idempotent() {
        let broker = InMemoryBroker::new();
        let session = broker.connect().await.unwrap();
        let channel = session.connection.create_channel().await.unwrap();
        let topology = Topology::default();

        topology.declare(channel.as_ref()).await.unwrap();
        topology.declare(channel.as_ref()).await.unwrap();

        assert_eq!(broker.binding_count(), 1);
        assert_eq!(
            broker.queue_dead_letter_exchange(STAFF_QUEUE).as_deref(),
            Some("bus_booking_events.dlx")
        );
        assert_eq!(broker.exchange_kind("bus_booking_events.dlx"), Some(ExchangeKind::Direct));
    }
}
