//! In-process broker.
//!
//! Models the subset of AMQP 0-9-1 the service relies on: durable
//! exchanges (direct, topic, fanout), durable queues with a dead-letter
//! exchange, bindings, manual ack/nack with requeue, and connection loss.
//! Unacknowledged deliveries return to the head of their queue when the
//! owning connection drops, as on a real broker.
//!
//! Selected at runtime with a `memory://` broker URL, and used by the test
//! suite to drive outages and redeliveries deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as stream_mpsc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use super::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerSession, Delivery, DeliveryAcker,
    DeliveryStream, EventEnvelope, ExchangeKind, LinkFailure,
};
use super::error::{MessagingError, Result};

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub routing_key: String,
    pub message_id: Option<String>,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    /// Number of times the message has been handed to a consumer.
    pub delivery_count: u32,
}

impl StoredMessage {
    fn from_envelope(envelope: &EventEnvelope) -> Self {
        Self {
            routing_key: envelope.routing_key.clone(),
            message_id: Some(envelope.message_id.clone()),
            payload: envelope.payload.clone(),
            redelivered: false,
            delivery_count: 0,
        }
    }
}

/// A message rejected without requeue and routed to a dead-letter exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub exchange: String,
    pub queue: String,
    pub message: StoredMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

struct ConsumerSlot {
    session: u64,
    channel: u64,
    sender: stream_mpsc::UnboundedSender<Result<Delivery>>,
}

#[derive(Default)]
struct QueueState {
    dead_letter_exchange: Option<String>,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, (u64, StoredMessage)>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    reachable: bool,
    connect_delay: Duration,
    connect_attempts: usize,
    fail_publishes: bool,
    next_id: u64,
    next_delivery_tag: u64,
    sessions: HashMap<u64, mpsc::UnboundedSender<LinkFailure>>,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    published: Vec<EventEnvelope>,
    dead_letters: Vec<DeadLetter>,
}

type Shared = Arc<Mutex<BrokerState>>;

fn lock(state: &Shared) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle to one in-process broker instance.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Shared,
}

impl InMemoryBroker {
    /// Create a reachable broker with no topology.
    pub fn new() -> Self {
        let state = BrokerState {
            reachable: true,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Delay every connection attempt, to widen race windows in tests.
    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.state).connect_delay = delay;
    }

    /// Make subsequent connection attempts succeed or fail.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable = reachable;
    }

    /// Make subsequent publishes fail.
    pub fn set_fail_publishes(&self, fail: bool) {
        lock(&self.state).fail_publishes = fail;
    }

    /// Drop every live connection and refuse new ones until [`restore`](Self::restore).
    ///
    /// Each connection reports an error followed by a close, matching what
    /// AMQP clients emit on a broken socket.
    pub fn simulate_outage(&self) {
        let mut state = lock(&self.state);
        state.reachable = false;
        let sessions: Vec<_> = state.sessions.drain().collect();
        for (session, notifier) in sessions {
            let _ = notifier.send(LinkFailure::Error("connection reset by peer".to_string()));
            let _ = notifier.send(LinkFailure::Closed);
            release_session(&mut state, session);
        }
        debug!("In-memory broker outage started");
    }

    /// Accept connections again after an outage.
    pub fn restore(&self) {
        self.set_reachable(true);
    }

    pub fn connect_attempts(&self) -> usize {
        lock(&self.state).connect_attempts
    }

    pub fn live_connections(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    /// Messages waiting for a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.state).queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Deliveries handed out but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state).queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        lock(&self.state).queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn published(&self) -> Vec<EventEnvelope> {
        lock(&self.state).published.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.state).dead_letters.clone()
    }

    pub fn binding_count(&self) -> usize {
        lock(&self.state).bindings.len()
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        lock(&self.state).exchanges.get(exchange).copied()
    }

    pub fn queue_dead_letter_exchange(&self, queue: &str) -> Option<String> {
        lock(&self.state)
            .queues
            .get(queue)
            .and_then(|q| q.dead_letter_exchange.clone())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<BrokerSession> {
        let delay = lock(&self.state).connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        state.connect_attempts += 1;
        if !state.reachable {
            return Err(MessagingError::Connection("connection refused".to_string()));
        }

        state.next_id += 1;
        let session = state.next_id;
        let (notifier, failures) = mpsc::unbounded_channel();
        state.sessions.insert(session, notifier);

        Ok(BrokerSession {
            connection: Arc::new(MemoryConnection {
                state: Arc::clone(&self.state),
                session,
            }),
            failures,
        })
    }
}

struct MemoryConnection {
    state: Shared,
    session: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = lock(&self.state);
        if !state.sessions.contains_key(&self.session) {
            return Err(MessagingError::Closed);
        }
        state.next_id += 1;
        Ok(Arc::new(MemoryChannel {
            state: Arc::clone(&self.state),
            session: self.session,
            id: state.next_id,
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.sessions.remove(&self.session).is_some() {
            release_session(&mut state, self.session);
        }
        Ok(())
    }
}

struct MemoryChannel {
    state: Shared,
    session: u64,
    id: u64,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn live<'a>(&'a self) -> Result<MutexGuard<'a, BrokerState>> {
        let state = lock(&self.state);
        if self.closed.load(Ordering::SeqCst) || !state.sessions.contains_key(&self.session) {
            return Err(MessagingError::Closed);
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let mut state = self.live()?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(MessagingError::Topology(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                name, kind, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, dead_letter_exchange: Option<&str>) -> Result<()> {
        let mut state = self.live()?;
        let dlx = dead_letter_exchange.map(str::to_string);
        match state.queues.get(name) {
            Some(existing) if existing.dead_letter_exchange != dlx => {
                Err(MessagingError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'x-dead-letter-exchange' for queue '{}'",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        dead_letter_exchange: dlx,
                        ..Default::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let mut state = self.live()?;
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::Topology(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::Topology(format!("NOT_FOUND - no exchange '{}'", exchange)));
        }
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, envelope: &EventEnvelope) -> Result<()> {
        let mut state = self.live()?;
        if state.fail_publishes {
            return Err(MessagingError::Publish {
                routing_key: envelope.routing_key.clone(),
                reason: "broker rejected message".to_string(),
            });
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::Publish {
                routing_key: envelope.routing_key.clone(),
                reason: format!("NOT_FOUND - no exchange '{}'", exchange),
            });
        }

        state.published.push(envelope.clone());
        let message = StoredMessage::from_envelope(envelope);
        enqueue(&self.state, &mut state, exchange, message);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.live()?;
        let (sender, receiver) = stream_mpsc::unbounded();
        let slot = ConsumerSlot {
            session: self.session,
            channel: self.id,
            sender,
        };
        match state.queues.get_mut(queue) {
            Some(q) => q.consumers.push(slot),
            None => {
                return Err(MessagingError::Consume {
                    queue: queue.to_string(),
                    reason: format!("NOT_FOUND - no queue '{}'", queue),
                })
            }
        }
        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer registered");
        dispatch(&self.state, &mut state, queue);
        Ok(receiver.boxed())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = lock(&self.state);
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != self.id);
        }
        Ok(())
    }
}

struct MemoryAcker {
    state: Shared,
    queue: String,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn take(&self, state: &mut BrokerState) -> Result<StoredMessage> {
        state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.delivery_tag))
            .map(|(_, message)| message)
            .ok_or_else(|| MessagingError::Acknowledge {
                delivery_tag: self.delivery_tag,
                reason: "PRECONDITION_FAILED - unknown delivery tag".to_string(),
            })
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = lock(&self.state);
        self.take(&mut state).map(|_| ())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let mut state = lock(&self.state);
        let mut message = self.take(&mut state)?;

        if requeue {
            message.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.ready.push_front(message);
            }
            dispatch(&self.state, &mut state, &self.queue);
            return Ok(());
        }

        let dlx = state
            .queues
            .get(&self.queue)
            .and_then(|q| q.dead_letter_exchange.clone());
        if let Some(dlx) = dlx {
            state.dead_letters.push(DeadLetter {
                exchange: dlx.clone(),
                queue: self.queue.clone(),
                message: message.clone(),
            });
            message.redelivered = false;
            message.delivery_count = 0;
            enqueue(&self.state, &mut state, &dlx, message);
        }
        Ok(())
    }
}

/// Route a message through `exchange` into every matching queue.
fn enqueue(shared: &Shared, state: &mut BrokerState, exchange: &str, message: StoredMessage) {
    let Some(kind) = state.exchanges.get(exchange).copied() else {
        return;
    };

    let mut targets: Vec<String> = Vec::new();
    for binding in state.bindings.iter().filter(|b| b.exchange == exchange) {
        let matched = match kind {
            ExchangeKind::Direct => binding.pattern == message.routing_key,
            ExchangeKind::Topic => topic_matches(&binding.pattern, &message.routing_key),
            ExchangeKind::Fanout => true,
        };
        if matched && !targets.contains(&binding.queue) {
            targets.push(binding.queue.clone());
        }
    }

    if targets.is_empty() {
        debug!(exchange = %exchange, routing_key = %message.routing_key, "Message unroutable, dropped");
    }

    for queue in targets {
        if let Some(q) = state.queues.get_mut(&queue) {
            q.ready.push_back(message.clone());
        }
        dispatch(shared, state, &queue);
    }
}

/// Hand ready messages to consumers round-robin.
fn dispatch(shared: &Shared, state: &mut BrokerState, queue_name: &str) {
    loop {
        let tag = state.next_delivery_tag + 1;
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        if queue.consumers.is_empty() {
            return;
        }
        let Some(mut message) = queue.ready.pop_front() else {
            return;
        };

        let idx = queue.next_consumer % queue.consumers.len();
        let session = queue.consumers[idx].session;
        message.delivery_count += 1;
        let delivery = Delivery {
            delivery_tag: tag,
            routing_key: message.routing_key.clone(),
            message_id: message.message_id.clone(),
            redelivered: message.redelivered,
            data: message.payload.clone(),
            acker: Arc::new(MemoryAcker {
                state: Arc::clone(shared),
                queue: queue_name.to_string(),
                delivery_tag: tag,
            }),
        };

        if queue.consumers[idx].sender.unbounded_send(Ok(delivery)).is_ok() {
            queue.unacked.insert(tag, (session, message));
            queue.next_consumer = idx + 1;
            state.next_delivery_tag = tag;
        } else {
            message.delivery_count -= 1;
            queue.consumers.remove(idx);
            queue.ready.push_front(message);
        }
    }
}

/// Drop consumers owned by `session` and requeue what they had not settled.
fn release_session(state: &mut BrokerState, session: u64) {
    for queue in state.queues.values_mut() {
        queue.consumers.retain(|c| c.session != session);

        let mut orphaned: Vec<(u64, StoredMessage)> = queue
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == session)
            .map(|(tag, (_, message))| (*tag, message.clone()))
            .collect();
        orphaned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));

        for (tag, mut message) in orphaned {
            queue.unacked.remove(&tag);
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    let Some((first, rest)) = pattern.split_first() else {
        return key.is_empty();
    };
    match *first {
        "#" => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        "*" => !key.is_empty() && match_words(rest, &key[1..]),
        word => key.first() == Some(&word) && match_words(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn channel(broker: &InMemoryBroker) -> (BrokerSession, Arc<dyn BrokerChannel>) {
        let session = broker.connect().await.unwrap();
        let channel = session.connection.create_channel().await.unwrap();
        (session, channel)
    }

    async fn setup(broker: &InMemoryBroker, kind: ExchangeKind) -> (BrokerSession, Arc<dyn BrokerChannel>) {
        let (session, channel) = channel(broker).await;
        channel.declare_exchange("events", kind).await.unwrap();
        channel.declare_exchange("events.dlx", ExchangeKind::Direct).await.unwrap();
        channel.declare_queue("staff", Some("events.dlx")).await.unwrap();
        channel.bind_queue("staff", "events", "staff.*").await.unwrap();
        (session, channel)
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("staff.*", "staff.created"));
        assert!(!topic_matches("staff.*", "staff.assigned.bus"));
        assert!(topic_matches("staff.#", "staff.assigned.bus"));
        assert!(topic_matches("staff.#", "staff"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("bus.*", "staff.created"));
    }

    #[tokio::test]
    async fn test_topic_exchange_routes_matching_keys() {
        let broker = InMemoryBroker::new();
        let (_session, channel) = setup(&broker, ExchangeKind::Topic).await;

        channel.publish("events", &EventEnvelope::json("staff.created", b"{}".to_vec())).await.unwrap();
        channel.publish("events", &EventEnvelope::json("bus.created", b"{}".to_vec())).await.unwrap();

        assert_eq!(broker.queue_depth("staff"), 1);
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn test_direct_exchange_needs_exact_key() {
        let broker = InMemoryBroker::new();
        let (_session, channel) = setup(&broker, ExchangeKind::Direct).await;

        channel.publish("events", &EventEnvelope::json("staff.created", b"{}".to_vec())).await.unwrap();

        assert_eq!(broker.queue_depth("staff"), 0);
    }

    #[tokio::test]
    async fn test_redeclare_with_other_kind_fails() {
        let broker = InMemoryBroker::new();
        let (_session, channel) = setup(&broker, ExchangeKind::Direct).await;

        let result = channel.declare_exchange("events", ExchangeKind::Topic).await;
        assert!(matches!(result, Err(MessagingError::Topology(_))));
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let broker = InMemoryBroker::new();
        let (_session, channel) = setup(&broker, ExchangeKind::Topic).await;
        channel.publish("events", &EventEnvelope::json("staff.deleted", b"{}".to_vec())).await.unwrap();

        let mut stream = channel.consume("staff", "test").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.acker.nack(false).await.unwrap();

        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].exchange, "events.dlx");
        assert_eq!(dead[0].message.routing_key, "staff.deleted");
        assert_eq!(broker.queue_depth("staff"), 0);
        assert_eq!(broker.unacked_count("staff"), 0);
    }

    #[tokio::test]
    async fn test_nack_with_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        let (_session, channel) = setup(&broker, ExchangeKind::Topic).await;
        channel.publish("events", &EventEnvelope::json("staff.updated", b"{}".to_vec())).await.unwrap();

        let mut stream = channel.consume("staff", "test").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.acker.nack(true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.message_id, first.message_id);
        second.acker.ack().await.unwrap();
        assert!(second.acker.ack().await.is_err());
    }

    #[tokio::test]
    async fn test_outage_notifies_and_requeues_unacked() {
        let broker = InMemoryBroker::new();
        let (mut session, channel) = setup(&broker, ExchangeKind::Topic).await;
        channel.publish("events", &EventEnvelope::json("staff.created", b"{}".to_vec())).await.unwrap();
        let mut stream = channel.consume("staff", "test").await.unwrap();
        let _held = stream.next().await.unwrap().unwrap();

        broker.simulate_outage();

        assert!(matches!(session.failures.recv().await, Some(LinkFailure::Error(_))));
        assert_eq!(session.failures.recv().await, Some(LinkFailure::Closed));
        assert!(stream.next().await.is_none());
        assert_eq!(broker.queue_depth("staff"), 1);
        assert!(channel.publish("events", &EventEnvelope::json("staff.created", Vec::new())).await.is_err());
        assert!(broker.connect().await.is_err());

        broker.restore();
        assert!(broker.connect().await.is_ok());
    }
}
