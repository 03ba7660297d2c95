//! Broker connection manager.
//!
//! Owns the single connection/channel pair of the process. Every publish
//! and consume goes through [`ConnectionManager::ensure_connection`] first.
//!
//! Connection attempts are single-flight: concurrent callers of
//! [`initialize`](ConnectionManager::initialize) join the attempt already in
//! progress and all observe its outcome. Once connected, failures reported
//! by the client put the manager back in `Disconnected` and start one
//! reconnect loop that retries forever on the configured delay.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::broker::{Broker, BrokerChannel, BrokerConnection, LinkFailure};
use super::error::{MessagingError, Result};
use super::retry::RetryPolicy;
use super::topology::Topology;

/// Lifecycle of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<()>>>;

/// An attempt tagged with its id, so a finished attempt only clears itself.
type TrackedAttempt = (u64, ConnectAttempt);

struct Link {
    state: ConnectionState,
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
}

/// Process-wide broker connection, shared by publisher and consumers.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    topology: Topology,
    retry: RetryPolicy,
    link: Mutex<Link>,
    in_flight: Mutex<Option<TrackedAttempt>>,
    next_attempt: AtomicU64,
    /// Bumped on every successful connect and on close. Failure
    /// notifications and reconnect loops carrying an older epoch are stale.
    epoch: AtomicU64,
    reconnecting: AtomicBool,
}

impl ConnectionManager {
    /// Create a manager. No connection is made until [`initialize`](Self::initialize).
    pub fn new(broker: Arc<dyn Broker>, topology: Topology, retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            broker,
            topology,
            retry,
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                connection: None,
                channel: None,
            }),
            in_flight: Mutex::new(None),
            next_attempt: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
        })
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<TrackedAttempt>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn state(&self) -> ConnectionState {
        self.link().state
    }

    /// True iff connected and a channel is open.
    pub fn is_connected(&self) -> bool {
        let link = self.link();
        link.state == ConnectionState::Connected && link.channel.is_some()
    }

    /// The current channel, if any.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.link().channel.clone()
    }

    /// Connect and declare the topology, or join the attempt already running.
    ///
    /// Errors from the attempt are returned to every caller that joined it.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let attempt = {
            let mut in_flight = self.in_flight();
            if let Some((_, attempt)) = in_flight.as_ref() {
                debug!("Joining in-flight broker connection attempt");
                attempt.clone()
            } else if self.is_connected() {
                return Ok(());
            } else {
                info!("Connecting to message broker");
                let id = self.next_attempt.fetch_add(1, Ordering::SeqCst);
                let this = Arc::clone(self);
                let attempt = async move {
                    let result = this.connect().await;
                    let mut in_flight = this.in_flight();
                    if matches!(in_flight.as_ref(), Some((current, _)) if *current == id) {
                        in_flight.take();
                    }
                    result
                }
                .boxed()
                .shared();
                *in_flight = Some((id, attempt.clone()));
                attempt
            }
        };

        attempt.await
    }

    /// Initialize if there is no usable channel.
    pub async fn ensure_connection(self: &Arc<Self>) -> Result<()> {
        if !self.is_connected() {
            self.initialize().await?;
        }
        Ok(())
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        let started = self.epoch.load(Ordering::SeqCst);
        self.link().state = ConnectionState::Connecting;

        let session = match self.broker.connect().await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Failed to connect to message broker");
                self.mark_failed(started);
                return Err(e);
            }
        };

        let channel = match self.open_channel(session.connection.as_ref()).await {
            Ok(channel) => channel,
            Err(e) => {
                error!(error = %e, "Failed to prepare broker channel");
                let _ = session.connection.close().await;
                self.mark_failed(started);
                return Err(e);
            }
        };

        // The epoch check and the store happen under the link lock, so a
        // close either sees the new link or makes this attempt stand down.
        let epoch = {
            let mut link = self.link();
            if self.epoch.load(Ordering::SeqCst) != started {
                None
            } else {
                let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                link.connection = Some(Arc::clone(&session.connection));
                link.channel = Some(Arc::clone(&channel));
                link.state = ConnectionState::Connected;
                Some(epoch)
            }
        };
        let Some(epoch) = epoch else {
            warn!("Connection closed while connecting; discarding new session");
            let _ = channel.close().await;
            let _ = session.connection.close().await;
            return Err(MessagingError::Closed);
        };
        self.reconnecting.store(false, Ordering::SeqCst);
        self.watch_failures(epoch, session.failures);

        info!(
            exchange = %self.topology.exchange,
            epoch,
            "Message broker connected"
        );
        Ok(())
    }

    /// Back to `Disconnected` after a failed attempt, unless a close or a
    /// newer connection has taken over the link since the attempt began.
    fn mark_failed(&self, started: u64) {
        let mut link = self.link();
        if self.epoch.load(Ordering::SeqCst) == started {
            link.state = ConnectionState::Disconnected;
        }
    }

    async fn open_channel(&self, connection: &dyn BrokerConnection) -> Result<Arc<dyn BrokerChannel>> {
        let channel = connection.create_channel().await?;
        self.topology.declare(channel.as_ref()).await?;
        Ok(channel)
    }

    fn watch_failures(self: &Arc<Self>, epoch: u64, mut failures: mpsc::UnboundedReceiver<LinkFailure>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(failure) = failures.recv().await {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                manager.handle_link_failure(epoch, failure);
            }
        });
    }

    fn handle_link_failure(self: &Arc<Self>, epoch: u64, failure: LinkFailure) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(epoch, failure = %failure, "Ignoring failure from superseded connection");
            return;
        }

        warn!(failure = %failure, "Message broker link lost");
        {
            let mut link = self.link();
            link.state = ConnectionState::Disconnected;
            link.channel = None;
            link.connection = None;
        }
        self.schedule_reconnect();
    }

    /// Start the reconnect loop unless one is already running.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already scheduled");
            return;
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.retry_connect(epoch).await;
        });
    }

    /// Retry [`initialize`](Self::initialize) on the policy delay until it succeeds.
    ///
    /// Stops early once the epoch moves on, meaning either another caller
    /// reconnected or [`close_connection`](Self::close_connection) ran.
    async fn retry_connect(self: &Arc<Self>, epoch: u64) {
        let mut attempt: u32 = 0;
        loop {
            let delay = self.retry.delay_for(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "Attempting to reconnect to message broker");
            tokio::time::sleep(delay).await;

            if self.epoch.load(Ordering::SeqCst) != epoch {
                debug!("Reconnect loop superseded");
                return;
            }

            match self.initialize().await {
                Ok(()) => {
                    info!(attempt, "Message broker reconnected");
                    return;
                }
                Err(e) => {
                    error!(attempt, error = %e, "Message broker reconnection failed");
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Close channel then connection, whichever exist. Cancels reconnects.
    ///
    /// An attempt still in progress is abandoned: it closes whatever it
    /// opened and resolves to [`MessagingError::Closed`].
    pub async fn close_connection(&self) -> Result<()> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.in_flight().take();
        let (channel, connection) = {
            let mut link = self.link();
            link.state = ConnectionState::Closing;
            (link.channel.take(), link.connection.take())
        };

        let mut outcome = Ok(());
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                error!(error = %e, "Error closing broker channel");
                outcome = Err(e);
            }
        }
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                error!(error = %e, "Error closing broker connection");
                outcome = outcome.and(Err(e));
            }
        }

        self.link().state = ConnectionState::Disconnected;
        if outcome.is_ok() {
            info!("Message broker connection closed gracefully");
        }
        outcome
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("exchange", &self.topology.exchange)
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::InMemoryBroker;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn manager(broker: &InMemoryBroker, delay_ms: u64) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            Arc::new(broker.clone()),
            Topology::default(),
            RetryPolicy::fixed(Duration::from_millis(delay_ms)),
        )
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_concurrent_initialize_makes_one_attempt() {
        let broker = InMemoryBroker::new();
        broker.set_connect_delay(Duration::from_millis(50));
        let manager = manager(&broker, 10);

        let results = futures::future::join_all((0..8).map(|_| {
            let manager = Arc::clone(&manager);
            async move { manager.initialize().await }
        }))
        .await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(broker.connect_attempts(), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_failure() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        broker.set_connect_delay(Duration::from_millis(50));
        let manager = manager(&broker, 10);

        let (a, b) = tokio::join!(manager.initialize(), manager.initialize());

        assert!(matches!(a, Err(MessagingError::Connection(_))));
        assert_eq!(a, b);
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_initialize_when_connected_is_noop() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker, 10);

        assert_ok!(manager.initialize().await);
        assert_ok!(manager.initialize().await);
        assert_ok!(manager.ensure_connection().await);

        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_initial_failure_propagates() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let manager = manager(&broker, 10);

        assert_err!(manager.initialize().await);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_close_then_ensure_reinitializes() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker, 10);

        manager.initialize().await.unwrap();
        manager.close_connection().await.unwrap();

        assert!(!manager.is_connected());
        assert!(manager.channel().is_none());
        assert_eq!(broker.live_connections(), 0);

        manager.ensure_connection().await.unwrap();
        assert!(manager.is_connected());
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_close_without_connection_is_tolerated() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker, 10);

        assert_ok!(manager.close_connection().await);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_outage_triggers_single_reconnect_loop() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker, 20);
        manager.initialize().await.unwrap();

        // Error and close are both reported for the same outage.
        broker.simulate_outage();
        assert!(wait_until(|| !manager.is_connected()).await);

        // Let a few failing attempts go by.
        tokio::time::sleep(Duration::from_millis(110)).await;
        let attempts_while_down = broker.connect_attempts() - 1;
        assert!(attempts_while_down >= 2);
        // A single loop on a 20ms cadence makes at most ~6 attempts in this window.
        assert!(attempts_while_down <= 8, "got {} attempts", attempts_while_down);

        broker.restore();
        assert!(wait_until(|| manager.is_connected()).await);
        assert_eq!(broker.live_connections(), 1);

        let settled = broker.connect_attempts();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(broker.connect_attempts(), settled);
    }

    #[tokio::test]
    async fn test_close_cancels_reconnect_loop() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker, 20);
        manager.initialize().await.unwrap();

        broker.simulate_outage();
        assert!(wait_until(|| !manager.is_connected()).await);
        manager.close_connection().await.unwrap();
        broker.restore();

        let before = broker.connect_attempts();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(broker.connect_attempts() <= before + 1);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_close_abandons_attempt_in_progress() {
        let broker = InMemoryBroker::new();
        broker.set_connect_delay(Duration::from_millis(50));
        let manager = manager(&broker, 20);

        let pending = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.initialize().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_ok!(manager.close_connection().await);

        let outcome = pending.await.unwrap();
        assert_eq!(outcome, Err(MessagingError::Closed));
        assert!(!manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(broker.live_connections(), 0);

        broker.set_connect_delay(Duration::ZERO);
        assert_ok!(manager.ensure_connection().await);
        assert!(manager.is_connected());
        assert_eq!(broker.live_connections(), 1);
    }
}
