//! Service configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::messaging::{ConsumerConfig, ExchangeKind, RetryPolicy, Topology};
use crate::{DEFAULT_AMQP_URL, DEFAULT_PORT, DEFAULT_RECONNECT_DELAY_MS};

/// How the reconnect delay evolves between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectStrategy {
    #[default]
    Fixed,
    Exponential,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Global service configuration.
///
/// Every field maps to an upper-case environment variable of the same name
/// (`port` ← `PORT`, `rabbitmq_url` ← `RABBITMQ_URL`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP listen port
    pub port: u16,

    /// Broker URL; `memory://` selects the in-process broker
    pub rabbitmq_url: String,

    /// Main exchange name
    pub exchange_name: String,

    /// Main exchange type
    pub exchange_kind: ExchangeKind,

    /// Also bind `bus_events` / `route_events` to the exchange
    pub bind_all_queues: bool,

    pub reconnect_strategy: ReconnectStrategy,

    /// Fixed delay, or base delay for exponential reconnects
    pub reconnect_delay_ms: u64,

    /// Cap for exponential reconnects
    pub reconnect_max_delay_ms: u64,

    /// Handler failures per message before dead-lettering; unset means unbounded
    pub max_redeliveries: Option<u32>,

    /// Run a logging consumer on `staff_events`
    pub consume_staff_events: bool,

    pub log_format: LogFormat,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            rabbitmq_url: DEFAULT_AMQP_URL.to_string(),
            exchange_name: crate::messaging::topology::DEFAULT_EXCHANGE.to_string(),
            exchange_kind: ExchangeKind::Topic,
            bind_all_queues: false,
            reconnect_strategy: ReconnectStrategy::Fixed,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            reconnect_max_delay_ms: 60_000,
            max_redeliveries: None,
            consume_staff_events: false,
            log_format: LogFormat::Pretty,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables over the defaults.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_source(config::Environment::default().try_parsing(true))
    }

    /// Load configuration from an arbitrary source over the defaults.
    pub fn from_source<S>(source: S) -> Result<Self, config::ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let defaults = config::Config::try_from(&Self::default())?;
        config::Config::builder()
            .add_source(defaults)
            .add_source(source)
            .build()?
            .try_deserialize()
    }

    pub fn topology(&self) -> Topology {
        Topology::transit(&self.exchange_name, self.exchange_kind, self.bind_all_queues)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.reconnect_delay_ms);
        match self.reconnect_strategy {
            ReconnectStrategy::Fixed => RetryPolicy::fixed(delay),
            ReconnectStrategy::Exponential => {
                RetryPolicy::exponential(delay, Duration::from_millis(self.reconnect_max_delay_ms))
            }
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            max_redeliveries: self.max_redeliveries,
        }
    }
}
